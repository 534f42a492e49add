//! Document store boundary.
//!
//! This crate defines the driver-facing abstraction the session layer talks to,
//! without making any storage assumptions, plus an in-memory implementation
//! for tests/dev and a fault-injecting wrapper.

pub mod document;
pub mod fault;
pub mod in_memory;
pub mod r#trait;

pub use document::{Document, Filter, PipelineStage, Sort, SortOrder, compare_values};
pub use fault::{FaultInjectingStore, StoreCall};
pub use in_memory::InMemoryDocumentStore;
pub use r#trait::{DocumentStore, StoreError};
