//! `docunit-core`: persistence building blocks shared by every layer.
//!
//! This crate contains **no IO**: identifiers, field types and coercion,
//! schema descriptors, naming rules and the error taxonomy.

pub mod error;
pub mod id;
pub mod naming;
pub mod schema;
pub mod value;

pub use error::{PersistenceError, PersistenceResult, StoreOperation};
pub use id::{EntityId, IdGenerator, SequentialIdGenerator, UuidV7Generator};
pub use naming::{DefaultNameResolver, NameResolver};
pub use schema::{EntityDefinition, FieldDef, ID_FIELD};
pub use value::{DefaultCoercer, FieldCoercer, FieldType};
