//! Unit of work over a document store.
//!
//! Entities are declared once into a [`RelationshipGraph`]; the
//! [`PersistenceCoordinator`] loads them through an identity map, tracks
//! field changes against their loaded baseline and writes everything pending
//! in one commit (inserts, then updates, then deletes).

pub mod change_tracker;
pub mod collection;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod graph;
pub mod identity_map;
pub mod mapping;
pub mod relations;
pub mod session;


pub use change_tracker::{ChangeTracker, Changes, FieldChange};
pub use collection::{CollectionDiff, CollectionDiffBuilder, CollectionFactory, CollectionKind, LazyCollection};
pub use config::SessionConfig;
pub use coordinator::PersistenceCoordinator;
pub use entity::{EntityKey, EntityRef, WeakEntityRef};
pub use graph::{Cardinality, EntityType, GraphBuilder, Node, NodeDefinition, RelationshipGraph};
pub use identity_map::IdentityMap;
pub use mapping::{DocumentGateway, DocumentMapper};
pub use relations::CollectionProxy;
pub use session::{CommitSummary, Session};
