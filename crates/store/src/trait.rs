use std::sync::Arc;

use thiserror::Error;

use docunit_core::EntityId;

use crate::document::{Document, Filter, PipelineStage, Sort};

/// Document store operation error.
///
/// These are **driver errors**; the session layer wraps them together with the
/// failing operation before handing them to callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Backend failure (connection, timeout, injected fault, ...).
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Document-oriented store driver.
///
/// The driver owns no session state. Every call is synchronous and may block;
/// cancellation and timeouts are the driver's concern.
///
/// ## Semantics
///
/// - `find` returns every document of `collection` matching `filter`, ordered by
///   `sort` (store order when empty)
/// - `insert` stores a new document; it carries its identifier in the `_id` field
/// - `update` merges the supplied fields into the document identified by `id`
/// - `delete` removes the document identified by `id`
/// - `aggregate` evaluates `stages` in order over the collection
pub trait DocumentStore: Send + Sync {
    fn find(&self, collection: &str, filter: &Filter, sort: &Sort)
    -> Result<Vec<Document>, StoreError>;

    fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    fn update(&self, collection: &str, id: &EntityId, document: Document)
    -> Result<(), StoreError>;

    fn delete(&self, collection: &str, id: &EntityId) -> Result<(), StoreError>;

    fn aggregate(
        &self,
        collection: &str,
        stages: &[PipelineStage],
    ) -> Result<Vec<Document>, StoreError>;
}

impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
    ) -> Result<Vec<Document>, StoreError> {
        (**self).find(collection, filter, sort)
    }

    fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        (**self).insert(collection, document)
    }

    fn update(
        &self,
        collection: &str,
        id: &EntityId,
        document: Document,
    ) -> Result<(), StoreError> {
        (**self).update(collection, id, document)
    }

    fn delete(&self, collection: &str, id: &EntityId) -> Result<(), StoreError> {
        (**self).delete(collection, id)
    }

    fn aggregate(
        &self,
        collection: &str,
        stages: &[PipelineStage],
    ) -> Result<Vec<Document>, StoreError> {
        (**self).aggregate(collection, stages)
    }
}
