//! Store wrapper that fails selected calls, for exercising partial-commit paths.

use std::collections::HashMap;
use std::sync::Mutex;

use docunit_core::{EntityId, StoreOperation};

use crate::document::{Document, Filter, PipelineStage, Sort};
use crate::r#trait::{DocumentStore, StoreError};

/// A call observed by [`FaultInjectingStore`], successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub operation: StoreOperation,
    pub collection: String,
    pub id: Option<EntityId>,
    pub failed: bool,
}

#[derive(Debug, Default)]
struct FaultState {
    counts: HashMap<StoreOperation, usize>,
    /// Operation -> 1-based call numbers that must fail.
    planned: HashMap<StoreOperation, Vec<usize>>,
    journal: Vec<StoreCall>,
}

/// Delegates to `inner`, failing the planned calls with [`StoreError::Backend`].
#[derive(Debug)]
pub struct FaultInjectingStore<S> {
    inner: S,
    state: Mutex<FaultState>,
}

impl<S> FaultInjectingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState::default()),
        }
    }

    /// Make the `nth` (1-based) call of `operation` fail.
    pub fn fail_nth(self, operation: StoreOperation, nth: usize) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.planned.entry(operation).or_default().push(nth);
        }
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every call made so far, in order.
    pub fn journal(&self) -> Vec<StoreCall> {
        self.state
            .lock()
            .map(|s| s.journal.clone())
            .unwrap_or_default()
    }

    /// Number of attempted calls of `operation` (failed ones included).
    pub fn calls(&self, operation: StoreOperation) -> usize {
        self.state
            .lock()
            .map(|s| s.counts.get(&operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn record(
        &self,
        operation: StoreOperation,
        collection: &str,
        id: Option<&EntityId>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        let count = state.counts.entry(operation).or_insert(0);
        *count += 1;
        let nth = *count;
        let failed = state
            .planned
            .get(&operation)
            .is_some_and(|planned| planned.contains(&nth));
        state.journal.push(StoreCall {
            operation,
            collection: collection.to_string(),
            id: id.cloned(),
            failed,
        });
        if failed {
            return Err(StoreError::Backend(format!(
                "injected failure on {operation} #{nth}"
            )));
        }
        Ok(())
    }
}

impl<S: DocumentStore> DocumentStore for FaultInjectingStore<S> {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
    ) -> Result<Vec<Document>, StoreError> {
        self.record(StoreOperation::Find, collection, None)?;
        self.inner.find(collection, filter, sort)
    }

    fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        let id = document
            .get(docunit_core::ID_FIELD)
            .and_then(|v| v.as_str())
            .map(EntityId::new);
        self.record(StoreOperation::Insert, collection, id.as_ref())?;
        self.inner.insert(collection, document)
    }

    fn update(
        &self,
        collection: &str,
        id: &EntityId,
        document: Document,
    ) -> Result<(), StoreError> {
        self.record(StoreOperation::Update, collection, Some(id))?;
        self.inner.update(collection, id, document)
    }

    fn delete(&self, collection: &str, id: &EntityId) -> Result<(), StoreError> {
        self.record(StoreOperation::Delete, collection, Some(id))?;
        self.inner.delete(collection, id)
    }

    fn aggregate(
        &self,
        collection: &str,
        stages: &[PipelineStage],
    ) -> Result<Vec<Document>, StoreError> {
        self.record(StoreOperation::Aggregate, collection, None)?;
        self.inner.aggregate(collection, stages)
    }
}
