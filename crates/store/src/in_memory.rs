use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde_json::Value as JsonValue;

use docunit_core::{EntityId, ID_FIELD};

use crate::document::{Document, Filter, PipelineStage, Sort, run_pipeline};
use crate::r#trait::{DocumentStore, StoreError};

type Collection = BTreeMap<String, Document>;

/// In-memory document store.
///
/// Intended for tests/dev. Store order is ascending identifier order.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a single document by identifier.
    pub fn get(&self, collection: &str, id: &EntityId) -> Option<Document> {
        let collections = self.collections.read().ok()?;
        collections.get(collection)?.get(id.as_str()).cloned()
    }

    /// Number of documents stored in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn document_id(document: &Document) -> Result<String, StoreError> {
        match document.get(ID_FIELD) {
            Some(JsonValue::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(other) => Err(StoreError::InvalidDocument(format!(
                "{ID_FIELD} must be a non-empty string, found {other}"
            ))),
            None => Err(StoreError::InvalidDocument(format!("missing {ID_FIELD}"))),
        }
    }

    fn snapshot(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
    ) -> Result<Vec<Document>, StoreError> {
        let mut docs: Vec<Document> = self
            .snapshot(collection)?
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect();
        if !sort.is_empty() {
            docs.sort_by(|a, b| sort.compare(a, b));
        }
        Ok(docs)
    }

    fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        let id = Self::document_id(&document)?;

        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let docs = collections.entry(collection.to_string()).or_default();

        if docs.contains_key(&id) {
            return Err(StoreError::DuplicateKey(format!("{collection}/{id}")));
        }
        docs.insert(id, document);
        Ok(())
    }

    fn update(
        &self,
        collection: &str,
        id: &EntityId,
        document: Document,
    ) -> Result<(), StoreError> {
        if let Some(supplied) = document.get(ID_FIELD) {
            if supplied != &JsonValue::String(id.to_string()) {
                return Err(StoreError::InvalidDocument(format!(
                    "{ID_FIELD} cannot change ({id} -> {supplied})"
                )));
            }
        }

        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let existing = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id.as_str()))
            .ok_or_else(|| StoreError::NotFound(format!("{collection}/{id}")))?;

        for (field, value) in document {
            existing.insert(field, value);
        }
        Ok(())
    }

    fn delete(&self, collection: &str, id: &EntityId) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id.as_str()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{collection}/{id}")))
    }

    fn aggregate(
        &self,
        collection: &str,
        stages: &[PipelineStage],
    ) -> Result<Vec<Document>, StoreError> {
        run_pipeline(self.snapshot(collection)?, stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn insert_then_find_by_filter() {
        let store = InMemoryDocumentStore::new();
        store.insert("employees", doc(json!({"_id": "2", "team": "a"}))).unwrap();
        store.insert("employees", doc(json!({"_id": "1", "team": "a"}))).unwrap();
        store.insert("employees", doc(json!({"_id": "3", "team": "b"}))).unwrap();

        let found = store
            .find("employees", &Filter::by("team", "a"), &Sort::none())
            .unwrap();
        let ids: Vec<_> = found.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!("1"), json!("2")]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryDocumentStore::new();
        store.insert("employees", doc(json!({"_id": "1"}))).unwrap();
        let err = store.insert("employees", doc(json!({"_id": "1"}))).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[test]
    fn insert_requires_identifier() {
        let store = InMemoryDocumentStore::new();
        let err = store.insert("employees", doc(json!({"name": "x"}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }

    #[test]
    fn update_merges_fields() {
        let store = InMemoryDocumentStore::new();
        store
            .insert("employees", doc(json!({"_id": "1", "name": "a", "wage": 1})))
            .unwrap();
        store
            .update("employees", &EntityId::new("1"), doc(json!({"wage": 2})))
            .unwrap();
        let stored = store.get("employees", &EntityId::new("1")).unwrap();
        assert_eq!(stored["name"], json!("a"));
        assert_eq!(stored["wage"], json!(2));
    }

    #[test]
    fn update_and_delete_of_missing_documents_fail() {
        let store = InMemoryDocumentStore::new();
        let id = EntityId::new("missing");
        assert!(matches!(
            store.update("employees", &id, Document::new()),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.delete("employees", &id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_removes_document() {
        let store = InMemoryDocumentStore::new();
        store.insert("employees", doc(json!({"_id": "1"}))).unwrap();
        store.delete("employees", &EntityId::new("1")).unwrap();
        assert!(store.is_empty("employees"));
    }
}
