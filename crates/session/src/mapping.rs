//! Entity <-> document mapping and the session's store gateway.

use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::warn;

use docunit_core::{
    DefaultCoercer, EntityId, FieldCoercer, ID_FIELD, PersistenceError, PersistenceResult,
};
use docunit_store::{Document, DocumentStore};

use crate::change_tracker::Changes;
use crate::entity::EntityRef;
use crate::graph::{Cardinality, EntityType, RelationshipGraph};

/// Converts entities to stored documents and back.
pub struct DocumentMapper {
    coercer: Box<dyn FieldCoercer>,
}

impl Default for DocumentMapper {
    fn default() -> Self {
        Self::new(DefaultCoercer)
    }
}

impl fmt::Debug for DocumentMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentMapper").finish_non_exhaustive()
    }
}

impl DocumentMapper {
    pub fn new(coercer: impl FieldCoercer + 'static) -> Self {
        Self {
            coercer: Box::new(coercer),
        }
    }

    pub fn coercer(&self) -> &dyn FieldCoercer {
        self.coercer.as_ref()
    }

    /// `{_id, fields.., embedded nodes as nested documents}`.
    pub fn to_document(&self, entity: &EntityRef) -> PersistenceResult<Document> {
        match entity.document_value() {
            JsonValue::Object(doc) => Ok(doc),
            other => Err(PersistenceError::invalid_entity(format!(
                "{} rendered as non-object {other}",
                entity.type_name()
            ))),
        }
    }

    /// Identifier carried by a stored document.
    pub fn document_id(doc: &Document) -> Option<EntityId> {
        match doc.get(ID_FIELD)? {
            JsonValue::String(id) if !id.is_empty() => Some(EntityId::new(id.as_str())),
            JsonValue::Number(n) => Some(EntityId::new(n.to_string())),
            _ => None,
        }
    }

    /// Build an entity of `ty` from a stored document.
    ///
    /// Values the coercer rejects are stored as `null`. Embedded documents
    /// become entities wired to their owner.
    pub fn hydrate(
        &self,
        graph: &RelationshipGraph,
        ty: &Arc<EntityType>,
        doc: &Document,
    ) -> PersistenceResult<EntityRef> {
        let entity = graph.instantiate(ty)?;
        entity.assign_id(Self::document_id(doc));

        for (idx, def) in ty.fields().iter().enumerate() {
            let raw = doc.get(&def.name).unwrap_or(&JsonValue::Null);
            let value = self.coercer.coerce(def.ty, raw).unwrap_or_else(|| {
                warn!(
                    entity = ty.name(),
                    field = %def.name,
                    value = %raw,
                    "stored value does not coerce; loading null"
                );
                JsonValue::Null
            });
            entity.set_value_at(idx, value);
        }

        for (idx, node) in ty.nodes().iter().enumerate() {
            if node.cardinality != Cardinality::EmbeddedChild {
                continue;
            }
            let Some(JsonValue::Object(nested)) = doc.get(&node.name) else {
                continue;
            };
            let target = graph.entity_type(&node.target)?;
            let child = self.hydrate(graph, &target, nested)?;
            if let Some(back) = node.inverse.as_deref().and_then(|n| target.node_index(n)) {
                child.set_embedding_parent_at(back, Some(&entity));
            }
            entity.set_embedded_at(idx, Some(child));
        }

        entity.mark_persisted(true);
        Ok(entity)
    }
}

/// Write path used by the session during commit.
pub struct DocumentGateway<'a, S> {
    store: &'a S,
    mapper: &'a DocumentMapper,
}

impl<'a, S: DocumentStore> DocumentGateway<'a, S> {
    pub fn new(store: &'a S, mapper: &'a DocumentMapper) -> Self {
        Self { store, mapper }
    }

    pub fn insert(&self, ty: &EntityType, entity: &EntityRef) -> PersistenceResult<()> {
        let id = Self::validate(ty, entity)?;
        let doc = self.mapper.to_document(entity)?;
        self.store
            .insert(ty.collection(), doc)
            .map_err(|e| PersistenceError::insert_failed(format!("{}/{id}: {e}", ty.name())))
    }

    /// Write only the changed fields.
    pub fn update(
        &self,
        ty: &EntityType,
        entity: &EntityRef,
        changes: &Changes,
    ) -> PersistenceResult<()> {
        let id = Self::validate(ty, entity)?;
        let doc: Document = changes
            .iter()
            .map(|(field, change)| (field.clone(), change.to.clone()))
            .collect();
        self.store
            .update(ty.collection(), &id, doc)
            .map_err(|e| PersistenceError::update_failed(format!("{}/{id}: {e}", ty.name())))
    }

    pub fn delete(&self, ty: &EntityType, entity: &EntityRef) -> PersistenceResult<()> {
        let id = Self::validate(ty, entity)?;
        self.store
            .delete(ty.collection(), &id)
            .map_err(|e| PersistenceError::delete_failed(format!("{}/{id}: {e}", ty.name())))
    }

    fn validate(ty: &EntityType, entity: &EntityRef) -> PersistenceResult<EntityId> {
        if !entity.is_a(ty.name()) {
            return Err(PersistenceError::invalid_entity(format!(
                "expected {}, got {}",
                ty.name(),
                entity.type_name()
            )));
        }
        entity.id().ok_or_else(|| {
            PersistenceError::invalid_entity(format!("{} has no identifier", ty.name()))
        })
    }
}
