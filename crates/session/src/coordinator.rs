//! Application-facing entry point: lookups, persist/remove cascades, commit.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use docunit_core::{
    EntityId, FieldCoercer, ID_FIELD, IdGenerator, PersistenceError, PersistenceResult,
    StoreOperation, UuidV7Generator,
};
use docunit_store::{Document, DocumentStore, Filter, PipelineStage, Sort};

use crate::config::SessionConfig;
use crate::entity::{EntityKey, EntityRef};
use crate::graph::{Cardinality, EntityType, Node, RelationshipGraph};
use crate::mapping::{DocumentGateway, DocumentMapper};
use crate::session::{CommitSummary, Session};

/// Owns the store, the relationship graph and the current [`Session`].
///
/// Entity handles are single-threaded, so a coordinator serves exactly one
/// thread of execution.
#[derive(Debug)]
pub struct PersistenceCoordinator<S, G = UuidV7Generator> {
    pub(crate) store: S,
    ids: G,
    pub(crate) graph: Arc<RelationshipGraph>,
    pub(crate) mapper: DocumentMapper,
    pub(crate) session: Session,
    config: SessionConfig,
}

impl<S: DocumentStore> PersistenceCoordinator<S, UuidV7Generator> {
    pub fn new(store: S, graph: Arc<RelationshipGraph>) -> Self {
        Self::with_ids(store, UuidV7Generator, graph)
    }
}

impl<S: DocumentStore, G: IdGenerator> PersistenceCoordinator<S, G> {
    pub fn with_ids(store: S, ids: G, graph: Arc<RelationshipGraph>) -> Self {
        Self {
            store,
            ids,
            graph,
            mapper: DocumentMapper::default(),
            session: Session::new(),
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_coercer(mut self, coercer: impl FieldCoercer + 'static) -> Self {
        self.mapper = DocumentMapper::new(coercer);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn graph(&self) -> &Arc<RelationshipGraph> {
        &self.graph
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn new_entity(&self, type_name: &str) -> PersistenceResult<EntityRef> {
        self.graph.new_entity(type_name)
    }

    /// Coerce and assign a field, registering the change.
    ///
    /// Foreign key fields go through the foreign key writer.
    pub fn set_field(
        &mut self,
        entity: &EntityRef,
        field: &str,
        value: impl Into<JsonValue>,
    ) -> PersistenceResult<()> {
        let ty = entity.entity_type();
        let (idx, def) = ty.field(field)?;
        let raw = value.into();
        let coerced = self.mapper.coercer().coerce(def.ty, &raw).ok_or_else(|| {
            PersistenceError::invalid_entity(format!(
                "{}.{field}: {raw} is not a valid {:?}",
                ty.name(),
                def.ty
            ))
        })?;

        if let Some((_, node)) = ty.parent_node_for_foreign_key(field) {
            let id = coerced.as_str().map(EntityId::new);
            let node = node.name.clone();
            return self.set_foreign_key(entity, &node, id);
        }
        entity.set_value_at(idx, coerced);
        self.mark_changed(entity);
        Ok(())
    }

    /// Assign an identifier. Fails once the entity is known to the session.
    pub fn set_id(&mut self, entity: &EntityRef, id: Option<EntityId>) -> PersistenceResult<()> {
        if entity.id() == id {
            return Ok(());
        }
        if let Some(current) = entity.id().filter(|_| !self.session.is_detached(entity)) {
            return Err(PersistenceError::ImmutableIdentifier {
                type_name: entity.type_name(),
                id: current.to_string(),
            });
        }
        entity.assign_id(id);
        Ok(())
    }

    pub fn find(&mut self, type_name: &str, id: &EntityId) -> PersistenceResult<EntityRef> {
        self.find_optional(type_name, id)?
            .ok_or_else(|| PersistenceError::not_found(type_name, id))
    }

    /// Identity map first, then the store. Entities pending removal are not found.
    pub fn find_optional(
        &mut self,
        type_name: &str,
        id: &EntityId,
    ) -> PersistenceResult<Option<EntityRef>> {
        let ty = self.graph.entity_type(type_name)?;
        if self
            .session
            .is_removed_key(&EntityKey::new(type_name, id.clone()))
        {
            return Ok(None);
        }
        if let Some(entity) = self.session.get(type_name, id) {
            return Ok(Some(entity));
        }
        let docs = self.query(&ty, &Filter::by(ID_FIELD, id.clone()), &Sort::none())?;
        Ok(self.load_documents(&ty, docs)?.into_iter().next())
    }

    pub fn find_all(&mut self, type_name: &str) -> PersistenceResult<Vec<EntityRef>> {
        self.find_where(type_name, &Filter::new(), &Sort::none())
    }

    pub fn find_where(
        &mut self,
        type_name: &str,
        filter: &Filter,
        sort: &Sort,
    ) -> PersistenceResult<Vec<EntityRef>> {
        let ty = self.graph.entity_type(type_name)?;
        let docs = self.query(&ty, filter, sort)?;
        self.load_documents(&ty, docs)
    }

    /// Raw pipeline over the type's collection; results are not tracked.
    pub fn aggregate(
        &self,
        type_name: &str,
        stages: &[PipelineStage],
    ) -> PersistenceResult<Vec<Document>> {
        let ty = self.graph.entity_type(type_name)?;
        self.store
            .aggregate(ty.collection(), stages)
            .map_err(|e| PersistenceError::store(StoreOperation::Aggregate, e))
    }

    /// Register `entity` and its cascade children as new.
    ///
    /// Identifiers are assigned where missing and children receive their
    /// parent's identifier as foreign key. Entities already known to the
    /// session only get their keys refreshed.
    pub fn persist(&mut self, entity: &EntityRef) -> PersistenceResult<()> {
        let mut visited = Vec::new();
        self.walk_persist(entity, 0, &mut visited)?;
        for item in &visited {
            if self.session.is_detached(item) {
                self.session.register_new(item);
            } else {
                self.mark_changed(item);
            }
        }
        debug!(root = %entity.type_name(), entities = visited.len(), "persist cascade");
        Ok(())
    }

    fn walk_persist(
        &mut self,
        entity: &EntityRef,
        depth: usize,
        visited: &mut Vec<EntityRef>,
    ) -> PersistenceResult<()> {
        if visited.iter().any(|v| v.ptr_eq(entity)) {
            return Ok(());
        }
        self.check_depth(entity, depth)?;
        if entity.id().is_none() {
            entity.assign_id(Some(self.ids.generate()));
        }
        visited.push(entity.clone());

        let ty = entity.entity_type();
        let parent_id: JsonValue = entity.id().map_or(JsonValue::Null, Into::into);
        for (idx, node) in ty.nodes().iter().enumerate() {
            if !(node.cascade && node.cardinality.is_child()) {
                continue;
            }
            let children = entity.resolved_children(idx);
            if children.is_empty() {
                continue;
            }
            let (fk_idx, back_idx) = self.child_link(node)?;
            for child in &children {
                child.set_value_at(fk_idx, parent_id.clone());
                child.set_parent_memo(back_idx, Some(entity));
                self.walk_persist(child, depth + 1, visited)?;
            }
            if node.cardinality == Cardinality::Children {
                entity.with_collection(idx, |c| c.sort())?;
            }
        }
        Ok(())
    }

    /// Register `entity` and its in-memory cascade children as removed.
    pub fn remove(&mut self, entity: &EntityRef) -> PersistenceResult<()> {
        let mut visited = Vec::new();
        self.walk_remove(entity, 0, &mut visited)?;
        for item in &visited {
            self.session.register_removed(item);
        }
        debug!(root = %entity.type_name(), entities = visited.len(), "remove cascade");
        Ok(())
    }

    fn walk_remove(
        &self,
        entity: &EntityRef,
        depth: usize,
        visited: &mut Vec<EntityRef>,
    ) -> PersistenceResult<()> {
        if visited.iter().any(|v| v.ptr_eq(entity)) {
            return Ok(());
        }
        self.check_depth(entity, depth)?;
        visited.push(entity.clone());
        let ty = entity.entity_type();
        for (idx, node) in ty.nodes().iter().enumerate() {
            if node.cascade && node.cardinality.is_child() {
                for child in entity.resolved_children(idx) {
                    self.walk_remove(&child, depth + 1, visited)?;
                }
            }
        }
        Ok(())
    }

    fn check_depth(&self, entity: &EntityRef, depth: usize) -> PersistenceResult<()> {
        if depth > self.config.max_cascade_depth {
            return Err(PersistenceError::invalid_entity(format!(
                "cascade from {} deeper than {} levels",
                entity.type_name(),
                self.config.max_cascade_depth
            )));
        }
        Ok(())
    }

    /// Write all pending changes and start a new session.
    ///
    /// After success the new session keeps the committed entities as clean
    /// when `retain_identity_map` is set. After a failure it starts empty.
    pub fn commit(&mut self) -> PersistenceResult<CommitSummary> {
        let mut session = std::mem::take(&mut self.session);
        let gateway = DocumentGateway::new(&self.store, &self.mapper);
        let result = session.commit(&gateway, &self.config);
        self.session = match &result {
            Ok(_) if self.config.retain_identity_map => session.into_clean(),
            Ok(_) => Session::new(),
            Err(e) => {
                warn!(error = %e, "discarding session after failed commit");
                Session::new()
            }
        };
        result
    }

    pub fn detach(&mut self, entity: &EntityRef) {
        self.session.detach(entity);
    }

    /// Drop every pending change and tracked entity.
    pub fn clear(&mut self) {
        self.session.clear();
    }

    pub(crate) fn query(
        &self,
        ty: &EntityType,
        filter: &Filter,
        sort: &Sort,
    ) -> PersistenceResult<Vec<Document>> {
        self.store
            .find(ty.collection(), filter, sort)
            .map_err(|e| PersistenceError::store(StoreOperation::Find, e))
    }

    /// Hydrate documents into tracked entities, reusing mapped instances and
    /// skipping those pending removal.
    pub(crate) fn load_documents(
        &mut self,
        ty: &Arc<EntityType>,
        docs: Vec<Document>,
    ) -> PersistenceResult<Vec<EntityRef>> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            let Some(id) = DocumentMapper::document_id(&doc) else {
                warn!(entity = ty.name(), "skipping stored document without identifier");
                continue;
            };
            if self
                .session
                .is_removed_key(&EntityKey::new(ty.name(), id.clone()))
            {
                continue;
            }
            if let Some(existing) = self.session.get(ty.name(), &id) {
                out.push(existing);
                continue;
            }
            let entity = self.mapper.hydrate(&self.graph, ty, &doc)?;
            out.push(self.session.track_clean(&entity));
        }
        Ok(out)
    }

    /// Register a change on `entity` and on every entity embedding it.
    pub(crate) fn mark_changed(&mut self, entity: &EntityRef) {
        let mut current = Some(entity.clone());
        let mut hops = 0;
        while let Some(e) = current {
            self.session.register_changed(&e);
            hops += 1;
            if hops > self.config.max_cascade_depth {
                break;
            }
            current = e.embedding_owner();
        }
    }

    /// Foreign key field index and parent node index on a child node's target.
    pub(crate) fn child_link(&self, node: &Node) -> PersistenceResult<(usize, usize)> {
        let target = self.graph.entity_type(&node.target)?;
        let fk = node.foreign_key.as_deref().unwrap_or_default();
        let fk_idx = target
            .field_index(fk)
            .ok_or_else(|| PersistenceError::unknown_field(target.name(), fk))?;
        let back = node.inverse.as_deref().unwrap_or_default();
        let back_idx = target
            .node_index(back)
            .ok_or_else(|| PersistenceError::unknown_node(target.name(), back))?;
        Ok((fk_idx, back_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, NodeDefinition};
    use docunit_core::{EntityDefinition, FieldType, SequentialIdGenerator};
    use docunit_store::InMemoryDocumentStore;
    use serde_json::json;

    type Coordinator = PersistenceCoordinator<InMemoryDocumentStore, SequentialIdGenerator>;

    fn coordinator() -> Coordinator {
        let mut builder = GraphBuilder::new();
        builder
            .define(
                EntityDefinition::new("Employee")
                    .field("name", FieldType::String)
                    .field("wage", FieldType::Integer),
            )
            .unwrap()
            .define(EntityDefinition::new("Team").field("name", FieldType::String))
            .unwrap()
            .parent_node("Employee", NodeDefinition::new("team"))
            .unwrap()
            .child_nodes(
                "Team",
                NodeDefinition::new("members").target("Employee").cascade(true),
            )
            .unwrap();
        PersistenceCoordinator::with_ids(
            InMemoryDocumentStore::new(),
            SequentialIdGenerator::new(),
            builder.build(),
        )
    }

    #[test]
    fn persist_assigns_identifiers_and_commit_inserts() -> anyhow::Result<()> {
        let mut units = coordinator();
        let ada = units.new_entity("Employee")?;
        units.set_field(&ada, "name", "Ada")?;
        units.set_field(&ada, "wage", "500")?;
        assert_eq!(ada.get("wage")?, json!(500));

        units.persist(&ada)?;
        assert_eq!(ada.id(), Some(EntityId::new("000000000001")));
        assert!(units.session().is_new(&ada));

        let summary = units.commit()?;
        assert_eq!(summary.inserted, 1);
        let found = units.find("Employee", &EntityId::new("000000000001"))?;
        assert!(found.ptr_eq(&ada));
        Ok(())
    }

    #[test]
    fn uncoercible_values_are_rejected() {
        let mut units = coordinator();
        let ada = units.new_entity("Employee").unwrap();
        let err = units.set_field(&ada, "wage", "lots").unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidEntity(_)));
        assert!(matches!(
            units.set_field(&ada, "salary", 1),
            Err(PersistenceError::UnknownField { .. })
        ));
    }

    #[test]
    fn identifiers_are_immutable_while_managed() -> anyhow::Result<()> {
        let mut units = coordinator();
        let ada = units.new_entity("Employee")?;
        units.set_id(&ada, Some(EntityId::new("e1")))?;
        units.persist(&ada)?;

        let err = units.set_id(&ada, Some(EntityId::new("e2"))).unwrap_err();
        assert!(matches!(err, PersistenceError::ImmutableIdentifier { .. }));

        units.detach(&ada);
        units.set_id(&ada, Some(EntityId::new("e2")))?;
        assert_eq!(ada.id(), Some(EntityId::new("e2")));
        Ok(())
    }

    #[test]
    fn missing_and_removed_entities_are_not_found() -> anyhow::Result<()> {
        let mut units = coordinator();
        assert!(matches!(
            units.find("Employee", &EntityId::new("nope")),
            Err(PersistenceError::EntityNotFound { .. })
        ));
        assert!(matches!(
            units.find("Robot", &EntityId::new("1")),
            Err(PersistenceError::UnknownType(_))
        ));

        let ada = units.new_entity("Employee")?;
        units.persist(&ada)?;
        units.commit()?;
        let id = ada.id().unwrap_or_else(|| EntityId::new("?"));

        units.remove(&ada)?;
        assert!(units.find("Employee", &id).is_err());
        units.commit()?;
        assert!(units.find("Employee", &id).is_err());
        Ok(())
    }

    #[test]
    fn loads_are_canonical() -> anyhow::Result<()> {
        let mut units = coordinator();
        for name in ["a", "b"] {
            let e = units.new_entity("Employee")?;
            units.set_field(&e, "name", name)?;
            units.persist(&e)?;
        }
        units.commit()?;
        units.clear();

        let first = units.find_all("Employee")?;
        let again = units.find_where("Employee", &Filter::by("name", "a"), &Sort::none())?;
        assert_eq!(first.len(), 2);
        assert_eq!(again.len(), 1);
        assert!(again[0].ptr_eq(&first[0]));

        let counted = units.aggregate("Employee", &[PipelineStage::Count("n".into())])?;
        assert_eq!(counted[0]["n"], json!(2));
        Ok(())
    }

    #[test]
    fn failed_commit_discards_the_session() -> anyhow::Result<()> {
        let mut units = coordinator();
        let ada = units.new_entity("Employee")?;
        units.set_id(&ada, Some(EntityId::new("dup")))?;
        units.persist(&ada)?;
        units.commit()?;

        units.clear();
        let twin = units.new_entity("Employee")?;
        units.set_id(&twin, Some(EntityId::new("dup")))?;
        units.persist(&twin)?;
        let err = units.commit().unwrap_err();
        assert_eq!(err.store_operation(), Some(StoreOperation::Insert));
        assert!(units.session().is_clean());
        assert!(units.session().tracker().is_empty());
        Ok(())
    }

    #[test]
    fn identity_map_can_be_dropped_after_commit() -> anyhow::Result<()> {
        let mut units = coordinator().with_config(SessionConfig {
            retain_identity_map: false,
            ..SessionConfig::default()
        });
        let ada = units.new_entity("Employee")?;
        units.persist(&ada)?;
        units.commit()?;
        assert!(units.session().tracker().is_empty());

        let id = ada.id().unwrap_or_else(|| EntityId::new("?"));
        let reloaded = units.find("Employee", &id)?;
        assert!(!reloaded.ptr_eq(&ada));
        Ok(())
    }

    #[test]
    fn cascade_depth_is_bounded() -> anyhow::Result<()> {
        let mut units = coordinator().with_config(SessionConfig {
            max_cascade_depth: 0,
            ..SessionConfig::default()
        });
        let team = units.new_entity("Team")?;
        let ada = units.new_entity("Employee")?;
        units.collection(&team, "members")?.push(&ada)?;
        assert!(matches!(
            units.persist(&team),
            Err(PersistenceError::InvalidEntity(_))
        ));
        Ok(())
    }
}
