//! Entity records and the shared handles the session hands out.
//!
//! An entity is a dynamic record shaped by its [`EntityType`]: one value per
//! declared field and one slot per relationship node. Handles are
//! reference-counted and single-threaded; identity is pointer identity.

use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use docunit_core::{EntityId, ID_FIELD, PersistenceError, PersistenceResult};

use crate::collection::LazyCollection;
use crate::graph::{Cardinality, EntityType};

/// Identity of a persisted entity: type name plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityKey {
    type_name: String,
    id: EntityId,
}

impl EntityKey {
    pub fn new(type_name: impl Into<String>, id: EntityId) -> Self {
        Self {
            type_name: type_name.into(),
            id,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.id)
    }
}

/// State of a single-child slot.
#[derive(Debug, Clone, Default)]
pub(crate) enum ChildSlot {
    #[default]
    Unloaded,
    Loaded(Option<EntityRef>),
}

pub(crate) enum Slot {
    /// Memoized parent, resolved from the foreign key.
    Parent(WeakEntityRef),
    Child(ChildSlot),
    Children(LazyCollection),
    Embedded(Option<EntityRef>),
    EmbeddingParent(WeakEntityRef),
}

pub(crate) struct Entity {
    pub(crate) ty: Arc<EntityType>,
    pub(crate) id: Option<EntityId>,
    pub(crate) values: Vec<JsonValue>,
    pub(crate) slots: Vec<Slot>,
    /// Stored by a successful commit or loaded from the store.
    pub(crate) persisted: bool,
}

/// Shared handle to an entity.
#[derive(Clone)]
pub struct EntityRef(Rc<RefCell<Entity>>);

/// Non-owning handle, used for back references.
#[derive(Clone, Default)]
pub struct WeakEntityRef(Weak<RefCell<Entity>>);

impl WeakEntityRef {
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(entity) => write!(f, "Weak({entity:?})"),
            None => f.write_str("Weak(<none>)"),
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(entity) => f
                .debug_struct("EntityRef")
                .field("type", &entity.ty.name())
                .field("id", &entity.id)
                .field("persisted", &entity.persisted)
                .finish(),
            Err(_) => f.write_str("EntityRef(<borrowed>)"),
        }
    }
}

impl EntityRef {
    pub(crate) fn new(entity: Entity) -> Self {
        Self(Rc::new(RefCell::new(entity)))
    }

    fn borrow(&self) -> Ref<'_, Entity> {
        self.0.borrow()
    }

    fn borrow_mut(&self) -> RefMut<'_, Entity> {
        self.0.borrow_mut()
    }

    pub fn entity_type(&self) -> Arc<EntityType> {
        Arc::clone(&self.borrow().ty)
    }

    pub fn type_name(&self) -> String {
        self.borrow().ty.name().to_string()
    }

    pub fn is_a(&self, type_name: &str) -> bool {
        self.borrow().ty.name() == type_name
    }

    pub fn id(&self) -> Option<EntityId> {
        self.borrow().id.clone()
    }

    /// Identity key, once an identifier is assigned.
    pub fn key(&self) -> Option<EntityKey> {
        let entity = self.borrow();
        entity
            .id
            .clone()
            .map(|id| EntityKey::new(entity.ty.name(), id))
    }

    pub fn is_persisted(&self) -> bool {
        self.borrow().persisted
    }

    pub fn get(&self, field: &str) -> PersistenceResult<JsonValue> {
        let entity = self.borrow();
        let idx = entity.ty.field(field)?.0;
        Ok(entity.values[idx].clone())
    }

    /// Write a field without coercion or relationship bookkeeping.
    ///
    /// Foreign keys written this way do not update parent collections; use the
    /// coordinator's setters for that.
    pub fn set(&self, field: &str, value: impl Into<JsonValue>) -> PersistenceResult<()> {
        let mut entity = self.borrow_mut();
        let idx = entity.ty.field(field)?.0;
        entity.values[idx] = value.into();
        Ok(())
    }

    /// Field name/value pairs in declaration order.
    pub fn values(&self) -> Vec<(String, JsonValue)> {
        let entity = self.borrow();
        entity
            .ty
            .fields()
            .iter()
            .zip(&entity.values)
            .map(|(def, value)| (def.name.clone(), value.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Rc::downgrade(&self.0))
    }

    /// Collection order: identified entities ascending by identifier before
    /// unidentified ones. Two unidentified entities compare equal, so a stable
    /// sort keeps their insertion order.
    pub fn collection_cmp(&self, other: &EntityRef) -> Ordering {
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a
                .cmp(&b)
                .then_with(|| self.type_name().cmp(&other.type_name())),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    pub(crate) fn assign_id(&self, id: Option<EntityId>) {
        self.borrow_mut().id = id;
    }

    pub(crate) fn mark_persisted(&self, persisted: bool) {
        self.borrow_mut().persisted = persisted;
    }

    pub(crate) fn value_at(&self, idx: usize) -> JsonValue {
        self.borrow().values.get(idx).cloned().unwrap_or(JsonValue::Null)
    }

    pub(crate) fn set_value_at(&self, idx: usize, value: JsonValue) {
        if let Some(slot) = self.borrow_mut().values.get_mut(idx) {
            *slot = value;
        }
    }

    /// Foreign key stored at field `idx`, when set to a string.
    pub(crate) fn foreign_key_at(&self, idx: usize) -> Option<EntityId> {
        match self.value_at(idx) {
            JsonValue::String(id) => Some(EntityId::new(id)),
            _ => None,
        }
    }

    /// Fields plus embedded nodes rendered as nested documents.
    pub(crate) fn tracked_values(&self) -> BTreeMap<String, JsonValue> {
        let entity = self.borrow();
        let mut out: BTreeMap<String, JsonValue> = entity
            .ty
            .fields()
            .iter()
            .zip(&entity.values)
            .map(|(def, value)| (def.name.clone(), value.clone()))
            .collect();
        for (node, slot) in entity.ty.nodes().iter().zip(&entity.slots) {
            if let Slot::Embedded(child) = slot {
                let value = child
                    .as_ref()
                    .map_or(JsonValue::Null, EntityRef::document_value);
                out.insert(node.name.clone(), value);
            }
        }
        out
    }

    /// `{_id?, fields.., embedded..}` as a JSON object.
    pub(crate) fn document_value(&self) -> JsonValue {
        let mut doc = serde_json::Map::new();
        if let Some(id) = self.id() {
            doc.insert(ID_FIELD.to_string(), id.into());
        }
        doc.extend(self.tracked_values());
        JsonValue::Object(doc)
    }

    fn layout_error(&self, idx: usize, expected: Cardinality) -> PersistenceError {
        PersistenceError::invalid_entity(format!(
            "{}: slot {idx} does not hold a {expected:?} node",
            self.type_name()
        ))
    }

    pub(crate) fn parent_memo(&self, idx: usize) -> Option<EntityRef> {
        match self.borrow().slots.get(idx) {
            Some(Slot::Parent(weak)) => weak.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn set_parent_memo(&self, idx: usize, parent: Option<&EntityRef>) {
        if let Some(Slot::Parent(weak)) = self.borrow_mut().slots.get_mut(idx) {
            *weak = parent.map(EntityRef::downgrade).unwrap_or_default();
        }
    }

    pub(crate) fn child_slot(&self, idx: usize) -> PersistenceResult<ChildSlot> {
        match self.borrow().slots.get(idx) {
            Some(Slot::Child(state)) => Ok(state.clone()),
            _ => Err(self.layout_error(idx, Cardinality::Child)),
        }
    }

    pub(crate) fn set_child_slot(&self, idx: usize, child: Option<EntityRef>) {
        if let Some(Slot::Child(state)) = self.borrow_mut().slots.get_mut(idx) {
            *state = ChildSlot::Loaded(child);
        }
    }

    /// Run `f` against the collection in slot `idx`.
    ///
    /// The entity stays mutably borrowed for the duration of `f`; `f` must not
    /// access this entity through another handle.
    pub(crate) fn with_collection<R>(
        &self,
        idx: usize,
        f: impl FnOnce(&mut LazyCollection) -> R,
    ) -> PersistenceResult<R> {
        {
            let mut entity = self.borrow_mut();
            if let Some(Slot::Children(collection)) = entity.slots.get_mut(idx) {
                return Ok(f(collection));
            }
        }
        Err(self.layout_error(idx, Cardinality::Children))
    }

    /// Entries of a loaded collection; `None` while unloaded.
    pub(crate) fn collection_entries(&self, idx: usize) -> Option<Vec<EntityRef>> {
        match self.borrow().slots.get(idx) {
            Some(Slot::Children(collection)) => collection.entries().map(<[EntityRef]>::to_vec),
            _ => None,
        }
    }

    /// Children held in memory by slot `idx`, whatever its cardinality.
    pub(crate) fn resolved_children(&self, idx: usize) -> Vec<EntityRef> {
        match self.borrow().slots.get(idx) {
            Some(Slot::Child(ChildSlot::Loaded(Some(child)))) => vec![child.clone()],
            Some(Slot::Children(collection)) => {
                collection.entries().map(<[EntityRef]>::to_vec).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn embedded_at(&self, idx: usize) -> PersistenceResult<Option<EntityRef>> {
        match self.borrow().slots.get(idx) {
            Some(Slot::Embedded(child)) => Ok(child.clone()),
            _ => Err(self.layout_error(idx, Cardinality::EmbeddedChild)),
        }
    }

    pub(crate) fn set_embedded_at(&self, idx: usize, child: Option<EntityRef>) {
        if let Some(Slot::Embedded(slot)) = self.borrow_mut().slots.get_mut(idx) {
            *slot = child;
        }
    }

    pub(crate) fn embedding_parent_at(&self, idx: usize) -> Option<EntityRef> {
        match self.borrow().slots.get(idx) {
            Some(Slot::EmbeddingParent(weak)) => weak.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn set_embedding_parent_at(&self, idx: usize, owner: Option<&EntityRef>) {
        if let Some(Slot::EmbeddingParent(weak)) = self.borrow_mut().slots.get_mut(idx) {
            *weak = owner.map(EntityRef::downgrade).unwrap_or_default();
        }
    }

    /// Owner of this entity through any embedding-parent slot.
    pub(crate) fn embedding_owner(&self) -> Option<EntityRef> {
        self.borrow().slots.iter().find_map(|slot| match slot {
            Slot::EmbeddingParent(weak) => weak.upgrade(),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, NodeDefinition, RelationshipGraph};
    use docunit_core::{EntityDefinition, FieldType};
    use serde_json::json;

    fn graph() -> Arc<RelationshipGraph> {
        let mut builder = GraphBuilder::new();
        builder
            .define(
                EntityDefinition::new("Employee")
                    .field("name", FieldType::String)
                    .field("wage", FieldType::Integer),
            )
            .unwrap()
            .define(EntityDefinition::new("Badge").field("code", FieldType::String))
            .unwrap()
            .embed_child("Employee", NodeDefinition::new("badge"))
            .unwrap();
        builder.build()
    }

    #[test]
    fn entities_compare_by_identifier() {
        let graph = graph();
        let a = graph.new_entity("Employee").unwrap();
        let b = graph.new_entity("Employee").unwrap();
        let unsaved = graph.new_entity("Employee").unwrap();
        a.assign_id(Some(EntityId::new("1")));
        b.assign_id(Some(EntityId::new("2")));

        assert_eq!(a.collection_cmp(&b), Ordering::Less);
        assert_eq!(b.collection_cmp(&a), Ordering::Greater);
        assert_eq!(a.collection_cmp(&a.clone()), Ordering::Equal);
        assert_eq!(unsaved.collection_cmp(&a), Ordering::Greater);

        let other = graph.new_entity("Employee").unwrap();
        unsaved.mark_persisted(true);
        other.mark_persisted(true);
        assert_eq!(unsaved.collection_cmp(&other), Ordering::Equal);
    }

    #[test]
    fn tracked_values_include_embedded_documents() {
        let graph = graph();
        let employee = graph.new_entity("Employee").unwrap();
        employee.set("name", "Ada").unwrap();
        let badge = graph.new_entity("Badge").unwrap();
        badge.set("code", "B-7").unwrap();

        let badge_idx = employee.entity_type().node_index("badge").unwrap();
        assert_eq!(employee.tracked_values()["badge"], JsonValue::Null);

        employee.set_embedded_at(badge_idx, Some(badge));
        let tracked = employee.tracked_values();
        assert_eq!(tracked["name"], json!("Ada"));
        assert_eq!(tracked["wage"], JsonValue::Null);
        assert_eq!(tracked["badge"], json!({"code": "B-7"}));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let graph = graph();
        let employee = graph.new_entity("Employee").unwrap();
        assert_eq!(
            employee.set("salary", 1).unwrap_err(),
            PersistenceError::unknown_field("Employee", "salary")
        );
        assert!(employee.get("salary").is_err());
    }
}
