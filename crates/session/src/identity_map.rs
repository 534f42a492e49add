use std::collections::BTreeMap;

use docunit_core::EntityId;

use crate::entity::{EntityKey, EntityRef};

/// The canonical in-memory instance for every known `(type, identifier)`.
///
/// Entities without an identifier are never stored. Iteration follows key
/// order, which keeps change sweeps deterministic.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: BTreeMap<EntityKey, EntityRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `entity` unless its key is already mapped or it has no identifier.
    pub fn add(&mut self, entity: &EntityRef) {
        if let Some(key) = entity.key() {
            self.entries.entry(key).or_insert_with(|| entity.clone());
        }
    }

    pub fn get(&self, type_name: &str, id: &EntityId) -> Option<EntityRef> {
        self.entries
            .get(&EntityKey::new(type_name, id.clone()))
            .cloned()
    }

    pub fn get_key(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.get(key).cloned()
    }

    /// Whether an entity with the same key is mapped.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        entity
            .key()
            .is_some_and(|key| self.entries.contains_key(&key))
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop the entry for `entity`'s key.
    pub fn delete(&mut self, entity: &EntityRef) -> Option<EntityRef> {
        entity.key().and_then(|key| self.entries.remove(&key))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityRef> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
