//! Unit of work: new, changed and removed sets plus the change tracker.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use docunit_core::{EntityId, PersistenceResult};
use docunit_store::DocumentStore;

use crate::change_tracker::{ChangeTracker, Changes};
use crate::config::SessionConfig;
use crate::entity::{EntityKey, EntityRef};
use crate::mapping::DocumentGateway;

/// Insertion-ordered set of entities keyed by identity.
#[derive(Debug, Default)]
struct EntitySet {
    order: Vec<EntityKey>,
    items: HashMap<EntityKey, EntityRef>,
}

impl EntitySet {
    fn insert(&mut self, key: EntityKey, entity: &EntityRef) -> bool {
        if self.items.contains_key(&key) {
            return false;
        }
        self.order.push(key.clone());
        self.items.insert(key, entity.clone());
        true
    }

    fn remove(&mut self, key: &EntityKey) -> Option<EntityRef> {
        let removed = self.items.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    fn contains(&self, key: &EntityKey) -> bool {
        self.items.contains_key(key)
    }

    fn holds(&self, key: &EntityKey, entity: &EntityRef) -> bool {
        self.items.get(key).is_some_and(|held| held.ptr_eq(entity))
    }

    fn entities(&self) -> Vec<EntityRef> {
        self.order
            .iter()
            .filter_map(|key| self.items.get(key).cloned())
            .collect()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.items.clear();
    }
}

/// Counts of store writes made by one commit.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// One unit of work.
///
/// Every registered entity carries an identifier. Clean entities live in the
/// change tracker; an entity is in at most one of the new, changed and
/// removed sets.
#[derive(Debug, Default)]
pub struct Session {
    tracker: ChangeTracker,
    new: EntitySet,
    changed: EntitySet,
    removed: EntitySet,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Schedule `entity` for insertion.
    ///
    /// Ignored when the identity is already known to this session, pending
    /// removal included.
    pub fn register_new(&mut self, entity: &EntityRef) {
        let Some(key) = entity.key() else {
            warn!(entity = %entity.type_name(), "cannot register an entity without identifier");
            return;
        };
        if let Some(existing) = self.tracker.get_key(&key) {
            if !existing.ptr_eq(entity) {
                warn!(%key, "identity already mapped to another instance; ignoring");
            }
            return;
        }
        if self.removed.contains(&key) {
            return;
        }
        if self.new.insert(key.clone(), entity) {
            self.tracker.add(entity);
            debug!(%key, "registered new");
        }
    }

    /// Record field changes on a clean entity. New, removed and untracked
    /// instances are left alone; an entity whose diff is empty leaves the
    /// changed set.
    pub fn register_changed(&mut self, entity: &EntityRef) {
        let Some(key) = entity.key() else {
            return;
        };
        if self.new.contains(&key) || self.removed.contains(&key) {
            return;
        }
        match self.tracker.get_key(&key) {
            Some(canonical) if canonical.ptr_eq(entity) => {}
            _ => return,
        }
        self.tracker.register_changes_on(entity);
        if self.tracker.changes_on(entity).is_empty() {
            self.changed.remove(&key);
        } else if self.changed.insert(key.clone(), entity) {
            debug!(%key, "registered changed");
        }
    }

    /// Schedule deletion. A pending insert is simply dropped.
    ///
    /// Detached entities are accepted only when they were persisted, so a
    /// document can still be deleted after the identity map was cleared.
    pub fn register_removed(&mut self, entity: &EntityRef) {
        let Some(key) = entity.key() else {
            return;
        };
        if self.is_detached(entity) && !entity.is_persisted() {
            debug!(%key, "ignored removal of detached entity");
            return;
        }
        self.changed.remove(&key);
        let was_new = self.new.remove(&key).is_some();
        self.tracker.delete(entity);
        if !was_new && self.removed.insert(key.clone(), entity) {
            debug!(%key, "registered removed");
        }
    }

    /// Track a freshly loaded entity, returning the canonical instance.
    pub fn track_clean(&mut self, entity: &EntityRef) -> EntityRef {
        match entity.key().and_then(|key| self.tracker.get_key(&key)) {
            Some(existing) => existing,
            None => {
                self.register_clean(entity);
                entity.clone()
            }
        }
    }

    /// Track `entity` as clean with its current values as the baseline.
    ///
    /// Identities already known to this session are left as they are.
    pub fn register_clean(&mut self, entity: &EntityRef) {
        if let Some(key) = entity.key() {
            if self.tracker.contains_key(&key) || self.removed.contains(&key) {
                return;
            }
            self.tracker.add(entity);
        }
    }

    pub fn get(&self, type_name: &str, id: &EntityId) -> Option<EntityRef> {
        self.tracker.get(type_name, id)
    }

    /// New, clean or changed. Entities pending removal are not managed.
    ///
    /// States belong to instances: only the canonical instance tracked under a
    /// key is managed, an older copy with the same key is detached.
    pub fn is_managed(&self, entity: &EntityRef) -> bool {
        entity
            .key()
            .is_some_and(|key| self.is_canonical(&key, entity) && !self.removed.contains(&key))
    }

    /// Unknown to every set of this session.
    pub fn is_detached(&self, entity: &EntityRef) -> bool {
        entity
            .key()
            .is_none_or(|key| !self.is_canonical(&key, entity) && !self.removed.holds(&key, entity))
    }

    fn is_canonical(&self, key: &EntityKey, entity: &EntityRef) -> bool {
        self.tracker
            .get_key(key)
            .is_some_and(|canonical| canonical.ptr_eq(entity))
    }

    pub fn is_new(&self, entity: &EntityRef) -> bool {
        self.in_set(&self.new, entity)
    }

    pub fn is_changed(&self, entity: &EntityRef) -> bool {
        self.in_set(&self.changed, entity)
    }

    pub fn is_removed(&self, entity: &EntityRef) -> bool {
        self.in_set(&self.removed, entity)
    }

    pub(crate) fn is_removed_key(&self, key: &EntityKey) -> bool {
        self.removed.contains(key)
    }

    fn in_set(&self, set: &EntitySet, entity: &EntityRef) -> bool {
        entity.key().is_some_and(|key| set.holds(&key, entity))
    }

    /// Forget `entity` entirely.
    pub fn detach(&mut self, entity: &EntityRef) {
        if let Some(key) = entity.key() {
            self.new.remove(&key);
            self.changed.remove(&key);
            self.removed.remove(&key);
            self.tracker.delete(entity);
            debug!(%key, "detached");
        }
    }

    pub fn clear(&mut self) {
        self.new.clear();
        self.changed.clear();
        self.removed.clear();
        self.tracker.clear();
    }

    /// Re-examine every clean entity and register the modified ones.
    pub fn detect_changes(&mut self) {
        let clean: Vec<EntityRef> = self.tracker.entities().cloned().collect();
        for entity in &clean {
            self.register_changed(entity);
        }
    }

    pub fn changes_on(&self, entity: &EntityRef) -> Changes {
        self.tracker.changes_on(entity)
    }

    pub fn new_entities(&self) -> Vec<EntityRef> {
        self.new.entities()
    }

    pub fn changed_entities(&self) -> Vec<EntityRef> {
        self.changed.entities()
    }

    pub fn removed_entities(&self) -> Vec<EntityRef> {
        self.removed.entities()
    }

    /// Nothing is pending.
    pub fn is_clean(&self) -> bool {
        self.new.len() == 0 && self.changed.len() == 0 && self.removed.len() == 0
    }

    /// A session holding only this session's clean entities.
    pub fn into_clean(self) -> Session {
        Session {
            tracker: self.tracker,
            ..Session::default()
        }
    }

    /// Write every pending change: all inserts, then updates, then deletes.
    ///
    /// Stops at the first failing write. Writes already made stay in the
    /// store; the failing entity and everything after it stay pending.
    pub fn commit<S: DocumentStore>(
        &mut self,
        gateway: &DocumentGateway<'_, S>,
        config: &SessionConfig,
    ) -> PersistenceResult<CommitSummary> {
        if config.detect_changes_on_commit {
            self.detect_changes();
        }
        let mut summary = CommitSummary::default();
        let result = self.write_all(gateway, &mut summary);
        match &result {
            Ok(()) => info!(
                inserted = summary.inserted,
                updated = summary.updated,
                deleted = summary.deleted,
                "session committed"
            ),
            Err(e) => error!(
                error = %e,
                inserted = summary.inserted,
                updated = summary.updated,
                deleted = summary.deleted,
                "commit failed"
            ),
        }
        result.map(|()| summary)
    }

    fn write_all<S: DocumentStore>(
        &mut self,
        gateway: &DocumentGateway<'_, S>,
        summary: &mut CommitSummary,
    ) -> PersistenceResult<()> {
        for entity in self.new.entities() {
            gateway.insert(&entity.entity_type(), &entity)?;
            entity.mark_persisted(true);
            if let Some(key) = entity.key() {
                self.new.remove(&key);
            }
            self.tracker.rebaseline(&entity);
            summary.inserted += 1;
        }

        for entity in self.changed.entities() {
            self.tracker.register_changes_on(&entity);
            let changes = self.tracker.changes_on(&entity);
            if !changes.is_empty() {
                gateway.update(&entity.entity_type(), &entity, &changes)?;
                self.tracker.refresh_changes_on(&entity);
                summary.updated += 1;
            }
            if let Some(key) = entity.key() {
                self.changed.remove(&key);
            }
        }

        for entity in self.removed.entities() {
            gateway.delete(&entity.entity_type(), &entity)?;
            entity.mark_persisted(false);
            if let Some(key) = entity.key() {
                self.removed.remove(&key);
            }
            summary.deleted += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, RelationshipGraph};
    use crate::mapping::DocumentMapper;
    use docunit_core::{EntityDefinition, FieldType};
    use docunit_store::InMemoryDocumentStore;
    use serde_json::json;
    use std::sync::Arc;

    fn graph() -> Arc<RelationshipGraph> {
        let mut builder = GraphBuilder::new();
        builder
            .define(
                EntityDefinition::new("Employee")
                    .field("name", FieldType::String)
                    .field("wage", FieldType::Integer),
            )
            .unwrap();
        builder.build()
    }

    fn employee(graph: &RelationshipGraph, id: &str) -> EntityRef {
        let e = graph.new_entity("Employee").unwrap();
        e.assign_id(Some(EntityId::new(id)));
        e.set("wage", 500).unwrap();
        e
    }

    #[test]
    fn states_are_mutually_exclusive() {
        let graph = graph();
        let mut session = Session::new();
        let e = employee(&graph, "1");

        session.register_new(&e);
        assert!(session.is_new(&e) && session.is_managed(&e));
        session.register_changed(&e);
        assert!(!session.is_changed(&e));

        session.register_removed(&e);
        assert!(!session.is_new(&e));
        assert!(!session.is_removed(&e));
        assert!(session.is_detached(&e));

        session.register_clean(&e);
        e.set("wage", 600).unwrap();
        session.register_changed(&e);
        assert!(session.is_changed(&e));
        session.register_removed(&e);
        assert!(session.is_removed(&e) && !session.is_changed(&e));
        assert!(!session.is_managed(&e) && !session.is_detached(&e));

        session.register_new(&e);
        assert!(session.is_removed(&e) && !session.is_new(&e));
    }

    #[test]
    fn duplicate_identity_is_ignored() {
        let graph = graph();
        let mut session = Session::new();
        let original = employee(&graph, "1");
        let copy = employee(&graph, "1");

        session.register_new(&original);
        session.register_new(&copy);
        assert_eq!(session.new_entities().len(), 1);
        assert!(session.new_entities()[0].ptr_eq(&original));
        assert!(session.track_clean(&copy).ptr_eq(&original));
    }

    #[test]
    fn stale_copy_of_a_tracked_key_is_detached() {
        let graph = graph();
        let mut session = Session::new();
        let tracked = employee(&graph, "1");
        let stale = employee(&graph, "1");
        session.register_clean(&tracked);

        assert!(session.is_managed(&tracked) && !session.is_detached(&tracked));
        assert!(session.is_detached(&stale) && !session.is_managed(&stale));

        tracked.set("wage", 700).unwrap();
        session.register_changed(&tracked);
        assert!(session.is_changed(&tracked));
        assert!(!session.is_changed(&stale));
    }

    #[test]
    fn removing_an_unsaved_detached_entity_is_ignored() {
        let graph = graph();
        let store = InMemoryDocumentStore::new();
        let mapper = DocumentMapper::default();
        let gateway = DocumentGateway::new(&store, &mapper);
        let mut session = Session::new();
        let e = employee(&graph, "x");

        session.register_removed(&e);
        assert!(!session.is_removed(&e));
        assert!(session.is_detached(&e));
        let summary = session.commit(&gateway, &SessionConfig::default()).unwrap();
        assert_eq!(summary, CommitSummary::default());
    }

    #[test]
    fn removing_a_persisted_detached_entity_deletes_it() {
        let graph = graph();
        let store = InMemoryDocumentStore::new();
        let mapper = DocumentMapper::default();
        let gateway = DocumentGateway::new(&store, &mapper);
        let mut session = Session::new();
        let e = employee(&graph, "1");
        session.register_new(&e);
        session.commit(&gateway, &SessionConfig::default()).unwrap();

        session.clear();
        assert!(session.is_detached(&e));
        session.register_removed(&e);
        assert!(session.is_removed(&e));
        let summary = session.commit(&gateway, &SessionConfig::default()).unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(store.get("employees", &EntityId::new("1")).is_none());
    }

    #[test]
    fn reverting_a_change_leaves_the_changed_set() {
        let graph = graph();
        let mut session = Session::new();
        let e = employee(&graph, "1");
        session.register_clean(&e);

        e.set("wage", 1_000_000).unwrap();
        session.register_changed(&e);
        assert!(session.is_changed(&e));

        e.set("wage", 500).unwrap();
        session.register_changed(&e);
        assert!(!session.is_changed(&e));
        assert!(session.changes_on(&e).is_empty());
    }

    #[test]
    fn detect_changes_sweeps_clean_entities() {
        let graph = graph();
        let mut session = Session::new();
        let a = employee(&graph, "1");
        let b = employee(&graph, "2");
        session.register_clean(&a);
        session.register_clean(&b);

        b.set("name", "Grace").unwrap();
        session.detect_changes();
        assert!(!session.is_changed(&a));
        assert!(session.is_changed(&b));
    }

    #[test]
    fn commit_inserts_updates_and_deletes() {
        let graph = graph();
        let store = InMemoryDocumentStore::new();
        let mapper = DocumentMapper::default();
        let gateway = DocumentGateway::new(&store, &mapper);
        let mut session = Session::new();

        let a = employee(&graph, "1");
        let b = employee(&graph, "2");
        session.register_new(&a);
        session.register_new(&b);
        let summary = session.commit(&gateway, &SessionConfig::default()).unwrap();
        assert_eq!(summary.inserted, 2);
        assert!(a.is_persisted());
        assert!(session.is_clean());

        a.set("wage", 750).unwrap();
        session.register_removed(&b);
        let summary = session.commit(&gateway, &SessionConfig::default()).unwrap();
        assert_eq!(
            summary,
            CommitSummary {
                inserted: 0,
                updated: 1,
                deleted: 1
            }
        );
        assert_eq!(store.get("employees", &EntityId::new("1")).unwrap()["wage"], json!(750));
        assert!(store.get("employees", &EntityId::new("2")).is_none());
        assert!(!b.is_persisted());
    }

    #[test]
    fn sweep_can_be_disabled() {
        let graph = graph();
        let store = InMemoryDocumentStore::new();
        let mapper = DocumentMapper::default();
        let gateway = DocumentGateway::new(&store, &mapper);
        let mut session = Session::new();
        let e = employee(&graph, "1");
        session.register_new(&e);
        session.commit(&gateway, &SessionConfig::default()).unwrap();

        e.set("wage", 900).unwrap();
        let config = SessionConfig {
            detect_changes_on_commit: false,
            ..SessionConfig::default()
        };
        let summary = session.commit(&gateway, &config).unwrap();
        assert_eq!(summary.updated, 0);
        assert_eq!(store.get("employees", &EntityId::new("1")).unwrap()["wage"], json!(500));
    }
}
