//! Field-level change tracking for clean entities.
//!
//! Each tracked field keeps a baseline (the persisted value) and at most one
//! pending value. A field whose current value equals its baseline has no
//! pending value, so changing a field and changing it back leaves no diff.

use std::collections::BTreeMap;
use std::ops::Deref;

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::entity::{EntityKey, EntityRef};
use crate::identity_map::IdentityMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldHistory {
    baseline: JsonValue,
    pending: Option<JsonValue>,
}

/// `from -> to` for one changed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub from: JsonValue,
    pub to: JsonValue,
}

impl FieldChange {
    pub fn new(from: impl Into<JsonValue>, to: impl Into<JsonValue>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

pub type Changes = BTreeMap<String, FieldChange>;

/// Identity map plus per-field snapshots of every tracked entity.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    map: IdentityMap,
    snapshots: BTreeMap<EntityKey, BTreeMap<String, FieldHistory>>,
}

impl Deref for ChangeTracker {
    type Target = IdentityMap;

    fn deref(&self) -> &IdentityMap {
        &self.map
    }
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `entity`, snapshotting its current values as the baseline.
    ///
    /// Already tracked keys keep their snapshot.
    pub fn add(&mut self, entity: &EntityRef) {
        let Some(key) = entity.key() else {
            return;
        };
        self.map.add(entity);
        self.snapshots.entry(key).or_insert_with(|| baseline_of(entity));
    }

    pub fn is_tracked(&self, entity: &EntityRef) -> bool {
        entity
            .key()
            .is_some_and(|key| self.snapshots.contains_key(&key))
    }

    /// Compare current values against the baselines and record pending values.
    pub fn register_changes_on(&mut self, entity: &EntityRef) {
        let Some(history) = entity.key().and_then(|key| self.snapshots.get_mut(&key)) else {
            return;
        };
        let current = entity.tracked_values();
        for (field, slot) in history.iter_mut() {
            let value = current.get(field).cloned().unwrap_or(JsonValue::Null);
            slot.pending = (value != slot.baseline).then_some(value);
        }
    }

    /// Fields with a pending value. Empty for untracked entities.
    pub fn changes_on(&self, entity: &EntityRef) -> Changes {
        entity
            .key()
            .and_then(|key| self.snapshots.get(&key))
            .map(|history| {
                history
                    .iter()
                    .filter_map(|(field, slot)| {
                        slot.pending.as_ref().map(|to| {
                            (field.clone(), FieldChange::new(slot.baseline.clone(), to.clone()))
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Promote pending values to baselines after they were written.
    pub fn refresh_changes_on(&mut self, entity: &EntityRef) {
        let Some(history) = entity.key().and_then(|key| self.snapshots.get_mut(&key)) else {
            return;
        };
        for slot in history.values_mut() {
            if let Some(value) = slot.pending.take() {
                slot.baseline = value;
            }
        }
    }

    /// Replace the snapshot with the entity's current values.
    pub fn rebaseline(&mut self, entity: &EntityRef) {
        let Some(key) = entity.key() else {
            return;
        };
        self.map.add(entity);
        self.snapshots.insert(key, baseline_of(entity));
    }

    pub fn delete(&mut self, entity: &EntityRef) {
        if let Some(key) = entity.key() {
            self.snapshots.remove(&key);
        }
        self.map.delete(entity);
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.snapshots.clear();
    }
}

fn baseline_of(entity: &EntityRef) -> BTreeMap<String, FieldHistory> {
    entity
        .tracked_values()
        .into_iter()
        .map(|(field, value)| {
            (
                field,
                FieldHistory {
                    baseline: value,
                    pending: None,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, RelationshipGraph};
    use docunit_core::{EntityDefinition, EntityId, FieldType};
    use proptest::prelude::*;
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

    fn employee(graph: &RelationshipGraph, wage: i64) -> EntityRef {
        let e = graph.new_entity("Employee").unwrap();
        e.assign_id(Some(EntityId::new("1")));
        e.set("name", "Ada").unwrap();
        e.set("wage", wage).unwrap();
        e
    }

    #[test]
    fn records_changed_fields_only() {
        let graph = graph();
        let e = employee(&graph, 500);
        let mut tracker = ChangeTracker::new();
        tracker.add(&e);

        e.set("wage", 1_000_000).unwrap();
        tracker.register_changes_on(&e);

        let expected = Changes::from([("wage".to_string(), FieldChange::new(500, 1_000_000))]);
        assert_eq!(tracker.changes_on(&e), expected);
    }

    #[test]
    fn refresh_promotes_pending_values() {
        let graph = graph();
        let e = employee(&graph, 500);
        let mut tracker = ChangeTracker::new();
        tracker.add(&e);

        e.set("wage", 600).unwrap();
        tracker.register_changes_on(&e);
        tracker.refresh_changes_on(&e);
        assert!(tracker.changes_on(&e).is_empty());

        e.set("wage", 500).unwrap();
        tracker.register_changes_on(&e);
        assert_eq!(tracker.changes_on(&e)["wage"], FieldChange::new(600, 500));
    }

    #[test]
    fn untracked_entities_have_no_changes() {
        let graph = graph();
        let e = employee(&graph, 1);
        let mut tracker = ChangeTracker::new();
        tracker.register_changes_on(&e);
        assert!(tracker.changes_on(&e).is_empty());
        assert!(!tracker.is_tracked(&e));

        tracker.add(&e);
        tracker.delete(&e);
        assert!(!tracker.contains(&e));
        assert!(!tracker.is_tracked(&e));
    }

    proptest! {
        #[test]
        fn returning_to_the_baseline_clears_the_diff(v1 in any::<i64>(), v2 in any::<i64>()) {
            let graph = graph();
            let e = employee(&graph, v1);
            let mut tracker = ChangeTracker::new();
            tracker.add(&e);

            e.set("wage", v2).unwrap();
            tracker.register_changes_on(&e);
            prop_assert_eq!(tracker.changes_on(&e).is_empty(), v1 == v2);

            e.set("wage", v1).unwrap();
            tracker.register_changes_on(&e);
            prop_assert!(tracker.changes_on(&e).is_empty());
            prop_assert_eq!(e.get("wage").unwrap(), json!(v1));
        }
    }
}
