//! Lazily loaded child collections.
//!
//! A [`LazyCollection`] is the in-memory side of a `child_nodes` slot: it stays
//! unloaded until first read, then holds its entries sorted by identifier.
//! Store access and session bookkeeping live in the coordinator's collection
//! view; this module only keeps membership and order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use docunit_core::{PersistenceError, PersistenceResult};

use crate::entity::EntityRef;
use crate::graph::EntityType;

/// Element type of a child collection.
#[derive(Debug)]
pub struct CollectionKind {
    target: Arc<EntityType>,
}

impl CollectionKind {
    pub fn target(&self) -> &EntityType {
        &self.target
    }

    /// Reject entities of any other type.
    pub fn check(&self, entity: &EntityRef) -> PersistenceResult<()> {
        if entity.is_a(self.target.name()) {
            Ok(())
        } else {
            Err(PersistenceError::type_mismatch(
                self.target.name(),
                entity.type_name(),
            ))
        }
    }
}

/// Produces one [`CollectionKind`] per element type, memoized.
#[derive(Debug, Default)]
pub struct CollectionFactory {
    kinds: RwLock<HashMap<String, Arc<CollectionKind>>>,
}

impl CollectionFactory {
    pub fn collection_for(&self, target: &Arc<EntityType>) -> Arc<CollectionKind> {
        if let Some(kind) = self
            .kinds
            .read()
            .ok()
            .and_then(|kinds| kinds.get(target.name()).cloned())
        {
            return kind;
        }

        let fresh = || {
            Arc::new(CollectionKind {
                target: Arc::clone(target),
            })
        };
        match self.kinds.write() {
            Ok(mut kinds) => Arc::clone(kinds.entry(target.name().to_string()).or_insert_with(fresh)),
            Err(_) => fresh(),
        }
    }
}

/// Stable sort by [`EntityRef::collection_cmp`].
pub(crate) fn sort_entities(entries: &mut [EntityRef]) {
    entries.sort_by(EntityRef::collection_cmp);
}

#[derive(Debug)]
pub struct LazyCollection {
    kind: Arc<CollectionKind>,
    foreign_key: String,
    entries: Option<Vec<EntityRef>>,
}

impl LazyCollection {
    pub fn unloaded(kind: Arc<CollectionKind>, foreign_key: impl Into<String>) -> Self {
        Self {
            kind,
            foreign_key: foreign_key.into(),
            entries: None,
        }
    }

    pub fn kind(&self) -> &Arc<CollectionKind> {
        &self.kind
    }

    /// Foreign key field on the element type.
    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn is_loaded(&self) -> bool {
        self.entries.is_some()
    }

    pub fn entries(&self) -> Option<&[EntityRef]> {
        self.entries.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.iter().any(|e| e.ptr_eq(entity)))
    }

    pub(crate) fn set_loaded(&mut self, mut entries: Vec<EntityRef>) {
        sort_entities(&mut entries);
        self.entries = Some(entries);
    }

    /// Drop the loaded entries, returning them.
    pub(crate) fn unload(&mut self) -> Vec<EntityRef> {
        self.entries.take().unwrap_or_default()
    }

    /// Add `entity` keeping the collection order. Loads an empty collection
    /// first when unloaded.
    pub(crate) fn insert_sorted(&mut self, entity: EntityRef) -> bool {
        let entries = self.entries.get_or_insert_with(Vec::new);
        if entries.iter().any(|e| e.ptr_eq(&entity)) {
            return false;
        }
        entries.push(entity);
        sort_entities(entries);
        true
    }

    pub(crate) fn remove(&mut self, entity: &EntityRef) -> bool {
        let Some(entries) = self.entries.as_mut() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !e.ptr_eq(entity));
        entries.len() != before
    }

    pub(crate) fn sort(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            sort_entities(entries);
        }
    }
}

/// Outcome of replacing a collection's contents wholesale.
#[derive(Debug)]
pub struct CollectionDiff {
    /// Final entries, in collection order.
    pub entries: Vec<EntityRef>,
    /// Previous entries absent from the new list.
    pub removed: Vec<EntityRef>,
    /// New entries that were not members before.
    pub added: Vec<EntityRef>,
}

/// Computes the difference between a collection and a replacement list.
///
/// An element of the new list matches a current entry when it is the same
/// instance or shares its identity key; matched entries keep the current
/// instance.
#[derive(Debug)]
pub struct CollectionDiffBuilder<'a> {
    current: &'a LazyCollection,
}

impl<'a> CollectionDiffBuilder<'a> {
    pub fn new(current: &'a LazyCollection) -> Self {
        Self { current }
    }

    pub fn build_with(&self, replacement: Vec<EntityRef>) -> PersistenceResult<CollectionDiff> {
        for entity in &replacement {
            self.current.kind.check(entity)?;
        }
        let current = self.current.entries().unwrap_or_default();

        let matching = |candidate: &EntityRef| {
            current.iter().find(|existing| {
                existing.ptr_eq(candidate)
                    || matches!((existing.key(), candidate.key()), (Some(a), Some(b)) if a == b)
            })
        };

        let mut entries: Vec<EntityRef> = Vec::with_capacity(replacement.len());
        let mut added = Vec::new();
        for candidate in replacement {
            let kept = match matching(&candidate) {
                Some(existing) => existing.clone(),
                None => {
                    if !added.iter().any(|a: &EntityRef| a.ptr_eq(&candidate)) {
                        added.push(candidate.clone());
                    }
                    candidate
                }
            };
            if !entries.iter().any(|e| e.ptr_eq(&kept)) {
                entries.push(kept);
            }
        }

        let removed = current
            .iter()
            .filter(|existing| !entries.iter().any(|e| e.ptr_eq(existing)))
            .cloned()
            .collect();
        sort_entities(&mut entries);
        Ok(CollectionDiff {
            entries,
            removed,
            added,
        })
    }
}
