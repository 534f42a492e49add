//! Entity identifiers and identifier generation.

use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a persisted entity.
///
/// Identifiers are ordered lexicographically; both bundled generators produce
/// values whose lexical order follows generation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<EntityId> for serde_json::Value {
    fn from(value: EntityId) -> Self {
        serde_json::Value::String(value.0)
    }
}

/// Source of fresh identifiers for entities persisted without one.
pub trait IdGenerator {
    fn generate(&self) -> EntityId;
}

impl<G: IdGenerator + ?Sized> IdGenerator for &G {
    fn generate(&self) -> EntityId {
        (**self).generate()
    }
}

/// UUIDv7 (time-ordered) identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn generate(&self) -> EntityId {
        EntityId::from(Uuid::now_v7())
    }
}

/// Deterministic, zero-padded counter identifiers (`"000000000001"`, ...).
///
/// Prefer this in tests where ordering and values must be predictable.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `last` (the first generated id is `last + 1`).
    pub fn starting_after(last: u64) -> Self {
        Self {
            next: AtomicU64::new(last),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self) -> EntityId {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        EntityId(format!("{n:012}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_sort_in_generation_order() {
        let ids = SequentialIdGenerator::new();
        let generated: Vec<EntityId> = (0..20).map(|_| ids.generate()).collect();
        let mut sorted = generated.clone();
        sorted.sort();
        assert_eq!(generated, sorted);
        assert_eq!(generated[0].as_str(), "000000000001");
    }

    #[test]
    fn uuid_ids_are_unique() {
        let ids = UuidV7Generator;
        let a = ids.generate();
        let b = ids.generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = EntityId::new("abc");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("abc"));
    }
}
