//! Persistence error model.

use thiserror::Error;

/// Result type used across the persistence layer.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Store operation that failed, carried by [`PersistenceError::StoreOperation`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Find,
    Insert,
    Update,
    Delete,
    Aggregate,
}

impl core::fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            StoreOperation::Find => "find",
            StoreOperation::Insert => "insert",
            StoreOperation::Update => "update",
            StoreOperation::Delete => "delete",
            StoreOperation::Aggregate => "aggregate",
        };
        f.write_str(name)
    }
}

/// Persistence-level error.
///
/// Declaration, type and identity errors are programming errors and are
/// returned as soon as they are detected. Store failures wrap the driver's
/// message together with the operation that failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// A relationship declaration was malformed.
    #[error("invalid relationship definition {type_name}.{node}: {reason}")]
    InvalidRelationshipDefinition {
        type_name: String,
        node: String,
        reason: String,
    },

    /// The same node name was declared twice on one type.
    #[error("relationship {type_name}.{node} is already registered")]
    DuplicateRegistration { type_name: String, node: String },

    /// A child relationship was declared against a parent node that does not exist.
    #[error("unresolved parent for {type_name}.{node}: {target} declares no matching parent node")]
    UnresolvedParent {
        type_name: String,
        node: String,
        target: String,
    },

    /// An entity of the wrong type was assigned into a typed slot.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// The identifier of a managed entity cannot change.
    #[error("identifier of managed {type_name} {id} is immutable")]
    ImmutableIdentifier { type_name: String, id: String },

    /// No document exists for the requested identity.
    #[error("{type_name} {id} not found")]
    EntityNotFound { type_name: String, id: String },

    /// A store write was invoked with the wrong type or without an identifier.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("unknown entity type: {0}")]
    UnknownType(String),

    #[error("unknown field {type_name}.{field}")]
    UnknownField { type_name: String, field: String },

    #[error("unknown relationship {type_name}.{node}")]
    UnknownNode { type_name: String, node: String },

    /// The document store rejected an operation.
    #[error("{operation} failed: {message}")]
    StoreOperation {
        operation: StoreOperation,
        message: String,
    },
}

impl PersistenceError {
    pub fn invalid_definition(
        type_name: impl Into<String>,
        node: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidRelationshipDefinition {
            type_name: type_name.into(),
            node: node.into(),
            reason: reason.into(),
        }
    }

    pub fn duplicate(type_name: impl Into<String>, node: impl Into<String>) -> Self {
        Self::DuplicateRegistration {
            type_name: type_name.into(),
            node: node.into(),
        }
    }

    pub fn unresolved_parent(
        type_name: impl Into<String>,
        node: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::UnresolvedParent {
            type_name: type_name.into(),
            node: node.into(),
            target: target.into(),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn not_found(type_name: impl Into<String>, id: impl core::fmt::Display) -> Self {
        Self::EntityNotFound {
            type_name: type_name.into(),
            id: id.to_string(),
        }
    }

    pub fn invalid_entity(msg: impl Into<String>) -> Self {
        Self::InvalidEntity(msg.into())
    }

    pub fn unknown_field(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            type_name: type_name.into(),
            field: field.into(),
        }
    }

    pub fn unknown_node(type_name: impl Into<String>, node: impl Into<String>) -> Self {
        Self::UnknownNode {
            type_name: type_name.into(),
            node: node.into(),
        }
    }

    pub fn store(operation: StoreOperation, message: impl core::fmt::Display) -> Self {
        Self::StoreOperation {
            operation,
            message: message.to_string(),
        }
    }

    pub fn insert_failed(message: impl core::fmt::Display) -> Self {
        Self::store(StoreOperation::Insert, message)
    }

    pub fn update_failed(message: impl core::fmt::Display) -> Self {
        Self::store(StoreOperation::Update, message)
    }

    pub fn delete_failed(message: impl core::fmt::Display) -> Self {
        Self::store(StoreOperation::Delete, message)
    }

    /// The failed store operation, if this is a store error.
    pub fn store_operation(&self) -> Option<StoreOperation> {
        match self {
            Self::StoreOperation { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_name_the_failing_operation() {
        let err = PersistenceError::update_failed("connection reset");
        assert_eq!(err.store_operation(), Some(StoreOperation::Update));
        assert_eq!(err.to_string(), "update failed: connection reset");
    }

    #[test]
    fn declaration_errors_are_not_store_errors() {
        let err = PersistenceError::duplicate("Parent", "children");
        assert_eq!(err.store_operation(), None);
        assert_eq!(err.to_string(), "relationship Parent.children is already registered");
    }
}
