//! Static schema descriptors.
//!
//! An entity type is described once, as an ordered list of `(name, type)`
//! pairs. Values are then addressed by the field's position in that list
//! instead of by generated accessors.

use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, PersistenceResult};
use crate::value::FieldType;

/// Document field that carries the entity identifier.
pub const ID_FIELD: &str = "_id";

/// A declared scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Declaration of an entity type: name, optional collection name, fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    pub collection: Option<String>,
    pub fields: Vec<FieldDef>,
}

impl EntityDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: None,
            fields: Vec::new(),
        }
    }

    /// Override the collection name derived from the type name.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldDef::new(name, ty));
        self
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Reject empty or reserved names and duplicate fields.
    pub fn validate(&self) -> PersistenceResult<()> {
        if self.name.trim().is_empty() {
            return Err(PersistenceError::invalid_entity("entity type name is empty"));
        }
        if matches!(&self.collection, Some(c) if c.trim().is_empty()) {
            return Err(PersistenceError::invalid_entity(format!(
                "{}: collection name is empty",
                self.name
            )));
        }
        for (idx, field) in self.fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(PersistenceError::invalid_entity(format!(
                    "{}: field at index {idx} has an empty name",
                    self.name
                )));
            }
            if field.name == ID_FIELD {
                return Err(PersistenceError::invalid_entity(format!(
                    "{}: field name {ID_FIELD} is reserved for the identifier",
                    self.name
                )));
            }
            if self.fields[..idx].iter().any(|f| f.name == field.name) {
                return Err(PersistenceError::invalid_entity(format!(
                    "{}: duplicate field {}",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_keep_declaration_order() {
        let def = EntityDefinition::new("Employee")
            .field("name", FieldType::String)
            .field("wage", FieldType::Integer);
        assert_eq!(def.field_index("name"), Some(0));
        assert_eq!(def.field_index("wage"), Some(1));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let def = EntityDefinition::new("Employee")
            .field("wage", FieldType::Integer)
            .field("wage", FieldType::Float);
        assert!(matches!(def.validate(), Err(PersistenceError::InvalidEntity(_))));
    }

    #[test]
    fn identifier_field_name_is_reserved() {
        let def = EntityDefinition::new("Employee").field(ID_FIELD, FieldType::String);
        assert!(def.validate().is_err());
    }
}
