//! Relationship graph: entity types, their nodes and the declarations that build them.
//!
//! Declarations are validated eagerly. A graph is assembled once through
//! [`GraphBuilder`] and is read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use docunit_core::{
    DefaultNameResolver, EntityDefinition, FieldDef, FieldType, NameResolver, PersistenceError,
    PersistenceResult,
};

use crate::collection::{CollectionFactory, LazyCollection};
use crate::entity::{ChildSlot, Entity, EntityRef, Slot, WeakEntityRef};

/// Kind of a relationship node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// Reference to the owning entity, stored as a foreign key field.
    Parent,
    /// At most one child holding a foreign key back to this entity.
    Child,
    /// Ordered collection of children holding a foreign key back to this entity.
    Children,
    /// Entity stored inside this entity's document.
    EmbeddedChild,
    /// Back reference from an embedded entity to its owner.
    EmbeddingParent,
}

impl Cardinality {
    pub fn is_child(self) -> bool {
        matches!(self, Cardinality::Child | Cardinality::Children)
    }

    fn declaration(self) -> &'static str {
        match self {
            Cardinality::Parent => "parent_node",
            Cardinality::Child => "child_node",
            Cardinality::Children => "child_nodes",
            Cardinality::EmbeddedChild => "embed_child",
            Cardinality::EmbeddingParent => "embedding_parent",
        }
    }
}

/// A declared relationship slot on an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    /// Persist/remove propagate through this node. Only child nodes cascade.
    pub cascade: bool,
    /// Parent nodes: the declaring type's foreign key field.
    /// Child nodes: the foreign key field on the target type.
    pub foreign_key: Option<String>,
    /// Child nodes: the parent node on the target.
    /// Embedded pairs: the opposite node, once both sides are declared.
    pub inverse: Option<String>,
}

/// A fully declared entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    name: String,
    collection: String,
    fields: Vec<FieldDef>,
    nodes: Vec<Node>,
}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Scalar fields, foreign keys included, in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> PersistenceResult<(usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
            .ok_or_else(|| PersistenceError::unknown_field(&self.name, name))
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    pub fn node(&self, name: &str) -> PersistenceResult<(usize, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, n)| n.name == name)
            .ok_or_else(|| PersistenceError::unknown_node(&self.name, name))
    }

    /// The parent node whose foreign key is stored in `field`, if any.
    pub fn parent_node_for_foreign_key(&self, field: &str) -> Option<(usize, &Node)> {
        self.nodes.iter().enumerate().find(|(_, n)| {
            n.cardinality == Cardinality::Parent && n.foreign_key.as_deref() == Some(field)
        })
    }

    /// Child and children nodes pointing at `target` through `foreign_key`.
    pub fn child_nodes_for<'a>(
        &'a self,
        target: &'a str,
        foreign_key: &'a str,
    ) -> impl Iterator<Item = (usize, &'a Node)> + 'a {
        self.nodes.iter().enumerate().filter(move |(_, n)| {
            n.cardinality.is_child()
                && n.target == target
                && n.foreign_key.as_deref() == Some(foreign_key)
        })
    }
}

/// Options accepted by the relationship declarations.
///
/// Each declaration permits a fixed subset of keys; anything else is rejected
/// with [`PersistenceError::InvalidRelationshipDefinition`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDefinition {
    name: String,
    target: Option<String>,
    cascade: Option<bool>,
    foreign_key: Option<String>,
    embedding_parent: Option<String>,
}

impl NodeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn target(mut self, type_name: impl Into<String>) -> Self {
        self.target = Some(type_name.into());
        self
    }

    pub fn cascade(mut self, cascade: bool) -> Self {
        self.cascade = Some(cascade);
        self
    }

    pub fn foreign_key(mut self, field: impl Into<String>) -> Self {
        self.foreign_key = Some(field.into());
        self
    }

    pub fn embedding_parent(mut self, node: impl Into<String>) -> Self {
        self.embedding_parent = Some(node.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn supplied_keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.target.is_some() {
            keys.push("type");
        }
        if self.cascade.is_some() {
            keys.push("cascade");
        }
        if self.foreign_key.is_some() {
            keys.push("foreign_key");
        }
        if self.embedding_parent.is_some() {
            keys.push("embedding_parent");
        }
        keys
    }
}

/// Assembles entity types and relationship declarations into a [`RelationshipGraph`].
pub struct GraphBuilder {
    names: Box<dyn NameResolver>,
    types: BTreeMap<String, EntityType>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::with_names(DefaultNameResolver)
    }

    pub fn with_names(names: impl NameResolver + 'static) -> Self {
        Self {
            names: Box::new(names),
            types: BTreeMap::new(),
        }
    }

    /// Register an entity type. Its collection defaults to the pluralized,
    /// underscored type name.
    pub fn define(&mut self, definition: EntityDefinition) -> PersistenceResult<&mut Self> {
        definition.validate()?;
        if self.types.contains_key(&definition.name) {
            return Err(PersistenceError::invalid_entity(format!(
                "entity type {} is already defined",
                definition.name
            )));
        }
        let collection = definition
            .collection
            .unwrap_or_else(|| self.names.collection_name(&definition.name));
        self.types.insert(
            definition.name.clone(),
            EntityType {
                name: definition.name,
                collection,
                fields: definition.fields,
                nodes: Vec::new(),
            },
        );
        Ok(self)
    }

    /// Declare a reference to the owning entity.
    ///
    /// Adds the identifier field `<name>_id` to the declaring type.
    pub fn parent_node(
        &mut self,
        type_name: &str,
        definition: NodeDefinition,
    ) -> PersistenceResult<&mut Self> {
        self.prepare(type_name, &definition, Cardinality::Parent, &[], &["type"])?;
        let target = self.single_target(&definition);
        if !self.types.contains_key(&target) {
            return Err(PersistenceError::invalid_definition(
                type_name,
                &definition.name,
                format!("unknown target type {target}"),
            ));
        }

        let foreign_key = format!("{}_id", self.names.underscore(&definition.name));
        let declaring = self.declaring_mut(type_name)?;
        if declaring.parent_node_for_foreign_key(&foreign_key).is_some() {
            return Err(PersistenceError::invalid_definition(
                type_name,
                &definition.name,
                format!("foreign key {foreign_key} is already used by another parent node"),
            ));
        }
        let existing = declaring
            .fields
            .iter()
            .find(|f| f.name == foreign_key)
            .map(|f| f.ty);
        match existing {
            Some(ty) if ty != FieldType::Identifier => {
                return Err(PersistenceError::invalid_definition(
                    type_name,
                    &definition.name,
                    format!("field {foreign_key} exists and is not an identifier"),
                ));
            }
            Some(_) => {}
            None => declaring
                .fields
                .push(FieldDef::new(foreign_key.clone(), FieldType::Identifier)),
        }
        declaring.nodes.push(Node {
            name: definition.name,
            target,
            cardinality: Cardinality::Parent,
            cascade: false,
            foreign_key: Some(foreign_key),
            inverse: None,
        });
        Ok(self)
    }

    /// Declare a single child. The target must declare a parent node pointing back.
    pub fn child_node(
        &mut self,
        type_name: &str,
        definition: NodeDefinition,
    ) -> PersistenceResult<&mut Self> {
        self.declare_child(type_name, definition, Cardinality::Child)
    }

    /// Declare an ordered child collection. The target must declare a parent
    /// node pointing back.
    pub fn child_nodes(
        &mut self,
        type_name: &str,
        definition: NodeDefinition,
    ) -> PersistenceResult<&mut Self> {
        self.declare_child(type_name, definition, Cardinality::Children)
    }

    /// Declare an entity stored inside the declaring type's document.
    pub fn embed_child(
        &mut self,
        type_name: &str,
        definition: NodeDefinition,
    ) -> PersistenceResult<&mut Self> {
        self.prepare(
            type_name,
            &definition,
            Cardinality::EmbeddedChild,
            &[],
            &["type", "embedding_parent"],
        )?;
        let target = self.single_target(&definition);
        let target_type = self.types.get(&target).ok_or_else(|| {
            PersistenceError::invalid_definition(
                type_name,
                &definition.name,
                format!("unknown target type {target}"),
            )
        })?;

        let inverse = match &definition.embedding_parent {
            Some(back) => {
                let matches = target_type.nodes.iter().any(|n| {
                    &n.name == back
                        && n.cardinality == Cardinality::EmbeddingParent
                        && n.target == type_name
                });
                if !matches {
                    return Err(PersistenceError::unresolved_parent(
                        type_name,
                        &definition.name,
                        &target,
                    ));
                }
                Some(back.clone())
            }
            None => target_type
                .nodes
                .iter()
                .find(|n| {
                    n.cardinality == Cardinality::EmbeddingParent
                        && n.target == type_name
                        && n.inverse.is_none()
                })
                .map(|n| n.name.clone()),
        };

        let name = definition.name;
        self.declaring_mut(type_name)?.nodes.push(Node {
            name: name.clone(),
            target: target.clone(),
            cardinality: Cardinality::EmbeddedChild,
            cascade: false,
            foreign_key: None,
            inverse: inverse.clone(),
        });
        if let Some(back) = inverse {
            self.link_inverse(&target, &back, &name);
        }
        Ok(self)
    }

    /// Declare the back reference from an embedded type to its owner.
    pub fn embedding_parent(
        &mut self,
        type_name: &str,
        definition: NodeDefinition,
    ) -> PersistenceResult<&mut Self> {
        self.prepare(
            type_name,
            &definition,
            Cardinality::EmbeddingParent,
            &[],
            &["type"],
        )?;
        let target = self.single_target(&definition);
        let target_type = self.types.get(&target).ok_or_else(|| {
            PersistenceError::invalid_definition(
                type_name,
                &definition.name,
                format!("unknown target type {target}"),
            )
        })?;
        let inverse = target_type
            .nodes
            .iter()
            .find(|n| {
                n.cardinality == Cardinality::EmbeddedChild
                    && n.target == type_name
                    && n.inverse.is_none()
            })
            .map(|n| n.name.clone());

        let name = definition.name;
        self.declaring_mut(type_name)?.nodes.push(Node {
            name: name.clone(),
            target: target.clone(),
            cardinality: Cardinality::EmbeddingParent,
            cascade: false,
            foreign_key: None,
            inverse: inverse.clone(),
        });
        if let Some(owner_node) = inverse {
            self.link_inverse(&target, &owner_node, &name);
        }
        Ok(self)
    }

    pub fn build(self) -> Arc<RelationshipGraph> {
        debug!(types = self.types.len(), "relationship graph built");
        Arc::new(RelationshipGraph {
            types: self
                .types
                .into_iter()
                .map(|(name, ty)| (name, Arc::new(ty)))
                .collect(),
            collections: CollectionFactory::default(),
        })
    }

    fn declare_child(
        &mut self,
        type_name: &str,
        definition: NodeDefinition,
        cardinality: Cardinality,
    ) -> PersistenceResult<&mut Self> {
        self.prepare(
            type_name,
            &definition,
            cardinality,
            &["cascade"],
            &["type", "cascade", "foreign_key"],
        )?;
        let target = match (&definition.target, cardinality) {
            (Some(target), _) => target.clone(),
            (None, Cardinality::Children) => {
                self.names.camelize(&self.names.singularize(&definition.name))
            }
            (None, _) => self.names.camelize(&definition.name),
        };
        let target_type = self.types.get(&target).ok_or_else(|| {
            PersistenceError::unresolved_parent(type_name, &definition.name, &target)
        })?;

        let candidates: Vec<&Node> = target_type
            .nodes
            .iter()
            .filter(|n| {
                n.cardinality == Cardinality::Parent
                    && n.target == type_name
                    && definition
                        .foreign_key
                        .as_ref()
                        .is_none_or(|fk| n.foreign_key.as_ref() == Some(fk))
            })
            .collect();
        let parent = match candidates.as_slice() {
            [] => {
                return Err(PersistenceError::unresolved_parent(
                    type_name,
                    &definition.name,
                    &target,
                ));
            }
            [only] => (*only).clone(),
            _ => {
                return Err(PersistenceError::invalid_definition(
                    type_name,
                    &definition.name,
                    format!("{target} declares several parent nodes for {type_name}; name the foreign_key"),
                ));
            }
        };

        self.declaring_mut(type_name)?.nodes.push(Node {
            name: definition.name,
            target,
            cardinality,
            cascade: definition.cascade.unwrap_or(false),
            foreign_key: parent.foreign_key,
            inverse: Some(parent.name),
        });
        Ok(self)
    }

    fn prepare(
        &self,
        type_name: &str,
        definition: &NodeDefinition,
        cardinality: Cardinality,
        required: &[&str],
        permitted: &[&str],
    ) -> PersistenceResult<()> {
        let declaring = self
            .types
            .get(type_name)
            .ok_or_else(|| PersistenceError::UnknownType(type_name.to_string()))?;
        let name = definition.name.as_str();
        if name.trim().is_empty() {
            return Err(PersistenceError::invalid_definition(
                type_name,
                name,
                "node name is empty",
            ));
        }

        let supplied = definition.supplied_keys();
        if let Some(key) = supplied.iter().find(|k| !permitted.contains(k)) {
            return Err(PersistenceError::invalid_definition(
                type_name,
                name,
                format!("{} does not accept `{key}`", cardinality.declaration()),
            ));
        }
        if let Some(key) = required.iter().find(|k| !supplied.contains(k)) {
            return Err(PersistenceError::invalid_definition(
                type_name,
                name,
                format!("{} requires `{key}`", cardinality.declaration()),
            ));
        }

        if declaring.node_index(name).is_some() || declaring.field_index(name).is_some() {
            return Err(PersistenceError::duplicate(type_name, name));
        }
        Ok(())
    }

    fn single_target(&self, definition: &NodeDefinition) -> String {
        definition
            .target
            .clone()
            .unwrap_or_else(|| self.names.camelize(&definition.name))
    }

    fn declaring_mut(&mut self, type_name: &str) -> PersistenceResult<&mut EntityType> {
        self.types
            .get_mut(type_name)
            .ok_or_else(|| PersistenceError::UnknownType(type_name.to_string()))
    }

    fn link_inverse(&mut self, type_name: &str, node: &str, inverse: &str) {
        if let Some(n) = self
            .types
            .get_mut(type_name)
            .and_then(|ty| ty.nodes.iter_mut().find(|n| n.name == node))
        {
            n.inverse = Some(inverse.to_string());
        }
    }
}

/// Immutable registry of entity types and their relationship nodes.
#[derive(Debug)]
pub struct RelationshipGraph {
    types: BTreeMap<String, Arc<EntityType>>,
    collections: CollectionFactory,
}

impl RelationshipGraph {
    pub fn entity_type(&self, name: &str) -> PersistenceResult<Arc<EntityType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| PersistenceError::UnknownType(name.to_string()))
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.types.values()
    }

    pub fn collections(&self) -> &CollectionFactory {
        &self.collections
    }

    /// A blank, unidentified entity of `type_name`.
    pub fn new_entity(&self, type_name: &str) -> PersistenceResult<EntityRef> {
        let ty = self.entity_type(type_name)?;
        self.instantiate(&ty)
    }

    pub(crate) fn instantiate(&self, ty: &Arc<EntityType>) -> PersistenceResult<EntityRef> {
        let mut slots = Vec::with_capacity(ty.nodes.len());
        for node in &ty.nodes {
            let slot = match node.cardinality {
                Cardinality::Parent => Slot::Parent(WeakEntityRef::default()),
                Cardinality::Child => Slot::Child(ChildSlot::Unloaded),
                Cardinality::Children => {
                    let target = self.entity_type(&node.target)?;
                    let foreign_key = node.foreign_key.clone().ok_or_else(|| {
                        PersistenceError::invalid_definition(
                            &ty.name,
                            &node.name,
                            "child collection without a foreign key",
                        )
                    })?;
                    Slot::Children(LazyCollection::unloaded(
                        self.collections.collection_for(&target),
                        foreign_key,
                    ))
                }
                Cardinality::EmbeddedChild => Slot::Embedded(None),
                Cardinality::EmbeddingParent => Slot::EmbeddingParent(WeakEntityRef::default()),
            };
            slots.push(slot);
        }
        Ok(EntityRef::new(Entity {
            ty: Arc::clone(ty),
            id: None,
            values: vec![JsonValue::Null; ty.fields.len()],
            slots,
            persisted: false,
        }))
    }
}
