//! Relationship accessors.
//!
//! Every accessor is driven by node metadata from the [`RelationshipGraph`]
//! (type, foreign key, inverse), so one implementation serves all entity types.
//!
//! [`RelationshipGraph`]: crate::graph::RelationshipGraph

use serde_json::Value as JsonValue;
use tracing::debug;

use docunit_core::{
    EntityId, ID_FIELD, IdGenerator, PersistenceError, PersistenceResult, StoreOperation,
};
use docunit_store::{DocumentStore, Filter, PipelineStage, Sort, SortOrder};

use crate::collection::CollectionDiffBuilder;
use crate::coordinator::PersistenceCoordinator;
use crate::entity::{ChildSlot, EntityRef};
use crate::graph::{Cardinality, Node};

fn check_type(expected: &str, entity: &EntityRef) -> PersistenceResult<()> {
    if entity.is_a(expected) {
        Ok(())
    } else {
        Err(PersistenceError::type_mismatch(expected, entity.type_name()))
    }
}

fn reject_self(owner: &EntityRef, other: &EntityRef, node: &str) -> PersistenceResult<()> {
    if owner.ptr_eq(other) {
        return Err(PersistenceError::invalid_entity(format!(
            "{}.{node} cannot refer to the entity itself",
            owner.type_name()
        )));
    }
    Ok(())
}

fn edge_of(entries: &[EntityRef], order: SortOrder) -> Option<EntityRef> {
    match order {
        SortOrder::Ascending => entries.first().cloned(),
        SortOrder::Descending => entries.last().cloned(),
    }
}

impl<S: DocumentStore, G: IdGenerator> PersistenceCoordinator<S, G> {
    fn node_of(
        &self,
        entity: &EntityRef,
        name: &str,
        cardinality: Cardinality,
    ) -> PersistenceResult<(usize, Node)> {
        let ty = entity.entity_type();
        let (idx, node) = ty.node(name)?;
        if node.cardinality != cardinality {
            return Err(PersistenceError::invalid_definition(
                ty.name(),
                name,
                format!("{:?} node used as {cardinality:?}", node.cardinality),
            ));
        }
        Ok((idx, node.clone()))
    }

    fn foreign_key_index(&self, entity: &EntityRef, node: &Node) -> PersistenceResult<usize> {
        let fk = node.foreign_key.as_deref().unwrap_or_default();
        entity
            .entity_type()
            .field_index(fk)
            .ok_or_else(|| PersistenceError::unknown_field(entity.type_name(), fk))
    }

    /// The child's parent node on the target type of a child node.
    fn back_node(&self, node: &Node) -> PersistenceResult<(usize, Node)> {
        let target = self.graph.entity_type(&node.target)?;
        let back = node.inverse.as_deref().unwrap_or_default();
        let (idx, back) = target.node(back)?;
        Ok((idx, back.clone()))
    }

    /// Parent through `node`, loaded by foreign key and memoized.
    ///
    /// With a null foreign key only a parent assigned before it had an
    /// identifier is returned.
    pub fn parent(&mut self, child: &EntityRef, node: &str) -> PersistenceResult<Option<EntityRef>> {
        let (idx, node) = self.node_of(child, node, Cardinality::Parent)?;
        let fk_idx = self.foreign_key_index(child, &node)?;
        let Some(fk) = child.foreign_key_at(fk_idx) else {
            return Ok(child.parent_memo(idx).filter(|p| p.id().is_none()));
        };
        if let Some(memo) = child.parent_memo(idx) {
            if memo.id().as_ref() == Some(&fk) {
                return Ok(Some(memo));
            }
        }
        let parent = self.find_optional(&node.target, &fk)?;
        child.set_parent_memo(idx, parent.as_ref());
        Ok(parent)
    }

    /// Point `child` at `parent` (or at nothing).
    ///
    /// The child joins the parent's inverse collection when that collection
    /// is already in memory.
    pub fn set_parent(
        &mut self,
        child: &EntityRef,
        node: &str,
        parent: Option<&EntityRef>,
    ) -> PersistenceResult<()> {
        let (idx, node) = self.node_of(child, node, Cardinality::Parent)?;
        if let Some(p) = parent {
            check_type(&node.target, p)?;
            reject_self(child, p, &node.name)?;
        }
        self.write_foreign_key(child, idx, &node, parent.and_then(EntityRef::id))?;
        child.set_parent_memo(idx, parent);
        if let Some(p) = parent {
            self.attach_to_parent(p, child, &node)?;
        }
        Ok(())
    }

    /// Write the foreign key behind a parent node.
    pub fn set_foreign_key(
        &mut self,
        child: &EntityRef,
        node: &str,
        id: Option<EntityId>,
    ) -> PersistenceResult<()> {
        let (idx, node) = self.node_of(child, node, Cardinality::Parent)?;
        self.write_foreign_key(child, idx, &node, id)
    }

    /// The foreign key writer.
    ///
    /// Former parents still linked by the old key lose the child from their
    /// in-memory slots. A parent whose identifier matches neither the old nor
    /// the new key is left alone.
    pub(crate) fn write_foreign_key(
        &mut self,
        child: &EntityRef,
        idx: usize,
        node: &Node,
        new: Option<EntityId>,
    ) -> PersistenceResult<()> {
        let fk_idx = self.foreign_key_index(child, node)?;
        let old = child.foreign_key_at(fk_idx);
        let memo = child.parent_memo(idx);

        child.set_value_at(fk_idx, new.clone().map_or(JsonValue::Null, Into::into));
        let memo_still_valid =
            matches!((&memo, &new), (Some(m), Some(n)) if m.id().as_ref() == Some(n));
        if !memo_still_valid {
            child.set_parent_memo(idx, None);
        }
        self.mark_changed(child);

        let mut former: Vec<EntityRef> = Vec::new();
        if let Some(old_id) = &old {
            former.extend(self.session.get(&node.target, old_id));
        }
        if let Some(m) = memo {
            if !former.iter().any(|f| f.ptr_eq(&m)) {
                former.push(m);
            }
        }
        for parent in former {
            let pid = parent.id();
            if pid.is_some() && pid == new {
                continue;
            }
            if pid != old {
                continue;
            }
            self.detach_from_parent(&parent, child, node)?;
        }
        Ok(())
    }

    /// Drop `child` from every in-memory slot of `parent` fed by `node`'s key.
    fn detach_from_parent(
        &mut self,
        parent: &EntityRef,
        child: &EntityRef,
        node: &Node,
    ) -> PersistenceResult<()> {
        let fk = node.foreign_key.as_deref().unwrap_or_default();
        let child_type = child.type_name();
        let parent_type = parent.entity_type();
        for (pidx, pnode) in parent_type.child_nodes_for(&child_type, fk) {
            match pnode.cardinality {
                Cardinality::Children => {
                    if parent.with_collection(pidx, |c| c.remove(child))? {
                        debug!(parent = %parent_type.name(), node = %pnode.name, "child left collection");
                    }
                }
                Cardinality::Child => {
                    if let ChildSlot::Loaded(Some(held)) = parent.child_slot(pidx)? {
                        if held.ptr_eq(child) {
                            parent.set_child_slot(pidx, None);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn attach_to_parent(
        &mut self,
        parent: &EntityRef,
        child: &EntityRef,
        node: &Node,
    ) -> PersistenceResult<()> {
        let fk = node.foreign_key.as_deref().unwrap_or_default();
        let child_type = child.type_name();
        let parent_type = parent.entity_type();
        // Collections of an unidentified parent are known to be empty in the store.
        let unidentified = parent.id().is_none();
        for (pidx, pnode) in parent_type.child_nodes_for(&child_type, fk) {
            match pnode.cardinality {
                Cardinality::Children => {
                    parent.with_collection(pidx, |c| {
                        if c.is_loaded() || unidentified {
                            c.insert_sorted(child.clone());
                        }
                    })?;
                }
                Cardinality::Child => {
                    let vacant = match parent.child_slot(pidx)? {
                        ChildSlot::Loaded(None) => true,
                        ChildSlot::Unloaded => unidentified,
                        ChildSlot::Loaded(Some(_)) => false,
                    };
                    if vacant {
                        parent.set_child_slot(pidx, Some(child.clone()));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Single child through `node`, loaded by foreign key on first access.
    pub fn child(&mut self, parent: &EntityRef, node: &str) -> PersistenceResult<Option<EntityRef>> {
        let (idx, node) = self.node_of(parent, node, Cardinality::Child)?;
        if let ChildSlot::Loaded(child) = parent.child_slot(idx)? {
            return Ok(child);
        }
        let loaded = match parent.id() {
            None => None,
            Some(pid) => {
                let (fk_idx, back_idx) = self.child_link(&node)?;
                let ty = self.graph.entity_type(&node.target)?;
                let fk = node.foreign_key.clone().unwrap_or_default();
                let docs = self.query(&ty, &Filter::by(fk, pid.clone()), &Sort::ascending(ID_FIELD))?;
                let found = self
                    .load_documents(&ty, docs)?
                    .into_iter()
                    .find(|c| c.foreign_key_at(fk_idx).as_ref() == Some(&pid));
                if let Some(c) = &found {
                    c.set_parent_memo(back_idx, Some(parent));
                }
                found
            }
        };
        parent.set_child_slot(idx, loaded.clone());
        Ok(loaded)
    }

    /// Replace the single child. The previous child loses its foreign key and
    /// is scheduled for removal.
    pub fn set_child(
        &mut self,
        parent: &EntityRef,
        node: &str,
        child: Option<&EntityRef>,
    ) -> PersistenceResult<()> {
        let (idx, node_def) = self.node_of(parent, node, Cardinality::Child)?;
        if let Some(c) = child {
            check_type(&node_def.target, c)?;
            reject_self(parent, c, node)?;
        }
        let previous = self.child(parent, node)?;
        if matches!((&previous, child), (Some(p), Some(c)) if p.ptr_eq(c)) {
            return Ok(());
        }

        let (fk_idx, back_idx) = self.child_link(&node_def)?;
        if let Some(prev) = &previous {
            prev.set_value_at(fk_idx, JsonValue::Null);
            prev.set_parent_memo(back_idx, None);
            self.session.register_removed(prev);
        }
        parent.set_child_slot(idx, child.cloned());
        if let Some(c) = child {
            let (_, back) = self.back_node(&node_def)?;
            self.set_parent(c, &back.name, Some(parent))?;
        }
        Ok(())
    }

    /// View over the child collection `node` of `owner`.
    pub fn collection(
        &mut self,
        owner: &EntityRef,
        node: &str,
    ) -> PersistenceResult<CollectionProxy<'_, S, G>> {
        let (idx, node) = self.node_of(owner, node, Cardinality::Children)?;
        Ok(CollectionProxy {
            units: self,
            owner: owner.clone(),
            idx,
            node,
        })
    }

    pub fn embedded(&self, owner: &EntityRef, node: &str) -> PersistenceResult<Option<EntityRef>> {
        let (idx, _) = self.node_of(owner, node, Cardinality::EmbeddedChild)?;
        owner.embedded_at(idx)
    }

    pub fn embedding_parent_of(
        &self,
        child: &EntityRef,
        node: &str,
    ) -> PersistenceResult<Option<EntityRef>> {
        let (idx, _) = self.node_of(child, node, Cardinality::EmbeddingParent)?;
        Ok(child.embedding_parent_at(idx))
    }

    /// Embed `child` into `owner`, moving it out of a former owner.
    pub fn set_embedded(
        &mut self,
        owner: &EntityRef,
        node: &str,
        child: Option<&EntityRef>,
    ) -> PersistenceResult<()> {
        let (idx, node_def) = self.node_of(owner, node, Cardinality::EmbeddedChild)?;
        if let Some(c) = child {
            check_type(&node_def.target, c)?;
            self.check_embedding_cycle(owner, c, node)?;
        }
        let previous = owner.embedded_at(idx)?;
        if matches!((&previous, child), (Some(p), Some(c)) if p.ptr_eq(c)) {
            return Ok(());
        }

        let target = self.graph.entity_type(&node_def.target)?;
        let back_idx = node_def
            .inverse
            .as_deref()
            .and_then(|n| target.node_index(n));
        if let (Some(prev), Some(back)) = (&previous, back_idx) {
            prev.set_embedding_parent_at(back, None);
        }
        if let Some(c) = child {
            if let Some(former) = c.embedding_owner() {
                if !former.ptr_eq(owner) {
                    self.release_embedded(&former, c);
                }
            }
            if let Some(back) = back_idx {
                c.set_embedding_parent_at(back, Some(owner));
            }
        }
        owner.set_embedded_at(idx, child.cloned());
        self.mark_changed(owner);
        Ok(())
    }

    /// Move `child` under `owner` through the opposite embed node.
    pub fn set_embedding_parent(
        &mut self,
        child: &EntityRef,
        node: &str,
        owner: Option<&EntityRef>,
    ) -> PersistenceResult<()> {
        let (idx, node_def) = self.node_of(child, node, Cardinality::EmbeddingParent)?;
        let Some(embed_node) = node_def.inverse.clone() else {
            return Err(PersistenceError::invalid_definition(
                child.type_name(),
                node,
                format!("{} declares no embed_child for this node", node_def.target),
            ));
        };
        match owner {
            Some(o) => {
                check_type(&node_def.target, o)?;
                self.set_embedded(o, &embed_node, Some(child))
            }
            None => match child.embedding_parent_at(idx) {
                Some(former) => self.set_embedded(&former, &embed_node, None),
                None => Ok(()),
            },
        }
    }

    fn release_embedded(&mut self, former: &EntityRef, child: &EntityRef) {
        let ty = former.entity_type();
        for (idx, node) in ty.nodes().iter().enumerate() {
            if node.cardinality != Cardinality::EmbeddedChild {
                continue;
            }
            if let Ok(Some(held)) = former.embedded_at(idx) {
                if held.ptr_eq(child) {
                    former.set_embedded_at(idx, None);
                }
            }
        }
        self.mark_changed(former);
    }

    fn check_embedding_cycle(
        &self,
        owner: &EntityRef,
        child: &EntityRef,
        node: &str,
    ) -> PersistenceResult<()> {
        let mut current = Some(owner.clone());
        let mut hops = 0;
        while let Some(e) = current {
            reject_self(&e, child, node)?;
            hops += 1;
            if hops > self.config().max_cascade_depth {
                break;
            }
            current = e.embedding_owner();
        }
        Ok(())
    }
}

/// Lazily loaded, identifier-ordered view of a child collection.
///
/// Borrowing the coordinator keeps session bookkeeping and store access in
/// one place while the view is alive.
pub struct CollectionProxy<'c, S, G> {
    units: &'c mut PersistenceCoordinator<S, G>,
    owner: EntityRef,
    idx: usize,
    node: Node,
}

impl<S: DocumentStore, G: IdGenerator> CollectionProxy<'_, S, G> {
    pub fn owner(&self) -> &EntityRef {
        &self.owner
    }

    pub fn is_loaded(&self) -> bool {
        self.owner.collection_entries(self.idx).is_some()
    }

    fn ensure_loaded(&mut self) -> PersistenceResult<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let entries = self.fetch()?;
        self.owner.with_collection(self.idx, |c| c.set_loaded(entries))
    }

    fn fetch(&mut self) -> PersistenceResult<Vec<EntityRef>> {
        let Some(owner_id) = self.owner.id() else {
            return Ok(Vec::new());
        };
        let (fk_idx, back_idx) = self.units.child_link(&self.node)?;
        let ty = self.units.graph.entity_type(&self.node.target)?;
        let fk = self.node.foreign_key.clone().unwrap_or_default();
        let docs = self.units.query(
            &ty,
            &Filter::by(fk, owner_id.clone()),
            &Sort::ascending(ID_FIELD),
        )?;
        let entries: Vec<EntityRef> = self
            .units
            .load_documents(&ty, docs)?
            .into_iter()
            .filter(|c| c.foreign_key_at(fk_idx).as_ref() == Some(&owner_id))
            .collect();
        for child in &entries {
            child.set_parent_memo(back_idx, Some(&self.owner));
        }
        debug!(owner = %self.owner.type_name(), node = %self.node.name, entries = entries.len(), "collection loaded");
        Ok(entries)
    }

    /// Add `entity`, pointing its foreign key at the owner.
    pub fn push(&mut self, entity: &EntityRef) -> PersistenceResult<()> {
        reject_self(&self.owner, entity, &self.node.name)?;
        self.owner
            .with_collection(self.idx, |c| c.kind().check(entity))??;
        self.ensure_loaded()?;
        if self
            .owner
            .with_collection(self.idx, |c| c.contains(entity))?
        {
            return Ok(());
        }

        let (back_idx, back) = self.units.back_node(&self.node)?;
        self.units
            .write_foreign_key(entity, back_idx, &back, self.owner.id())?;
        entity.set_parent_memo(back_idx, Some(&self.owner));
        self.owner
            .with_collection(self.idx, |c| c.insert_sorted(entity.clone()))?;
        Ok(())
    }

    /// Take `entity` out of the collection.
    ///
    /// The entity is scheduled for deletion unless its foreign key already
    /// points at another parent.
    pub fn remove(&mut self, entity: &EntityRef) -> PersistenceResult<bool> {
        self.ensure_loaded()?;
        if !self.owner.with_collection(self.idx, |c| c.remove(entity))? {
            return Ok(false);
        }
        self.drop_member(entity)?;
        Ok(true)
    }

    fn drop_member(&mut self, entity: &EntityRef) -> PersistenceResult<()> {
        let (fk_idx, back_idx) = self.units.child_link(&self.node)?;
        let fk = entity.foreign_key_at(fk_idx);
        if fk.is_none() || fk == self.owner.id() {
            if entity
                .parent_memo(back_idx)
                .is_some_and(|m| m.ptr_eq(&self.owner))
            {
                entity.set_parent_memo(back_idx, None);
            }
            self.units.session.register_removed(entity);
        }
        Ok(())
    }

    /// Discard the loaded entries (detaching them) and load again.
    pub fn reload(&mut self) -> PersistenceResult<()> {
        let previous = self.owner.with_collection(self.idx, |c| c.unload())?;
        for entity in &previous {
            self.units.session.detach(entity);
        }
        self.ensure_loaded()
    }

    pub fn all(&mut self) -> PersistenceResult<Vec<EntityRef>> {
        self.ensure_loaded()?;
        Ok(self.owner.collection_entries(self.idx).unwrap_or_default())
    }

    pub fn each(&mut self, mut f: impl FnMut(&EntityRef)) -> PersistenceResult<()> {
        for entity in self.all()? {
            f(&entity);
        }
        Ok(())
    }

    pub fn get(&mut self, index: usize) -> PersistenceResult<Option<EntityRef>> {
        Ok(self.all()?.get(index).cloned())
    }

    pub fn size(&mut self) -> PersistenceResult<usize> {
        self.ensure_loaded()?;
        self.owner.with_collection(self.idx, |c| c.len())
    }

    /// Smallest entry. Queries a single document while unloaded.
    pub fn first(&mut self) -> PersistenceResult<Option<EntityRef>> {
        self.edge(SortOrder::Ascending)
    }

    /// Largest entry. Queries a single document while unloaded.
    pub fn last(&mut self) -> PersistenceResult<Option<EntityRef>> {
        self.edge(SortOrder::Descending)
    }

    fn edge(&mut self, order: SortOrder) -> PersistenceResult<Option<EntityRef>> {
        if let Some(entries) = self.owner.collection_entries(self.idx) {
            return Ok(edge_of(&entries, order));
        }
        let Some(owner_id) = self.owner.id() else {
            return Ok(None);
        };
        let (fk_idx, _) = self.units.child_link(&self.node)?;
        let ty = self.units.graph.entity_type(&self.node.target)?;
        let fk = self.node.foreign_key.clone().unwrap_or_default();
        let sort = match order {
            SortOrder::Ascending => Sort::ascending(ID_FIELD),
            SortOrder::Descending => Sort::descending(ID_FIELD),
        };
        let stages = [
            PipelineStage::Match(Filter::by(fk, owner_id.clone())),
            PipelineStage::Sort(sort),
            PipelineStage::Limit(1),
        ];
        let docs = self
            .units
            .store
            .aggregate(ty.collection(), &stages)
            .map_err(|e| PersistenceError::store(StoreOperation::Aggregate, e))?;
        let head = self
            .units
            .load_documents(&ty, docs)?
            .into_iter()
            .find(|c| c.foreign_key_at(fk_idx).as_ref() == Some(&owner_id));
        if head.is_some() {
            return Ok(head);
        }
        // The stored edge is pending removal or moved away in memory.
        self.ensure_loaded()?;
        Ok(self
            .owner
            .collection_entries(self.idx)
            .and_then(|entries| edge_of(&entries, order)))
    }

    /// Replace the contents with `replacement`.
    ///
    /// Entries left out are removed as by [`CollectionProxy::remove`]; new
    /// entries get their foreign key pointed at the owner.
    pub fn assign(&mut self, replacement: Vec<EntityRef>) -> PersistenceResult<()> {
        for entity in &replacement {
            reject_self(&self.owner, entity, &self.node.name)?;
        }
        self.ensure_loaded()?;
        let diff = self
            .owner
            .with_collection(self.idx, |c| CollectionDiffBuilder::new(c).build_with(replacement))??;

        for entity in &diff.removed {
            self.drop_member(entity)?;
        }
        let (back_idx, back) = self.units.back_node(&self.node)?;
        for entity in &diff.added {
            self.units
                .write_foreign_key(entity, back_idx, &back, self.owner.id())?;
            entity.set_parent_memo(back_idx, Some(&self.owner));
        }
        self.owner
            .with_collection(self.idx, |c| c.set_loaded(diff.entries))
    }
}
