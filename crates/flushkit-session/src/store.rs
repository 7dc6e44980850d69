//! Instance bookkeeping for the unit of work.
//!
//! The store owns every instance the session knows about, keyed by an
//! [`InstanceId`] handle. It tracks column values against their last
//! committed snapshot, the current and committed members of each
//! relationship attribute, and the identity map of persistent rows.
//!
//! Relationship history is exposed through two explicit operations:
//! [`InstanceStore::peek_history`] never loads anything, while
//! [`InstanceStore::load_history`] may call the configured
//! [`RelationshipLoader`] to fetch an unloaded collection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use flushkit_core::value::cmp_keys;
use flushkit_core::{
    Direction, Error, FlushError, FlushErrorKind, MapperId, Mappers, PassiveDeletes, Relationship,
    RelationshipId, Result, Value,
};
use indexmap::IndexSet;
use serde::Serialize;

static NULL: Value = Value::Null;

/// Handle to an instance held by an [`InstanceStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(usize);

impl InstanceId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectState {
    /// Created but never added to the session.
    Transient,
    /// Added to the session, needs INSERT on flush.
    New,
    /// Has a row in the database.
    Persistent,
    /// Row was deleted by a flush.
    Deleted,
    /// Removed from the session.
    Detached,
    /// In-memory state may not match the database after a failed flush.
    Expired,
}

/// Added, unchanged and removed members of one relationship attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub added: Vec<InstanceId>,
    pub unchanged: Vec<InstanceId>,
    pub deleted: Vec<InstanceId>,
}

impl History {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.unchanged.is_empty() && self.deleted.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.deleted.is_empty()
    }

    /// Added then unchanged members.
    pub fn non_deleted(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.added.iter().chain(&self.unchanged).copied()
    }

    /// Every member, added, unchanged and removed.
    pub fn sum(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.non_deleted().chain(self.deleted.iter().copied())
    }

    fn diff(current: &[InstanceId], committed: &[InstanceId]) -> Self {
        let mut history = History::default();
        for id in current {
            if committed.contains(id) {
                history.unchanged.push(*id);
            } else {
                history.added.push(*id);
            }
        }
        history.deleted = committed
            .iter()
            .filter(|id| !current.contains(id))
            .copied()
            .collect();
        history
    }
}

/// Loads the committed members of an unloaded relationship.
///
/// Implementations typically query the database and register the rows they
/// find with [`InstanceStore::attach`].
pub trait RelationshipLoader: Send + Sync {
    fn load(
        &self,
        store: &mut InstanceStore,
        parent: InstanceId,
        relationship: &Relationship,
    ) -> Result<Vec<InstanceId>>;
}

/// Identity of a persistent row: base mapper plus primary key values.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    pub base: MapperId,
    pub pk: Vec<Value>,
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && cmp_keys(&self.pk, &other.pk).is_eq()
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base.hash(state);
        for v in &self.pk {
            v.hash_into(state);
        }
    }
}

#[derive(Debug, Clone)]
enum RelationState {
    Loaded {
        current: Vec<InstanceId>,
        committed: Vec<InstanceId>,
    },
    Unloaded {
        added: Vec<InstanceId>,
        removed: Vec<InstanceId>,
    },
}

impl RelationState {
    fn current(&self) -> &[InstanceId] {
        match self {
            RelationState::Loaded { current, .. } => current,
            RelationState::Unloaded { added, .. } => added,
        }
    }

    fn push(&mut self, child: InstanceId) {
        match self {
            RelationState::Loaded { current, .. } => {
                if !current.contains(&child) {
                    current.push(child);
                }
            }
            RelationState::Unloaded { added, removed } => {
                if let Some(pos) = removed.iter().position(|c| *c == child) {
                    removed.remove(pos);
                } else if !added.contains(&child) {
                    added.push(child);
                }
            }
        }
    }

    /// Returns whether the child was a known member.
    fn drop_member(&mut self, child: InstanceId) -> bool {
        match self {
            RelationState::Loaded { current, .. } => {
                let before = current.len();
                current.retain(|c| *c != child);
                before != current.len()
            }
            RelationState::Unloaded { added, removed } => {
                if let Some(pos) = added.iter().position(|c| *c == child) {
                    added.remove(pos);
                    true
                } else if removed.contains(&child) {
                    false
                } else {
                    removed.push(child);
                    true
                }
            }
        }
    }

    fn history(&self) -> Option<History> {
        match self {
            RelationState::Loaded { current, committed } => Some(History::diff(current, committed)),
            RelationState::Unloaded { added, removed } => {
                if added.is_empty() && removed.is_empty() {
                    None
                } else {
                    Some(History {
                        added: added.clone(),
                        unchanged: Vec::new(),
                        deleted: removed.clone(),
                    })
                }
            }
        }
    }

    fn commit(&mut self) {
        match self {
            RelationState::Loaded { current, committed } => committed.clone_from(current),
            RelationState::Unloaded { added, removed } => {
                added.clear();
                removed.clear();
            }
        }
    }
}

#[derive(Debug, Clone)]
struct InstanceState {
    mapper: MapperId,
    state: ObjectState,
    values: HashMap<&'static str, Value>,
    committed: HashMap<&'static str, Value>,
    identity: Option<Vec<Value>>,
    insert_order: Option<u64>,
    relations: HashMap<RelationshipId, RelationState>,
    /// Relationships this instance was explicitly removed from.
    detached_from: HashSet<RelationshipId>,
}

/// Cascade rule to follow in [`InstanceStore::cascade_iterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeKind {
    SaveUpdate,
    Delete,
}

/// Owns every instance known to a session.
pub struct InstanceStore {
    mappers: Arc<Mappers>,
    instances: Vec<InstanceState>,
    identity_map: HashMap<IdentityKey, InstanceId>,
    /// Instances whose relationship currently contains a child, keyed by
    /// `(child, relationship)`.
    holders: HashMap<(InstanceId, RelationshipId), IndexSet<InstanceId>>,
    new: IndexSet<InstanceId>,
    deleted: IndexSet<InstanceId>,
    loader: Option<Box<dyn RelationshipLoader>>,
    next_insert_order: u64,
    flushing: bool,
}

impl fmt::Debug for InstanceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStore")
            .field("instances", &self.instances.len())
            .field("new", &self.new.len())
            .field("deleted", &self.deleted.len())
            .field("has_loader", &self.loader.is_some())
            .field("flushing", &self.flushing)
            .finish()
    }
}

impl InstanceStore {
    pub fn new(mappers: Arc<Mappers>) -> Self {
        Self {
            mappers,
            instances: Vec::new(),
            identity_map: HashMap::new(),
            holders: HashMap::new(),
            new: IndexSet::new(),
            deleted: IndexSet::new(),
            loader: None,
            next_insert_order: 0,
            flushing: false,
        }
    }

    /// Install the loader used by [`load_history`](Self::load_history).
    pub fn set_loader(&mut self, loader: impl RelationshipLoader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    pub fn mappers(&self) -> &Arc<Mappers> {
        &self.mappers
    }

    // ========================================================================
    // Creating and attaching instances
    // ========================================================================

    /// Create a transient instance of the named mapper.
    pub fn create(&mut self, mapper: &str) -> Result<InstanceId> {
        let mapper = self.mappers.get(mapper)?;
        Ok(self.push_instance(mapper, ObjectState::Transient))
    }

    /// Create a transient instance and set some of its columns.
    pub fn create_with(
        &mut self,
        mapper: &str,
        values: &[(&'static str, Value)],
    ) -> Result<InstanceId> {
        let id = self.create(mapper)?;
        for (col, value) in values {
            self.set(id, col, value.clone())?;
        }
        Ok(id)
    }

    /// Register a row that already exists in the database.
    ///
    /// If the identity map already holds an instance with the same primary
    /// key, that instance is returned unchanged.
    pub fn attach(&mut self, mapper: &str, values: &[(&'static str, Value)]) -> Result<InstanceId> {
        let mapper_id = self.mappers.get(mapper)?;
        let m = self.mappers.mapper(mapper_id);
        let mut pk = Vec::with_capacity(m.primary_key.len());
        for col in &m.primary_key {
            let value = values
                .iter()
                .find(|(c, _)| c == col)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            if value.is_null() {
                return Err(Error::Custom(format!(
                    "cannot attach {} without a value for primary key column '{col}'",
                    m.name
                )));
            }
            pk.push(value);
        }
        let key = IdentityKey { base: m.base, pk };
        if let Some(existing) = self.identity_map.get(&key) {
            return Ok(*existing);
        }

        let id = self.push_instance(mapper_id, ObjectState::Persistent);
        for (col, value) in values {
            let col = self.check_attribute(id, col)?;
            self.instances[id.0].values.insert(col, value.clone());
        }
        let inst = &mut self.instances[id.0];
        inst.committed = inst.values.clone();
        inst.identity = Some(key.pk.clone());
        self.identity_map.insert(key, id);
        Ok(id)
    }

    fn push_instance(&mut self, mapper: MapperId, state: ObjectState) -> InstanceId {
        let id = InstanceId(self.instances.len());
        self.instances.push(InstanceState {
            mapper,
            state,
            values: HashMap::new(),
            committed: HashMap::new(),
            identity: None,
            insert_order: None,
            relations: HashMap::new(),
            detached_from: HashSet::new(),
        });
        id
    }

    // ========================================================================
    // Column access
    // ========================================================================

    pub fn contains(&self, id: InstanceId) -> bool {
        id.0 < self.instances.len()
    }

    /// Fail with `UnknownInstance` for a handle this store never issued.
    pub fn check_instance(&self, id: InstanceId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(Error::Flush(FlushError::new(
                FlushErrorKind::UnknownInstance,
                format!("instance {id} does not belong to this session"),
            )))
        }
    }

    /// Mapper of an instance the store issued.
    pub(crate) fn mapper_of(&self, id: InstanceId) -> MapperId {
        self.instances[id.0].mapper
    }

    /// Mapper of an instance, or `UnknownInstance`.
    pub fn mapper(&self, id: InstanceId) -> Result<MapperId> {
        self.check_instance(id)?;
        Ok(self.mapper_of(id))
    }

    /// Lifecycle state. Handles from another store read as `Detached`.
    pub fn state(&self, id: InstanceId) -> ObjectState {
        self.instances.get(id.0).map_or(ObjectState::Detached, |i| i.state)
    }

    /// Primary key the row had at its last flush or load.
    pub fn identity(&self, id: InstanceId) -> Option<&[Value]> {
        self.instances.get(id.0)?.identity.as_deref()
    }

    pub fn has_identity(&self, id: InstanceId) -> bool {
        self.identity(id).is_some()
    }

    pub fn insert_order(&self, id: InstanceId) -> Option<u64> {
        self.instances.get(id.0)?.insert_order
    }

    /// Current value of a column; unset columns read as NULL.
    pub fn get(&self, id: InstanceId, column: &str) -> &Value {
        self.instances
            .get(id.0)
            .and_then(|i| i.values.get(column))
            .unwrap_or(&NULL)
    }

    /// Value of a column at the last flush or load.
    pub fn committed_value(&self, id: InstanceId, column: &str) -> &Value {
        self.instances
            .get(id.0)
            .and_then(|i| i.committed.get(column))
            .unwrap_or(&NULL)
    }

    /// Current primary key values of an instance.
    pub fn primary_key(&self, id: InstanceId) -> Vec<Value> {
        let Some(inst) = self.instances.get(id.0) else {
            return Vec::new();
        };
        let mapper = self.mappers.mapper(inst.mapper);
        mapper
            .primary_key
            .iter()
            .map(|col| self.get(id, col).clone())
            .collect()
    }

    pub fn set(&mut self, id: InstanceId, column: &str, value: impl Into<Value>) -> Result<()> {
        self.check_instance(id)?;
        let name = self.check_attribute(id, column)?;
        self.instances[id.0].values.insert(name, value.into());
        Ok(())
    }

    /// Write an attribute known to exist on the instance's mapper.
    pub(crate) fn write(&mut self, id: InstanceId, column: &'static str, value: Value) {
        self.instances[id.0].values.insert(column, value);
    }

    /// Record the value a statement just wrote to the database.
    pub(crate) fn set_committed(&mut self, id: InstanceId, column: &'static str, value: Value) {
        self.instances[id.0].committed.insert(column, value);
    }

    /// Take over the database row of `old`: the pending instance `new`
    /// inherits its identity and committed snapshot so the flush can UPDATE
    /// that row instead of deleting and re-inserting it.
    pub(crate) fn adopt_row(&mut self, new: InstanceId, old: InstanceId) {
        let (identity, committed) = {
            let old = &self.instances[old.0];
            (old.identity.clone(), old.committed.clone())
        };
        let inst = &mut self.instances[new.0];
        inst.identity = identity;
        inst.committed = committed;
    }

    fn check_attribute(&self, id: InstanceId, column: &str) -> Result<&'static str> {
        let mapper = self.mappers.mapper(self.mapper_of(id));
        mapper
            .attributes()
            .iter()
            .copied()
            .find(|a| *a == column)
            .ok_or_else(|| {
                Error::config(format!(
                    "mapper '{}' has no column '{column}'",
                    mapper.name
                ))
            })
    }

    /// Columns whose current value differs from the committed snapshot.
    pub fn changed_columns(&self, id: InstanceId) -> Vec<&'static str> {
        let Some(inst) = self.instances.get(id.0) else {
            return Vec::new();
        };
        let mapper = self.mappers.mapper(inst.mapper);
        mapper
            .attributes()
            .iter()
            .copied()
            .filter(|col| {
                let current = inst.values.get(col).unwrap_or(&NULL);
                let committed = inst.committed.get(col).unwrap_or(&NULL);
                current != committed
            })
            .collect()
    }

    /// Whether any column or relationship attribute has pending changes.
    pub fn is_modified(&self, id: InstanceId) -> bool {
        let Some(inst) = self.instances.get(id.0) else {
            return false;
        };
        !self.changed_columns(id).is_empty()
            || inst
                .relations
                .values()
                .any(|r| r.history().is_some_and(|h| h.has_changes()))
    }

    // ========================================================================
    // Relationship attributes
    // ========================================================================

    fn resolve(&self, id: InstanceId, name: &str) -> Result<RelationshipId> {
        let mapper = self.mapper(id)?;
        self.mappers.relationship_by_name(mapper, name).ok_or_else(|| {
            Error::config(format!(
                "mapper '{}' has no relationship '{name}'",
                self.mappers.mapper(mapper).name
            ))
        })
    }

    fn relation_mut(&mut self, id: InstanceId, rel: RelationshipId) -> &mut RelationState {
        let inst = &mut self.instances[id.0];
        let loaded = inst.identity.is_none();
        inst.relations.entry(rel).or_insert_with(|| {
            if loaded {
                RelationState::Loaded {
                    current: Vec::new(),
                    committed: Vec::new(),
                }
            } else {
                RelationState::Unloaded {
                    added: Vec::new(),
                    removed: Vec::new(),
                }
            }
        })
    }

    /// Append `child` to a collection (or set a scalar) relationship.
    pub fn append(&mut self, parent: InstanceId, relationship: &str, child: InstanceId) -> Result<()> {
        let rel = self.resolve(parent, relationship)?;
        self.check_instance(child)?;
        self.link(parent, rel, child, true)
    }

    /// Remove `child` from a relationship.
    pub fn remove(&mut self, parent: InstanceId, relationship: &str, child: InstanceId) -> Result<()> {
        let rel = self.resolve(parent, relationship)?;
        self.check_instance(child)?;
        self.unlink(parent, rel, child, true);
        Ok(())
    }

    /// Set a scalar relationship, replacing its previous value.
    pub fn set_related(
        &mut self,
        parent: InstanceId,
        relationship: &str,
        child: Option<InstanceId>,
    ) -> Result<()> {
        let rel = self.resolve(parent, relationship)?;
        if let Some(child) = child {
            self.check_instance(child)?;
        }
        let previous = self.relation_mut(parent, rel).current().to_vec();
        for old in previous {
            if Some(old) != child {
                self.unlink(parent, rel, old, true);
            }
        }
        match child {
            Some(child) => self.link(parent, rel, child, true),
            None => Ok(()),
        }
    }

    /// Load the relationship's members as known after loading.
    pub fn related(&mut self, parent: InstanceId, relationship: &str) -> Result<Vec<InstanceId>> {
        let rel = self.resolve(parent, relationship)?;
        let history = self.load_history(parent, rel)?;
        Ok(history.non_deleted().collect())
    }

    /// Mark a relationship of a persistent instance as loaded with the given members.
    pub fn set_committed_members(
        &mut self,
        parent: InstanceId,
        relationship: &str,
        members: &[InstanceId],
    ) -> Result<()> {
        let rel = self.resolve(parent, relationship)?;
        for member in members {
            self.check_instance(*member)?;
        }
        self.install_loaded(parent, rel, members.to_vec());
        Ok(())
    }

    fn install_loaded(&mut self, parent: InstanceId, rel: RelationshipId, loaded: Vec<InstanceId>) {
        let pending = self.instances[parent.0].relations.remove(&rel);
        if let Some(previous) = &pending {
            for &child in previous.current() {
                self.unindex_holder(child, rel, parent);
            }
        }
        let mut current = loaded.clone();
        if let Some(RelationState::Unloaded { added, removed }) = pending {
            current.retain(|c| !removed.contains(c));
            let scalar = !self.mappers.relationship(rel).uselist;
            if scalar && !added.is_empty() {
                current.clear();
            }
            for a in added {
                if !current.contains(&a) {
                    current.push(a);
                }
            }
        }
        for &child in &current {
            self.index_holder(child, rel, parent);
        }
        self.instances[parent.0].relations.insert(
            rel,
            RelationState::Loaded {
                current,
                committed: loaded,
            },
        );
    }

    fn index_holder(&mut self, child: InstanceId, rel: RelationshipId, parent: InstanceId) {
        self.holders.entry((child, rel)).or_default().insert(parent);
    }

    fn unindex_holder(&mut self, child: InstanceId, rel: RelationshipId, parent: InstanceId) {
        if let Some(holders) = self.holders.get_mut(&(child, rel)) {
            holders.shift_remove(&parent);
            if holders.is_empty() {
                self.holders.remove(&(child, rel));
            }
        }
    }

    fn link(&mut self, parent: InstanceId, rel: RelationshipId, child: InstanceId, backref: bool) -> Result<()> {
        let relationship = self.mappers.relationship(rel).clone();
        if !relationship.uselist {
            let previous: Vec<InstanceId> = self
                .relation_mut(parent, rel)
                .current()
                .iter()
                .copied()
                .filter(|c| *c != child)
                .collect();
            for old in previous {
                self.unlink(parent, rel, old, backref);
            }
        }
        self.relation_mut(parent, rel).push(child);
        self.index_holder(child, rel, parent);
        self.instances[child.0].detached_from.remove(&rel);

        if backref {
            if let Some(reverse) = relationship.reverse {
                let reverse_rel = self.mappers.relationship(reverse);
                if !reverse_rel.uselist {
                    let previous: Vec<InstanceId> = self
                        .relation_mut(child, reverse)
                        .current()
                        .iter()
                        .copied()
                        .filter(|p| *p != parent)
                        .collect();
                    for old_parent in previous {
                        self.unlink(child, reverse, old_parent, true);
                    }
                }
                self.relation_mut(child, reverse).push(parent);
                self.index_holder(parent, reverse, child);
                self.instances[parent.0].detached_from.remove(&reverse);
            }
        }

        if relationship.cascade.save_update
            && matches!(self.state(parent), ObjectState::New | ObjectState::Persistent)
            && self.state(child) == ObjectState::Transient
        {
            self.add(child)?;
        }
        Ok(())
    }

    fn unlink(&mut self, parent: InstanceId, rel: RelationshipId, child: InstanceId, backref: bool) {
        if self.relation_mut(parent, rel).drop_member(child) {
            self.instances[child.0].detached_from.insert(rel);
        }
        self.unindex_holder(child, rel, parent);
        if backref {
            if let Some(reverse) = self.mappers.relationship(rel).reverse {
                if self.relation_mut(child, reverse).drop_member(parent) {
                    self.instances[parent.0].detached_from.insert(reverse);
                }
                self.unindex_holder(parent, reverse, child);
            }
        }
    }

    /// History of one relationship attribute without loading anything.
    ///
    /// Returns `None` when the attribute is unloaded and unchanged.
    pub fn peek_history(&self, id: InstanceId, rel: RelationshipId) -> Option<History> {
        let inst = self.instances.get(id.0)?;
        match inst.relations.get(&rel) {
            Some(state) => state.history(),
            None if inst.identity.is_none() => Some(History::default()),
            None => None,
        }
    }

    /// History of one relationship attribute, loading it first if needed.
    pub fn load_history(&mut self, id: InstanceId, rel: RelationshipId) -> Result<History> {
        self.check_instance(id)?;
        let loaded = matches!(
            self.instances[id.0].relations.get(&rel),
            Some(RelationState::Loaded { .. })
        );
        if !loaded && self.instances[id.0].identity.is_some() {
            let relationship = self.mappers.relationship(rel).clone();
            let members = match self.loader.take() {
                Some(loader) => {
                    tracing::debug!(
                        instance = %id,
                        relationship = relationship.name,
                        "Loading relationship"
                    );
                    let result = loader.load(self, id, &relationship);
                    self.loader = Some(loader);
                    result?
                }
                None => Vec::new(),
            };
            self.install_loaded(id, rel, members);
        }
        Ok(self.peek_history(id, rel).unwrap_or_default())
    }

    /// Whether a live instance currently holds `child` through `rel`.
    ///
    /// Holders that are deleted or pending delete do not count. A persistent
    /// child with no known holder that was never explicitly removed from
    /// `rel` is assumed to still have its parent, even if that parent was
    /// never loaded.
    pub fn has_parent(&self, child: InstanceId, rel: RelationshipId) -> bool {
        self.has_parent_except(child, rel, |_| false)
    }

    /// [`has_parent`](Self::has_parent), also discounting holders for which
    /// `going` returns true.
    pub(crate) fn has_parent_except(
        &self,
        child: InstanceId,
        rel: RelationshipId,
        going: impl Fn(InstanceId) -> bool,
    ) -> bool {
        let Some(inst) = self.instances.get(child.0) else {
            return false;
        };
        let mut known = false;
        for &holder in self.holders.get(&(child, rel)).into_iter().flatten() {
            match self.state(holder) {
                ObjectState::Detached => {}
                ObjectState::Deleted => known = true,
                _ if self.deleted.contains(&holder) || going(holder) => known = true,
                _ => return true,
            }
        }
        !known && !inst.detached_from.contains(&rel) && inst.identity.is_some()
    }

    /// An instance is an orphan when a delete-orphan relationship targets its
    /// mapper and no parent holds it through any of them.
    pub fn is_orphan(&self, id: InstanceId) -> bool {
        let Ok(mapper) = self.mapper(id) else {
            return false;
        };
        let orphans = self.mappers.delete_orphans(mapper);
        !orphans.is_empty() && orphans.iter().all(|rel| !self.has_parent(id, *rel))
    }

    /// Instances reachable from `id` through relationships with the given cascade.
    pub fn cascade_iterator(&mut self, id: InstanceId, kind: CascadeKind) -> Result<Vec<InstanceId>> {
        self.check_instance(id)?;
        let mut out = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let rels = self.mappers.relationships_of(self.mapper_of(current));
            for rel in rels {
                let relationship = self.mappers.relationship(rel);
                let follow = match kind {
                    CascadeKind::SaveUpdate => relationship.cascade.save_update,
                    CascadeKind::Delete => relationship.cascade.delete,
                };
                if !follow {
                    continue;
                }
                let passive = kind == CascadeKind::SaveUpdate
                    || relationship.passive_deletes != PassiveDeletes::Active;
                let scalar = relationship.direction == Direction::ManyToOne;
                let history = if passive {
                    self.peek_history(current, rel).unwrap_or_default()
                } else {
                    self.load_history(current, rel)?
                };
                let mut children: Vec<InstanceId> = history.non_deleted().collect();
                // A replaced many-to-one target still goes down with its former owner.
                if kind == CascadeKind::Delete && scalar {
                    children.extend(history.deleted.iter().copied());
                }
                for child in children {
                    if visited.insert(child) {
                        out.push(child);
                        stack.push(child);
                    }
                }
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Session membership
    // ========================================================================

    /// Add a transient instance (and its save-update cascade) to the session.
    pub fn add(&mut self, id: InstanceId) -> Result<()> {
        self.check_instance(id)?;
        match self.state(id) {
            ObjectState::Transient => {
                self.instances[id.0].state = ObjectState::New;
                self.instances[id.0].insert_order = Some(self.next_insert_order);
                self.next_insert_order += 1;
                self.new.insert(id);
            }
            ObjectState::Persistent | ObjectState::Expired => {
                self.deleted.shift_remove(&id);
            }
            ObjectState::New => {}
            ObjectState::Deleted | ObjectState::Detached => {
                return Err(Error::Flush(FlushError::new(
                    FlushErrorKind::UnknownInstance,
                    format!("{} is no longer part of the session", self.describe(id)),
                )));
            }
        }
        for child in self.cascade_iterator(id, CascadeKind::SaveUpdate)? {
            if self.state(child) == ObjectState::Transient {
                self.instances[child.0].state = ObjectState::New;
                self.instances[child.0].insert_order = Some(self.next_insert_order);
                self.next_insert_order += 1;
                self.new.insert(child);
            }
        }
        Ok(())
    }

    /// Mark an instance (and its delete cascade) for deletion.
    ///
    /// Deleting a pending instance simply removes it from the session.
    pub fn delete(&mut self, id: InstanceId) -> Result<()> {
        self.check_instance(id)?;
        match self.state(id) {
            ObjectState::New => {
                self.expunge(id);
                return Ok(());
            }
            ObjectState::Persistent | ObjectState::Expired => {}
            _ => {
                return Err(Error::Flush(FlushError::new(
                    FlushErrorKind::UnknownInstance,
                    format!("{} is not persisted", self.describe(id)),
                )));
            }
        }
        self.deleted.insert(id);
        for child in self.cascade_iterator(id, CascadeKind::Delete)? {
            match self.state(child) {
                ObjectState::Persistent | ObjectState::Expired => {
                    self.deleted.insert(child);
                }
                ObjectState::New => self.expunge(child),
                _ => {}
            }
        }
        Ok(())
    }

    /// Remove an instance from the session without deleting its row.
    pub fn expunge(&mut self, id: InstanceId) {
        if !self.contains(id) {
            return;
        }
        self.new.shift_remove(&id);
        self.deleted.shift_remove(&id);
        let inst = &mut self.instances[id.0];
        inst.insert_order = None;
        inst.state = if inst.identity.is_some() {
            ObjectState::Detached
        } else {
            ObjectState::Transient
        };
        if let Some(pk) = inst.identity.clone() {
            let key = IdentityKey {
                base: self.mappers.mapper(inst.mapper).base,
                pk,
            };
            if self.identity_map.get(&key) == Some(&id) {
                self.identity_map.remove(&key);
            }
        }
    }

    pub fn is_pending_delete(&self, id: InstanceId) -> bool {
        self.deleted.contains(&id)
    }

    /// Pending instances in the order they were added.
    pub fn new_instances(&self) -> Vec<InstanceId> {
        self.new.iter().copied().collect()
    }

    /// Persistent instances with pending changes, excluding those marked deleted.
    pub fn dirty_instances(&self) -> Vec<InstanceId> {
        (0..self.instances.len())
            .map(InstanceId)
            .filter(|id| {
                matches!(self.state(*id), ObjectState::Persistent | ObjectState::Expired)
                    && !self.deleted.contains(id)
                    && self.is_modified(*id)
            })
            .collect()
    }

    pub fn deleted_instances(&self) -> Vec<InstanceId> {
        self.deleted.iter().copied().collect()
    }

    /// Look up a persistent instance by base mapper and primary key.
    pub fn lookup_identity(&self, base: MapperId, pk: &[Value]) -> Option<InstanceId> {
        self.identity_map
            .get(&IdentityKey {
                base,
                pk: pk.to_vec(),
            })
            .copied()
    }

    // ========================================================================
    // Flush hand-back
    // ========================================================================

    pub(crate) fn begin_flush(&mut self) -> Result<()> {
        if self.flushing {
            return Err(Error::Flush(FlushError::new(
                FlushErrorKind::Reentrant,
                "Session is already flushing",
            )));
        }
        self.flushing = true;
        Ok(())
    }

    pub(crate) fn end_flush(&mut self) {
        self.flushing = false;
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Record the flushed state of a saved instance as committed.
    pub(crate) fn commit(&mut self, id: InstanceId) {
        let pk = self.primary_key(id);
        let base = self.mappers.mapper(self.mapper_of(id)).base;
        let inst = &mut self.instances[id.0];
        if let Some(old) = inst.identity.take() {
            let old_key = IdentityKey { base, pk: old };
            if self.identity_map.get(&old_key) == Some(&id) {
                self.identity_map.remove(&old_key);
            }
        }
        inst.committed = inst.values.clone();
        inst.insert_order = None;
        inst.state = ObjectState::Persistent;
        for rel in inst.relations.values_mut() {
            rel.commit();
        }
        inst.identity = Some(pk.clone());
        self.new.shift_remove(&id);
        self.identity_map.insert(IdentityKey { base, pk }, id);
    }

    /// Record that an instance's row was deleted.
    pub(crate) fn mark_deleted(&mut self, id: InstanceId) {
        let base = self.mappers.mapper(self.mapper_of(id)).base;
        self.new.shift_remove(&id);
        self.deleted.shift_remove(&id);
        let inst = &mut self.instances[id.0];
        inst.state = ObjectState::Deleted;
        inst.insert_order = None;
        if let Some(pk) = inst.identity.take() {
            let key = IdentityKey { base, pk };
            if self.identity_map.get(&key) == Some(&id) {
                self.identity_map.remove(&key);
            }
        }
    }

    /// Flag a persistent instance as possibly out of sync with the database.
    pub(crate) fn expire(&mut self, id: InstanceId) {
        let inst = &mut self.instances[id.0];
        if inst.state == ObjectState::Persistent {
            inst.state = ObjectState::Expired;
        }
    }

    /// Short human readable description, e.g. `Ball#3(id=5)`.
    pub fn describe(&self, id: InstanceId) -> String {
        let Some(inst) = self.instances.get(id.0) else {
            return format!("unknown{id}");
        };
        let mapper = self.mappers.mapper(inst.mapper);
        let pk: Vec<String> = mapper
            .primary_key
            .iter()
            .map(|col| format!("{col}={}", self.get(id, col)))
            .collect();
        format!("{}{}({})", mapper.name, id, pk.join(", "))
    }
}
