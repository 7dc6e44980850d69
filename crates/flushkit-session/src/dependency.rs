//! Dependency processors.
//!
//! One [`DependencyProcessor`] exists per compiled relationship. During a
//! flush it:
//!
//! 1. declares mapper-level edges to the dependency graph
//!    ([`register_dependencies`](DependencyProcessor::register_dependencies))
//! 2. walks relationship history to pull related instances into the flush
//!    ([`preprocess_dependencies`](DependencyProcessor::preprocess_dependencies))
//! 3. copies key values between rows once the referenced rows exist
//!    ([`process_dependencies`](DependencyProcessor::process_dependencies))
//!
//! Statements a processor needs beyond plain saves and deletes (post
//! updates, association table rows) are queued on the [`UowTransaction`]
//! and executed by the flush right after the processor returns.

use flushkit_core::{
    Cascade, Direction, Error, FlushError, FlushErrorKind, PassiveDeletes, Relationship,
    RelationshipId, Result,
};

use crate::graph::GraphNode;
use crate::store::{CascadeKind, History, InstanceId};
use crate::sync::{AssociationRow, ClauseSynchronizer, SyncDest};
use crate::unit_of_work::{PendingAction, UowTransaction};

/// State shared by every processor variant.
#[derive(Debug, Clone)]
pub struct RelationProcessor {
    relationship: Relationship,
    cascade: Cascade,
    sync: ClauseSynchronizer,
}

impl RelationProcessor {
    fn new(relationship: &Relationship) -> Self {
        let mut cascade = relationship.cascade;
        if relationship.association {
            cascade.delete = true;
            cascade.delete_orphan = true;
        }
        Self {
            relationship: relationship.clone(),
            cascade,
            sync: ClauseSynchronizer::for_relationship(relationship),
        }
    }

    fn id(&self) -> RelationshipId {
        self.relationship.id
    }

    fn passive_deletes(&self) -> bool {
        self.relationship.passive_deletes != PassiveDeletes::Active
    }

    /// Children keep their foreign keys when the parent goes away.
    fn leaves_children_alone(&self) -> bool {
        self.relationship.passive_deletes == PassiveDeletes::All && !self.relationship.post_update
    }

    fn history(&self, uow: &mut UowTransaction<'_>, obj: InstanceId, passive: bool) -> Result<Option<History>> {
        uow.history(obj, self.id(), passive)
    }

    /// Reject children the relationship's target mapper cannot load.
    fn verify_canload(&self, uow: &UowTransaction<'_>, child: InstanceId) -> Result<()> {
        if !uow.config().enable_typechecks || !self.relationship.enable_typechecks {
            return Ok(());
        }
        let mappers = uow.mappers();
        let child_mapper = uow.store().mapper_of(child);
        if mappers.is_a(child_mapper, self.relationship.target) {
            return Ok(());
        }
        let description = uow.store().describe(child);
        Err(Error::Flush(
            FlushError::new(
                FlushErrorKind::TypeMismatch,
                format!(
                    "attempting to flush an item of type '{}' on relationship '{}.{}', which is handled by mapper '{}' and does not load items of that type; \
                     use a polymorphic target or set enable_typechecks(false)",
                    mappers.mapper(child_mapper).name,
                    mappers.mapper(self.relationship.parent).name,
                    self.relationship.name,
                    mappers.mapper(self.relationship.target).name
                ),
            )
            .with_instances(vec![description]),
        ))
    }

    /// Queue a post update of this relationship's key columns on `obj`
    /// when any related instance is present.
    fn conditional_post_update(&self, uow: &mut UowTransaction<'_>, obj: InstanceId, related: bool) {
        if self.relationship.post_update && related {
            uow.register_post_update(obj, self.sync.dest_columns());
        }
    }

    /// Register an orphaned child and its delete cascade for deletion.
    fn delete_orphan(&self, uow: &mut UowTransaction<'_>, child: InstanceId) -> Result<()> {
        tracing::debug!(
            instance = %uow.store().describe(child),
            relationship = self.relationship.name,
            "Removed child is an orphan, registering for delete"
        );
        uow.register_object(child, true, false);
        for c in uow.store_mut().cascade_iterator(child, CascadeKind::Delete)? {
            uow.register_object(c, true, false);
        }
        Ok(())
    }
}

/// Flush behavior of one relationship, by shape.
#[derive(Debug, Clone)]
pub enum DependencyProcessor {
    /// The child table holds the foreign key.
    OneToMany(RelationProcessor),
    /// The parent table holds the foreign key.
    ManyToOne(RelationProcessor),
    /// Rows of a secondary table link both sides.
    ManyToMany(RelationProcessor),
    /// One-to-many to an association object; children always cascade
    /// delete and delete-orphan.
    Association(RelationProcessor),
}

impl DependencyProcessor {
    pub fn new(relationship: &Relationship) -> Self {
        let inner = RelationProcessor::new(relationship);
        match relationship.direction {
            _ if relationship.association => DependencyProcessor::Association(inner),
            Direction::OneToMany => DependencyProcessor::OneToMany(inner),
            Direction::ManyToOne => DependencyProcessor::ManyToOne(inner),
            Direction::ManyToMany => DependencyProcessor::ManyToMany(inner),
        }
    }

    fn inner(&self) -> &RelationProcessor {
        match self {
            DependencyProcessor::OneToMany(p)
            | DependencyProcessor::ManyToOne(p)
            | DependencyProcessor::ManyToMany(p)
            | DependencyProcessor::Association(p) => p,
        }
    }

    pub fn relationship(&self) -> &Relationship {
        &self.inner().relationship
    }

    pub fn cascade(&self) -> Cascade {
        self.inner().cascade
    }

    pub fn synchronizer(&self) -> &ClauseSynchronizer {
        &self.inner().sync
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DependencyProcessor::OneToMany(_) => "OneToMany",
            DependencyProcessor::ManyToOne(_) => "ManyToOne",
            DependencyProcessor::ManyToMany(_) => "ManyToMany",
            DependencyProcessor::Association(_) => "Association",
        }
    }

    /// Declare graph edges and attach this processor to a task.
    pub fn register_dependencies(&self, uow: &mut UowTransaction<'_>) {
        let p = self.inner();
        let rel = &p.relationship;
        let parent = GraphNode::Mapper(rel.parent);
        let target = GraphNode::Mapper(rel.target);
        match self {
            DependencyProcessor::OneToMany(_) | DependencyProcessor::Association(_) => {
                if rel.post_update {
                    if !rel.is_backref {
                        let stub = GraphNode::PostUpdateStub(rel.id);
                        uow.register_dependency(target, stub);
                        uow.register_dependency(parent, stub);
                        uow.register_processor(stub, rel.id, rel.parent);
                    }
                } else {
                    uow.register_dependency(parent, target);
                    uow.register_processor(parent, rel.id, rel.parent);
                }
            }
            DependencyProcessor::ManyToOne(_) => {
                if rel.post_update {
                    if !rel.is_backref {
                        let stub = GraphNode::PostUpdateStub(rel.id);
                        uow.register_dependency(target, stub);
                        uow.register_dependency(parent, stub);
                        uow.register_processor(stub, rel.id, rel.parent);
                    }
                } else {
                    uow.register_dependency(target, parent);
                    uow.register_processor(target, rel.id, rel.parent);
                }
            }
            DependencyProcessor::ManyToMany(_) => {
                let stub = GraphNode::AssociationStub(rel.id);
                uow.register_dependency(parent, stub);
                uow.register_dependency(target, stub);
                uow.register_processor(stub, rel.id, rel.parent);
            }
        }
    }

    /// Relationship history of one instance.
    pub fn get_object_dependencies(
        &self,
        uow: &mut UowTransaction<'_>,
        obj: InstanceId,
        passive: bool,
    ) -> Result<Option<History>> {
        self.inner().history(uow, obj, passive)
    }

    /// Order two related rows for the row-level sort: the first element of
    /// the pair is written first. `None` when they are the same row.
    pub fn whose_dependent_on_who(&self, obj: InstanceId, other: InstanceId) -> Option<(InstanceId, InstanceId)> {
        if obj == other {
            return None;
        }
        match self {
            DependencyProcessor::OneToMany(_) | DependencyProcessor::Association(_) => Some((obj, other)),
            DependencyProcessor::ManyToOne(_) | DependencyProcessor::ManyToMany(_) => Some((other, obj)),
        }
    }

    // ========================================================================
    // Preprocessing
    // ========================================================================

    /// Register related instances that the flush must also save or delete.
    pub fn preprocess_dependencies(
        &self,
        uow: &mut UowTransaction<'_>,
        deplist: &[InstanceId],
        delete: bool,
    ) -> Result<()> {
        let p = self.inner();
        match self {
            DependencyProcessor::OneToMany(_) | DependencyProcessor::Association(_) => {
                one_to_many_preprocess(p, uow, deplist, delete)
            }
            DependencyProcessor::ManyToOne(_) => many_to_one_preprocess(p, uow, deplist, delete),
            DependencyProcessor::ManyToMany(_) => many_to_many_preprocess(p, uow, deplist, delete),
        }
    }

    // ========================================================================
    // Processing
    // ========================================================================

    /// Synchronize keys for `deplist` after the rows they depend on exist.
    pub fn process_dependencies(
        &self,
        uow: &mut UowTransaction<'_>,
        deplist: &[InstanceId],
        delete: bool,
    ) -> Result<()> {
        let p = self.inner();
        tracing::trace!(
            processor = self.kind_name(),
            relationship = p.relationship.name,
            instances = deplist.len(),
            delete,
            "Processing dependencies"
        );
        match self {
            DependencyProcessor::OneToMany(_) | DependencyProcessor::Association(_) => {
                one_to_many_process(p, uow, deplist, delete)
            }
            DependencyProcessor::ManyToOne(_) => many_to_one_process(p, uow, deplist, delete),
            DependencyProcessor::ManyToMany(_) => many_to_many_process(p, uow, deplist, delete),
        }
    }
}

// ============================================================================
// One-to-many
// ============================================================================

fn one_to_many_preprocess(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    deplist: &[InstanceId],
    delete: bool,
) -> Result<()> {
    let rel = p.id();
    if delete {
        // Children of a deleted parent keep their row but lose the key,
        // unless delete-orphan says they cannot outlive it.
        if p.relationship.post_update || p.cascade.delete || p.leaves_children_alone() {
            return Ok(());
        }
        for &obj in deplist {
            let Some(history) = p.history(uow, obj, p.passive_deletes())? else {
                continue;
            };
            for child in history.deleted.iter().chain(&history.unchanged).copied() {
                if uow.has_parent(child, rel) {
                    if history.unchanged.contains(&child) {
                        uow.register_object(child, false, false);
                    }
                } else if p.cascade.delete_orphan {
                    p.delete_orphan(uow, child)?;
                } else {
                    uow.register_object(child, false, false);
                }
            }
        }
        return Ok(());
    }

    for &obj in deplist {
        let Some(history) = p.history(uow, obj, true)? else {
            continue;
        };
        for &child in &history.added {
            uow.register_object(child, false, false);
        }
        for &child in &history.deleted {
            if !p.cascade.delete_orphan {
                if !p.leaves_children_alone() {
                    uow.register_object(child, false, false);
                }
            } else if !uow.has_parent(child, rel) {
                p.delete_orphan(uow, child)?;
            }
        }
    }
    Ok(())
}

fn one_to_many_process(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    deplist: &[InstanceId],
    delete: bool,
) -> Result<()> {
    let rel = p.id();
    if delete {
        if (p.cascade.delete && !p.relationship.post_update) || p.leaves_children_alone() {
            return Ok(());
        }
        for &obj in deplist {
            let Some(history) = p.history(uow, obj, p.passive_deletes())? else {
                continue;
            };
            for &child in &history.deleted {
                if !uow.has_parent(child, rel) {
                    one_to_many_sync(p, uow, obj, child, true)?;
                    p.conditional_post_update(uow, child, true);
                }
            }
            for &child in &history.unchanged {
                one_to_many_sync(p, uow, obj, child, true)?;
                p.conditional_post_update(uow, child, true);
            }
        }
        return Ok(());
    }

    for &obj in deplist {
        let Some(history) = p.history(uow, obj, true)? else {
            continue;
        };
        for &child in &history.added {
            one_to_many_sync(p, uow, obj, child, false)?;
            p.conditional_post_update(uow, child, true);
        }
        for &child in &history.deleted {
            if !p.cascade.delete_orphan && !p.leaves_children_alone() && !uow.has_parent(child, rel) {
                one_to_many_sync(p, uow, obj, child, true)?;
                p.conditional_post_update(uow, child, true);
            }
        }
    }
    Ok(())
}

fn one_to_many_sync(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    obj: InstanceId,
    child: InstanceId,
    clear_keys: bool,
) -> Result<()> {
    if !p.relationship.post_update && uow.is_deleted(child) {
        return Ok(());
    }
    p.verify_canload(uow, child)?;
    p.sync
        .execute(uow.store_mut(), Some(obj), SyncDest::Instance(child), obj, child, clear_keys)
}

// ============================================================================
// Many-to-one
// ============================================================================

fn many_to_one_preprocess(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    deplist: &[InstanceId],
    delete: bool,
) -> Result<()> {
    if p.relationship.post_update {
        return Ok(());
    }
    let rel = p.id();
    if delete {
        if !p.cascade.delete {
            return Ok(());
        }
        for &obj in deplist {
            let Some(history) = p.history(uow, obj, p.passive_deletes())? else {
                continue;
            };
            for child in history.deleted.iter().chain(&history.unchanged).copied() {
                if !uow.has_parent(child, rel) {
                    p.delete_orphan(uow, child)?;
                }
            }
        }
        return Ok(());
    }

    for &obj in deplist {
        uow.register_object(obj, false, false);
        if !p.cascade.delete_orphan {
            continue;
        }
        let Some(history) = p.history(uow, obj, p.passive_deletes())? else {
            continue;
        };
        for &child in &history.deleted {
            if !uow.has_parent(child, rel) {
                p.delete_orphan(uow, child)?;
            }
        }
    }
    Ok(())
}

fn many_to_one_process(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    deplist: &[InstanceId],
    delete: bool,
) -> Result<()> {
    if delete {
        // The row must stop referencing its target before it can go.
        if !p.relationship.post_update || p.cascade.delete_orphan {
            return Ok(());
        }
        for &obj in deplist {
            many_to_one_sync(p, uow, obj, None, true)?;
            if let Some(history) = p.history(uow, obj, p.passive_deletes())? {
                p.conditional_post_update(uow, obj, !history.is_empty());
            }
        }
        return Ok(());
    }

    for &obj in deplist {
        let Some(history) = p.history(uow, obj, true)? else {
            continue;
        };
        for &child in &history.added {
            many_to_one_sync(p, uow, obj, Some(child), false)?;
        }
        // Set to nothing: the reference goes away with the key.
        if history.added.is_empty() && !history.deleted.is_empty() {
            many_to_one_sync(p, uow, obj, None, true)?;
        }
        p.conditional_post_update(uow, obj, !history.is_empty());
    }
    Ok(())
}

fn many_to_one_sync(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    obj: InstanceId,
    child: Option<InstanceId>,
    clear_keys: bool,
) -> Result<()> {
    if !p.relationship.post_update && uow.is_deleted(obj) {
        return Ok(());
    }
    if let Some(child) = child {
        p.verify_canload(uow, child)?;
    }
    let child = child.unwrap_or(obj);
    p.sync
        .execute(uow.store_mut(), Some(child), SyncDest::Instance(obj), obj, child, clear_keys)
}

// ============================================================================
// Many-to-many
// ============================================================================

fn many_to_many_preprocess(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    deplist: &[InstanceId],
    delete: bool,
) -> Result<()> {
    if delete || !p.cascade.delete_orphan {
        return Ok(());
    }
    let rel = p.id();
    for &obj in deplist {
        let Some(history) = p.history(uow, obj, true)? else {
            continue;
        };
        for &child in &history.deleted {
            if !uow.has_parent(child, rel) {
                p.delete_orphan(uow, child)?;
            }
        }
    }
    Ok(())
}

fn many_to_many_process(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    deplist: &[InstanceId],
    delete: bool,
) -> Result<()> {
    let rel = p.id();
    let reverse = p.relationship.reverse;
    let mut secondary_delete = Vec::new();
    let mut secondary_insert = Vec::new();

    for &obj in deplist {
        let passive = if delete { p.passive_deletes() } else { true };
        let Some(history) = p.history(uow, obj, passive)? else {
            continue;
        };
        let (inserts, deletes) = if delete {
            let gone: Vec<InstanceId> = history.deleted.iter().chain(&history.unchanged).copied().collect();
            (Vec::new(), gone)
        } else {
            (history.added, history.deleted)
        };
        for child in inserts {
            if let Some(row) = association_row(p, uow, rel, reverse, obj, child)? {
                secondary_insert.push(row);
            }
        }
        for child in deletes {
            if let Some(row) = association_row(p, uow, rel, reverse, obj, child)? {
                secondary_delete.push(row);
            }
        }
    }

    if !secondary_delete.is_empty() {
        secondary_delete.sort_by(AssociationRow::sort_cmp);
        uow.queue(PendingAction::SecondaryDelete {
            relationship: rel,
            rows: secondary_delete,
        });
    }
    if !secondary_insert.is_empty() {
        secondary_insert.sort_by(AssociationRow::sort_cmp);
        uow.queue(PendingAction::SecondaryInsert {
            relationship: rel,
            rows: secondary_insert,
        });
    }
    Ok(())
}

/// Build the association row for one pair, unless the reverse side already
/// handled it in this flush.
fn association_row(
    p: &RelationProcessor,
    uow: &mut UowTransaction<'_>,
    rel: RelationshipId,
    reverse: Option<RelationshipId>,
    obj: InstanceId,
    child: InstanceId,
) -> Result<Option<AssociationRow>> {
    if !uow.claim_association(rel, reverse, obj, child) {
        return Ok(None);
    }
    p.verify_canload(uow, child)?;
    let mut row = AssociationRow::new();
    p.sync
        .execute(uow.store_mut(), None, SyncDest::Row(&mut row), obj, child, false)?;
    Ok(Some(row))
}
