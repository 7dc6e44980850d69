//! Flush-scoped unit of work state.
//!
//! A [`UowTransaction`] is built at the start of every flush and dropped
//! once the results are handed back to the store. It owns:
//!
//! - one [`Task`] per base mapper (and per stub node), holding the instances
//!   to save or delete and the dependency processors to run there
//! - the mapper-level [`DependencyGraph`]
//! - bookkeeping shared by the processors during one flush, such as the
//!   association rows already written and the statements processors have
//!   requested (post updates, secondary table writes)
//!
//! Building a plan runs the preprocessing fixed point and sorts the graph.
//! Cycles collapse into a [`CycleGroup`] whose rows are sorted individually.

use std::collections::HashSet;
use std::sync::Arc;

use flushkit_core::{
    Error, FlushError, FlushErrorKind, MapperId, Mappers, RelationshipId, Result,
};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::SessionConfig;
use crate::dependency::DependencyProcessor;
use crate::graph::{DependencyGraph, GraphNode};
use crate::store::{CascadeKind, History, InstanceId, InstanceStore, ObjectState};
use crate::sync::AssociationRow;

// ============================================================================
// Tasks and elements
// ============================================================================

/// A dependency processor attached to a task.
///
/// `target` is the base mapper whose elements are handed to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskProcessor {
    pub relationship: RelationshipId,
    pub target: MapperId,
}

/// One instance registered with a task.
#[derive(Debug, Clone, Default)]
pub struct TaskElement {
    listonly: bool,
    isdelete: bool,
    preprocessed: HashSet<TaskProcessor>,
}

impl TaskElement {
    fn new() -> Self {
        Self {
            listonly: true,
            isdelete: false,
            preprocessed: HashSet::new(),
        }
    }

    /// Only takes part in dependency processing; no statement of its own.
    pub fn listonly(&self) -> bool {
        self.listonly
    }

    pub fn isdelete(&self) -> bool {
        self.isdelete
    }

    /// One-way: an element never goes back to listonly.
    fn set_listonly(&mut self, value: bool) {
        if !value && self.listonly {
            self.listonly = false;
            self.preprocessed.clear();
        }
    }

    fn set_isdelete(&mut self, value: bool) {
        if self.isdelete != value {
            self.isdelete = value;
            self.preprocessed.clear();
        }
    }
}

/// Unit of flush work for one graph node.
#[derive(Debug, Clone)]
pub struct Task {
    pub node: GraphNode,
    elements: IndexMap<InstanceId, TaskElement>,
    processors: IndexSet<TaskProcessor>,
}

impl Task {
    fn new(node: GraphNode) -> Self {
        Self {
            node,
            elements: IndexMap::new(),
            processors: IndexSet::new(),
        }
    }

    pub fn elements(&self) -> impl Iterator<Item = (InstanceId, &TaskElement)> {
        self.elements.iter().map(|(id, e)| (*id, e))
    }

    pub fn element(&self, id: InstanceId) -> Option<&TaskElement> {
        self.elements.get(&id)
    }

    pub fn processors(&self) -> impl Iterator<Item = TaskProcessor> + '_ {
        self.processors.iter().copied()
    }

    /// Instances to INSERT or UPDATE.
    pub fn to_save(&self) -> Vec<InstanceId> {
        self.elements
            .iter()
            .filter(|(_, e)| !e.listonly && !e.isdelete)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Instances to DELETE.
    pub fn to_delete(&self) -> Vec<InstanceId> {
        self.elements
            .iter()
            .filter(|(_, e)| !e.listonly && e.isdelete)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.processors.is_empty()
    }
}

/// A statement a dependency processor asked for while it ran.
#[derive(Debug, Clone)]
pub enum PendingAction {
    /// UPDATE only the given columns of an already written row.
    PostUpdate {
        instance: InstanceId,
        columns: Vec<&'static str>,
    },
    SecondaryDelete {
        relationship: RelationshipId,
        rows: Vec<AssociationRow>,
    },
    SecondaryInsert {
        relationship: RelationshipId,
        rows: Vec<AssociationRow>,
    },
}

// ============================================================================
// Plan
// ============================================================================

/// Processor invocation attached to one row of a cycle group.
#[derive(Debug, Clone, Serialize)]
pub struct RowDependency {
    pub processor: TaskProcessor,
    pub saves: Vec<InstanceId>,
    pub deletes: Vec<InstanceId>,
}

/// One row of a cycle group, in row-level topological order.
#[derive(Debug, Clone, Serialize)]
pub struct RowStep {
    pub instance: InstanceId,
    pub save: bool,
    pub delete: bool,
    pub dependencies: Vec<RowDependency>,
}

/// Mapper tasks that depend on each other, flushed row by row.
#[derive(Debug, Clone, Serialize)]
pub struct CycleGroup {
    pub nodes: Vec<GraphNode>,
    pub rows: Vec<RowStep>,
    /// Processors run once for the whole group after its rows.
    pub processors: Vec<TaskProcessor>,
}

#[derive(Debug, Clone, Serialize)]
pub enum PlanStep {
    Task(GraphNode),
    Cycle(CycleGroup),
}

/// Ordered flush steps.
///
/// Saves and processor invocations run in step order; deletes run in
/// reverse step order afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushPlan {
    pub steps: Vec<PlanStep>,
    lines: Vec<String>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Human readable listing of the plan, one step per line.
    pub fn describe(&self) -> String {
        self.lines.join("\n")
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

// ============================================================================
// UowTransaction
// ============================================================================

/// Flush-scoped state passed to every dependency processor.
pub struct UowTransaction<'s> {
    store: &'s mut InstanceStore,
    mappers: Arc<Mappers>,
    config: SessionConfig,
    processors: Arc<Vec<DependencyProcessor>>,
    graph: DependencyGraph<GraphNode>,
    tasks: IndexMap<GraphNode, Task>,
    association_rows: HashSet<(RelationshipId, InstanceId, InstanceId)>,
    pending: Vec<PendingAction>,
    saved: IndexSet<InstanceId>,
    row_switches: Vec<(InstanceId, InstanceId)>,
}

impl std::fmt::Debug for UowTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UowTransaction")
            .field("tasks", &self.tasks.len())
            .field("edges", &self.graph.edges().count())
            .field("pending", &self.pending.len())
            .field("saved", &self.saved.len())
            .finish()
    }
}

impl<'s> UowTransaction<'s> {
    pub fn new(store: &'s mut InstanceStore, config: SessionConfig) -> Self {
        let mappers = Arc::clone(store.mappers());
        let processors = Arc::new(
            mappers
                .relationships()
                .map(DependencyProcessor::new)
                .collect(),
        );
        Self {
            store,
            mappers,
            config,
            processors,
            graph: DependencyGraph::new(),
            tasks: IndexMap::new(),
            association_rows: HashSet::new(),
            pending: Vec::new(),
            saved: IndexSet::new(),
            row_switches: Vec::new(),
        }
    }

    pub fn store(&self) -> &InstanceStore {
        self.store
    }

    pub fn store_mut(&mut self) -> &mut InstanceStore {
        self.store
    }

    pub fn mappers(&self) -> &Arc<Mappers> {
        &self.mappers
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn graph(&self) -> &DependencyGraph<GraphNode> {
        &self.graph
    }

    pub fn processor(&self, rel: RelationshipId) -> &DependencyProcessor {
        &self.processors[rel.index()]
    }

    pub(crate) fn processor_set(&self) -> Arc<Vec<DependencyProcessor>> {
        Arc::clone(&self.processors)
    }

    pub fn task(&self, node: GraphNode) -> Option<&Task> {
        self.tasks.get(&node)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    fn base(&self, mapper: MapperId) -> MapperId {
        self.mappers.mapper(mapper).base
    }

    fn node_of(&self, id: InstanceId) -> GraphNode {
        GraphNode::Mapper(self.base(self.store.mapper_of(id)))
    }

    /// Get the task of a node, creating it (and registering the
    /// dependencies of its mapper hierarchy) on first use.
    pub fn get_task(&mut self, node: GraphNode) -> &mut Task {
        let node = match node {
            GraphNode::Mapper(m) => GraphNode::Mapper(self.base(m)),
            other => other,
        };
        if !self.tasks.contains_key(&node) {
            self.tasks.insert(node, Task::new(node));
            self.graph.add_node(node);
            if let GraphNode::Mapper(base) = node {
                let processors = Arc::clone(&self.processors);
                for mapper in self.mappers.polymorphic_iterator(base) {
                    let own = self.mappers.mapper(mapper).relationships.clone();
                    for rel in own {
                        processors[rel.index()].register_dependencies(self);
                    }
                }
            }
        }
        self.tasks.entry(node).or_insert_with(|| Task::new(node))
    }

    /// Record that `before` flushes its inserts before `after`.
    pub fn register_dependency(&mut self, before: GraphNode, after: GraphNode) {
        let before = self.get_task(before).node;
        let after = self.get_task(after).node;
        if self.graph.register_dependency(before, after) {
            tracing::debug!(before = ?before, after = ?after, "Registered mapper dependency");
        }
    }

    /// Attach a processor to `node`; it will process the elements of the
    /// task of `from`.
    pub fn register_processor(&mut self, node: GraphNode, relationship: RelationshipId, from: MapperId) {
        let target = self.base(from);
        self.get_task(GraphNode::Mapper(target));
        self.get_task(node).processors.insert(TaskProcessor {
            relationship,
            target,
        });
    }

    /// Whether an instance can take part in this flush.
    fn is_valid(&self, id: InstanceId) -> bool {
        self.store.contains(id)
            && matches!(
                self.store.state(id),
                ObjectState::New | ObjectState::Persistent | ObjectState::Expired
            )
    }

    /// Register an instance for save (or delete) with the task of its mapper.
    ///
    /// Instances outside the session are ignored. Returns whether the
    /// instance was newly added.
    pub fn register_object(&mut self, id: InstanceId, isdelete: bool, listonly: bool) -> bool {
        if !self.is_valid(id) {
            tracing::debug!(instance = %id, "Instance not part of the session, not registering for flush");
            return false;
        }
        tracing::debug!(
            instance = %self.store.describe(id),
            isdelete,
            listonly,
            "Register object for flush"
        );
        let node = self.node_of(id);
        let task = self.get_task(node);
        let mut added = false;
        let element = task.elements.entry(id).or_insert_with(|| {
            added = true;
            TaskElement::new()
        });
        if !listonly {
            element.set_listonly(false);
        }
        if isdelete {
            element.set_isdelete(true);
        }
        added
    }

    /// Register `id` and everything its delete cascade reaches for deletion.
    pub fn register_delete_cascade(&mut self, id: InstanceId) -> Result<()> {
        self.register_object(id, true, false);
        for child in self.store.cascade_iterator(id, CascadeKind::Delete)? {
            self.register_object(child, true, false);
        }
        Ok(())
    }

    /// Remove an instance from its task (used by a row switch).
    pub fn unregister_object(&mut self, id: InstanceId) {
        let node = self.node_of(id);
        if let Some(task) = self.tasks.get_mut(&node) {
            task.elements.shift_remove(&id);
        }
    }

    pub fn is_deleted(&self, id: InstanceId) -> bool {
        self.tasks
            .get(&self.node_of(id))
            .and_then(|t| t.elements.get(&id))
            .is_some_and(|e| e.isdelete)
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.tasks
            .get(&self.node_of(id))
            .is_some_and(|t| t.elements.contains_key(&id))
    }

    /// Relationship history, loading it unless `passive`.
    pub fn history(&mut self, id: InstanceId, rel: RelationshipId, passive: bool) -> Result<Option<History>> {
        if passive {
            Ok(self.store.peek_history(id, rel))
        } else {
            self.store.load_history(id, rel).map(Some)
        }
    }

    pub fn has_parent(&self, child: InstanceId, rel: RelationshipId) -> bool {
        self.store.has_parent_except(child, rel, |holder| self.is_deleted(holder))
    }

    /// Record an association row; false if this pair (or its reverse) was
    /// already handled in this flush.
    pub fn claim_association(
        &mut self,
        rel: RelationshipId,
        reverse: Option<RelationshipId>,
        obj: InstanceId,
        child: InstanceId,
    ) -> bool {
        if reverse.is_some_and(|r| self.association_rows.contains(&(r, child, obj))) {
            return false;
        }
        self.association_rows.insert((rel, obj, child));
        true
    }

    /// Ask for an UPDATE of `columns` on an instance's row.
    pub fn register_post_update(&mut self, id: InstanceId, columns: Vec<&'static str>) {
        if !self.is_valid(id) {
            return;
        }
        tracing::debug!(instance = %self.store.describe(id), columns = ?columns, "Register post update");
        self.pending.push(PendingAction::PostUpdate {
            instance: id,
            columns,
        });
    }

    pub fn queue(&mut self, action: PendingAction) {
        self.pending.push(action);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingAction> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn mark_saved(&mut self, id: InstanceId) {
        self.saved.insert(id);
    }

    pub fn was_saved(&self, id: InstanceId) -> bool {
        self.saved.contains(&id)
    }

    pub(crate) fn record_row_switch(&mut self, new: InstanceId, old: InstanceId) {
        self.row_switches.push((new, old));
    }

    pub fn row_switches(&self) -> &[(InstanceId, InstanceId)] {
        &self.row_switches
    }

    /// Every instance registered with any task.
    pub fn touched(&self) -> Vec<InstanceId> {
        self.tasks
            .values()
            .flat_map(|t| t.elements.keys().copied())
            .collect()
    }

    /// Elements of a base mapper's task handed to a processor.
    pub(crate) fn deplist(&self, tp: TaskProcessor, delete: bool) -> Vec<InstanceId> {
        let parent = self.mappers.relationship(tp.relationship).parent;
        self.tasks
            .get(&GraphNode::Mapper(tp.target))
            .map(|task| {
                task.elements
                    .iter()
                    .filter(|(id, e)| {
                        e.isdelete == delete && self.mappers.is_a(self.store.mapper_of(**id), parent)
                    })
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Preprocessing
    // ========================================================================

    /// Run every processor over the elements it has not seen yet, until a
    /// full pass registers nothing new.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn preprocess(&mut self) -> Result<()> {
        let mut passes = 0;
        loop {
            passes += 1;
            let mut progressed = false;
            let mut i = 0;
            while i < self.tasks.len() {
                let procs: Vec<TaskProcessor> = self.tasks[i].processors.iter().copied().collect();
                for tp in procs {
                    if self.preexecute(tp)? {
                        progressed = true;
                    }
                }
                i += 1;
            }
            if !progressed {
                break;
            }
        }
        tracing::debug!(passes, tasks = self.tasks.len(), "Preprocessing complete");
        Ok(())
    }

    fn preexecute(&mut self, tp: TaskProcessor) -> Result<bool> {
        let processors = Arc::clone(&self.processors);
        let processor = &processors[tp.relationship.index()];
        let mut progressed = false;
        for delete in [false, true] {
            let parent = self.mappers.relationship(tp.relationship).parent;
            let mut pending = Vec::new();
            if let Some(task) = self.tasks.get_mut(&GraphNode::Mapper(tp.target)) {
                for (id, element) in &mut task.elements {
                    if element.isdelete == delete
                        && !element.preprocessed.contains(&tp)
                        && self.mappers.is_a(self.store.mapper_of(*id), parent)
                    {
                        element.preprocessed.insert(tp);
                        pending.push(*id);
                    }
                }
            }
            if !pending.is_empty() {
                progressed = true;
                processor.preprocess_dependencies(self, &pending, delete)?;
            }
        }
        Ok(progressed)
    }

    // ========================================================================
    // Sorting
    // ========================================================================

    /// Preprocess, sort, and assemble the ordered plan.
    pub fn build_plan(&mut self) -> Result<FlushPlan> {
        self.preprocess()?;
        let groups = self.graph.sort_with_cycles();
        tracing::debug!(
            order = ?groups.iter().map(|g| &g.nodes).collect::<Vec<_>>(),
            "Dependency sort"
        );

        let mut steps = Vec::with_capacity(groups.len());
        for group in groups {
            if group.cyclic {
                steps.push(PlanStep::Cycle(self.sort_circular(&group.nodes)?));
            } else {
                steps.push(PlanStep::Task(group.nodes[0]));
            }
        }
        let lines = self.describe_steps(&steps);
        Ok(FlushPlan { steps, lines })
    }

    /// Break a group of mutually dependent tasks into rows ordered by the
    /// relationships between individual instances.
    fn sort_circular(&mut self, nodes: &[GraphNode]) -> Result<CycleGroup> {
        let in_cycle = |this: &Self, mapper: MapperId| nodes.contains(&GraphNode::Mapper(this.base(mapper)));

        let mut cyclic = Vec::new();
        let mut group_processors: Vec<TaskProcessor> = Vec::new();
        for node in nodes {
            let Some(task) = self.tasks.get(node) else {
                continue;
            };
            for tp in task.processors.iter().copied() {
                let rel = self.mappers.relationship(tp.relationship);
                if in_cycle(self, rel.parent) && in_cycle(self, rel.target) {
                    if !cyclic.contains(&tp) {
                        cyclic.push(tp);
                    }
                } else if !group_processors.contains(&tp) {
                    group_processors.push(tp);
                }
            }
        }

        let originals: Vec<(InstanceId, bool)> = nodes
            .iter()
            .filter_map(|n| self.tasks.get(n))
            .flat_map(|t| t.elements.iter().map(|(id, e)| (*id, e.isdelete)))
            .collect();

        let mut rows = DependencyGraph::new();
        for (id, _) in &originals {
            rows.add_node(*id);
        }

        let processors = Arc::clone(&self.processors);
        let mut attached: IndexMap<InstanceId, IndexMap<TaskProcessor, RowDependency>> = IndexMap::new();
        for &(obj, isdelete) in &originals {
            let obj_base = self.base(self.store.mapper_of(obj));
            for &tp in &cyclic {
                let rel = self.mappers.relationship(tp.relationship);
                if tp.target != obj_base || !self.mappers.is_a(self.store.mapper_of(obj), rel.parent) {
                    continue;
                }
                let processor = &processors[tp.relationship.index()];
                let Some(history) = processor.get_object_dependencies(self, obj, true)? else {
                    continue;
                };
                for other in history.sum() {
                    if !self.contains(other) {
                        let node = self.node_of(other);
                        self.get_task(node).elements.insert(other, TaskElement::new());
                        rows.add_node(other);
                    }
                    let owner = match processor.whose_dependent_on_who(obj, other) {
                        Some((before, after)) => {
                            rows.register_dependency(before, after);
                            before
                        }
                        None => obj,
                    };
                    let dep = attached
                        .entry(owner)
                        .or_default()
                        .entry(tp)
                        .or_insert_with(|| RowDependency {
                            processor: tp,
                            saves: Vec::new(),
                            deletes: Vec::new(),
                        });
                    let list = if isdelete { &mut dep.deletes } else { &mut dep.saves };
                    if !list.contains(&obj) {
                        list.push(obj);
                    }
                }
            }
        }

        let order = rows.sort_strict().map_err(|cycle| {
            let instances: Vec<String> = cycle.iter().map(|id| self.store.describe(*id)).collect();
            Error::Flush(
                FlushError::new(
                    FlushErrorKind::CircularDependency,
                    format!(
                        "circular dependency between rows {}; set post_update on one of the relationships involved",
                        instances.join(", ")
                    ),
                )
                .with_instances(instances),
            )
        })?;

        let mut used: HashSet<GraphNode> = HashSet::new();
        let mut steps = Vec::with_capacity(order.len());
        for id in order {
            let node = self.node_of(id);
            used.insert(node);
            let (listonly, isdelete) = self
                .tasks
                .get(&node)
                .and_then(|t| t.elements.get(&id))
                .map_or((true, false), |e| (e.listonly, e.isdelete));
            steps.push(RowStep {
                instance: id,
                save: !listonly && !isdelete,
                delete: !listonly && isdelete,
                dependencies: attached
                    .shift_remove(&id)
                    .map(|deps| deps.into_values().collect())
                    .unwrap_or_default(),
            });
        }

        // Tasks without rows still run their processors once for the group.
        for node in nodes {
            if used.contains(node) {
                continue;
            }
            if let Some(task) = self.tasks.get(node) {
                for tp in task.processors.iter().copied() {
                    if !group_processors.contains(&tp) {
                        group_processors.push(tp);
                    }
                }
            }
        }

        tracing::debug!(
            nodes = ?nodes,
            rows = steps.len(),
            "Resolved cyclical dependency at row level"
        );
        Ok(CycleGroup {
            nodes: nodes.to_vec(),
            rows: steps,
            processors: group_processors,
        })
    }

    fn node_name(&self, node: GraphNode) -> String {
        match node {
            GraphNode::Mapper(m) => self.mappers.mapper(m).name.to_string(),
            GraphNode::AssociationStub(r) | GraphNode::PostUpdateStub(r) => {
                let rel = self.mappers.relationship(r);
                let kind = if matches!(node, GraphNode::AssociationStub(_)) {
                    "association"
                } else {
                    "post_update"
                };
                format!("{kind}({}.{})", self.mappers.mapper(rel.parent).name, rel.name)
            }
        }
    }

    fn processor_name(&self, tp: TaskProcessor) -> String {
        let rel = self.mappers.relationship(tp.relationship);
        format!(
            "{}({}.{})",
            self.processors[tp.relationship.index()].kind_name(),
            self.mappers.mapper(rel.parent).name,
            rel.name
        )
    }

    fn describe_ids(&self, ids: &[InstanceId]) -> String {
        ids.iter()
            .map(|id| self.store.describe(*id))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn describe_steps(&self, steps: &[PlanStep]) -> Vec<String> {
        let mut lines = Vec::new();
        for step in steps {
            match step {
                PlanStep::Task(node) => {
                    let Some(task) = self.tasks.get(node) else {
                        continue;
                    };
                    let saves = task.to_save();
                    if !saves.is_empty() {
                        lines.push(format!("save {}: {}", self.node_name(*node), self.describe_ids(&saves)));
                    }
                    for tp in task.processors() {
                        if !self.deplist(tp, false).is_empty() || !self.deplist(tp, true).is_empty() {
                            lines.push(format!("process {}", self.processor_name(tp)));
                        }
                    }
                }
                PlanStep::Cycle(group) => {
                    let names: Vec<String> = group.nodes.iter().map(|n| self.node_name(*n)).collect();
                    lines.push(format!("cycle [{}]", names.join(", ")));
                    for row in &group.rows {
                        let action = match (row.save, row.delete) {
                            (true, _) => "save",
                            (_, true) => "delete",
                            _ => "list",
                        };
                        lines.push(format!("  {action} {}", self.store.describe(row.instance)));
                        for dep in &row.dependencies {
                            lines.push(format!("    process {}", self.processor_name(dep.processor)));
                        }
                    }
                    for tp in &group.processors {
                        lines.push(format!("  process {}", self.processor_name(*tp)));
                    }
                }
            }
        }
        for step in steps.iter().rev() {
            match step {
                PlanStep::Task(node) => {
                    if let Some(task) = self.tasks.get(node) {
                        let deletes = task.to_delete();
                        if !deletes.is_empty() {
                            lines.push(format!(
                                "delete {}: {}",
                                self.node_name(*node),
                                self.describe_ids(&deletes)
                            ));
                        }
                    }
                }
                PlanStep::Cycle(group) => {
                    for row in group.rows.iter().rev().filter(|r| r.delete) {
                        lines.push(format!("delete {}", self.store.describe(row.instance)));
                    }
                }
            }
        }
        lines
    }
}
