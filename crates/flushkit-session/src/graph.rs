//! Dependency graph and topological sorting.
//!
//! The same graph type orders mapper-level tasks and, inside a cyclical
//! task, individual rows. Nodes and edges are kept in insertion order; when
//! several nodes are ready at once the one registered first wins, so the
//! emitted statement order is reproducible.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Debug;
use std::hash::Hash;

use flushkit_core::{MapperId, RelationshipId};
use indexmap::IndexSet;
use serde::Serialize;

/// A node of the mapper-level graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GraphNode {
    /// The task of a base mapper (shared by its whole inheritance hierarchy).
    Mapper(MapperId),
    /// Stands for the secondary table of a many-to-many relationship.
    AssociationStub(RelationshipId),
    /// Sits between the two mappers of a post_update relationship.
    PostUpdateStub(RelationshipId),
}

impl GraphNode {
    pub fn is_stub(self) -> bool {
        !matches!(self, GraphNode::Mapper(_))
    }

    pub fn mapper(self) -> Option<MapperId> {
        match self {
            GraphNode::Mapper(id) => Some(id),
            _ => None,
        }
    }
}

/// One position of a sorted graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedGroup<N> {
    /// Members in insertion order.
    pub nodes: Vec<N>,
    /// Whether the members depend on each other (including a self-loop).
    pub cyclic: bool,
}

/// Directed graph where an edge `(a, b)` means `a` is processed before `b`.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N> {
    nodes: IndexSet<N>,
    edges: IndexSet<(N, N)>,
}

impl<N> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self {
            nodes: IndexSet::new(),
            edges: IndexSet::new(),
        }
    }
}

const UNVISITED: usize = usize::MAX;

impl<N: Copy + Eq + Hash + Debug> DependencyGraph<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; returns false if it was already known.
    pub fn add_node(&mut self, node: N) -> bool {
        self.nodes.insert(node)
    }

    /// Record that `before` must be processed before `after`.
    ///
    /// Registering the same edge again has no effect. Returns whether the
    /// edge is new.
    pub fn register_dependency(&mut self, before: N, after: N) -> bool {
        self.nodes.insert(before);
        self.nodes.insert(after);
        let added = self.edges.insert((before, after));
        if added {
            tracing::trace!(before = ?before, after = ?after, "Registered dependency");
        }
        added
    }

    pub fn contains(&self, node: &N) -> bool {
        self.nodes.contains(node)
    }

    pub fn has_edge(&self, before: N, after: N) -> bool {
        self.edges.contains(&(before, after))
    }

    pub fn nodes(&self) -> impl Iterator<Item = N> + '_ {
        self.nodes.iter().copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = (N, N)> + '_ {
        self.edges.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn adjacency(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.nodes.len()];
        for (a, b) in &self.edges {
            if let (Some(ia), Some(ib)) = (self.nodes.get_index_of(a), self.nodes.get_index_of(b)) {
                adj[ia].push(ib);
            }
        }
        adj
    }

    /// Strongly connected components (iterative Tarjan), members sorted by
    /// insertion index.
    fn components(&self, adj: &[Vec<usize>]) -> Vec<Vec<usize>> {
        let n = adj.len();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut next = 0;
        let mut components = Vec::new();

        for root in 0..n {
            if index[root] != UNVISITED {
                continue;
            }
            index[root] = next;
            lowlink[root] = next;
            next += 1;
            stack.push(root);
            on_stack[root] = true;
            let mut call: Vec<(usize, usize)> = vec![(root, 0)];

            while let Some(frame) = call.last_mut() {
                let v = frame.0;
                if frame.1 < adj[v].len() {
                    let w = adj[v][frame.1];
                    frame.1 += 1;
                    if index[w] == UNVISITED {
                        index[w] = next;
                        lowlink[w] = next;
                        next += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        call.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                    continue;
                }

                call.pop();
                if let Some(&(parent, _)) = call.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    components.push(component);
                }
            }
        }
        components
    }

    /// Sort the graph, collapsing each cycle into one cyclic group.
    pub fn sort_with_cycles(&self) -> Vec<SortedGroup<N>> {
        let adj = self.adjacency();
        let components = self.components(&adj);
        let mut component_of = vec![0; adj.len()];
        for (c, members) in components.iter().enumerate() {
            for &m in members {
                component_of[m] = c;
            }
        }

        let mut indegree = vec![0usize; components.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); components.len()];
        for (v, targets) in adj.iter().enumerate() {
            for &w in targets {
                let (cv, cw) = (component_of[v], component_of[w]);
                if cv != cw && !successors[cv].contains(&cw) {
                    successors[cv].push(cw);
                    indegree[cw] += 1;
                }
            }
        }

        // Components are keyed by their first-registered member.
        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = components
            .iter()
            .enumerate()
            .filter(|(c, _)| indegree[*c] == 0)
            .map(|(c, members)| Reverse((members[0], c)))
            .collect();

        let mut out = Vec::with_capacity(components.len());
        while let Some(Reverse((_, c))) = ready.pop() {
            let members = &components[c];
            let cyclic = members.len() > 1 || adj[members[0]].contains(&members[0]);
            out.push(SortedGroup {
                nodes: members.iter().map(|&i| self.nodes[i]).collect(),
                cyclic,
            });
            for &s in &successors[c] {
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    ready.push(Reverse((components[s][0], s)));
                }
            }
        }
        out
    }

    /// Sort the graph, failing with the members of the first cycle found.
    pub fn sort_strict(&self) -> std::result::Result<Vec<N>, Vec<N>> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for group in self.sort_with_cycles() {
            if group.cyclic {
                return Err(group.nodes);
            }
            out.extend(group.nodes);
        }
        Ok(out)
    }
}
