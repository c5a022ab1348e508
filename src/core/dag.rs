//! Dependency resolution into an execution plan.
//!
//! Resolution happens per invocation, against whatever the registry holds at
//! that moment: a structural pass checks that every reachable name exists,
//! then a depth-first post-order walk yields the execution order and detects
//! cycles. The result is an [`ExecutionPlan`], a DAG the scheduler walks.

use crate::core::registry::TaskRegistry;
use crate::core::task::{Composition, ErrorPolicy, Task, TaskId};
use crate::error::{Error, Result};
use crate::slog_debug;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Why one task waits for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// The target declared the source as a dependency. If the source does
    /// not succeed the target is skipped.
    Dependency,
    /// Consecutive steps of a sequential dependency list. `policy` is the
    /// composing task's error policy; `None` defers to the run default.
    Sequence { policy: Option<ErrorPolicy> },
}

impl EdgeKind {
    /// Combine two reasons for the same edge, keeping the strictest.
    fn merge(self, other: EdgeKind) -> EdgeKind {
        use EdgeKind::*;
        match (self, other) {
            (Dependency, _) | (_, Dependency) => Dependency,
            (Sequence { policy: a }, Sequence { policy: b }) => {
                let policy = match (a, b) {
                    (Some(ErrorPolicy::FailFast), _) | (_, Some(ErrorPolicy::FailFast)) => {
                        Some(ErrorPolicy::FailFast)
                    }
                    (None, _) | (_, None) => None,
                    _ => Some(ErrorPolicy::Continue),
                };
                Sequence { policy }
            }
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Dependency => write!(f, "dependency"),
            EdgeKind::Sequence { .. } => write!(f, "sequence"),
        }
    }
}

/// Resolved, ordered graph for one invocation.
///
/// Nodes are in execution order: every task comes after everything it waits
/// on, over either edge kind. Among tasks free to go in any order, dependency
/// post-order is kept. Each task appears exactly once.
pub struct ExecutionPlan {
    /// Edges point from the task that must settle first to the one waiting.
    graph: DiGraph<Task, EdgeKind>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Roots in the order they were requested.
    requested: Vec<TaskId>,
}

impl ExecutionPlan {
    fn new(requested: Vec<TaskId>) -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            requested,
        }
    }

    fn add_task(&mut self, task: Task) -> NodeIndex {
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, kind: EdgeKind) {
        match self.graph.find_edge(from, to) {
            Some(edge) => {
                if let Some(existing) = self.graph.edge_weight_mut(edge) {
                    *existing = existing.merge(kind);
                }
            }
            None => {
                self.graph.add_edge(from, to, kind);
            }
        }
    }

    /// Reorder nodes so every edge points forward, keeping the current order
    /// wherever the edges allow it.
    fn sort_topologically(&mut self) {
        let count = self.graph.node_count();
        let mut indegree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|index| self.graph.edges_directed(index, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(position, _)| Reverse(position))
            .collect();

        let mut order = Vec::with_capacity(count);
        while let Some(Reverse(position)) = ready.pop() {
            let index = NodeIndex::new(position);
            order.push(index);
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                let degree = &mut indegree[next.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        let unchanged = order.iter().enumerate().all(|(pos, index)| pos == index.index());
        if order.len() != count || unchanged {
            return;
        }

        let mut graph = DiGraph::with_capacity(count, self.graph.edge_count());
        let mut remap = vec![NodeIndex::end(); count];
        for old in order {
            remap[old.index()] = graph.add_node(self.graph[old].clone());
        }
        for edge in self.graph.edge_references() {
            graph.add_edge(
                remap[edge.source().index()],
                remap[edge.target().index()],
                *edge.weight(),
            );
        }
        self.task_index = graph
            .node_indices()
            .map(|index| (graph[index].id.clone(), index))
            .collect();
        self.graph = graph;
    }

    /// Tasks in plan order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Task ids in plan order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks().map(|t| t.id.clone()).collect()
    }

    pub fn requested(&self) -> &[TaskId] {
        &self.requested
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Position of a task in plan order.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.task_index.get(id).map(|index| index.index())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Kind of the edge `from -> to`, if `to` waits directly on `from`.
    pub fn edge(&self, from: &TaskId, to: &TaskId) -> Option<EdgeKind> {
        let from = self.task_index.get(from)?;
        let to = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from, *to)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Number of edges of either kind.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub(crate) fn node_indices(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    pub(crate) fn task_at(&self, index: NodeIndex) -> &Task {
        &self.graph[index]
    }

    /// Everything `index` waits on, with the reason.
    pub(crate) fn predecessors(&self, index: NodeIndex) -> Vec<(NodeIndex, EdgeKind)> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (edge.source(), *edge.weight()))
            .collect()
    }

    /// Tasks `id` waits on directly, with the reason.
    pub fn waits_on(&self, id: &TaskId) -> Vec<(TaskId, EdgeKind)> {
        match self.task_index.get(id) {
            Some(&index) => self
                .predecessors(index)
                .into_iter()
                .map(|(pred, kind)| (self.graph[pred].id.clone(), kind))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Get the underlying graph for advanced operations.
    pub fn graph(&self) -> &DiGraph<Task, EdgeKind> {
        &self.graph
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("requested", &self.requested)
            .field("order", &self.ids())
            .field("edges", &self.edge_count())
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Orders tasks from a registry.
pub struct DependencyResolver<'a> {
    registry: &'a TaskRegistry,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(registry: &'a TaskRegistry) -> Self {
        Self { registry }
    }

    /// Resolve a single task.
    pub fn resolve(&self, id: &TaskId) -> Result<ExecutionPlan> {
        self.resolve_many(std::slice::from_ref(id))
    }

    /// Resolve several roots into one plan. Shared dependencies appear once.
    ///
    /// # Errors
    /// - `UnknownTask` if a root is not registered
    /// - `UnknownDependency` if any reachable dependency is not registered
    /// - `CyclicDependency` if the reachable graph has a cycle
    pub fn resolve_many(&self, ids: &[TaskId]) -> Result<ExecutionPlan> {
        self.validate(ids)?;

        let mut walk = Walk {
            registry: self.registry,
            marks: HashMap::new(),
            path: Vec::new(),
            order: Vec::new(),
        };
        for id in ids {
            walk.visit(id)?;
        }

        let mut plan = ExecutionPlan::new(ids.to_vec());
        for task in walk.order {
            plan.add_task(task.clone());
        }
        self.add_dependency_edges(&mut plan);
        self.add_sequence_edges(&mut plan);
        plan.sort_topologically();

        slog_debug!("resolved {:?} -> {:?}", ids, plan.ids());
        Ok(plan)
    }

    /// Structural pass: every root and every reachable dependency must exist.
    fn validate(&self, ids: &[TaskId]) -> Result<()> {
        let mut seen: HashSet<&TaskId> = HashSet::new();
        let mut stack: Vec<&Task> = Vec::new();

        for id in ids {
            let task = self.registry.get(id)?;
            if seen.insert(&task.id) {
                stack.push(task);
            }
        }

        while let Some(task) = stack.pop() {
            for dep in &task.dependencies {
                let dep_task = self.registry.get(dep).map_err(|_| Error::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                if seen.insert(&dep_task.id) {
                    stack.push(dep_task);
                }
            }
        }
        Ok(())
    }

    fn add_dependency_edges(&self, plan: &mut ExecutionPlan) {
        let mut edges = Vec::new();
        for to in plan.node_indices() {
            for dep in &plan.task_at(to).dependencies {
                if let Some(&from) = plan.task_index.get(dep) {
                    edges.push((from, to));
                }
            }
        }
        for (from, to) in edges {
            plan.add_edge(from, to, EdgeKind::Dependency);
        }
    }

    /// Chain consecutive steps of sequential dependency lists.
    ///
    /// A step starts only after the previous step settled, and so does
    /// everything the step alone depends on. Dependencies shared with tasks
    /// outside the step get no edge. A pair that already has to run the other
    /// way round (through some other path) keeps the existing order.
    fn add_sequence_edges(&self, plan: &mut ExecutionPlan) {
        let mut chains = Vec::new();
        for index in plan.node_indices() {
            let task = plan.task_at(index);
            if task.mode != Composition::Sequential || task.dependencies.len() < 2 {
                continue;
            }
            let steps: Vec<NodeIndex> = task
                .dependencies
                .iter()
                .filter_map(|dep| plan.task_index.get(dep).copied())
                .collect();
            chains.push((steps, task.on_error));
        }

        for (steps, policy) in chains {
            for pair in steps.windows(2) {
                let prev = pair[0];
                for target in owned_closure(plan, pair[1]) {
                    if target == prev || has_path_connecting(&plan.graph, target, prev, None) {
                        continue;
                    }
                    plan.add_edge(prev, target, EdgeKind::Sequence { policy });
                }
            }
        }
    }
}

/// `start` and the tasks it transitively depends on that no task outside
/// that set depends on.
fn owned_closure(plan: &ExecutionPlan, start: NodeIndex) -> Vec<NodeIndex> {
    let candidates = closure(plan, start);
    let mut owned: HashSet<NodeIndex> = HashSet::from([start]);
    loop {
        let mut grew = false;
        for &index in &candidates {
            if owned.contains(&index) {
                continue;
            }
            let exclusive = plan
                .graph
                .edges_directed(index, Direction::Outgoing)
                .filter(|edge| *edge.weight() == EdgeKind::Dependency)
                .all(|edge| owned.contains(&edge.target()));
            if exclusive {
                owned.insert(index);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    candidates
        .into_iter()
        .filter(|index| owned.contains(index))
        .collect()
}

/// `start` and every task it transitively depends on.
fn closure(plan: &ExecutionPlan, start: NodeIndex) -> Vec<NodeIndex> {
    let mut seen = HashSet::new();
    let mut stack = vec![start];
    let mut members = Vec::new();
    while let Some(index) = stack.pop() {
        if !seen.insert(index) {
            continue;
        }
        members.push(index);
        for dep in &plan.task_at(index).dependencies {
            if let Some(&dep_index) = plan.task_index.get(dep) {
                stack.push(dep_index);
            }
        }
    }
    members
}

/// Depth-first post-order walk with three-colour marking.
struct Walk<'r> {
    registry: &'r TaskRegistry,
    marks: HashMap<TaskId, Mark>,
    path: Vec<TaskId>,
    order: Vec<&'r Task>,
}

impl<'r> Walk<'r> {
    fn visit(&mut self, id: &TaskId) -> Result<()> {
        match self.marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = self.path.iter().position(|p| p == id).unwrap_or(0);
                let mut cycle = self.path[start..].to_vec();
                cycle.push(id.clone());
                return Err(Error::CyclicDependency { cycle });
            }
            None => {}
        }

        let task = self.registry.get(id)?;
        self.marks.insert(id.clone(), Mark::InProgress);
        self.path.push(id.clone());

        for dep in &task.dependencies {
            self.visit(dep)?;
        }

        self.path.pop();
        self.marks.insert(id.clone(), Mark::Done);
        self.order.push(task);
        Ok(())
    }
}
