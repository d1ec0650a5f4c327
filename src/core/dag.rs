//! Task graph (directed acyclic graph) for dependency management.
//!
//! `TaskGraph` is built once per [`Request`]. Edges point from a dependency
//! to its dependent. The graph is the arena that owns every [`TaskNode`];
//! everything else refers to nodes by [`TaskId`].

use crate::core::request::Request;
use crate::core::task::{TaskId, TaskKind, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Why one node depends on another.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Declared through `blockedBy`.
    #[default]
    Explicit,
    /// Implicit edge from a builder to its paired validator.
    Validates,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Explicit => write!(f, "explicit"),
            DependencyKind::Validates => write!(f, "validates"),
        }
    }
}

/// The task dependency graph.
///
/// Uses petgraph's DiGraph; nodes are tasks and edges carry the
/// [`DependencyKind`].
pub struct TaskGraph {
    graph: DiGraph<TaskNode, DependencyKind>,
    task_index: HashMap<TaskId, NodeIndex>,
    key_index: HashMap<String, TaskId>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            key_index: HashMap::new(),
        }
    }

    /// Translate a request into a validated DAG.
    ///
    /// Builds edges from explicit `blocked_by` declarations plus the implicit
    /// builder → validator pairing, then verifies acyclicity with a
    /// topological sort. Units without a domain take the request's.
    ///
    /// # Errors
    /// - `Validation` for duplicate keys, unknown references, or a validator
    ///   without exactly one builder dependency
    /// - `CyclicGraph` if the declarations form a cycle
    pub fn from_request(request: &Request) -> Result<Self> {
        let mut graph = Self::new();

        for unit in &request.units {
            let mut gates = unit.gates.clone();
            if unit.kind.produces_changes() {
                gates.extend(request.acceptance.iter().cloned());
            }
            let domain = if unit.domain.is_empty() {
                &request.domain
            } else {
                &unit.domain
            };
            let mut node = TaskNode::new(&unit.key, unit.kind, domain, &unit.description)
                .with_gates(gates);
            node.max_retries = unit.max_retries;
            graph.add_task(node)?;
        }

        for unit in &request.units {
            let to = graph.require_key(&unit.key)?;

            if let Some(builder_key) = &unit.validates {
                if unit.kind != TaskKind::Validator {
                    return Err(Error::Validation(format!(
                        "{} declares `validates` but is a {}",
                        unit.key, unit.kind
                    )));
                }
                let from = graph.require_key(builder_key)?;
                graph.add_dependency(&from, &to, DependencyKind::Validates)?;
            }

            for dep_key in &unit.blocked_by {
                let from = graph.require_key(dep_key)?;
                if !graph.has_dependency(&from, &to) {
                    graph.add_dependency(&from, &to, DependencyKind::Explicit)?;
                }
            }
        }

        graph.check_validator_pairing()?;
        graph.topological_order()?;
        Ok(graph)
    }

    /// Add a node. Keys must be unique within a graph.
    pub fn add_task(&mut self, task: TaskNode) -> Result<NodeIndex> {
        if self.key_index.contains_key(&task.key) {
            return Err(Error::Validation(format!(
                "Duplicate task key: {}",
                task.key
            )));
        }
        let id = task.id;
        let key = task.key.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        self.key_index.insert(key, id);
        Ok(index)
    }

    /// Record that `from` must complete before `to` can start.
    ///
    /// Cycles are not checked here; [`TaskGraph::from_request`] checks the
    /// finished graph once.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId, kind: DependencyKind) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;
        self.graph.add_edge(from_index, to_index, kind);
        if let Some(node) = self.graph.node_weight_mut(to_index) {
            node.dependencies.insert(*from);
        }
        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    fn require_key(&self, key: &str) -> Result<TaskId> {
        self.id_of(key)
            .ok_or_else(|| Error::Validation(format!("Unknown task key: {}", key)))
    }

    fn check_validator_pairing(&self) -> Result<()> {
        for node in self.graph.node_weights() {
            if node.kind != TaskKind::Validator {
                continue;
            }
            let builders = self
                .get_dependencies(&node.id)
                .into_iter()
                .filter(|dep| dep.kind == TaskKind::Builder)
                .count();
            if builders != 1 {
                return Err(Error::Validation(format!(
                    "Validator {} must depend on exactly one builder, found {}",
                    node.key, builders
                )));
            }
        }
        Ok(())
    }

    /// Look up a node id by request-local key.
    pub fn id_of(&self, key: &str) -> Option<TaskId> {
        self.key_index.get(key).copied()
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut TaskNode> {
        match self.task_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    /// Get a task or fail with `TaskNotFound`.
    pub fn task(&self, id: &TaskId) -> Result<&TaskNode> {
        self.get_task(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Mutable variant of [`TaskGraph::task`].
    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut TaskNode> {
        self.get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if a dependency exists between two tasks.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(from), self.task_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Get the dependency kind between two tasks, if one exists.
    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<DependencyKind> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Get all tasks that the given task depends on (predecessors).
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that depend on the given task (successors).
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&TaskNode> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every node reachable from `id` through outgoing edges, breadth-first.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(next) {
                    if let Some(node) = self.graph.node_weight(next) {
                        out.push(node.id);
                    }
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// Get all tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&TaskNode> {
        self.graph.node_weights().collect()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    // ========== Scheduling Operations ==========

    /// Tasks ready to dispatch, in topological order.
    ///
    /// A task is ready when its own status is `pending` and every
    /// dependency has status `completed`.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let order = match self.topological_indices() {
            Ok(order) => order,
            Err(_) => return Vec::new(),
        };
        order
            .into_iter()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if !task.is_pending() {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep_index| {
                        self.graph
                            .node_weight(dep_index)
                            .map(|dep| dep.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    });
                deps_satisfied.then_some(task.id)
            })
            .collect()
    }

    /// Whether every node has reached a terminal status.
    pub fn all_settled(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_finished())
    }

    /// Count tasks with the given status label.
    pub fn count_with_status(&self, label: &str) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.status.label() == label)
            .count()
    }

    fn topological_indices(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| {
            let task = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.key.clone())
                .unwrap_or_else(|| "unknown".to_string());
            Error::CyclicGraph { task }
        })
    }

    /// Get tasks in topological order (each after all of its dependencies).
    ///
    /// # Errors
    /// Returns `CyclicGraph` if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        Ok(self
            .topological_indices()?
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
