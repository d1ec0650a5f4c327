//! Worker agents and the pool that holds them.
//!
//! Workers are external collaborators. The scheduler dispatches by
//! [`Capability`] tag and talks to workers only through [`TaskSpec`] in and
//! [`TaskResult`] out.

use crate::core::task::{FailureRecord, TaskId, TaskKind, TaskNode, TaskResult};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Closed set of worker capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Builder,
    Validator,
    Analyzer,
    /// Finding aggregation; performed in-process by the consensus stage.
    Consensus,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Builder => "builder",
            Capability::Validator => "validator",
            Capability::Analyzer => "analyzer",
            Capability::Consensus => "consensus",
        }
    }
}

impl From<TaskKind> for Capability {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Builder => Capability::Builder,
            TaskKind::Validator => Capability::Validator,
            TaskKind::Analyzer => Capability::Analyzer,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted result of a dependency, handed to dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResult {
    pub task_id: TaskId,
    pub key: String,
    pub kind: TaskKind,
    pub result: TaskResult,
}

/// Everything a worker is told about one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub key: String,
    pub kind: TaskKind,
    pub domain: String,
    pub description: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Resource scope of the request.
    pub scope: Vec<String>,
    /// Failures of earlier attempts, oldest first.
    pub feedback: Vec<FailureRecord>,
    /// Results of completed dependencies.
    pub upstream: Vec<UpstreamResult>,
}

impl TaskSpec {
    /// Spec for the next attempt of `node`.
    pub fn for_node(node: &TaskNode, scope: Vec<String>, upstream: Vec<UpstreamResult>) -> Self {
        Self {
            task_id: node.id,
            key: node.key.clone(),
            kind: node.kind,
            domain: node.domain.clone(),
            description: node.description.clone(),
            attempt: node.attempt(),
            scope,
            feedback: node.failures.clone(),
            upstream,
        }
    }

    /// Whether this attempt carries feedback from a failed one.
    pub fn is_retry(&self) -> bool {
        !self.feedback.is_empty()
    }
}

/// A worker agent.
///
/// An `Err` from `execute` counts as a rejected attempt.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identifier recorded as the task owner.
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    async fn execute(&self, spec: TaskSpec) -> Result<TaskResult>;
}

/// How a dispatched attempt ended, from the scheduler's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Done(TaskResult),
    Failed(String),
    TimedOut(Duration),
}

/// Message from a worker task back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub task_id: TaskId,
    /// Attempt this response answers; stale attempts are ignored.
    pub attempt: u32,
    pub outcome: WorkerOutcome,
}

/// Run one attempt on its own tokio task and report back on `tx`.
///
/// The attempt is bounded by `timeout`; a panicking worker is reported as a
/// failure rather than leaving the scheduler waiting.
pub fn spawn_attempt(
    worker: Arc<dyn Worker>,
    spec: TaskSpec,
    timeout: Duration,
    tx: mpsc::Sender<WorkerResponse>,
) {
    let task_id = spec.task_id;
    let attempt = spec.attempt;
    tokio::spawn(async move {
        let mut handle = tokio::spawn(async move { worker.execute(spec).await });
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(result))) => WorkerOutcome::Done(result),
            Ok(Ok(Err(e))) => WorkerOutcome::Failed(e.to_string()),
            Ok(Err(join_error)) => WorkerOutcome::Failed(format!("worker aborted: {}", join_error)),
            Err(_) => {
                handle.abort();
                WorkerOutcome::TimedOut(timeout)
            }
        };
        let _ = tx
            .send(WorkerResponse {
                task_id,
                attempt,
                outcome,
            })
            .await;
    });
}

/// Registered workers plus the in-flight capacity limit.
///
/// # Example
///
/// ```ignore
/// use concord::orchestration::WorkerPool;
///
/// let mut pool = WorkerPool::new(3);
/// pool.register(Arc::new(MyBuilder));
///
/// assert!(pool.has_capacity());
/// assert_eq!(pool.active_count(), 0);
/// ```
pub struct WorkerPool {
    workers: BTreeMap<Capability, Arc<dyn Worker>>,
    /// Tasks currently dispatched.
    active: HashSet<TaskId>,
    max_concurrent: usize,
}

impl WorkerPool {
    /// Create an empty pool. A capacity of 0 is raised to 1.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            workers: BTreeMap::new(),
            active: HashSet::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Register a worker under its capability, replacing any previous one.
    pub fn register(&mut self, worker: Arc<dyn Worker>) -> &mut Self {
        self.workers.insert(worker.capability(), worker);
        self
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.register(worker);
        self
    }

    /// Worker for `capability`.
    ///
    /// # Errors
    /// `WorkerUnavailable` if none is registered.
    pub fn worker(&self, capability: Capability) -> Result<Arc<dyn Worker>> {
        self.workers
            .get(&capability)
            .cloned()
            .ok_or_else(|| Error::WorkerUnavailable(capability.to_string()))
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.workers.keys().copied().collect()
    }

    /// Mark `task` as in flight.
    pub fn acquire(&mut self, task: TaskId) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::Validation(format!(
                "worker pool at capacity ({})",
                self.max_concurrent
            )));
        }
        self.active.insert(task);
        Ok(())
    }

    /// Free the slot held by `task`.
    pub fn release(&mut self, task: &TaskId) -> bool {
        self.active.remove(task)
    }

    pub fn is_active(&self, task: &TaskId) -> bool {
        self.active.contains(task)
    }

    /// Get the number of in-flight tasks.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Check if another task can be dispatched.
    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capabilities", &self.capabilities())
            .field("active", &self.active.len())
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}
