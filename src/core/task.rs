//! Task data model for the task graph.
//!
//! A `TaskNode` is the unit of schedulable work. Nodes live in the
//! [`TaskGraph`](crate::core::TaskGraph) arena and are addressed by
//! [`TaskId`], never by reference.

use crate::consensus::RawFinding;
use crate::error::{Error, Result};
use crate::orchestration::gate::{GateReason, GateSpec};
use crate::orchestration::registry::ClaimConflict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task within a graph.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What kind of work a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Produces a change set.
    Builder,
    /// Independently verifies its paired builder's change set.
    Validator,
    /// Produces raw findings for the consensus stage.
    Analyzer,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Builder => "builder",
            TaskKind::Validator => "validator",
            TaskKind::Analyzer => "analyzer",
        }
    }

    /// Whether results of this kind are change sets subject to conflict checks.
    pub fn produces_changes(&self) -> bool {
        matches!(self, TaskKind::Builder | TaskKind::Validator)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status in its lifecycle.
///
/// ```text
/// pending ──> in_progress ──> completed
///    │             │
///    │             ├──> rejected ──> pending (retry)
///    │             │        └──────> escalated
///    │             └──> escalated
///    └──> blocked (an ancestor escalated)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for dependencies or for dispatch.
    #[default]
    Pending,
    /// Dispatched to a worker.
    InProgress,
    /// Can never run because an upstream node escalated.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
    /// Result accepted.
    Completed,
    /// Last attempt failed; about to be retried or escalated.
    Rejected,
    /// Retry bound exhausted; needs an external decision.
    Escalated,
}

impl TaskStatus {
    /// Short label without payload, used in events.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked { .. } => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Escalated => "escalated",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Escalated | TaskStatus::Blocked { .. }
        )
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: &TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Blocked { .. })
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Rejected)
                | (TaskStatus::InProgress, TaskStatus::Escalated)
                | (TaskStatus::Rejected, TaskStatus::Pending)
                | (TaskStatus::Rejected, TaskStatus::Escalated)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// A single change to a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Resource key the change touches (file path, subsystem name, ...).
    pub resource: String,
    /// Opaque change body.
    #[serde(default)]
    pub content: String,
}

impl Change {
    pub fn new(resource: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            content: content.into(),
        }
    }
}

/// A proposed set of changes from a builder or validator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(changes: Vec<Change>) -> Self {
        Self { changes }
    }

    /// Distinct resource keys touched, in sorted order.
    pub fn resource_keys(&self) -> BTreeSet<String> {
        self.changes.iter().map(|c| c.resource.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// The accepted (or candidate) output of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TaskResult {
    Change {
        change_set: ChangeSet,
        rationale: String,
    },
    Findings {
        findings: Vec<RawFinding>,
    },
}

impl TaskResult {
    pub fn change_set(&self) -> Option<&ChangeSet> {
        match self {
            TaskResult::Change { change_set, .. } => Some(change_set),
            TaskResult::Findings { .. } => None,
        }
    }

    pub fn findings(&self) -> Option<&[RawFinding]> {
        match self {
            TaskResult::Findings { findings } => Some(findings),
            TaskResult::Change { .. } => None,
        }
    }

    /// Whether this result shape is what a node of `kind` must produce.
    pub fn matches_kind(&self, kind: TaskKind) -> bool {
        match self {
            TaskResult::Change { .. } => kind.produces_changes(),
            TaskResult::Findings { .. } => kind == TaskKind::Analyzer,
        }
    }
}

/// Why an attempt was rejected. Every variant is recoverable until the
/// retry bound is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Failure {
    /// The worker reported an error or returned the wrong output shape.
    WorkerRejected { message: String },
    /// The worker did not answer within the configured timeout.
    WorkerTimeout { after_ms: u64 },
    /// One or more quality gates failed.
    QualityGate { reasons: Vec<GateReason> },
    /// Another in-flight task holds a resource the result touches.
    Conflict { conflicts: Vec<ClaimConflict> },
}

impl Failure {
    pub fn timeout(after: Duration) -> Self {
        Failure::WorkerTimeout {
            after_ms: after.as_millis() as u64,
        }
    }

    /// The error-taxonomy variant this failure corresponds to.
    pub fn to_error(&self) -> Error {
        match self {
            Failure::WorkerRejected { message } => Error::WorkerRejected(message.clone()),
            Failure::WorkerTimeout { after_ms } => {
                Error::WorkerTimeout(Duration::from_millis(*after_ms))
            }
            Failure::QualityGate { reasons } => Error::QualityGateFailure(
                reasons
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            Failure::Conflict { conflicts } => match conflicts.first() {
                Some(c) => Error::ConflictDetected {
                    resource: c.resource.clone(),
                    holder: c.holder_key.clone(),
                },
                None => Error::ConflictDetected {
                    resource: String::new(),
                    holder: String::new(),
                },
            },
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_error())
    }
}

/// One rejected attempt in a node's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// 1-based attempt number that failed.
    pub attempt: u32,
    pub failure: Failure,
    pub at: DateTime<Utc>,
}

/// A single node in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Request-local name, unique within one graph.
    pub key: String,
    pub kind: TaskKind,
    /// Free-form classification tag.
    pub domain: String,
    /// What the task should accomplish.
    pub description: String,
    /// Nodes that must reach `completed` first.
    pub dependencies: BTreeSet<TaskId>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Worker currently (or last) assigned.
    pub owner: Option<String>,
    pub retry_count: u32,
    /// Overrides the retry policy's bound for this node.
    pub max_retries: Option<u32>,
    /// Accepted result, set on completion.
    pub result: Option<TaskResult>,
    /// Rejected attempts, oldest first.
    pub failures: Vec<FailureRecord>,
    /// Gates evaluated for this node in addition to any custom ones.
    pub gates: Vec<GateSpec>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    /// Create a new pending node that follows the policy's retry bound.
    pub fn new(key: &str, kind: TaskKind, domain: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(),
            key: key.to_string(),
            kind,
            domain: domain.to_string(),
            description: description.to_string(),
            dependencies: BTreeSet::new(),
            status: TaskStatus::Pending,
            owner: None,
            retry_count: 0,
            max_retries: None,
            result: None,
            failures: Vec::new(),
            gates: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_gates(mut self, gates: Vec<GateSpec>) -> Self {
        self.gates = gates;
        self
    }

    /// Move to `to`, enforcing the state machine.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(&to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        match to {
            TaskStatus::InProgress => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Escalated => {
                self.completed_at = Some(Utc::now())
            }
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Current attempt number (1-based) for the next or running dispatch.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}
