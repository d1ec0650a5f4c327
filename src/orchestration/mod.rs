//! Orchestration layer.
//!
//! This module provides the components that drive a task graph to
//! completion: the worker pool, quality gates, the resource registry and
//! conflict detector, the bounded retry policy, and the scheduler that ties
//! them together.

pub mod conflict;
pub mod gate;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use conflict::{Admission, ConflictDetector};
pub use gate::{
    Checkpoint, GateContext, GateEnforcer, GateReason, GateSpec, GateVerdict, QualityGate,
    ReasonCode,
};
pub use registry::{ClaimConflict, ResourceClaim, ResourceRegistry};
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_WORKER_TIMEOUT_SECS};
pub use scheduler::{BlockedTask, Escalation, RunOutcome, Scheduler, SchedulerEvent};
pub use worker::{
    spawn_attempt, Capability, TaskSpec, UpstreamResult, Worker, WorkerOutcome, WorkerPool,
    WorkerResponse,
};
