//! Core domain models for the orchestration engine.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: task nodes, incoming requests, and the task graph.

pub mod dag;
pub mod request;
pub mod task;

pub use dag::{DependencyKind, TaskGraph};
pub use request::{Request, UnitDecl};
pub use task::{
    Change, ChangeSet, Failure, FailureRecord, TaskId, TaskKind, TaskNode, TaskResult, TaskStatus,
};
