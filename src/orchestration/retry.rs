//! Bounded retry policy.
//!
//! One policy object decides the fate of every failed attempt, whatever the
//! cause: worker error, worker timeout, gate failure, or resource conflict.

use crate::core::task::TaskNode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum number of retries before a task escalates.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default time a worker has to answer before the attempt counts as failed.
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// What to do with a node whose latest attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum RetryDecision {
    /// Return to pending; `retry_count` becomes `next_retry`.
    Retry { next_retry: u32 },
    /// Retry bound exhausted after `attempts` attempts.
    Escalate { attempts: u32 },
}

/// Retry bound plus worker timeout.
///
/// `max_retries` is the bound for every node that does not carry its own
/// override.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub worker_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            worker_timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the specified retry bound.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a policy with the specified worker timeout.
    pub fn with_worker_timeout(worker_timeout: Duration) -> Self {
        Self {
            worker_timeout,
            ..Default::default()
        }
    }

    pub fn timeout(mut self, worker_timeout: Duration) -> Self {
        self.worker_timeout = worker_timeout;
        self
    }

    /// Retry bound in force for `node`.
    pub fn bound_for(&self, node: &TaskNode) -> u32 {
        node.max_retries.unwrap_or(self.max_retries)
    }

    /// Decide the next step for `node` after a failed attempt.
    ///
    /// The failed attempt increments `retry_count`; the node is retried while
    /// the incremented count stays within [`RetryPolicy::bound_for`].
    pub fn decide(&self, node: &TaskNode) -> RetryDecision {
        let next_retry = node.retry_count + 1;
        if next_retry <= self.bound_for(node) {
            RetryDecision::Retry { next_retry }
        } else {
            RetryDecision::Escalate {
                attempts: next_retry,
            }
        }
    }
}
