//! Conflict detection for candidate change sets.

use crate::core::task::{TaskId, TaskNode, TaskResult};
use crate::error::Result;
use crate::event_log::{actor, EventKind, EventLog};
use crate::orchestration::registry::{ClaimConflict, ResourceRegistry};
use std::sync::Arc;

/// Outcome of admitting a candidate result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Every touched resource is now claimed by the task.
    Granted { resources: Vec<String> },
    /// Nothing was claimed.
    Conflict { conflicts: Vec<ClaimConflict> },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }
}

/// Claims the resources a candidate result touches, all or nothing.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    registry: Arc<ResourceRegistry>,
}

impl ConflictDetector {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Try to claim every resource `result` touches on behalf of `node`.
    ///
    /// Findings results touch no resources and are always granted. The
    /// attempt is logged whether or not it succeeds.
    pub fn admit(&self, node: &TaskNode, result: &TaskResult, log: &dyn EventLog) -> Result<Admission> {
        let Some(change_set) = result.change_set() else {
            return Ok(Admission::Granted {
                resources: Vec::new(),
            });
        };
        let keys = change_set.resource_keys();
        let resources: Vec<String> = keys.iter().cloned().collect();

        let outcome = self.registry.claim_all(&keys, node.id, &node.key);
        let conflicts = match &outcome {
            Ok(()) => Vec::new(),
            Err(conflicts) => conflicts.clone(),
        };
        log.append(
            actor::CONFLICT_DETECTOR,
            EventKind::ClaimAttempt {
                task: node.id,
                resources: resources.clone(),
                granted: outcome.is_ok(),
                conflicts: conflicts.clone(),
            },
        )?;

        if conflicts.is_empty() {
            tracing::debug!(task = %node.key, ?resources, "claims granted");
            Ok(Admission::Granted { resources })
        } else {
            tracing::debug!(task = %node.key, ?conflicts, "claim conflict");
            Ok(Admission::Conflict { conflicts })
        }
    }

    /// Release everything `task` holds, logging the release when non-empty.
    pub fn release(&self, task: TaskId, log: &dyn EventLog) -> Result<Vec<String>> {
        let released = self.registry.release_all(&task);
        if !released.is_empty() {
            log.append(
                actor::CONFLICT_DETECTOR,
                EventKind::ClaimsReleased {
                    task,
                    resources: released.clone(),
                },
            )?;
        }
        Ok(released)
    }
}
