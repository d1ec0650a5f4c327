//! Resource registry: which in-flight task owns which resource key.
//!
//! The claims table is the only mutable state shared between concurrently
//! executing tasks. Every access goes through a single lock, so a claim is an
//! atomic compare-and-set: it succeeds only when the key is unclaimed or
//! already owned by the same task.

use crate::core::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Ownership record for one resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub resource_key: String,
    pub owning_task_id: TaskId,
    /// Request-local key of the owning task, for feedback.
    pub owning_task_key: String,
    /// Logical clock value at claim time.
    pub claimed_at: u64,
}

/// A claim refused because another task holds the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimConflict {
    pub resource: String,
    pub holder: TaskId,
    pub holder_key: String,
}

impl std::fmt::Display for ClaimConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} held by {}", self.resource, self.holder_key)
    }
}

#[derive(Debug, Default)]
struct ClaimsTable {
    claims: HashMap<String, ResourceClaim>,
    clock: u64,
}

impl ClaimsTable {
    fn conflict_for(&self, resource: &str, owner: &TaskId) -> Option<ClaimConflict> {
        self.claims
            .get(resource)
            .filter(|claim| claim.owning_task_id != *owner)
            .map(|claim| ClaimConflict {
                resource: resource.to_string(),
                holder: claim.owning_task_id,
                holder_key: claim.owning_task_key.clone(),
            })
    }

    fn insert(&mut self, resource: &str, owner: TaskId, owner_key: &str) {
        if self.claims.contains_key(resource) {
            return;
        }
        self.clock += 1;
        self.claims.insert(
            resource.to_string(),
            ResourceClaim {
                resource_key: resource.to_string(),
                owning_task_id: owner,
                owning_task_key: owner_key.to_string(),
                claimed_at: self.clock,
            },
        );
    }
}

/// Thread-safe claims table.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    table: Mutex<ClaimsTable>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Every mutation completes before the guard drops, so a poisoned table
    // is still consistent.
    fn table(&self) -> MutexGuard<'_, ClaimsTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compare-and-set claim of a single key.
    pub fn claim(
        &self,
        resource: &str,
        owner: TaskId,
        owner_key: &str,
    ) -> std::result::Result<(), ClaimConflict> {
        let mut table = self.table();
        if let Some(conflict) = table.conflict_for(resource, &owner) {
            return Err(conflict);
        }
        table.insert(resource, owner, owner_key);
        Ok(())
    }

    /// Claim every key or none of them.
    ///
    /// On conflict nothing is claimed and every conflicting key is reported,
    /// in key order.
    pub fn claim_all(
        &self,
        resources: &BTreeSet<String>,
        owner: TaskId,
        owner_key: &str,
    ) -> std::result::Result<(), Vec<ClaimConflict>> {
        let mut table = self.table();
        let conflicts: Vec<ClaimConflict> = resources
            .iter()
            .filter_map(|resource| table.conflict_for(resource, &owner))
            .collect();
        if !conflicts.is_empty() {
            return Err(conflicts);
        }
        for resource in resources {
            table.insert(resource, owner, owner_key);
        }
        Ok(())
    }

    /// Release a single key if `owner` holds it.
    pub fn release(&self, resource: &str, owner: &TaskId) -> bool {
        let mut table = self.table();
        match table.claims.get(resource) {
            Some(claim) if claim.owning_task_id == *owner => {
                table.claims.remove(resource);
                true
            }
            _ => false,
        }
    }

    /// Release everything `owner` holds. Returns the released keys, sorted.
    pub fn release_all(&self, owner: &TaskId) -> Vec<String> {
        let mut table = self.table();
        let mut released: Vec<String> = table
            .claims
            .values()
            .filter(|claim| claim.owning_task_id == *owner)
            .map(|claim| claim.resource_key.clone())
            .collect();
        for resource in &released {
            table.claims.remove(resource);
        }
        released.sort();
        released
    }

    pub fn holder(&self, resource: &str) -> Option<TaskId> {
        self.table()
            .claims
            .get(resource)
            .map(|claim| claim.owning_task_id)
    }

    /// Keys held by `owner`, sorted.
    pub fn claims_of(&self, owner: &TaskId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .table()
            .claims
            .values()
            .filter(|claim| claim.owning_task_id == *owner)
            .map(|claim| claim.resource_key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// All claims ordered by claim time.
    pub fn snapshot(&self) -> Vec<ResourceClaim> {
        let mut claims: Vec<ResourceClaim> = self.table().claims.values().cloned().collect();
        claims.sort_by_key(|claim| claim.claimed_at);
        claims
    }

    pub fn len(&self) -> usize {
        self.table().claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
