//! Resource conflict integration tests.
//!
//! These tests verify that concurrent candidate results touching the same
//! resource are never both admitted, and that the loser is retried with the
//! holder named in its feedback.

use std::collections::BTreeSet;
use std::sync::Arc;

use concord::core::{Change, ChangeSet, Failure, Request, TaskId, TaskResult, TaskStatus, UnitDecl};
use concord::event_log::EventKind;
use concord::orchestration::{Capability, GateSpec, ResourceRegistry};

use crate::fixtures::{scheduler_for, touching, transition_seq, ScriptedWorker};

/// Test: Two tasks propose changes to the same resource
/// Given two independent builders that both touch "moduleX"
/// When both results arrive in the same batch
/// Then exactly one is accepted and the other is rejected as a conflict and retried
#[tokio::test]
async fn test_same_resource_exactly_one_accepted() {
    let request = Request::new("core", "")
        .unit(UnitDecl::builder("first"))
        .unit(UnitDecl::builder("second"));
    let worker = touching(&["moduleX", "shared/util.rs"]);
    let (mut scheduler, log) = scheduler_for(&request, vec![worker.clone()], 2);

    assert_eq!(scheduler.dispatch_ready_tasks().await.unwrap(), 2);
    let batch = scheduler.recv_responses(2).await;
    assert_eq!(batch.len(), 2);
    scheduler.handle_responses(batch).await.unwrap();

    let graph = scheduler.graph();
    let completed: Vec<_> = graph
        .all_tasks()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();
    let retried: Vec<_> = graph
        .all_tasks()
        .into_iter()
        .filter(|t| t.is_pending())
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(retried.len(), 1);

    let loser = retried[0];
    assert_eq!(loser.retry_count, 1);
    match &loser.failures[0].failure {
        Failure::Conflict { conflicts } => {
            let resources: Vec<&str> = conflicts.iter().map(|c| c.resource.as_str()).collect();
            assert_eq!(resources, vec!["moduleX", "shared/util.rs"]);
            assert!(conflicts.iter().all(|c| c.holder == completed[0].id));
            assert!(conflicts.iter().all(|c| c.holder_key == completed[0].key));
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    let denied = log
        .events()
        .into_iter()
        .filter(|e| matches!(e.event, EventKind::ClaimAttempt { granted: false, .. }))
        .count();
    assert_eq!(denied, 1);

    // The retry carries the conflict and then succeeds.
    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.completed.len(), 2);
    let retry = worker.seen_for(&outcome.completed[1]);
    assert_eq!(retry.len(), 2);
    assert!(matches!(retry[1].feedback[0].failure, Failure::Conflict { .. }));
    assert!(scheduler.registry().is_empty());
}

/// Test: Conflict is all-or-nothing
/// Given a registry where another task holds "b"
/// When a result touching "a", "b" and "c" is admitted
/// Then nothing is claimed
#[tokio::test]
async fn test_partial_claims_never_applied() {
    let registry = Arc::new(ResourceRegistry::new());
    let holder = TaskId::new();
    registry.claim("b", holder, "holder").unwrap();

    let request = Request::new("core", "").unit(UnitDecl::builder("writer").max_retries(0));
    let (scheduler, _log) = scheduler_for(&request, vec![touching(&["a", "b", "c"])], 1);
    let mut scheduler = scheduler.with_registry(registry.clone());

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.escalations.len(), 1);
    assert!(registry.holder("a").is_none());
    assert!(registry.holder("c").is_none());
    assert_eq!(registry.holder("b"), Some(holder));
    assert_eq!(registry.len(), 1);
}

/// Test: Claims survive a rejected attempt
/// Given a result that passes conflict admission but fails a candidate gate
/// When the task retries and finally escalates
/// Then it holds its claims through the retry and releases them once, on escalation
#[tokio::test]
async fn test_claims_released_only_on_escalation() {
    let request = Request::new("core", "")
        .acceptance(GateSpec::ForbiddenPattern {
            pattern: "updated".to_string(),
        })
        .unit(UnitDecl::builder("writer").max_retries(1));
    let (mut scheduler, log) = scheduler_for(&request, vec![touching(&["moduleX"])], 1);

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.escalations.len(), 1);
    assert!(scheduler.registry().is_empty());

    let events = log.events();
    let granted = events
        .iter()
        .filter(|e| matches!(e.event, EventKind::ClaimAttempt { granted: true, .. }))
        .count();
    let released: Vec<u64> = events
        .iter()
        .filter(|e| matches!(e.event, EventKind::ClaimsReleased { .. }))
        .map(|e| e.seq)
        .collect();
    assert_eq!(granted, 2);
    assert_eq!(released.len(), 1);
    let escalated = transition_seq(&events, "writer", "escalated").unwrap();
    assert!(released[0] > escalated);
}

/// Test: A retrying task still owns its resources
/// Given task A holding "moduleX" after a rejected attempt, and task B sharing the registry
/// When B proposes a change to "moduleX" while A is pending its retry
/// Then B is rejected as a conflict naming A, and A completes its retry
#[tokio::test]
async fn test_conflict_against_task_awaiting_retry() {
    let registry = Arc::new(ResourceRegistry::new());

    let first = ScriptedWorker::new("builder", Capability::Builder, |spec| {
        let body = if spec.attempt == 1 { "todo!()" } else { "fn x() {}" };
        Ok(TaskResult::Change {
            change_set: ChangeSet::new(vec![Change::new("moduleX", body)]),
            rationale: "implement x".to_string(),
        })
    });
    let request_a = Request::new("core", "")
        .acceptance(GateSpec::ForbiddenPattern {
            pattern: r"todo!\(\)".to_string(),
        })
        .unit(UnitDecl::builder("a"));
    let (scheduler_a, _log_a) = scheduler_for(&request_a, vec![first], 1);
    let mut scheduler_a = scheduler_a.with_registry(registry.clone());
    let a_id = scheduler_a.graph().id_of("a").unwrap();

    scheduler_a.dispatch_ready_tasks().await.unwrap();
    let batch = scheduler_a.recv_responses(1).await;
    scheduler_a.handle_responses(batch).await.unwrap();
    assert!(scheduler_a.graph().task(&a_id).unwrap().is_pending());
    assert_eq!(registry.holder("moduleX"), Some(a_id));

    let request_b = Request::new("core", "").unit(UnitDecl::builder("b").max_retries(0));
    let (scheduler_b, _log_b) = scheduler_for(&request_b, vec![touching(&["moduleX"])], 1);
    let mut scheduler_b = scheduler_b.with_registry(registry.clone());
    let outcome_b = scheduler_b.run().await.unwrap();

    assert_eq!(outcome_b.escalations.len(), 1);
    match &outcome_b.escalations[0].failures[0].failure {
        Failure::Conflict { conflicts } => {
            assert_eq!(conflicts[0].resource, "moduleX");
            assert_eq!(conflicts[0].holder, a_id);
            assert_eq!(conflicts[0].holder_key, "a");
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    let outcome_a = scheduler_a.run().await.unwrap();
    assert_eq!(outcome_a.completed, vec!["a".to_string()]);
    assert!(registry.is_empty());
}

/// Test: Compare-and-set mutual exclusion under concurrency
/// Given many concurrent tasks claiming the same key
/// When they race
/// Then exactly one claim succeeds
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claim_fuzzing() {
    for round in 0..20 {
        let registry = Arc::new(ResourceRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let owner = TaskId::new();
                    let keys: BTreeSet<String> = ["moduleX".to_string(), format!("own-{}", i)]
                        .into_iter()
                        .collect();
                    registry
                        .claim_all(&keys, owner, &format!("task-{}", i))
                        .is_ok()
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1, "round {}: exactly one claim may win", round);
        // Losers claimed nothing.
        assert_eq!(registry.len(), 2);
    }
}
