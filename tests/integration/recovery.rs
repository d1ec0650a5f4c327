//! Timeout, retry and escalation integration tests.
//!
//! These tests verify that slow, failing and panicking workers are retried
//! within the bound and then escalated without disturbing sibling branches.
//! Time is paused so timeouts resolve instantly.

use std::time::Duration;

use concord::core::{Failure, Request, TaskStatus, UnitDecl};
use concord::event_log::EventKind;
use concord::orchestration::{Capability, RetryPolicy};

use crate::fixtures::{change, scheduler_for, ScriptedWorker};

/// Test: Timeout counts as a failed attempt
/// Given a builder whose first attempt hangs past the worker timeout
/// When the scheduler runs
/// Then the attempt times out, the retry carries the timeout as feedback, and the task completes
#[tokio::test(start_paused = true)]
async fn test_timeout_retried() {
    let builder = ScriptedWorker::new("slow", Capability::Builder, |spec| {
        Ok(change(&[format!("{}.rs", spec.key)], "done"))
    })
    .delay("a", 1, Duration::from_secs(600));
    let request = Request::new("core", "").unit(UnitDecl::builder("a"));
    let (mut scheduler, log) = scheduler_for(&request, vec![builder.clone()], 1);

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.completed, vec!["a".to_string()]);
    assert_eq!(outcome.dispatches, 2);

    let retry = &builder.seen_for("a")[1];
    assert_eq!(retry.attempt, 2);
    assert!(retry.is_retry());
    assert_eq!(
        retry.feedback[0].failure,
        Failure::WorkerTimeout { after_ms: 5_000 }
    );

    let failed = log
        .events()
        .into_iter()
        .filter(|e| matches!(e.event, EventKind::AttemptFailed { attempt: 1, .. }))
        .count();
    assert_eq!(failed, 1);
}

/// Test: A worker that never answers escalates
/// Given a builder that always hangs
/// When the scheduler runs with the default bound of 3 retries
/// Then the task escalates after 4 timed-out attempts
#[tokio::test(start_paused = true)]
async fn test_repeated_timeouts_escalate() {
    let builder = ScriptedWorker::new("stuck", Capability::Builder, |_| {
        Ok(change(&["x.rs"], "never seen"))
    });
    for attempt in 1..=4 {
        builder.delay("stuck", attempt, Duration::from_secs(3600));
    }
    let request = Request::new("core", "").unit(UnitDecl::builder("stuck"));
    let (mut scheduler, _log) = scheduler_for(&request, vec![builder], 1);

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.escalations.len(), 1);
    let escalation = &outcome.escalations[0];
    assert_eq!(escalation.attempts, 4);
    let attempts: Vec<u32> = escalation.failures.iter().map(|f| f.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);
    assert!(escalation
        .failures
        .iter()
        .all(|f| matches!(f.failure, Failure::WorkerTimeout { .. })));
}

/// Test: Panicking worker does not hang the run
/// Given a builder that panics on its first attempt
/// When the scheduler runs
/// Then the panic is a rejected attempt and the retry succeeds
#[tokio::test]
async fn test_panicking_worker_rejected() {
    let builder = ScriptedWorker::new("panicky", Capability::Builder, |spec| {
        if spec.attempt == 1 {
            panic!("worker bug");
        }
        Ok(change(&["a.rs"], "recovered"))
    });
    let request = Request::new("core", "").unit(UnitDecl::builder("a"));
    let (mut scheduler, _log) = scheduler_for(&request, vec![builder.clone()], 1);

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.completed, vec!["a".to_string()]);
    let retry = &builder.seen_for("a")[1];
    assert!(matches!(
        &retry.feedback[0].failure,
        Failure::WorkerRejected { message } if message.contains("aborted")
    ));
}

/// Test: Escalation is per branch
/// Given a failing branch with descendants and an independent healthy branch
/// When the failing branch exhausts its retries
/// Then its descendants are blocked, the healthy branch completes, and every node is terminal
#[tokio::test]
async fn test_escalation_isolated_to_branch() {
    let builder = ScriptedWorker::new("builder", Capability::Builder, |spec| {
        if spec.key.starts_with("broken") {
            return Err(concord::Error::WorkerRejected("compile error".to_string()));
        }
        Ok(change(&[format!("{}.rs", spec.key)], "ok"))
    });
    let request = Request::new("core", "")
        .unit(UnitDecl::builder("broken").max_retries(2))
        .unit(UnitDecl::builder("after-broken").blocked_by("broken"))
        .unit(UnitDecl::builder("healthy"))
        .unit(UnitDecl::builder("after-healthy").blocked_by("healthy"))
        .unit(UnitDecl::builder("join").blocked_by("after-broken").blocked_by("after-healthy"));
    let (mut scheduler, _log) = scheduler_for(&request, vec![builder.clone()], 2);

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.escalations.len(), 1);
    assert_eq!(outcome.escalations[0].key, "broken");
    assert_eq!(outcome.escalations[0].attempts, 3);
    assert!(outcome.completed.contains(&"healthy".to_string()));
    assert!(outcome.completed.contains(&"after-healthy".to_string()));

    let mut blocked: Vec<&str> = outcome.blocked.iter().map(|b| b.key.as_str()).collect();
    blocked.sort();
    assert_eq!(blocked, vec!["after-broken", "join"]);

    let graph = scheduler.graph();
    assert!(graph.all_settled());
    let broken = graph.task(&graph.id_of("broken").unwrap()).unwrap();
    assert_eq!(broken.status, TaskStatus::Escalated);
    assert_eq!(broken.failures.len(), 3);
    assert!(builder.seen_for("after-broken").is_empty());
    assert!(builder.seen_for("join").is_empty());

    // Feedback grows with each retry.
    let feedback: Vec<usize> = builder
        .seen_for("broken")
        .iter()
        .map(|s| s.feedback.len())
        .collect();
    assert_eq!(feedback, vec![0, 1, 2]);
}

/// Test: Retry bound holds for every non-terminal state
/// Given a task that fails every attempt
/// When its transitions are replayed from the log
/// Then retry_count never exceeds max_retries before escalation
#[tokio::test]
async fn test_retry_count_bounded_in_log() {
    let failing = ScriptedWorker::new("builder", Capability::Builder, |_| {
        Err(concord::Error::WorkerRejected("no".to_string()))
    });
    let request = Request::new("core", "").unit(UnitDecl::builder("a").max_retries(1));
    let (mut scheduler, log) = scheduler_for(&request, vec![failing], 1);
    scheduler.run().await.unwrap();

    let to_states: Vec<String> = log
        .events()
        .into_iter()
        .filter_map(|e| match e.event {
            EventKind::TaskTransition { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        to_states,
        vec![
            "in_progress",
            "rejected",
            "pending",
            "in_progress",
            "rejected",
            "escalated"
        ]
    );
}

/// Test: The policy owns the default retry bound
/// Given an always-failing builder with no per-unit bound
/// When the scheduler runs under a policy allowing zero retries
/// Then the builder is dispatched once and escalates after one attempt
#[tokio::test]
async fn test_policy_bound_governs_units_without_override() {
    let failing = ScriptedWorker::new("builder", Capability::Builder, |_| {
        Err(concord::Error::WorkerRejected("no".to_string()))
    });
    let request = Request::new("core", "").unit(UnitDecl::builder("a"));
    let (scheduler, _log) = scheduler_for(&request, vec![failing.clone()], 1);
    let mut scheduler = scheduler.with_policy(RetryPolicy::with_max_retries(0));

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.dispatches, 1);
    assert_eq!(outcome.escalations[0].attempts, 1);
    assert_eq!(failing.seen_for("a").len(), 1);
}
