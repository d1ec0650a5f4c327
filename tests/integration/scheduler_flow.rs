//! Scheduler ordering and retry integration tests.
//!
//! These tests drive complete task graphs through the Scheduler and check
//! dispatch order against the event log.

use std::collections::HashMap;

use concord::core::{Failure, Request, TaskResult, TaskStatus, UnitDecl};
use concord::event_log::EventKind;
use concord::orchestration::{Capability, GateSpec, ReasonCode, SchedulerEvent};
use tokio::sync::mpsc;

use crate::fixtures::{
    approving_validator, change, dispatches, own_resource_builder, scheduler_for,
    transition_seq, ScriptedWorker,
};

/// Test: Builder retried on gate failure, validator waits
/// Given builder B with a paired validator V
/// When B fails the rationale gate twice and passes on the 3rd attempt
/// Then V is not dispatched during B's failed attempts and runs exactly once after B completes
#[tokio::test]
async fn test_validator_waits_for_builder_retries() {
    let builder = ScriptedWorker::new("builder", Capability::Builder, |spec| {
        let rationale = if spec.attempt < 3 { "" } else { "added input validation" };
        Ok(change(&["src/form.rs"], rationale))
    });
    let validator = approving_validator();

    let request = Request::new("backend", "harden form handling")
        .unit(UnitDecl::builder("B").gate(GateSpec::RationaleRequired))
        .unit(UnitDecl::validator("V", "B"));
    let (mut scheduler, log) =
        scheduler_for(&request, vec![builder.clone(), validator.clone()], 4);

    let outcome = scheduler.run().await.unwrap();
    assert!(outcome.is_clean());
    assert_eq!(outcome.completed, vec!["B".to_string(), "V".to_string()]);

    let events = log.events();
    let all = dispatches(&events);
    let b_attempts: Vec<u32> = all.iter().filter(|d| d.1 == "B").map(|d| d.2).collect();
    assert_eq!(b_attempts, vec![1, 2, 3]);

    let v_dispatches: Vec<&(u64, String, u32)> = all.iter().filter(|d| d.1 == "V").collect();
    assert_eq!(v_dispatches.len(), 1, "V must dispatch exactly once");
    let b_completed = transition_seq(&events, "B", "completed").unwrap();
    assert!(v_dispatches[0].0 > b_completed);

    // Third attempt carried both gate failures as feedback.
    let third = &builder.seen_for("B")[2];
    assert_eq!(third.feedback.len(), 2);
    for record in &third.feedback {
        assert!(matches!(
            &record.failure,
            Failure::QualityGate { reasons } if reasons[0].code == ReasonCode::MissingRationale
        ));
    }

    // V saw B's accepted change set.
    let v_spec = &validator.seen_for("V")[0];
    assert_eq!(v_spec.upstream.len(), 1);
    assert_eq!(v_spec.upstream[0].key, "B");

    let b = scheduler.graph().task(&scheduler.graph().id_of("B").unwrap()).unwrap();
    assert_eq!(b.retry_count, 2);
    assert_eq!(b.status, TaskStatus::Completed);
}

/// Test: No node dispatches before its dependencies complete
/// Given a diamond graph with a tail
/// When the run completes
/// Then every dispatch comes after every dependency's completion
#[tokio::test]
async fn test_dispatch_respects_dependencies() {
    let request = Request::new("core", "")
        .unit(UnitDecl::builder("root"))
        .unit(UnitDecl::builder("left").blocked_by("root"))
        .unit(UnitDecl::builder("right").blocked_by("root"))
        .unit(UnitDecl::builder("join").blocked_by("left").blocked_by("right"))
        .unit(UnitDecl::builder("tail").blocked_by("join"));
    let (mut scheduler, log) = scheduler_for(&request, vec![own_resource_builder()], 4);

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.completed.len(), 5);

    let events = log.events();
    let graph = scheduler.graph();
    for (seq, key, _) in dispatches(&events) {
        let node = graph.task(&graph.id_of(&key).unwrap()).unwrap();
        for dep in graph.get_dependencies(&node.id) {
            let done = transition_seq(&events, &dep.key, "completed").unwrap();
            assert!(done < seq, "{} dispatched before {} completed", key, dep.key);
        }
    }
    assert_eq!(outcome.completed.first().map(String::as_str), Some("root"));
    assert_eq!(outcome.completed.last().map(String::as_str), Some("tail"));
}

/// Test: Independent nodes run concurrently up to capacity
/// Given four independent builders and capacity 2
/// When ready tasks are dispatched
/// Then exactly two are in flight
#[tokio::test]
async fn test_independent_nodes_respect_capacity() {
    let request = Request::new("core", "")
        .unit(UnitDecl::builder("a"))
        .unit(UnitDecl::builder("b"))
        .unit(UnitDecl::builder("c"))
        .unit(UnitDecl::builder("d"));
    let (mut scheduler, _log) = scheduler_for(&request, vec![own_resource_builder()], 2);

    assert_eq!(scheduler.dispatch_ready_tasks().await.unwrap(), 2);
    assert_eq!(scheduler.active_count(), 2);
    assert_eq!(scheduler.dispatch_ready_tasks().await.unwrap(), 0);

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.completed.len(), 4);
    assert_eq!(outcome.dispatches, 4);
}

/// Test: Observer receives lifecycle events
/// Given a scheduler with an observer channel
/// When a builder fails once then succeeds
/// Then the observer sees started, retrying, started, completed, settled
#[tokio::test]
async fn test_observer_sees_lifecycle() {
    let builder = ScriptedWorker::new("builder", Capability::Builder, |spec| {
        if spec.attempt == 1 {
            return Err(concord::Error::WorkerRejected("flaky".to_string()));
        }
        Ok(change(&["a.rs"], "done"))
    });
    let request = Request::new("core", "").unit(UnitDecl::builder("a"));
    let (scheduler, _log) = scheduler_for(&request, vec![builder], 1);
    let (tx, mut rx) = mpsc::channel(64);
    let mut scheduler = scheduler.with_observer(tx);

    scheduler.run().await.unwrap();
    drop(scheduler);

    let mut kinds = Vec::new();
    while let Some(event) = rx.recv().await {
        kinds.push(match event {
            SchedulerEvent::TaskStarted { attempt, .. } => format!("started:{}", attempt),
            SchedulerEvent::TaskRetrying { failed_attempt, .. } => {
                format!("retrying:{}", failed_attempt)
            }
            SchedulerEvent::TaskCompleted { .. } => "completed".to_string(),
            SchedulerEvent::TaskEscalated { .. } => "escalated".to_string(),
            SchedulerEvent::TaskBlocked { .. } => "blocked".to_string(),
            SchedulerEvent::AllTasksSettled => "settled".to_string(),
        });
    }
    assert_eq!(
        kinds,
        vec!["started:1", "retrying:1", "started:2", "completed", "settled"]
    );
}

/// Test: Wrong result shape is a rejected attempt
/// Given an analyzer worker registered for builder work
/// When the builder node returns findings
/// Then the attempt is rejected and retried until escalation
#[tokio::test]
async fn test_wrong_result_shape_rejected() {
    let confused = ScriptedWorker::new("confused", Capability::Builder, |_| {
        Ok(TaskResult::Findings { findings: vec![] })
    });
    let request = Request::new("core", "").unit(UnitDecl::builder("a").max_retries(1));
    let (mut scheduler, _log) = scheduler_for(&request, vec![confused], 1);

    let outcome = scheduler.run().await.unwrap();
    assert_eq!(outcome.escalations.len(), 1);
    assert!(outcome.escalations[0]
        .failures
        .iter()
        .all(|f| matches!(f.failure, Failure::WorkerRejected { .. })));
}

/// Test: Every state change is logged before it is visible
/// Given a single builder run
/// When the run finishes
/// Then the log holds RunStarted first, RunFinished last, and strictly increasing seq
#[tokio::test]
async fn test_event_log_frames_the_run() {
    let request = Request::new("core", "")
        .unit(UnitDecl::builder("a"))
        .unit(UnitDecl::analyzer("scan").blocked_by("a"));
    let analyzer = crate::fixtures::analyzer(HashMap::new());
    let (mut scheduler, log) =
        scheduler_for(&request, vec![own_resource_builder(), analyzer], 2);
    scheduler.run().await.unwrap();

    let events = log.events();
    assert!(matches!(events[0].event, EventKind::RunStarted { tasks: 2, .. }));
    assert!(matches!(
        events.last().unwrap().event,
        EventKind::RunFinished { completed: 2, escalated: 0, blocked: 0 }
    ));
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

    // Analyzer results never claim resources.
    let claims = events
        .iter()
        .filter(|e| matches!(e.event, EventKind::ClaimAttempt { .. }))
        .count();
    assert_eq!(claims, 1);
}
