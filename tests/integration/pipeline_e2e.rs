//! End-to-end pipeline tests.
//!
//! These tests exercise the full Engine from request to report: graph
//! construction, scheduling with gates and conflicts, normalization and
//! aggregation, with configuration loaded from a TOML file and a file-backed
//! event log.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use concord::consensus::{Confidence, RawFinding};
use concord::core::{Request, UnitDecl};
use concord::event_log::{EventKind, EventLog, JsonlEventLog};
use concord::orchestration::GateSpec;
use concord::{Engine, EngineConfig, Error};
use tempfile::{NamedTempFile, TempDir};

use crate::fixtures::{analyzer, approving_validator, own_resource_builder};

fn audit_findings() -> HashMap<String, Vec<RawFinding>> {
    let mut findings = HashMap::new();
    findings.insert(
        "a11y".to_string(),
        vec![
            RawFinding::new("src/form.rs:40", "input without label", "serious")
                .category("accessibility")
                .evidence("<input name=q>")
                .remediation("add aria-label"),
            RawFinding::new("src/api.rs:12", "no CSRF token", "blocker")
                .category("security")
                .applicability("server"),
        ],
    );
    findings.insert(
        "security".to_string(),
        vec![
            RawFinding::new("src/form.rs:40", "unescaped user input", "sev1")
                .category("security")
                .confidence("high"),
            RawFinding {
                title: Some("no location".to_string()),
                ..Default::default()
            },
        ],
    );
    findings
}

fn write_config(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", body).unwrap();
    file
}

/// Test: Full request to report
/// Given a builder, its validator, and two analyzers blocked by the validator
/// When the engine runs with file configuration and a JSONL log
/// Then the report is complete and the log records the whole run in order
#[tokio::test]
async fn test_full_pipeline() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("run.jsonl");
    let config_file = write_config(&format!(
        r#"
event_log = "{}"

[retry]
max_retries = 2
worker_timeout_secs = 5

[scheduler]
max_concurrent = 3

[weights]
accessibility = 0.5
security = 0.5

[context]
tags = ["client"]

[severity_aliases]
sev1 = "critical"
"#,
        log_path.display()
    ));
    let config = EngineConfig::load(config_file.path()).unwrap();
    let log = config.open_event_log("audit").unwrap();

    let request = Request::new("web", "harden the signup form")
        .acceptance(GateSpec::NonEmptyChangeSet)
        .acceptance(GateSpec::WithinScope)
        .resource("form.rs")
        .resource("review.verdict")
        .unit(UnitDecl::builder("form").description("escape input"))
        .unit(UnitDecl::validator("review", "form"))
        .unit(UnitDecl::analyzer("a11y").blocked_by("review"))
        .unit(UnitDecl::analyzer("security").blocked_by("review"));

    let engine = Engine::new(config)
        .with_worker(own_resource_builder())
        .with_worker(approving_validator())
        .with_worker(analyzer(audit_findings()));
    let run = engine.run(&request, log.clone()).await.unwrap();

    assert!(run.escalations.is_empty());
    assert_eq!(run.completed.len(), 4);
    assert_eq!(&run.completed[..2], &["form".to_string(), "review".to_string()]);

    let report = run.report.as_ref().unwrap();
    assert_eq!(report.ranked_findings.len(), 1);
    let record = &report.ranked_findings[0];
    assert_eq!(record.location, "src/form.rs:40");
    assert_eq!(record.confidence, Confidence::Confirmed);
    assert_eq!(record.sources, vec!["a11y", "security"]);
    assert_eq!(record.evidence, vec!["<input name=q>"]);
    assert_eq!(record.remediation.as_deref(), Some("add aria-label"));

    // High then critical: the group is critical, filed under accessibility.
    assert_eq!(report.health_score.to_string(), "93/100");
    assert_eq!(report.excluded_false_positives.len(), 1);
    assert_eq!(report.excluded_false_positives[0].finding_id, "a11y#1");
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(
        report.event_log_reference,
        Some(format!("file:{}", log_path.display()))
    );

    let reopened = JsonlEventLog::open(&log_path).unwrap();
    let events = reopened.read_from(0).unwrap();
    assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    assert!(matches!(
        &events[0].event,
        EventKind::RunStarted { domain, tasks: 4 } if domain == "web"
    ));
    assert!(matches!(
        events.last().unwrap().event,
        EventKind::AggregationCompleted { records: 1, excluded: 1, .. }
    ));
    let gate_runs = events
        .iter()
        .filter(|e| matches!(e.event, EventKind::GateEvaluated { .. }))
        .count();
    // Two acceptance gates on each of the two change-producing nodes.
    assert_eq!(gate_runs, 4);
}

/// Test: Out-of-scope changes are rejected
/// Given a request whose scope excludes the builder's resource
/// When the engine runs
/// Then the builder escalates with scope reasons and its validator is blocked
#[tokio::test]
async fn test_out_of_scope_escalates_and_blocks() {
    let mut config = EngineConfig::default();
    config.retry.max_retries = 1;

    let request = Request::new("web", "")
        .acceptance(GateSpec::WithinScope)
        .resource("docs/README.md")
        .unit(UnitDecl::builder("form"))
        .unit(UnitDecl::validator("check", "form"))
        .unit(UnitDecl::builder("docs"));

    let engine = Engine::new(config)
        .with_worker(own_resource_builder())
        .with_worker(approving_validator());
    let log = Arc::new(concord::event_log::InMemoryEventLog::new());
    let run = engine.run(&request, log).await.unwrap();

    assert!(run.report.is_none());
    assert_eq!(run.escalations.len(), 2);
    let escalated: Vec<&str> = run.escalations.iter().map(|e| e.key.as_str()).collect();
    assert!(escalated.contains(&"form"));
    assert!(escalated.contains(&"docs"));
    assert_eq!(run.blocked.len(), 1);
    assert_eq!(run.blocked[0].key, "check");
    assert!(run.blocked[0].reason.contains("form"));
    assert!(matches!(run.escalations[0].error(), Error::RetryExhausted { attempts: 2, .. }));
    assert!(!run.is_clean());
}

/// Test: Cyclic requests never start
/// Given units that block each other
/// When the engine runs
/// Then it fails with a cyclic graph error before logging anything
#[tokio::test]
async fn test_cyclic_request_rejected() {
    let request = Request::new("core", "")
        .unit(UnitDecl::builder("a").blocked_by("b"))
        .unit(UnitDecl::builder("b").blocked_by("a"));
    let engine = Engine::new(EngineConfig::default()).with_worker(own_resource_builder());
    let log = Arc::new(concord::event_log::InMemoryEventLog::new());

    let err = engine.run(&request, log.clone()).await.unwrap_err();
    assert!(matches!(err, Error::CyclicGraph { .. }));
    assert!(log.is_empty());
}

/// Test: Request parsed from JSON
/// Given a request document using blockedBy and acceptance_predicate
/// When it is deserialized and run
/// Then the graph honors the declared edges
#[tokio::test]
async fn test_request_from_json() {
    let request: Request = serde_json::from_str(
        r#"{
            "domain": "web",
            "description": "audit",
            "acceptance_predicate": [{"gate": "non_empty_change_set"}],
            "initial_resources": [],
            "units": [
                {"key": "build", "kind": "builder"},
                {"key": "scan", "kind": "analyzer", "blockedBy": ["build"]}
            ],
            "weights": {"uncategorized": 1.0}
        }"#,
    )
    .unwrap();

    let engine = Engine::new(EngineConfig::default())
        .with_worker(own_resource_builder())
        .with_worker(analyzer(HashMap::new()));
    let run = engine
        .run(&request, Arc::new(concord::event_log::InMemoryEventLog::new()))
        .await
        .unwrap();
    assert_eq!(run.completed, vec!["build".to_string(), "scan".to_string()]);
    assert!(run.is_clean());
    assert_eq!(run.report.unwrap().health_score.rounded, 100);
}
