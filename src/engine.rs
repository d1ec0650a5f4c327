//! End-to-end run: request → task graph → scheduler → normalizer →
//! aggregator → report.

use crate::config::EngineConfig;
use crate::consensus::{
    CategoryWeights, ConsensusAggregator, Finding, NormalizationWarning, Normalizer, Report,
};
use crate::core::{Request, TaskGraph, TaskKind, TaskStatus};
use crate::error::Result;
use crate::event_log::EventLog;
use crate::orchestration::{
    BlockedTask, Escalation, GateEnforcer, QualityGate, RunOutcome, Scheduler, SchedulerEvent,
    Worker, WorkerPool,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Consensus report; `None` when the request declared no analyzers.
    pub report: Option<Report>,
    /// Branches that exhausted their retries.
    pub escalations: Vec<Escalation>,
    /// Nodes that never ran because an ancestor escalated.
    pub blocked: Vec<BlockedTask>,
    /// Keys of completed tasks, in completion order.
    pub completed: Vec<String>,
    pub dispatches: usize,
}

impl RunReport {
    /// No findings and no escalations: "no issues found".
    pub fn is_clean(&self) -> bool {
        self.escalations.is_empty()
            && self.blocked.is_empty()
            && self.report.as_ref().map_or(true, Report::is_clean)
    }
}

/// The orchestration and consensus engine.
pub struct Engine {
    config: EngineConfig,
    workers: Vec<Arc<dyn Worker>>,
    gates: Vec<Arc<dyn QualityGate>>,
    task_gates: Vec<(String, Arc<dyn QualityGate>)>,
    observer: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            workers: Vec::new(),
            gates: Vec::new(),
            task_gates: Vec::new(),
            observer: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a worker. A later worker with the same capability replaces
    /// an earlier one.
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Register a custom gate for every node.
    pub fn with_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.gates.push(gate);
        self
    }

    /// Register a custom gate for the unit with key `key`.
    pub fn with_task_gate(mut self, key: &str, gate: Arc<dyn QualityGate>) -> Self {
        self.task_gates.push((key.to_string(), gate));
        self
    }

    pub fn with_observer(mut self, observer: mpsc::Sender<SchedulerEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn scheduler(&self, graph: TaskGraph, request: &Request, log: Arc<dyn EventLog>) -> Scheduler {
        let mut pool = WorkerPool::new(self.config.scheduler.max_concurrent);
        for worker in &self.workers {
            pool.register(worker.clone());
        }
        let mut gates = GateEnforcer::new();
        for gate in &self.gates {
            gates = gates.with_gate(gate.clone());
        }
        for (key, gate) in &self.task_gates {
            gates = gates.with_task_gate(key, gate.clone());
        }

        let scheduler = Scheduler::new(graph, pool, log)
            .with_policy(self.config.retry_policy())
            .with_gates(gates)
            .with_domain(&request.domain)
            .with_scope(request.initial_resources.iter().cloned());
        match &self.observer {
            Some(observer) => scheduler.with_observer(observer.clone()),
            None => scheduler,
        }
    }

    /// Execute `request` and build its report.
    ///
    /// Escalated branches are returned in the [`RunReport`], not as errors.
    ///
    /// # Errors
    /// `CyclicGraph` or `Validation` for a bad request, `WorkerUnavailable`
    /// if a unit kind has no worker, `Configuration` if the category weights
    /// are invalid, and event log failures.
    pub async fn run(&self, request: &Request, log: Arc<dyn EventLog>) -> Result<RunReport> {
        let graph = TaskGraph::from_request(request)?;
        let has_analyzers = graph.all_tasks().iter().any(|t| t.kind == TaskKind::Analyzer);

        // Fail on bad weights before any worker runs.
        let weights = request
            .weights
            .clone()
            .unwrap_or_else(|| self.config.weights());
        if has_analyzers {
            weights.validate()?;
        }

        let mut scheduler = self.scheduler(graph, request, log.clone());
        let outcome = scheduler.run().await?;
        let graph = scheduler.into_graph();

        let report = if has_analyzers {
            Some(self.consensus(request, &graph, &weights, log.as_ref())?)
        } else {
            None
        };

        let RunOutcome {
            completed,
            escalations,
            blocked,
            dispatches,
        } = outcome;
        info!(
            completed = completed.len(),
            escalated = escalations.len(),
            health = %report.as_ref().map(|r| r.health_score.to_string()).unwrap_or_default(),
            "engine run finished"
        );
        Ok(RunReport {
            report,
            escalations,
            blocked,
            completed,
            dispatches,
        })
    }

    /// Normalize every completed analyzer's findings, in declaration order,
    /// and aggregate them.
    fn consensus(
        &self,
        request: &Request,
        graph: &TaskGraph,
        weights: &CategoryWeights,
        log: &dyn EventLog,
    ) -> Result<Report> {
        let normalizer = Normalizer::new(self.config.severity_scale());
        let mut findings: Vec<Finding> = Vec::new();
        let mut warnings: Vec<NormalizationWarning> = Vec::new();

        for unit in &request.units {
            let node = match graph.id_of(&unit.key) {
                Some(id) => graph.task(&id)?,
                None => continue,
            };
            if node.kind != TaskKind::Analyzer || node.status != TaskStatus::Completed {
                continue;
            }
            let raw = node.result.as_ref().and_then(|r| r.findings()).unwrap_or_default();
            let batch = normalizer.normalize_logged(&node.key, raw, log)?;
            findings.extend(batch.findings);
            warnings.extend(batch.warnings);
        }

        let aggregator =
            ConsensusAggregator::new(self.config.scoring_table(), self.config.detection_context());
        let mut report = aggregator.aggregate_logged(&findings, weights, log)?;
        let mut all_warnings: Vec<String> = warnings.iter().map(ToString::to_string).collect();
        all_warnings.append(&mut report.warnings);
        report.warnings = all_warnings;
        Ok(report)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .field("gates", &(self.gates.len() + self.task_gates.len()))
            .finish()
    }
}
