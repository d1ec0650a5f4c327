//! Scheduler for parallel task execution.
//!
//! The Scheduler is the single arbiter of the task graph. It dispatches ready
//! nodes to workers, which run as independent tokio tasks and answer over a
//! channel. Responses are handled in batches:
//!
//! 1. admission: shape check, worker-done gates, all-or-nothing resource
//!    claim, candidate-completion gates
//! 2. finalization: admitted results complete and release their claims;
//!    everything else goes through the retry policy
//!
//! A node keeps its claims across retries and releases them only on
//! `completed` or `escalated`.
//!
//! Every transition is appended to the event log before it is applied.

use crate::core::dag::TaskGraph;
use crate::core::task::{Failure, FailureRecord, TaskId, TaskKind, TaskResult, TaskStatus};
use crate::error::{Error, Result};
use crate::event_log::{actor, EventKind, EventLog};
use crate::orchestration::conflict::{Admission, ConflictDetector};
use crate::orchestration::gate::{Checkpoint, GateEnforcer, GateVerdict};
use crate::orchestration::registry::ResourceRegistry;
use crate::orchestration::retry::{RetryDecision, RetryPolicy};
use crate::orchestration::worker::{
    spawn_attempt, Capability, TaskSpec, UpstreamResult, WorkerOutcome, WorkerPool, WorkerResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RESPONSE_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow external components to react to task state changes
/// without polling.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A task has been dispatched to a worker.
    TaskStarted {
        task_id: TaskId,
        key: String,
        attempt: u32,
        worker: String,
    },
    /// A task's result was accepted.
    TaskCompleted { task_id: TaskId, key: String },
    /// An attempt failed and the task returned to pending.
    TaskRetrying {
        task_id: TaskId,
        key: String,
        failed_attempt: u32,
        failure: Failure,
    },
    /// A task exhausted its retry bound.
    TaskEscalated {
        task_id: TaskId,
        key: String,
        attempts: u32,
    },
    /// A task can never run because an ancestor escalated.
    TaskBlocked {
        task_id: TaskId,
        key: String,
        reason: String,
    },
    /// Every node reached a terminal status.
    AllTasksSettled,
}

/// A branch that needs an external decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub task_id: TaskId,
    pub key: String,
    pub kind: TaskKind,
    pub attempts: u32,
    /// Full failure history, oldest first.
    pub failures: Vec<FailureRecord>,
}

impl Escalation {
    /// The error this escalation corresponds to.
    pub fn error(&self) -> Error {
        Error::RetryExhausted {
            task: self.key.clone(),
            attempts: self.attempts,
        }
    }
}

/// A node that never ran because an ancestor escalated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: TaskId,
    pub key: String,
    pub reason: String,
}

/// What a finished run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Keys of completed tasks, in completion order.
    pub completed: Vec<String>,
    pub escalations: Vec<Escalation>,
    pub blocked: Vec<BlockedTask>,
    /// Total worker dispatches, retries included.
    pub dispatches: usize,
}

impl RunOutcome {
    /// Every node completed.
    pub fn is_clean(&self) -> bool {
        self.escalations.is_empty() && self.blocked.is_empty()
    }
}

enum Verdict {
    Accept(TaskResult),
    Reject(Failure),
}

/// Scheduler for parallel task execution.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use concord::core::{Request, TaskGraph};
/// use concord::event_log::InMemoryEventLog;
/// use concord::orchestration::{Scheduler, WorkerPool};
///
/// let graph = TaskGraph::from_request(&request)?;
/// let pool = WorkerPool::new(4).with_worker(Arc::new(MyBuilder));
/// let mut scheduler = Scheduler::new(graph, pool, Arc::new(InMemoryEventLog::new()));
/// let outcome = scheduler.run().await?;
/// ```
pub struct Scheduler {
    graph: TaskGraph,
    pool: WorkerPool,
    gates: GateEnforcer,
    detector: ConflictDetector,
    policy: RetryPolicy,
    log: Arc<dyn EventLog>,
    domain: String,
    scope: BTreeSet<String>,
    observer: Option<mpsc::Sender<SchedulerEvent>>,
    response_tx: mpsc::Sender<WorkerResponse>,
    response_rx: mpsc::Receiver<WorkerResponse>,
    /// In-flight tasks and the attempt each was dispatched with.
    in_flight: HashMap<TaskId, u32>,
    outcome: RunOutcome,
    started: bool,
}

impl Scheduler {
    /// Create a scheduler over `graph`.
    ///
    /// Defaults: no custom gates, a fresh resource registry, the default
    /// retry policy, and an empty resource scope.
    pub fn new(graph: TaskGraph, pool: WorkerPool, log: Arc<dyn EventLog>) -> Self {
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        Self {
            graph,
            pool,
            gates: GateEnforcer::new(),
            detector: ConflictDetector::new(Arc::new(ResourceRegistry::new())),
            policy: RetryPolicy::default(),
            log,
            domain: String::new(),
            scope: BTreeSet::new(),
            observer: None,
            response_tx,
            response_rx,
            in_flight: HashMap::new(),
            outcome: RunOutcome::default(),
            started: false,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_gates(mut self, gates: GateEnforcer) -> Self {
        self.gates = gates;
        self
    }

    /// Share a resource registry with other schedulers.
    pub fn with_registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.detector = ConflictDetector::new(registry);
        self
    }

    /// Domain recorded when the run starts.
    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    /// Receive [`SchedulerEvent`]s. The receiver must be drained; sends wait
    /// for channel capacity.
    pub fn with_observer(mut self, observer: mpsc::Sender<SchedulerEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn into_graph(self) -> TaskGraph {
        self.graph
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        self.detector.registry()
    }

    /// Get the number of in-flight tasks.
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event).await;
        }
    }

    /// Validate the run and log its start. Called by [`Scheduler::run`];
    /// calling it again is a no-op.
    ///
    /// # Errors
    /// `WorkerUnavailable` if a node kind has no registered worker;
    /// `InvalidPattern` if a declared gate does not compile.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let mut kinds: Vec<Capability> = self
            .graph
            .all_tasks()
            .iter()
            .map(|t| Capability::from(t.kind))
            .collect();
        kinds.sort();
        kinds.dedup();
        for capability in kinds {
            self.pool.worker(capability)?;
        }
        self.gates.prepare(&self.graph)?;

        self.log.append(
            actor::SCHEDULER,
            EventKind::RunStarted {
                domain: self.domain.clone(),
                tasks: self.graph.task_count(),
            },
        )?;
        info!(domain = %self.domain, tasks = self.graph.task_count(), "run started");
        self.started = true;
        Ok(())
    }

    /// Log a transition, then apply it.
    fn transition(&mut self, id: &TaskId, to: TaskStatus) -> Result<()> {
        let node = self.graph.task(id)?;
        if !node.status.can_transition_to(&to) {
            return Err(Error::InvalidTransition {
                from: node.status.to_string(),
                to: to.to_string(),
            });
        }
        self.log.append(
            actor::SCHEDULER,
            EventKind::TaskTransition {
                task: *id,
                key: node.key.clone(),
                from: node.status.label().to_string(),
                to: to.label().to_string(),
            },
        )?;
        debug!(task = %node.key, from = node.status.label(), to = to.label(), "transition");
        self.graph.task_mut(id)?.transition(to)
    }

    fn upstream_of(&self, id: &TaskId) -> Vec<UpstreamResult> {
        self.graph
            .get_dependencies(id)
            .into_iter()
            .filter_map(|dep| {
                dep.result.as_ref().map(|result| UpstreamResult {
                    task_id: dep.id,
                    key: dep.key.clone(),
                    kind: dep.kind,
                    result: result.clone(),
                })
            })
            .collect()
    }

    /// Dispatch ready tasks up to the pool's capacity.
    ///
    /// Returns the number of tasks dispatched.
    pub async fn dispatch_ready_tasks(&mut self) -> Result<usize> {
        self.start()?;
        let mut dispatched = 0;
        for task_id in self.graph.ready_tasks() {
            if !self.pool.has_capacity() {
                break;
            }
            self.dispatch(task_id).await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn dispatch(&mut self, task_id: TaskId) -> Result<()> {
        let node = self.graph.task(&task_id)?;
        let worker = self.pool.worker(Capability::from(node.kind))?;
        let spec = TaskSpec::for_node(
            node,
            self.scope.iter().cloned().collect(),
            self.upstream_of(&task_id),
        );

        self.transition(&task_id, TaskStatus::InProgress)?;
        self.log.append(
            actor::SCHEDULER,
            EventKind::TaskDispatched {
                task: task_id,
                key: spec.key.clone(),
                attempt: spec.attempt,
                worker: worker.name().to_string(),
            },
        )?;
        self.graph.task_mut(&task_id)?.owner = Some(worker.name().to_string());
        self.pool.acquire(task_id)?;
        self.in_flight.insert(task_id, spec.attempt);
        self.outcome.dispatches += 1;
        debug!(task = %spec.key, attempt = spec.attempt, worker = worker.name(), "dispatched");

        self.emit(SchedulerEvent::TaskStarted {
            task_id,
            key: spec.key.clone(),
            attempt: spec.attempt,
            worker: worker.name().to_string(),
        })
        .await;

        spawn_attempt(
            worker,
            spec,
            self.policy.worker_timeout,
            self.response_tx.clone(),
        );
        Ok(())
    }

    /// Wait for `count` worker responses.
    ///
    /// Returns early if the channel closes.
    pub async fn recv_responses(&mut self, count: usize) -> Vec<WorkerResponse> {
        let mut batch = Vec::with_capacity(count);
        while batch.len() < count {
            match self.response_rx.recv().await {
                Some(response) => batch.push(response),
                None => break,
            }
        }
        batch
    }

    /// Wait for one response, then take whatever else is already queued.
    async fn next_batch(&mut self) -> Vec<WorkerResponse> {
        let mut batch = self.recv_responses(1).await;
        while let Ok(response) = self.response_rx.try_recv() {
            batch.push(response);
        }
        batch
    }

    /// Handle a batch of worker responses.
    ///
    /// Responses for attempts that are no longer in flight are ignored.
    /// Within a batch, admission runs in arrival order before any result is
    /// finalized, so two results touching the same resource always conflict.
    pub async fn handle_responses(&mut self, batch: Vec<WorkerResponse>) -> Result<()> {
        let mut verdicts = Vec::with_capacity(batch.len());
        for response in batch {
            if self.in_flight.get(&response.task_id) != Some(&response.attempt) {
                debug!(task = %response.task_id, attempt = response.attempt, "ignoring stale response");
                continue;
            }
            self.in_flight.remove(&response.task_id);
            self.pool.release(&response.task_id);
            let verdict = self.admit(&response.task_id, response.outcome)?;
            verdicts.push((response.task_id, verdict));
        }

        for (task_id, verdict) in verdicts {
            match verdict {
                Verdict::Accept(result) => self.complete(task_id, result).await?,
                Verdict::Reject(failure) => self.fail(task_id, failure).await?,
            }
        }
        Ok(())
    }

    fn admit(&mut self, task_id: &TaskId, outcome: WorkerOutcome) -> Result<Verdict> {
        let result = match outcome {
            WorkerOutcome::Done(result) => result,
            WorkerOutcome::Failed(message) => {
                return Ok(Verdict::Reject(Failure::WorkerRejected { message }))
            }
            WorkerOutcome::TimedOut(after) => return Ok(Verdict::Reject(Failure::timeout(after))),
        };

        let node = self.graph.task(task_id)?;
        if !result.matches_kind(node.kind) {
            return Ok(Verdict::Reject(Failure::WorkerRejected {
                message: format!("{} task returned the wrong result shape", node.kind),
            }));
        }

        let log = self.log.as_ref();
        if let GateVerdict::Fail(reasons) =
            self.gates
                .evaluate(Checkpoint::WorkerDone, node, &result, &self.scope, log)?
        {
            return Ok(Verdict::Reject(Failure::QualityGate { reasons }));
        }

        if let Admission::Conflict { conflicts } = self.detector.admit(node, &result, log)? {
            return Ok(Verdict::Reject(Failure::Conflict { conflicts }));
        }

        if let GateVerdict::Fail(reasons) = self.gates.evaluate(
            Checkpoint::CandidateCompletion,
            node,
            &result,
            &self.scope,
            log,
        )? {
            return Ok(Verdict::Reject(Failure::QualityGate { reasons }));
        }

        Ok(Verdict::Accept(result))
    }

    async fn complete(&mut self, task_id: TaskId, result: TaskResult) -> Result<()> {
        self.transition(&task_id, TaskStatus::Completed)?;
        self.detector.release(task_id, self.log.as_ref())?;

        let node = self.graph.task_mut(&task_id)?;
        node.result = Some(result);
        let key = node.key.clone();
        debug!(task = %key, "completed");
        self.outcome.completed.push(key.clone());
        self.emit(SchedulerEvent::TaskCompleted { task_id, key }).await;
        Ok(())
    }

    async fn fail(&mut self, task_id: TaskId, failure: Failure) -> Result<()> {
        let node = self.graph.task(&task_id)?;
        let attempt = node.attempt();
        let key = node.key.clone();

        self.log.append(
            actor::SCHEDULER,
            EventKind::AttemptFailed {
                task: task_id,
                attempt,
                failure: failure.clone(),
            },
        )?;
        self.transition(&task_id, TaskStatus::Rejected)?;
        let node = self.graph.task_mut(&task_id)?;
        node.failures.push(FailureRecord {
            attempt,
            failure: failure.clone(),
            at: Utc::now(),
        });

        match self.policy.decide(node) {
            RetryDecision::Retry { next_retry } => {
                self.transition(&task_id, TaskStatus::Pending)?;
                self.graph.task_mut(&task_id)?.retry_count = next_retry;
                debug!(task = %key, attempt, %failure, "retrying");
                self.emit(SchedulerEvent::TaskRetrying {
                    task_id,
                    key,
                    failed_attempt: attempt,
                    failure,
                })
                .await;
            }
            RetryDecision::Escalate { attempts } => {
                self.escalate(task_id, attempts).await?;
            }
        }
        Ok(())
    }

    async fn escalate(&mut self, task_id: TaskId, attempts: u32) -> Result<()> {
        self.transition(&task_id, TaskStatus::Escalated)?;
        self.detector.release(task_id, self.log.as_ref())?;

        let node = self.graph.task_mut(&task_id)?;
        node.retry_count = attempts;
        let escalation = Escalation {
            task_id,
            key: node.key.clone(),
            kind: node.kind,
            attempts,
            failures: node.failures.clone(),
        };
        self.log.append(
            actor::SCHEDULER,
            EventKind::TaskEscalated {
                task: task_id,
                key: escalation.key.clone(),
                attempts,
            },
        )?;
        warn!(task = %escalation.key, attempts, "escalated: {}", escalation.error());

        let key = escalation.key.clone();
        self.outcome.escalations.push(escalation);
        self.emit(SchedulerEvent::TaskEscalated {
            task_id,
            key: key.clone(),
            attempts,
        })
        .await;

        self.block_descendants(task_id, &key).await
    }

    async fn block_descendants(&mut self, task_id: TaskId, key: &str) -> Result<()> {
        let reason = format!("upstream task {} escalated", key);
        for descendant in self.graph.descendants(&task_id) {
            if !self.graph.task(&descendant)?.is_pending() {
                continue;
            }
            self.transition(
                &descendant,
                TaskStatus::Blocked {
                    reason: reason.clone(),
                },
            )?;
            let blocked = BlockedTask {
                task_id: descendant,
                key: self.graph.task(&descendant)?.key.clone(),
                reason: reason.clone(),
            };
            debug!(task = %blocked.key, %reason, "blocked");
            self.emit(SchedulerEvent::TaskBlocked {
                task_id: descendant,
                key: blocked.key.clone(),
                reason: reason.clone(),
            })
            .await;
            self.outcome.blocked.push(blocked);
        }
        Ok(())
    }

    /// Run the scheduling loop until every node is terminal.
    ///
    /// Escalations do not abort the run; they are reported in the returned
    /// [`RunOutcome`] alongside the nodes they blocked.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.start()?;
        loop {
            self.dispatch_ready_tasks().await?;

            if self.in_flight.is_empty() {
                // Nothing running and nothing ready: every node is terminal.
                break;
            }

            let batch = self.next_batch().await;
            if batch.is_empty() {
                break;
            }
            self.handle_responses(batch).await?;
        }

        self.emit(SchedulerEvent::AllTasksSettled).await;
        self.log.append(
            actor::SCHEDULER,
            EventKind::RunFinished {
                completed: self.outcome.completed.len(),
                escalated: self.outcome.escalations.len(),
                blocked: self.outcome.blocked.len(),
            },
        )?;
        info!(
            completed = self.outcome.completed.len(),
            escalated = self.outcome.escalations.len(),
            blocked = self.outcome.blocked.len(),
            "run finished"
        );
        Ok(self.outcome.clone())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("graph", &self.graph)
            .field("pool", &self.pool)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
