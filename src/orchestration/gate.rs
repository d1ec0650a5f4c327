//! Quality gates.
//!
//! A gate is a pure predicate over a candidate [`TaskResult`]. Gates run at
//! one of two checkpoints and only produce verdicts; the scheduler decides
//! what a failing verdict means for the task.
//!
//! Built-in gates are declared as [`GateSpec`] values on request units and
//! compiled once per run by [`GateEnforcer::prepare`]. Custom gates implement
//! [`QualityGate`] directly.

use crate::core::dag::TaskGraph;
use crate::core::task::{TaskId, TaskKind, TaskNode, TaskResult};
use crate::error::Result;
use crate::event_log::{actor, EventKind, EventLog};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// When a gate is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// The worker reported it is done.
    WorkerDone,
    /// The result is about to be accepted as the node's completion.
    CandidateCompletion,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Checkpoint::WorkerDone => write!(f, "worker_done"),
            Checkpoint::CandidateCompletion => write!(f, "candidate_completion"),
        }
    }
}

/// Machine-checkable failure code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    EmptyChangeSet,
    MissingRationale,
    ForbiddenPattern,
    TooManyResources,
    OutOfScope,
    MissingFindings,
    /// Raised by a user-supplied gate.
    Custom(String),
}

/// One structured reason a gate failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReason {
    pub gate: String,
    pub code: ReasonCode,
    pub detail: String,
    /// Offending resource, when the reason concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl GateReason {
    pub fn new(gate: &str, code: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            gate: gate.to_string(),
            code,
            detail: detail.into(),
            resource: None,
        }
    }

    pub fn on_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{}: {} ({})", self.gate, self.detail, resource),
            None => write!(f, "{}: {}", self.gate, self.detail),
        }
    }
}

/// Pass, or fail with reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reasons")]
pub enum GateVerdict {
    Pass,
    Fail(Vec<GateReason>),
}

impl GateVerdict {
    pub fn fail(reason: GateReason) -> Self {
        GateVerdict::Fail(vec![reason])
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, GateVerdict::Pass)
    }

    pub fn reasons(&self) -> &[GateReason] {
        match self {
            GateVerdict::Pass => &[],
            GateVerdict::Fail(reasons) => reasons,
        }
    }

    fn from_reasons(reasons: Vec<GateReason>) -> Self {
        if reasons.is_empty() {
            GateVerdict::Pass
        } else {
            GateVerdict::Fail(reasons)
        }
    }
}

/// What a gate may look at besides the result itself.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub task_key: &'a str,
    pub kind: TaskKind,
    /// The request's resource scope.
    pub scope: &'a BTreeSet<String>,
}

/// A pure, deterministic predicate over a task result.
pub trait QualityGate: Send + Sync {
    fn name(&self) -> &str;

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::CandidateCompletion
    }

    fn evaluate(&self, result: &TaskResult, ctx: &GateContext<'_>) -> GateVerdict;
}

/// Declarative built-in gates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "gate")]
pub enum GateSpec {
    /// A change result must touch at least one resource.
    NonEmptyChangeSet,
    /// A change result must explain itself.
    RationaleRequired,
    /// No change content may match `pattern` (regex).
    ForbiddenPattern { pattern: String },
    /// A change result may touch at most `limit` distinct resources.
    MaxResources { limit: usize },
    /// Every touched resource must be in the request's resource scope.
    /// An empty scope allows everything.
    WithinScope,
    /// An analyzer result must contain at least one finding.
    FindingsRequired,
}

impl GateSpec {
    pub fn name(&self) -> &'static str {
        match self {
            GateSpec::NonEmptyChangeSet => "non_empty_change_set",
            GateSpec::RationaleRequired => "rationale_required",
            GateSpec::ForbiddenPattern { .. } => "forbidden_pattern",
            GateSpec::MaxResources { .. } => "max_resources",
            GateSpec::WithinScope => "within_scope",
            GateSpec::FindingsRequired => "findings_required",
        }
    }

    /// Shape checks run when the worker reports done; content checks run at
    /// candidate completion.
    pub fn checkpoint(&self) -> Checkpoint {
        match self {
            GateSpec::NonEmptyChangeSet | GateSpec::RationaleRequired | GateSpec::FindingsRequired => {
                Checkpoint::WorkerDone
            }
            GateSpec::ForbiddenPattern { .. } | GateSpec::MaxResources { .. } | GateSpec::WithinScope => {
                Checkpoint::CandidateCompletion
            }
        }
    }

    /// Compile into an evaluable gate.
    ///
    /// # Errors
    /// `InvalidPattern` if a `ForbiddenPattern` regex does not compile.
    pub fn build(&self) -> Result<Arc<dyn QualityGate>> {
        let pattern = match self {
            GateSpec::ForbiddenPattern { pattern } => Some(Regex::new(pattern)?),
            _ => None,
        };
        Ok(Arc::new(BuiltinGate {
            spec: self.clone(),
            pattern,
        }))
    }
}

struct BuiltinGate {
    spec: GateSpec,
    pattern: Option<Regex>,
}

impl QualityGate for BuiltinGate {
    fn name(&self) -> &str {
        self.spec.name()
    }

    fn checkpoint(&self) -> Checkpoint {
        self.spec.checkpoint()
    }

    fn evaluate(&self, result: &TaskResult, ctx: &GateContext<'_>) -> GateVerdict {
        let name = self.name();
        match (&self.spec, result) {
            (GateSpec::NonEmptyChangeSet, TaskResult::Change { change_set, .. }) => {
                if change_set.is_empty() {
                    GateVerdict::fail(GateReason::new(
                        name,
                        ReasonCode::EmptyChangeSet,
                        "change set is empty",
                    ))
                } else {
                    GateVerdict::Pass
                }
            }
            (GateSpec::RationaleRequired, TaskResult::Change { rationale, .. }) => {
                if rationale.trim().is_empty() {
                    GateVerdict::fail(GateReason::new(
                        name,
                        ReasonCode::MissingRationale,
                        "rationale is empty",
                    ))
                } else {
                    GateVerdict::Pass
                }
            }
            (GateSpec::ForbiddenPattern { pattern }, TaskResult::Change { change_set, .. }) => {
                let Some(regex) = &self.pattern else {
                    return GateVerdict::Pass;
                };
                GateVerdict::from_reasons(
                    change_set
                        .changes
                        .iter()
                        .filter(|change| regex.is_match(&change.content))
                        .map(|change| {
                            GateReason::new(
                                name,
                                ReasonCode::ForbiddenPattern,
                                format!("content matches /{}/", pattern),
                            )
                            .on_resource(&change.resource)
                        })
                        .collect(),
                )
            }
            (GateSpec::MaxResources { limit }, TaskResult::Change { change_set, .. }) => {
                let touched = change_set.resource_keys().len();
                if touched > *limit {
                    GateVerdict::fail(GateReason::new(
                        name,
                        ReasonCode::TooManyResources,
                        format!("touches {} resources, limit is {}", touched, limit),
                    ))
                } else {
                    GateVerdict::Pass
                }
            }
            (GateSpec::WithinScope, TaskResult::Change { change_set, .. }) => {
                if ctx.scope.is_empty() {
                    return GateVerdict::Pass;
                }
                GateVerdict::from_reasons(
                    change_set
                        .resource_keys()
                        .iter()
                        .filter(|resource| !ctx.scope.contains(*resource))
                        .map(|resource| {
                            GateReason::new(name, ReasonCode::OutOfScope, "outside request scope")
                                .on_resource(resource)
                        })
                        .collect(),
                )
            }
            (GateSpec::FindingsRequired, TaskResult::Findings { findings }) => {
                if findings.is_empty() {
                    GateVerdict::fail(GateReason::new(
                        name,
                        ReasonCode::MissingFindings,
                        "analyzer returned no findings",
                    ))
                } else {
                    GateVerdict::Pass
                }
            }
            // Gates do not apply to the other result shape.
            _ => GateVerdict::Pass,
        }
    }
}

/// Runs every gate attached to a node at a checkpoint.
///
/// A node's gates are its declared [`GateSpec`]s plus any custom gates
/// registered globally or for its key.
#[derive(Default)]
pub struct GateEnforcer {
    global: Vec<Arc<dyn QualityGate>>,
    by_key: HashMap<String, Vec<Arc<dyn QualityGate>>>,
    compiled: HashMap<TaskId, Vec<Arc<dyn QualityGate>>>,
}

impl GateEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom gate for every node.
    pub fn with_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.global.push(gate);
        self
    }

    /// Register a custom gate for the node with request key `key`.
    pub fn with_task_gate(mut self, key: &str, gate: Arc<dyn QualityGate>) -> Self {
        self.by_key.entry(key.to_string()).or_default().push(gate);
        self
    }

    /// Compile the declared gates of every node in `graph`.
    pub fn prepare(&mut self, graph: &TaskGraph) -> Result<()> {
        self.compiled.clear();
        for node in graph.all_tasks() {
            let mut gates = Vec::with_capacity(node.gates.len());
            for spec in &node.gates {
                gates.push(spec.build()?);
            }
            self.compiled.insert(node.id, gates);
        }
        Ok(())
    }

    fn gates_for<'a>(&'a self, node: &'a TaskNode) -> impl Iterator<Item = &'a Arc<dyn QualityGate>> {
        self.compiled
            .get(&node.id)
            .into_iter()
            .flatten()
            .chain(self.by_key.get(&node.key).into_iter().flatten())
            .chain(self.global.iter())
    }

    /// Evaluate all gates for `node` at `checkpoint`.
    ///
    /// Every gate runs, so the verdict carries every failing reason. Each
    /// evaluation is appended to `log`.
    pub fn evaluate(
        &self,
        checkpoint: Checkpoint,
        node: &TaskNode,
        result: &TaskResult,
        scope: &BTreeSet<String>,
        log: &dyn EventLog,
    ) -> Result<GateVerdict> {
        let ctx = GateContext {
            task_key: &node.key,
            kind: node.kind,
            scope,
        };
        let mut reasons = Vec::new();
        for gate in self.gates_for(node).filter(|g| g.checkpoint() == checkpoint) {
            let verdict = gate.evaluate(result, &ctx);
            log.append(
                actor::GATE_ENFORCER,
                EventKind::GateEvaluated {
                    task: node.id,
                    gate: gate.name().to_string(),
                    checkpoint,
                    passed: verdict.is_pass(),
                    reasons: verdict.reasons().to_vec(),
                },
            )?;
            tracing::debug!(
                task = %node.key,
                gate = gate.name(),
                %checkpoint,
                passed = verdict.is_pass(),
                "gate evaluated"
            );
            if let GateVerdict::Fail(failed) = verdict {
                reasons.extend(failed);
            }
        }
        Ok(GateVerdict::from_reasons(reasons))
    }
}

impl std::fmt::Debug for GateEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateEnforcer")
            .field("global", &self.global.len())
            .field("by_key", &self.by_key.len())
            .field("compiled", &self.compiled.len())
            .finish()
    }
}
