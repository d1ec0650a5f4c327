//! Incoming work requests.
//!
//! A `Request` describes one run: the domain, the acceptance predicate, the
//! resource scope, and the units of work that become [`TaskNode`]s.
//!
//! [`TaskNode`]: crate::core::TaskNode

use crate::consensus::CategoryWeights;
use crate::core::task::TaskKind;
use crate::orchestration::gate::GateSpec;
use serde::{Deserialize, Serialize};

/// A declared unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDecl {
    /// Request-local name used by `blocked_by` and `validates`.
    pub key: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub description: String,
    /// Keys of units that must complete first.
    #[serde(default, rename = "blockedBy", alias = "blocked_by")]
    pub blocked_by: Vec<String>,
    /// For validators: the builder this validator verifies.
    #[serde(default)]
    pub validates: Option<String>,
    /// Overrides the run's retry bound for this unit.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Unit-specific gates.
    #[serde(default)]
    pub gates: Vec<GateSpec>,
}

impl UnitDecl {
    pub fn new(key: &str, kind: TaskKind) -> Self {
        Self {
            key: key.to_string(),
            kind,
            domain: String::new(),
            description: String::new(),
            blocked_by: Vec::new(),
            validates: None,
            max_retries: None,
            gates: Vec::new(),
        }
    }

    pub fn builder(key: &str) -> Self {
        Self::new(key, TaskKind::Builder)
    }

    /// A validator paired with `builder`.
    pub fn validator(key: &str, builder: &str) -> Self {
        let mut unit = Self::new(key, TaskKind::Validator);
        unit.validates = Some(builder.to_string());
        unit
    }

    pub fn analyzer(key: &str) -> Self {
        Self::new(key, TaskKind::Analyzer)
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn blocked_by(mut self, key: &str) -> Self {
        self.blocked_by.push(key.to_string());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn gate(mut self, gate: GateSpec) -> Self {
        self.gates.push(gate);
        self
    }
}

/// One incoming request; produces one task graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub description: String,
    /// Gates every builder and validator result must pass at candidate-completion.
    #[serde(default, alias = "acceptance_predicate")]
    pub acceptance: Vec<GateSpec>,
    /// Resource scope handed to every worker.
    #[serde(default)]
    pub initial_resources: Vec<String>,
    #[serde(default)]
    pub units: Vec<UnitDecl>,
    /// Per-run category weights; falls back to the engine configuration.
    #[serde(default)]
    pub weights: Option<CategoryWeights>,
}

impl Request {
    pub fn new(domain: &str, description: &str) -> Self {
        Self {
            domain: domain.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn unit(mut self, unit: UnitDecl) -> Self {
        self.units.push(unit);
        self
    }

    pub fn acceptance(mut self, gate: GateSpec) -> Self {
        self.acceptance.push(gate);
        self
    }

    pub fn resource(mut self, key: &str) -> Self {
        self.initial_resources.push(key.to_string());
        self
    }

    pub fn weights(mut self, weights: CategoryWeights) -> Self {
        self.weights = Some(weights);
        self
    }
}
