//! Raw and canonical findings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical four-level severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How sure the analyzer is about a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Certainty {
    Low,
    #[default]
    Medium,
    High,
}

/// A finding as an analyzer reported it.
///
/// Only `location` and `title` are mandatory, and even those are optional
/// here so that malformed records can be reported instead of failing to
/// deserialize the whole batch. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    #[serde(default, alias = "file", alias = "url", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Label (`"high"`, `"P1"`, ...) or numeric score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Value>,
    /// Label (`"high"`) or a number in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, alias = "fix", skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    /// Context tag the finding applies to, e.g. `"server"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicability: Option<String>,
    /// Other locations that refer to the same underlying issue.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

impl RawFinding {
    pub fn new(location: &str, title: &str, severity: &str) -> Self {
        Self {
            location: Some(location.to_string()),
            title: Some(title.to_string()),
            severity: Some(Value::String(severity.to_string())),
            ..Default::default()
        }
    }

    pub fn severity_score(mut self, score: f64) -> Self {
        self.severity = serde_json::Number::from_f64(score).map(Value::Number);
        self
    }

    pub fn confidence(mut self, confidence: &str) -> Self {
        self.confidence = Some(Value::String(confidence.to_string()));
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn evidence(mut self, evidence: &str) -> Self {
        self.evidence = Some(evidence.to_string());
        self
    }

    pub fn remediation(mut self, remediation: &str) -> Self {
        self.remediation = Some(remediation.to_string());
        self
    }

    pub fn applicability(mut self, tag: &str) -> Self {
        self.applicability = Some(tag.to_string());
        self
    }

    pub fn related(mut self, location: &str) -> Self {
        self.related.push(location.to_string());
        self
    }
}

/// A normalized finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// `<source_id>#<index in the source batch>`.
    pub id: String,
    pub source_id: String,
    pub location: String,
    pub title: String,
    pub severity: Severity,
    pub certainty: Certainty,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicability: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}
