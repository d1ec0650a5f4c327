//! Finding normalization.
//!
//! Converts heterogeneous analyzer output into canonical [`Finding`]s.
//! Normalization never fails a batch: records missing `location` or `title`
//! are dropped with a warning, and unknown severities become `low` with a
//! warning.

use crate::consensus::finding::{Certainty, Finding, RawFinding, Severity};
use crate::error::{Error, Result};
use crate::event_log::{actor, EventKind, EventLog};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Category assigned when an analyzer does not supply one.
pub const DEFAULT_CATEGORY: &str = "uncategorized";

const BUILTIN_LABELS: &[(&str, Severity)] = &[
    ("critical", Severity::Critical),
    ("blocker", Severity::Critical),
    ("fatal", Severity::Critical),
    ("p0", Severity::Critical),
    ("high", Severity::High),
    ("major", Severity::High),
    ("error", Severity::High),
    ("serious", Severity::High),
    ("p1", Severity::High),
    ("medium", Severity::Medium),
    ("moderate", Severity::Medium),
    ("warning", Severity::Medium),
    ("p2", Severity::Medium),
    ("low", Severity::Low),
    ("minor", Severity::Low),
    ("info", Severity::Low),
    ("note", Severity::Low),
    ("p3", Severity::Low),
];

/// Maps analyzer-specific severity labels and scores onto [`Severity`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeverityScale {
    /// Extra labels, lowercase. Checked before the built-in labels.
    aliases: BTreeMap<String, Severity>,
}

impl SeverityScale {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(mut self, label: &str, severity: Severity) -> Self {
        self.aliases.insert(label.trim().to_lowercase(), severity);
        self
    }

    pub fn with_aliases(mut self, aliases: &BTreeMap<String, Severity>) -> Self {
        for (label, severity) in aliases {
            self.aliases.insert(label.trim().to_lowercase(), *severity);
        }
        self
    }

    /// Map a numeric score on a 0-10 scale.
    pub fn from_score(score: f64) -> Severity {
        if score >= 9.0 {
            Severity::Critical
        } else if score >= 7.0 {
            Severity::High
        } else if score >= 4.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn from_label(&self, label: &str) -> Option<Severity> {
        let label = label.trim().to_lowercase();
        if let Some(severity) = self.aliases.get(&label) {
            return Some(*severity);
        }
        if let Some((_, severity)) = BUILTIN_LABELS.iter().find(|(l, _)| *l == label) {
            return Some(*severity);
        }
        label.parse::<f64>().ok().filter(|s| s.is_finite()).map(Self::from_score)
    }

    /// Map a raw severity value, or `None` if it is not recognized.
    pub fn map(&self, value: &Value) -> Option<Severity> {
        match value {
            Value::String(label) => self.from_label(label),
            Value::Number(n) => n.as_f64().map(Self::from_score),
            _ => None,
        }
    }
}

/// Parse the optional `confidence` field.
///
/// Unrecognized or missing values mean medium certainty.
pub fn parse_certainty(value: Option<&Value>) -> Certainty {
    match value {
        Some(Value::String(label)) => match label.trim().to_lowercase().as_str() {
            "high" | "certain" | "confirmed" => Certainty::High,
            "low" | "tentative" | "unlikely" => Certainty::Low,
            _ => Certainty::Medium,
        },
        Some(Value::Number(n)) => match n.as_f64() {
            Some(score) if score >= 0.8 => Certainty::High,
            Some(score) if score >= 0.5 => Certainty::Medium,
            Some(_) => Certainty::Low,
            None => Certainty::Medium,
        },
        _ => Certainty::Medium,
    }
}

/// Something the normalizer noticed but did not fail on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NormalizationWarning {
    Dropped {
        source: String,
        index: usize,
        reason: String,
    },
    UnknownSeverity {
        source: String,
        index: usize,
        value: String,
    },
}

impl std::fmt::Display for NormalizationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizationWarning::Dropped {
                source,
                index,
                reason,
            } => write!(f, "{}#{} dropped: {}", source, index, reason),
            NormalizationWarning::UnknownSeverity {
                source,
                index,
                value,
            } => write!(f, "{}#{} has unknown severity {}; treated as low", source, index, value),
        }
    }
}

/// Output of normalizing one source's batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub findings: Vec<Finding>,
    pub warnings: Vec<NormalizationWarning>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Converts raw analyzer records into canonical findings.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    scale: SeverityScale,
}

impl Normalizer {
    pub fn new(scale: SeverityScale) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> &SeverityScale {
        &self.scale
    }

    /// Normalize one record.
    ///
    /// Returns the finding plus an unknown-severity warning when the severity
    /// had to be defaulted.
    ///
    /// # Errors
    /// `MalformedFinding` if `location` or `title` is missing or blank.
    pub fn normalize_record(
        &self,
        source_id: &str,
        index: usize,
        raw: &RawFinding,
    ) -> Result<(Finding, Option<NormalizationWarning>)> {
        let location = non_empty(&raw.location).ok_or_else(|| {
            Error::MalformedFinding(format!("{}#{} has no location", source_id, index))
        })?;
        let title = non_empty(&raw.title).ok_or_else(|| {
            Error::MalformedFinding(format!("{}#{} has no title", source_id, index))
        })?;

        let (severity, warning) = match raw.severity.as_ref().and_then(|v| self.scale.map(v)) {
            Some(severity) => (severity, None),
            None => {
                let value = raw
                    .severity
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "<missing>".to_string());
                let warning = NormalizationWarning::UnknownSeverity {
                    source: source_id.to_string(),
                    index,
                    value,
                };
                (Severity::Low, Some(warning))
            }
        };

        let finding = Finding {
            id: format!("{}#{}", source_id, index),
            source_id: source_id.to_string(),
            location,
            title,
            severity,
            certainty: parse_certainty(raw.confidence.as_ref()),
            category: non_empty(&raw.category).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            evidence: non_empty(&raw.evidence),
            remediation: non_empty(&raw.remediation),
            applicability: non_empty(&raw.applicability).map(|s| s.to_lowercase()),
            related: raw
                .related
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        };
        Ok((finding, warning))
    }

    /// Normalize every record from one source, in order.
    pub fn normalize(&self, source_id: &str, raw: &[RawFinding]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (index, record) in raw.iter().enumerate() {
            match self.normalize_record(source_id, index, record) {
                Ok((finding, warning)) => {
                    if let Some(warning) = warning {
                        warn!("{}", warning);
                        batch.warnings.push(warning);
                    }
                    batch.findings.push(finding);
                }
                Err(e) => {
                    let warning = NormalizationWarning::Dropped {
                        source: source_id.to_string(),
                        index,
                        reason: e.to_string(),
                    };
                    warn!("{}", warning);
                    batch.warnings.push(warning);
                }
            }
        }
        batch
    }

    /// [`Normalizer::normalize`], recording every warning in `log`.
    pub fn normalize_logged(
        &self,
        source_id: &str,
        raw: &[RawFinding],
        log: &dyn EventLog,
    ) -> Result<NormalizedBatch> {
        let batch = self.normalize(source_id, raw);
        for warning in &batch.warnings {
            let event = match warning {
                NormalizationWarning::Dropped {
                    source,
                    index,
                    reason,
                } => EventKind::FindingDropped {
                    source: source.clone(),
                    index: *index,
                    reason: reason.clone(),
                },
                NormalizationWarning::UnknownSeverity {
                    source,
                    index,
                    value,
                } => EventKind::SeverityDefaulted {
                    source: source.clone(),
                    index: *index,
                    value: value.clone(),
                },
            };
            log.append(actor::NORMALIZER, event)?;
        }
        Ok(batch)
    }
}
