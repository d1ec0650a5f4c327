//! Consensus aggregation.
//!
//! Turns canonical findings from any number of analyzers into one ranked
//! report:
//!
//! 1. applicability filter against the detected context
//! 2. grouping by location and declared related links
//! 3. confidence voting per group
//! 4. capped per-category deductions
//! 5. weighted health score
//! 6. priority from severity and confidence
//!
//! Aggregation is a pure function of its inputs: the same findings, weights
//! and context always serialize to the same bytes.

use crate::consensus::finding::{Certainty, Finding, Severity};
use crate::consensus::scoring::{CategoryScore, CategoryWeights, HealthScore, ScoringTable};
use crate::error::{Error, Result};
use crate::event_log::{actor, EventKind, EventLog};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

/// Voted confidence of a consensus record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Confirmed,
    Likely,
    Investigate,
    FalsePositive,
}

impl Confidence {
    /// Position on the promotion ladder; false positives are off the ladder.
    fn rank(&self) -> u8 {
        match self {
            Confidence::Investigate => 1,
            Confidence::Likely => 2,
            Confidence::Confirmed => 3,
            Confidence::FalsePositive => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Confirmed => "confirmed",
            Confidence::Likely => "likely",
            Confidence::Investigate => "investigate",
            Confidence::FalsePositive => "false_positive",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority bucket, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    FixImmediately,
    FixThisSprint,
    Backlog,
    Info,
}

impl Priority {
    /// Fixed severity × confidence lookup.
    pub fn from_matrix(severity: Severity, confidence: Confidence) -> Self {
        use Confidence::*;
        use Severity::*;
        match (confidence, severity) {
            (FalsePositive, _) => Priority::Info,
            (Confirmed | Likely, Critical | High) => Priority::FixImmediately,
            (Confirmed | Likely, Medium) => Priority::FixThisSprint,
            (Confirmed | Likely, Low) => Priority::Backlog,
            (Investigate, Critical | High | Medium) => Priority::Backlog,
            (Investigate, Low) => Priority::Info,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::FixImmediately => write!(f, "fix immediately"),
            Priority::FixThisSprint => write!(f, "fix this sprint"),
            Priority::Backlog => write!(f, "backlog"),
            Priority::Info => write!(f, "info"),
        }
    }
}

/// One or more findings about the same underlying issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub id: String,
    pub location: String,
    pub title: String,
    pub category: String,
    /// Highest severity among contributors.
    pub severity: Severity,
    pub confidence: Confidence,
    pub priority: Priority,
    /// In order of first observation.
    pub contributing_finding_ids: Vec<String>,
    /// Distinct sources, in order of first observation.
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_positive_justification: Option<String>,
}

impl ConsensusRecord {
    /// Start a record from its first finding.
    pub fn new(id: String, finding: &Finding) -> Self {
        let mut record = Self {
            id,
            location: finding.location.clone(),
            title: finding.title.clone(),
            category: finding.category.clone(),
            severity: finding.severity,
            confidence: Confidence::Investigate,
            priority: Priority::Info,
            contributing_finding_ids: Vec::new(),
            sources: Vec::new(),
            evidence: Vec::new(),
            remediation: None,
            false_positive_justification: None,
        };
        record.add(finding);
        record
    }

    /// Add a corroborating finding and re-vote. Confidence only moves up.
    pub fn add(&mut self, finding: &Finding) {
        self.contributing_finding_ids.push(finding.id.clone());
        if !self.sources.contains(&finding.source_id) {
            self.sources.push(finding.source_id.clone());
        }
        if let Some(evidence) = &finding.evidence {
            if !self.evidence.contains(evidence) {
                self.evidence.push(evidence.clone());
            }
        }
        if self.remediation.is_none() {
            self.remediation = finding.remediation.clone();
        }
        self.severity = self.severity.max(finding.severity);

        let vote = if self.sources.len() >= 2 {
            Confidence::Confirmed
        } else if finding.certainty == Certainty::High {
            Confidence::Likely
        } else {
            Confidence::Investigate
        };
        self.promote(vote);
    }

    /// Raise confidence to `to` if that is a promotion. Never demotes.
    pub fn promote(&mut self, to: Confidence) -> bool {
        if self.confidence == Confidence::FalsePositive || to.rank() <= self.confidence.rank() {
            self.priority = Priority::from_matrix(self.severity, self.confidence);
            return false;
        }
        self.confidence = to;
        self.priority = Priority::from_matrix(self.severity, self.confidence);
        true
    }

    /// The only way to lower confidence.
    ///
    /// # Errors
    /// `Validation` if `justification` is blank.
    pub fn mark_false_positive(&mut self, justification: &str) -> Result<()> {
        let justification = justification.trim();
        if justification.is_empty() {
            return Err(Error::Validation(
                "false positive reclassification requires a justification".to_string(),
            ));
        }
        self.confidence = Confidence::FalsePositive;
        self.priority = Priority::Info;
        self.false_positive_justification = Some(justification.to_string());
        Ok(())
    }
}

/// A finding removed by the applicability filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedFinding {
    pub finding_id: String,
    pub source_id: String,
    pub location: String,
    pub title: String,
    pub confidence: Confidence,
    pub reason: String,
}

/// Tags describing where the analyzed system runs, e.g. `client`, `server`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionContext {
    tags: BTreeSet<String>,
}

impl DetectionContext {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tags: tags
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Whether a finding tagged `applicability` applies here.
    ///
    /// Untagged findings always apply; an empty context accepts everything.
    pub fn applies(&self, applicability: Option<&str>) -> bool {
        match applicability {
            None => true,
            Some(_) if self.tags.is_empty() => true,
            Some(tag) => self.tags.contains(&tag.to_lowercase()),
        }
    }

    fn describe(&self) -> String {
        self.tags.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// The final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub health_score: HealthScore,
    /// Sorted by category name.
    pub category_scores: Vec<CategoryScore>,
    /// Most urgent first.
    pub ranked_findings: Vec<ConsensusRecord>,
    pub excluded_false_positives: Vec<ExcludedFinding>,
    pub event_log_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Report {
    /// No issues found.
    pub fn is_clean(&self) -> bool {
        self.ranked_findings.is_empty()
    }
}

/// Minimal union-find over group indices.
struct Groups {
    parent: Vec<usize>,
}

impl Groups {
    fn new() -> Self {
        Self { parent: Vec::new() }
    }

    fn add(&mut self) -> usize {
        self.parent.push(self.parent.len());
        self.parent.len() - 1
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge, keeping the lower (earlier) index as the root.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

/// Groups, votes, scores and ranks findings.
#[derive(Debug, Clone, Default)]
pub struct ConsensusAggregator {
    table: ScoringTable,
    context: DetectionContext,
}

impl ConsensusAggregator {
    pub fn new(table: ScoringTable, context: DetectionContext) -> Self {
        Self { table, context }
    }

    pub fn with_context(mut self, context: DetectionContext) -> Self {
        self.context = context;
        self
    }

    pub fn table(&self) -> &ScoringTable {
        &self.table
    }

    /// Aggregate `findings` into a report.
    ///
    /// # Errors
    /// `Configuration` if `weights` are invalid; nothing is scored.
    pub fn aggregate(&self, findings: &[Finding], weights: &CategoryWeights) -> Result<Report> {
        weights.validate()?;

        let (applicable, excluded) = self.filter(findings);
        let mut records = self.group(&applicable);
        let (category_scores, mut warnings) = self.score(&records, weights);
        let health_score = HealthScore::from_scores(&category_scores);

        // Stable: ties keep first-observation order.
        records.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.severity.cmp(&a.severity))
                .then(b.confidence.rank().cmp(&a.confidence.rank()))
        });

        for w in &warnings {
            warn!("{}", w);
        }
        warnings.dedup();

        Ok(Report {
            health_score,
            category_scores,
            ranked_findings: records,
            excluded_false_positives: excluded,
            event_log_reference: None,
            warnings,
        })
    }

    /// [`ConsensusAggregator::aggregate`], recording the outcome in `log`.
    pub fn aggregate_logged(
        &self,
        findings: &[Finding],
        weights: &CategoryWeights,
        log: &dyn EventLog,
    ) -> Result<Report> {
        let mut report = self.aggregate(findings, weights)?;
        report.event_log_reference = Some(log.reference());
        log.append(
            actor::AGGREGATOR,
            EventKind::AggregationCompleted {
                health_score: report.health_score.exact,
                records: report.ranked_findings.len(),
                excluded: report.excluded_false_positives.len(),
            },
        )?;
        info!(
            health = %report.health_score,
            records = report.ranked_findings.len(),
            excluded = report.excluded_false_positives.len(),
            "aggregation complete"
        );
        Ok(report)
    }

    fn filter<'a>(&self, findings: &'a [Finding]) -> (Vec<&'a Finding>, Vec<ExcludedFinding>) {
        let mut applicable = Vec::new();
        let mut excluded = Vec::new();
        for finding in findings {
            if self.context.applies(finding.applicability.as_deref()) {
                applicable.push(finding);
            } else {
                excluded.push(ExcludedFinding {
                    finding_id: finding.id.clone(),
                    source_id: finding.source_id.clone(),
                    location: finding.location.clone(),
                    title: finding.title.clone(),
                    confidence: Confidence::FalsePositive,
                    reason: format!(
                        "applies to {} but detected context is [{}]",
                        finding.applicability.as_deref().unwrap_or_default(),
                        self.context.describe()
                    ),
                });
            }
        }
        (applicable, excluded)
    }

    fn group(&self, findings: &[&Finding]) -> Vec<ConsensusRecord> {
        let mut groups = Groups::new();

        // Each distinct location gets a slot in first-observation order.
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut slot_of = |groups: &mut Groups, location: &str| -> usize {
            if let Some(&i) = slots.get(location) {
                return i;
            }
            let i = groups.add();
            slots.insert(location.to_string(), i);
            i
        };
        let mut finding_slots = Vec::with_capacity(findings.len());
        for finding in findings {
            let own = slot_of(&mut groups, &finding.location);
            for related in &finding.related {
                let other = slot_of(&mut groups, related);
                groups.union(own, other);
            }
            finding_slots.push(own);
        }

        let mut records: Vec<ConsensusRecord> = Vec::new();
        let mut record_of_root: BTreeMap<usize, usize> = BTreeMap::new();
        for (finding, own) in findings.iter().zip(finding_slots) {
            let root = groups.find(own);
            match record_of_root.get(&root) {
                Some(&index) => records[index].add(finding),
                None => {
                    let id = format!("CR-{:03}", records.len() + 1);
                    record_of_root.insert(root, records.len());
                    records.push(ConsensusRecord::new(id, finding));
                }
            }
        }
        records
    }

    fn score(
        &self,
        records: &[ConsensusRecord],
        weights: &CategoryWeights,
    ) -> (Vec<CategoryScore>, Vec<String>) {
        let mut by_category: BTreeMap<String, Vec<Severity>> = weights
            .categories()
            .map(|c| (c.clone(), Vec::new()))
            .collect();
        for record in records {
            if record.confidence == Confidence::FalsePositive {
                continue;
            }
            by_category
                .entry(record.category.clone())
                .or_default()
                .push(record.severity);
        }

        let mut warnings = Vec::new();
        let scores = by_category
            .into_iter()
            .map(|(category, severities)| {
                let weight = match weights.get(&category) {
                    Some(weight) => weight,
                    None => {
                        warnings.push(format!(
                            "category {} has no weight; excluded from the health score",
                            category
                        ));
                        0.0
                    }
                };
                let records = severities.len();
                let (score, deduction) = self.table.score(severities);
                CategoryScore {
                    category,
                    weight,
                    score,
                    deduction,
                    records,
                }
            })
            .collect();
        (scores, warnings)
    }
}
