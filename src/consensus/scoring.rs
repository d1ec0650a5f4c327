//! Category scoring and the weighted health score.

use crate::consensus::finding::Severity;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Allowed distance of the weight sum from 1.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Default cap on a single category's total deduction.
pub const DEFAULT_CATEGORY_CAP: u32 = 25;

/// Per-run category weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryWeights(BTreeMap<String, f64>);

impl CategoryWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category: &str, weight: f64) -> Self {
        self.0.insert(category.to_string(), weight);
        self
    }

    pub fn get(&self, category: &str) -> Option<f64> {
        self.0.get(category).copied()
    }

    pub fn categories(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check every weight is in `[0, 1]` and the weights sum to 1.
    ///
    /// # Errors
    /// `Configuration` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        for (category, weight) in &self.0 {
            if !weight.is_finite() || !(0.0..=1.0).contains(weight) {
                return Err(Error::Configuration(format!(
                    "weight for {} must be within [0, 1], got {}",
                    category, weight
                )));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(Error::Configuration(format!(
                "category weights must sum to 1, got {}",
                sum
            )));
        }
        Ok(())
    }
}

impl FromIterator<(String, f64)> for CategoryWeights {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, f64>> for CategoryWeights {
    fn from(map: BTreeMap<String, f64>) -> Self {
        Self(map)
    }
}

/// Points deducted per record of each severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeductionTable {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl Default for DeductionTable {
    fn default() -> Self {
        Self {
            critical: 15,
            high: 8,
            medium: 4,
            low: 2,
        }
    }
}

impl DeductionTable {
    pub fn deduction(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}

/// Deduction table plus per-category cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringTable {
    pub deductions: DeductionTable,
    pub category_cap: u32,
}

impl Default for ScoringTable {
    fn default() -> Self {
        Self {
            deductions: DeductionTable::default(),
            category_cap: DEFAULT_CATEGORY_CAP,
        }
    }
}

impl ScoringTable {
    /// Score one category from the severities of its records.
    ///
    /// Starts at 100, subtracts the capped total deduction, floors at 0.
    pub fn score<I>(&self, severities: I) -> (f64, u32)
    where
        I: IntoIterator<Item = Severity>,
    {
        let total: u32 = severities
            .into_iter()
            .map(|s| self.deductions.deduction(s))
            .fold(0u32, |acc, d| acc.saturating_add(d));
        let applied = total.min(self.category_cap);
        let score = (100.0 - f64::from(applied)).clamp(0.0, 100.0);
        (score, applied)
    }
}

/// Score of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: String,
    pub weight: f64,
    pub score: f64,
    /// Total deduction actually applied, after the cap.
    pub deduction: u32,
    /// Records that contributed.
    pub records: usize,
}

impl CategoryScore {
    pub fn new(category: &str, weight: f64, score: f64) -> Self {
        Self {
            category: category.to_string(),
            weight,
            score: score.clamp(0.0, 100.0),
            deduction: 0,
            records: 0,
        }
    }
}

/// Weighted sum of category scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    /// Unrounded value in `[0, 100]`.
    pub exact: f64,
    /// `exact` rounded half away from zero.
    pub rounded: u32,
}

impl HealthScore {
    pub fn from_scores(scores: &[CategoryScore]) -> Self {
        let exact = scores
            .iter()
            .map(|s| s.score * s.weight)
            .sum::<f64>()
            .clamp(0.0, 100.0);
        Self {
            exact,
            rounded: exact.round() as u32,
        }
    }
}

impl std::fmt::Display for HealthScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/100", self.rounded)
    }
}
