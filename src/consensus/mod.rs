//! Consensus layer: normalize analyzer findings, then group, vote, score
//! and rank them into a [`Report`].

pub mod aggregator;
pub mod finding;
pub mod normalizer;
pub mod scoring;

pub use aggregator::{
    Confidence, ConsensusAggregator, ConsensusRecord, DetectionContext, ExcludedFinding, Priority,
    Report,
};
pub use finding::{Certainty, Finding, RawFinding, Severity};
pub use normalizer::{
    parse_certainty, NormalizationWarning, NormalizedBatch, Normalizer, SeverityScale,
    DEFAULT_CATEGORY,
};
pub use scoring::{
    CategoryScore, CategoryWeights, DeductionTable, HealthScore, ScoringTable,
    DEFAULT_CATEGORY_CAP, WEIGHT_TOLERANCE,
};
