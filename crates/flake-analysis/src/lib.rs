//! Flakiness analytics
//!
//! Pure computation over occurrence histories: feature extraction and
//! composite scoring, failure-signature normalization, adaptive temporal
//! clustering, and the quarantine policy evaluator. Everything here is a
//! deterministic function of its inputs; the wall clock is always an
//! explicit argument.

pub mod clusterer;
pub mod policy;
pub mod scorer;

pub use clusterer::{
    cluster_failures, normalize_message, pattern_metrics, signature, FailureCategory,
    PatternMetrics, TemporalCluster,
};
pub use policy::{evaluate_policy, PolicyAction, PolicyDecision, PolicyPriority, RepoOverrides};
pub use scorer::{score_test, FlakinessFeatures, Recommendation, ScoreOutcome};
