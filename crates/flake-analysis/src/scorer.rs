//! Flakiness scoring
//!
//! A deterministic pipeline over a test's rolling occurrence window:
//! feature extraction, a weighted composite with ordered adjustments, a
//! confidence estimate, and a coarse recommendation. `now` is an explicit
//! argument so the same inputs always produce the same score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use shared::config::PolicyConfig;
use shared::models::Occurrence;

use crate::clusterer;

/// Composite weights (design constants)
const W_INTERMITTENCY: f64 = 0.30;
const W_RERUN_PASS: f64 = 0.25;
const W_CLUSTERING: f64 = 0.15;
const W_SIGNATURE_VARIANCE: f64 = 0.10;
const W_FAIL_RATIO: f64 = 0.10;

/// Extracted feature vector for one test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlakinessFeatures {
    pub fail_success_ratio: f64,
    pub rerun_pass_rate: f64,
    pub intermittency_score: f64,
    pub failure_clustering: f64,
    pub message_signature_variance: f64,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub total_runs: u32,
    pub recent_failures: u32,
    pub days_since_first_seen: f64,
    pub avg_time_between_failures_hours: Option<f64>,
}

impl FlakinessFeatures {
    /// A long unbroken failure streak means broken, not flaky
    pub fn is_likely_broken(&self) -> bool {
        self.total_runs > 0
            && self.max_consecutive_failures as f64 >= 0.8 * self.total_runs as f64
    }
}

/// Coarse action suggested by the scorer.
///
/// The policy evaluator's decision table is authoritative for plan
/// generation; this recommendation feeds check outputs and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    None,
    Warn,
    Quarantine,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Recommendation::None => "none",
            Recommendation::Warn => "warn",
            Recommendation::Quarantine => "quarantine",
        };
        write!(f, "{}", s)
    }
}

/// Scoring output snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreOutcome {
    pub score: f64,
    pub confidence: f64,
    pub features: FlakinessFeatures,
    pub recommendation: Recommendation,
    pub last_updated_at: DateTime<Utc>,
}

/// Score a test from its ordered occurrences.
///
/// `occurrences` must be in canonical order `(created_at, attempt)`; only
/// the most recent `rolling_window_size` entries are considered.
pub fn score_test(
    occurrences: &[Occurrence],
    now: DateTime<Utc>,
    config: &PolicyConfig,
) -> ScoreOutcome {
    let window_start = occurrences
        .len()
        .saturating_sub(config.rolling_window_size as usize);
    let window = &occurrences[window_start..];

    let features = extract_features(window, now, config);
    let score = composite_score(&features);
    let confidence = confidence(features.total_runs, config.min_runs_for_quarantine);
    let recommendation = recommend(score, &features, config);

    ScoreOutcome {
        score,
        confidence,
        features,
        recommendation,
        last_updated_at: now,
    }
}

/// Extract the feature vector from an occurrence window
pub fn extract_features(
    window: &[Occurrence],
    now: DateTime<Utc>,
    config: &PolicyConfig,
) -> FlakinessFeatures {
    if window.is_empty() {
        return FlakinessFeatures::default();
    }

    let total = window.len() as u32;
    let failing: Vec<&Occurrence> = window.iter().filter(|o| o.status.is_failing()).collect();
    let failed_count = failing.len() as u32;

    let lookback = chrono::Duration::days(config.lookback_days as i64);
    let recent_failures = failing
        .iter()
        .filter(|o| o.created_at > now - lookback)
        .count() as u32;

    let failure_times: Vec<DateTime<Utc>> = failing.iter().map(|o| o.created_at).collect();
    let avg_time_between_failures_hours = if failure_times.len() >= 2 {
        let span = (*failure_times.last().expect("non-empty") - failure_times[0])
            .num_seconds() as f64;
        Some(span / 3600.0 / (failure_times.len() - 1) as f64)
    } else {
        None
    };

    let (consecutive, max_consecutive) = failure_streaks(window);

    FlakinessFeatures {
        fail_success_ratio: failed_count as f64 / total as f64,
        rerun_pass_rate: rerun_pass_rate(window),
        intermittency_score: intermittency(window),
        failure_clustering: clusterer::cluster_feature(&failure_times),
        message_signature_variance: signature_variance(&failing),
        consecutive_failures: consecutive,
        max_consecutive_failures: max_consecutive,
        total_runs: total,
        recent_failures,
        days_since_first_seen: (now - window[0].created_at).num_seconds().max(0) as f64
            / 86_400.0,
        avg_time_between_failures_hours,
    }
}

/// Fraction of retries that passed.
///
/// Within each run, occurrences are taken in ascending attempt order; every
/// attempt beyond the first is a retry, and a passing retry is a success.
fn rerun_pass_rate(window: &[Occurrence]) -> f64 {
    let mut by_run: BTreeMap<&str, Vec<&Occurrence>> = BTreeMap::new();
    for occurrence in window {
        by_run.entry(&occurrence.run_id).or_default().push(occurrence);
    }

    let mut retries = 0u32;
    let mut successful = 0u32;
    for attempts in by_run.values_mut() {
        attempts.sort_by_key(|o| o.attempt);
        for occurrence in attempts.iter().skip(1) {
            retries += 1;
            if occurrence.status == shared::models::OccurrenceStatus::Passed {
                successful += 1;
            }
        }
    }

    if retries == 0 {
        0.0
    } else {
        successful as f64 / retries as f64
    }
}

/// Fraction of comparable consecutive pairs that flip between failing and
/// passing. Skipped occurrences are excluded from the pairing.
fn intermittency(window: &[Occurrence]) -> f64 {
    let comparable: Vec<&Occurrence> = window
        .iter()
        .filter(|o| o.status != shared::models::OccurrenceStatus::Skipped)
        .collect();

    if comparable.len() < 2 {
        return 0.0;
    }

    let transitions = comparable
        .windows(2)
        .filter(|pair| pair[0].status.is_failing() != pair[1].status.is_failing())
        .count();

    transitions as f64 / (comparable.len() - 1) as f64
}

/// Distinct normalized signatures per failure; 0 when nothing failed
fn signature_variance(failing: &[&Occurrence]) -> f64 {
    if failing.is_empty() {
        return 0.0;
    }
    let distinct: std::collections::BTreeSet<&str> = failing
        .iter()
        .filter_map(|o| o.failure_msg_signature.as_deref())
        .collect();
    distinct.len() as f64 / failing.len() as f64
}

/// (trailing streak, longest streak) of failing occurrences; skips neither
/// break nor extend a streak
fn failure_streaks(window: &[Occurrence]) -> (u32, u32) {
    let mut current = 0u32;
    let mut longest = 0u32;
    for occurrence in window {
        if occurrence.status == shared::models::OccurrenceStatus::Skipped {
            continue;
        }
        if occurrence.status.is_failing() {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    (current, longest)
}

/// Weighted composite with ordered adjustments, clamped to [0, 1].
///
/// Every ratio feature is clamped before weighting so an out-of-range input
/// (a negative clustering value, a ratio above 1) cannot push the composite
/// out of bounds.
pub fn composite_score(features: &FlakinessFeatures) -> f64 {
    let clamp01 = |v: f64| v.clamp(0.0, 1.0);

    let mut score = W_INTERMITTENCY * clamp01(features.intermittency_score)
        + W_RERUN_PASS * clamp01(features.rerun_pass_rate)
        + W_CLUSTERING * clamp01(features.failure_clustering)
        + W_SIGNATURE_VARIANCE * clamp01(features.message_signature_variance)
        + W_FAIL_RATIO * clamp01(features.fail_success_ratio);

    let total = features.total_runs as f64;
    if total > 0.0 {
        // 1. A near-unbroken failure streak means broken, not flaky
        if features.max_consecutive_failures as f64 >= 0.8 * total {
            score *= 1.0 - 0.10 * (features.max_consecutive_failures as f64 / total);
        }

        // 2. Retries that pass plus heavy flip-flopping is the classic flake
        if features.rerun_pass_rate > 0.3 && features.intermittency_score > 0.4 {
            score *= 1.2;
        }

        // 3. A fresh failure streak points at a recent regression
        if (features.consecutive_failures as f64) >= (0.6 * total).min(5.0) {
            score *= 0.8;
        }
    }

    score.clamp(0.0, 1.0)
}

/// Confidence saturates once the window covers the quarantine minimum
pub fn confidence(total_runs: u32, min_runs_for_quarantine: u32) -> f64 {
    if min_runs_for_quarantine == 0 {
        return 1.0;
    }
    (total_runs as f64 / min_runs_for_quarantine as f64).min(1.0)
}

fn recommend(score: f64, features: &FlakinessFeatures, config: &PolicyConfig) -> Recommendation {
    if features.total_runs < config.min_runs_for_quarantine {
        return Recommendation::None;
    }

    let enough_recent = features.recent_failures >= config.min_recent_failures;

    // A broken test still needs pulling out of the gate even though the
    // composite is damped by adjustment 1
    if features.is_likely_broken() && enough_recent {
        return Recommendation::Quarantine;
    }

    if score >= 0.5 && enough_recent {
        return Recommendation::Quarantine;
    }

    if score >= config.warn_threshold {
        return Recommendation::Warn;
    }

    Recommendation::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shared::models::OccurrenceStatus;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn occurrence(
        run: usize,
        attempt: i32,
        status: OccurrenceStatus,
        minute: i64,
    ) -> Occurrence {
        Occurrence {
            id: format!("o-{}-{}", run, attempt),
            test_id: "t-1".to_string(),
            run_id: format!("r-{}", run),
            status,
            duration_ms: Some(100),
            failure_msg_signature: status
                .is_failing()
                .then(|| "assertion:abcd1234".to_string()),
            stack_digest: None,
            attempt,
            created_at: base_time() + chrono::Duration::minutes(minute),
        }
    }

    fn config() -> PolicyConfig {
        PolicyConfig::default()
    }

    fn now_for(occurrences: &[Occurrence]) -> DateTime<Utc> {
        occurrences
            .last()
            .map(|o| o.created_at + chrono::Duration::hours(1))
            .unwrap_or_else(base_time)
    }

    #[test]
    fn test_s1_stable_test_scores_zero() {
        let occurrences: Vec<_> = (0..20)
            .map(|i| occurrence(i, 1, OccurrenceStatus::Passed, i as i64 * 60))
            .collect();

        let outcome = score_test(&occurrences, now_for(&occurrences), &config());
        assert!(outcome.score < 0.01, "score was {}", outcome.score);
        assert_eq!(outcome.recommendation, Recommendation::None);
    }

    #[test]
    fn test_s2_alternating_is_fully_intermittent_and_warned() {
        let occurrences: Vec<_> = (0..20)
            .map(|i| {
                let status = if i % 2 == 0 {
                    OccurrenceStatus::Passed
                } else {
                    OccurrenceStatus::Failed
                };
                occurrence(i, 1, status, i as i64 * 60)
            })
            .collect();

        let outcome = score_test(&occurrences, now_for(&occurrences), &config());
        assert_eq!(outcome.features.intermittency_score, 1.0);
        assert!(
            (0.30..=0.45).contains(&outcome.score),
            "score was {}",
            outcome.score
        );
        assert_eq!(outcome.recommendation, Recommendation::Warn);
    }

    #[test]
    fn test_s3_retry_passing_flake_is_quarantined() {
        // 15 runs; every 3rd fails on attempt 1 and passes on attempt 2
        let mut occurrences = Vec::new();
        for run in 0..15 {
            let minute = run as i64 * 60;
            if run % 3 == 2 {
                occurrences.push(occurrence(run, 1, OccurrenceStatus::Failed, minute));
                occurrences.push(occurrence(run, 2, OccurrenceStatus::Passed, minute + 5));
            } else {
                occurrences.push(occurrence(run, 1, OccurrenceStatus::Passed, minute));
            }
        }

        let outcome = score_test(&occurrences, now_for(&occurrences), &config());
        assert_eq!(outcome.features.rerun_pass_rate, 1.0);
        assert!(outcome.score > 0.5, "score was {}", outcome.score);
        assert_eq!(outcome.recommendation, Recommendation::Quarantine);
    }

    #[test]
    fn test_s4_broken_test_scores_below_alternating_but_quarantines() {
        let broken: Vec<_> = (0..20)
            .map(|i| occurrence(i, 1, OccurrenceStatus::Failed, i as i64 * 60))
            .collect();
        let alternating: Vec<_> = (0..20)
            .map(|i| {
                let status = if i % 2 == 0 {
                    OccurrenceStatus::Passed
                } else {
                    OccurrenceStatus::Failed
                };
                occurrence(i, 1, status, i as i64 * 60)
            })
            .collect();

        let broken_outcome = score_test(&broken, now_for(&broken), &config());
        let alternating_outcome = score_test(&alternating, now_for(&alternating), &config());

        assert!(
            broken_outcome.score < alternating_outcome.score,
            "broken {} vs alternating {}",
            broken_outcome.score,
            alternating_outcome.score
        );
        assert!(broken_outcome.features.is_likely_broken());
        assert_eq!(broken_outcome.recommendation, Recommendation::Quarantine);
    }

    #[test]
    fn test_score_is_deterministic() {
        let occurrences: Vec<_> = (0..30)
            .map(|i| {
                let status = if i % 3 == 0 {
                    OccurrenceStatus::Failed
                } else {
                    OccurrenceStatus::Passed
                };
                occurrence(i, 1, status, i as i64 * 37)
            })
            .collect();
        let now = now_for(&occurrences);

        let first = score_test(&occurrences, now, &config());
        let second = score_test(&occurrences, now, &config());
        assert_eq!(first.score.to_bits(), second.score.to_bits());
        assert_eq!(first.confidence.to_bits(), second.confidence.to_bits());
    }

    #[test]
    fn test_out_of_range_features_stay_bounded() {
        let features = FlakinessFeatures {
            fail_success_ratio: 7.5,
            rerun_pass_rate: -3.0,
            intermittency_score: 42.0,
            failure_clustering: -1.0,
            message_signature_variance: 2.0,
            total_runs: 10,
            ..Default::default()
        };
        let score = composite_score(&features);
        assert!((0.0..=1.0).contains(&score), "score was {}", score);
    }

    #[test]
    fn test_classic_flaky_outranks_fully_broken() {
        // ordering monotonicity: rerun>0.5 && intermittency>0.5 beats
        // max_consecutive == total at identical counts
        let classic = FlakinessFeatures {
            fail_success_ratio: 0.5,
            rerun_pass_rate: 0.8,
            intermittency_score: 0.7,
            failure_clustering: 0.2,
            message_signature_variance: 0.1,
            total_runs: 20,
            max_consecutive_failures: 2,
            ..Default::default()
        };
        let broken = FlakinessFeatures {
            fail_success_ratio: 0.5,
            rerun_pass_rate: 0.0,
            intermittency_score: 0.0,
            failure_clustering: 0.2,
            message_signature_variance: 0.1,
            total_runs: 20,
            max_consecutive_failures: 20,
            consecutive_failures: 20,
            ..Default::default()
        };
        assert!(composite_score(&classic) > composite_score(&broken));
    }

    #[test]
    fn test_window_truncation() {
        // 80 occurrences; only the last 50 count
        let occurrences: Vec<_> = (0..80)
            .map(|i| {
                // all failures land in the first 30, outside the window
                let status = if i < 30 {
                    OccurrenceStatus::Failed
                } else {
                    OccurrenceStatus::Passed
                };
                occurrence(i, 1, status, i as i64 * 60)
            })
            .collect();

        let outcome = score_test(&occurrences, now_for(&occurrences), &config());
        assert_eq!(outcome.features.total_runs, 50);
        assert_eq!(outcome.features.fail_success_ratio, 0.0);
    }

    #[test]
    fn test_confidence_saturates() {
        assert_eq!(confidence(0, 5), 0.0);
        assert!((confidence(2, 5) - 0.4).abs() < 1e-9);
        assert_eq!(confidence(5, 5), 1.0);
        assert_eq!(confidence(50, 5), 1.0);
    }

    #[test]
    fn test_too_few_runs_recommends_nothing() {
        let occurrences: Vec<_> = (0..3)
            .map(|i| occurrence(i, 1, OccurrenceStatus::Failed, i as i64))
            .collect();
        let outcome = score_test(&occurrences, now_for(&occurrences), &config());
        assert_eq!(outcome.recommendation, Recommendation::None);
    }

    #[test]
    fn test_stale_failures_are_not_recent() {
        let occurrences: Vec<_> = (0..10)
            .map(|i| occurrence(i, 1, OccurrenceStatus::Failed, i as i64 * 60))
            .collect();
        // thirty days later, nothing in the lookback window
        let now = base_time() + chrono::Duration::days(30);
        let outcome = score_test(&occurrences, now, &config());
        assert_eq!(outcome.features.recent_failures, 0);
        // broken but without recent failures: no quarantine
        assert_ne!(outcome.recommendation, Recommendation::Quarantine);
    }

    #[test]
    fn test_skipped_occurrences_do_not_break_streaks() {
        let occurrences = vec![
            occurrence(0, 1, OccurrenceStatus::Failed, 0),
            occurrence(1, 1, OccurrenceStatus::Skipped, 60),
            occurrence(2, 1, OccurrenceStatus::Failed, 120),
            occurrence(3, 1, OccurrenceStatus::Failed, 180),
        ];
        let features = extract_features(&occurrences, now_for(&occurrences), &config());
        assert_eq!(features.max_consecutive_failures, 3);
        assert_eq!(features.consecutive_failures, 3);
    }

    #[test]
    fn test_signature_variance() {
        let mut occurrences: Vec<_> = (0..4)
            .map(|i| occurrence(i, 1, OccurrenceStatus::Failed, i as i64))
            .collect();
        occurrences[0].failure_msg_signature = Some("timeout:1111".to_string());
        occurrences[1].failure_msg_signature = Some("timeout:1111".to_string());
        occurrences[2].failure_msg_signature = Some("assertion:2222".to_string());
        occurrences[3].failure_msg_signature = Some("assertion:2222".to_string());

        let features = extract_features(&occurrences, now_for(&occurrences), &config());
        assert!((features.message_signature_variance - 0.5).abs() < 1e-9);
    }
}
