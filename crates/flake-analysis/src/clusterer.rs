//! Failure clustering
//!
//! Two views of "the same failure": a normalized message signature that
//! collapses paths, addresses and ids, and adaptive temporal clusters over
//! the failure timeline whose shape feeds the scorer's clustering feature.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

lazy_static! {
    // Substitution order matters: timestamps and hex literals must be
    // rewritten before the generic number pass eats their digits.
    static ref RE_TIMESTAMP: Regex = Regex::new(
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?|\b\d{2}:\d{2}:\d{2}\b"
    )
    .expect("valid timestamp regex");
    static ref RE_HEX: Regex = Regex::new(r"0[xX][0-9a-fA-F]+").expect("valid hex regex");
    static ref RE_PATH: Regex = Regex::new(
        r"(?:[A-Za-z]:)?(?:[\\/][\w.$@+\-]+){2,}"
    )
    .expect("valid path regex");
    static ref RE_LINE: Regex = Regex::new(r"(?i)\bline\s+\d+").expect("valid line regex");
    static ref RE_NUMBER: Regex = Regex::new(r"\b\d+\b").expect("valid number regex");
    static ref RE_WHITESPACE: Regex = Regex::new(r"\s+").expect("valid whitespace regex");
}

/// Root-cause bucket keyed off the normalized message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    Timeout,
    Assertion,
    Connection,
    Resource,
    Unknown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::Assertion => "assertion",
            FailureCategory::Connection => "connection",
            FailureCategory::Resource => "resource",
            FailureCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl FailureCategory {
    fn classify(normalized: &str) -> Self {
        if normalized.contains("timeout")
            || normalized.contains("timed out")
            || normalized.contains("deadline exceeded")
        {
            FailureCategory::Timeout
        } else if normalized.contains("assert")
            || normalized.contains("expected")
            || normalized.contains("tobe(")
            || normalized.contains("should be")
        {
            FailureCategory::Assertion
        } else if normalized.contains("connection")
            || normalized.contains("econnrefused")
            || normalized.contains("refused")
            || normalized.contains("socket")
            || normalized.contains("network")
            || normalized.contains("dns")
        {
            FailureCategory::Connection
        } else if normalized.contains("memory")
            || normalized.contains("oom")
            || normalized.contains("disk")
            || normalized.contains("no space")
            || normalized.contains("resource")
            || normalized.contains("quota")
            || normalized.contains("too many open files")
        {
            FailureCategory::Resource
        } else {
            FailureCategory::Unknown
        }
    }
}

/// Strip volatile fragments from a failure message and classify it
pub fn normalize_message(raw: &str) -> (FailureCategory, String) {
    let text = RE_TIMESTAMP.replace_all(raw, "<ts>");
    let text = RE_HEX.replace_all(&text, "<hex>");
    let text = RE_PATH.replace_all(&text, "<path>");
    let text = RE_LINE.replace_all(&text, "line #");
    let text = RE_NUMBER.replace_all(&text, "#");
    let text = text.to_lowercase();
    let text = RE_WHITESPACE.replace_all(&text, " ");
    let normalized = text.trim().to_string();

    let category = FailureCategory::classify(&normalized);
    (category, normalized)
}

/// Stable signature for a raw failure message:
/// `{category}:{first 16 hex chars of sha256(normalized)}`
pub fn signature(raw: &str) -> String {
    let (category, normalized) = normalize_message(raw);
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{}:{}", category, &hex::encode(digest)[..16])
}

/// One adaptive temporal cluster of failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalCluster {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub members: usize,
    /// members / max(1, duration in minutes)
    pub density: f64,
    pub avg_gap_minutes: f64,
}

/// Pattern metrics over the cluster set
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PatternMetrics {
    pub burstiness: f64,
    pub periodicity: f64,
    pub randomness: f64,
}

/// Default split threshold when the gap distribution is degenerate
const DEFAULT_THRESHOLD_MIN: f64 = 120.0;

/// Floor for the adaptive threshold
const MIN_THRESHOLD_MIN: f64 = 30.0;

/// Group failure timestamps into temporal clusters.
///
/// The split threshold adapts to the gap distribution
/// (`max(30 min, Q3 + 1.5 * IQR)`); clusters with fewer than two members are
/// discarded as isolated failures.
pub fn cluster_failures(times: &[DateTime<Utc>]) -> Vec<TemporalCluster> {
    if times.len() < 2 {
        return Vec::new();
    }

    let mut sorted = times.to_vec();
    sorted.sort();

    let gaps: Vec<f64> = sorted
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds() as f64 / 60.0)
        .collect();

    let threshold = adaptive_threshold(&gaps);

    let mut clusters = Vec::new();
    let mut current: Vec<DateTime<Utc>> = vec![sorted[0]];
    for (i, gap) in gaps.iter().enumerate() {
        if *gap > threshold {
            push_cluster(&mut clusters, &current);
            current.clear();
        }
        current.push(sorted[i + 1]);
    }
    push_cluster(&mut clusters, &current);

    clusters
}

fn adaptive_threshold(gaps: &[f64]) -> f64 {
    if gaps.is_empty() {
        return DEFAULT_THRESHOLD_MIN;
    }
    let mut sorted = gaps.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("gaps are finite"));

    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    (q3 + 1.5 * iqr).max(MIN_THRESHOLD_MIN)
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = pos - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

fn push_cluster(clusters: &mut Vec<TemporalCluster>, members: &[DateTime<Utc>]) {
    if members.len() < 2 {
        return;
    }
    let start = members[0];
    let end = *members.last().expect("members is non-empty");
    let duration_min = (end - start).num_seconds() as f64 / 60.0;
    let gaps: Vec<f64> = members
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds() as f64 / 60.0)
        .collect();

    clusters.push(TemporalCluster {
        start,
        end,
        members: members.len(),
        density: members.len() as f64 / duration_min.max(1.0),
        avg_gap_minutes: gaps.iter().sum::<f64>() / gaps.len() as f64,
    });
}

/// Burstiness, periodicity and randomness over the cluster set
pub fn pattern_metrics(clusters: &[TemporalCluster]) -> PatternMetrics {
    if clusters.is_empty() {
        return PatternMetrics {
            burstiness: 0.0,
            periodicity: 0.0,
            randomness: 1.0,
        };
    }

    let densities: Vec<f64> = clusters.iter().map(|c| c.density).collect();
    let burstiness = coefficient_of_variation(&densities).clamp(0.0, 1.0);

    let periodicity = if clusters.len() < 3 {
        0.0
    } else {
        let centers: Vec<f64> = clusters
            .iter()
            .map(|c| {
                let mid = c.start + (c.end - c.start) / 2;
                mid.timestamp() as f64 / 60.0
            })
            .collect();
        let intervals: Vec<f64> = centers.windows(2).map(|w| w[1] - w[0]).collect();
        (1.0 - coefficient_of_variation(&intervals)).clamp(0.0, 1.0)
    };

    let sizes: Vec<f64> = clusters.iter().map(|c| c.members as f64).collect();
    let randomness = (1.0 - coefficient_of_variation(&sizes)).clamp(0.0, 1.0);

    PatternMetrics {
        burstiness,
        periodicity,
        randomness,
    }
}

/// The `failureClustering` feature consumed by the scorer:
/// burstiness blended with saturated mean density, bounded to [0, 1].
pub fn cluster_feature(times: &[DateTime<Utc>]) -> f64 {
    let clusters = cluster_failures(times);
    if clusters.is_empty() {
        return 0.0;
    }
    let metrics = pattern_metrics(&clusters);
    let mean_density =
        clusters.iter().map(|c| c.density).sum::<f64>() / clusters.len() as f64;
    let saturation = mean_density / (mean_density + 1.0);
    (0.5 * metrics.burstiness + 0.5 * saturation).clamp(0.0, 1.0)
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean.abs() < f64::EPSILON {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minute)
    }

    #[test]
    fn test_normalize_strips_paths_lines_and_ids() {
        let (_, normalized) = normalize_message(
            "AssertionError at /home/ci/project/src/widget_test.py line 42: expected 5 got 7",
        );
        assert!(!normalized.contains("/home"));
        assert!(!normalized.contains("42"));
        assert!(normalized.contains("<path>"));
        assert!(normalized.contains("line #"));
        assert!(normalized.contains("expected # got #"));
    }

    #[test]
    fn test_normalize_strips_hex_and_timestamps() {
        let (_, normalized) =
            normalize_message("segfault at 0xDEADBEEF on 2024-03-01T10:15:30Z worker 3");
        assert!(normalized.contains("<hex>"));
        assert!(normalized.contains("<ts>"));
        assert!(!normalized.contains("deadbeef"));
    }

    #[test]
    fn test_category_classification() {
        assert_eq!(
            normalize_message("Operation timed out after 30000ms").0,
            FailureCategory::Timeout
        );
        assert_eq!(
            normalize_message("expected true to equal false").0,
            FailureCategory::Assertion
        );
        assert_eq!(
            normalize_message("ECONNREFUSED 127.0.0.1:5432").0,
            FailureCategory::Connection
        );
        assert_eq!(
            normalize_message("java.lang.OutOfMemoryError: heap").0,
            FailureCategory::Resource
        );
        assert_eq!(
            normalize_message("something inexplicable").0,
            FailureCategory::Unknown
        );
    }

    #[test]
    fn test_signature_is_stable_across_volatile_fragments() {
        let a = signature("failed at /tmp/build-1234/test.rs line 10: expected 1 got 2");
        let b = signature("failed at /tmp/build-9876/test.rs line 99: expected 3 got 4");
        assert_eq!(a, b);
        assert!(a.starts_with("assertion:"));
    }

    #[test]
    fn test_signature_differs_for_different_failures() {
        let a = signature("expected blue got red");
        let b = signature("connection refused by host");
        assert_ne!(a, b);
    }

    #[test]
    fn test_evenly_spaced_failures_form_one_cluster() {
        // equal gaps: threshold = Q3 + 1.5*IQR = gap, nothing exceeds it
        let times: Vec<_> = (0..10).map(|i| at(i * 60)).collect();
        let clusters = cluster_failures(&times);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, 10);
    }

    #[test]
    fn test_bursts_split_into_clusters() {
        // two tight bursts a day apart
        let mut times: Vec<_> = (0..5).map(at).collect();
        times.extend((0..5).map(|i| at(24 * 60 + i)));
        let clusters = cluster_failures(&times);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, 5);
        assert_eq!(clusters[1].members, 5);
        assert!(clusters[0].density > 1.0);
    }

    #[test]
    fn test_isolated_failures_are_discarded() {
        // one burst plus a stray failure a week later
        let mut times: Vec<_> = (0..4).map(at).collect();
        times.push(at(7 * 24 * 60));
        let clusters = cluster_failures(&times);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, 4);
    }

    #[test]
    fn test_fewer_than_two_failures_never_cluster() {
        assert!(cluster_failures(&[]).is_empty());
        assert!(cluster_failures(&[at(0)]).is_empty());
    }

    #[test]
    fn test_pattern_metrics_defaults_with_no_clusters() {
        let metrics = pattern_metrics(&[]);
        assert_eq!(metrics.burstiness, 0.0);
        assert_eq!(metrics.periodicity, 0.0);
        assert_eq!(metrics.randomness, 1.0);
    }

    #[test]
    fn test_periodicity_requires_three_clusters() {
        let mut times: Vec<_> = (0..3).map(at).collect();
        times.extend((0..3).map(|i| at(24 * 60 + i)));
        let clusters = cluster_failures(&times);
        assert_eq!(clusters.len(), 2);
        assert_eq!(pattern_metrics(&clusters).periodicity, 0.0);
    }

    #[test]
    fn test_periodic_bursts_score_high_periodicity() {
        // bursts of 6 keep the inter-burst gaps in the outlier fence
        let mut times = Vec::new();
        for day in 0..4 {
            for i in 0..6 {
                times.push(at(day * 24 * 60 + i));
            }
        }
        let clusters = cluster_failures(&times);
        assert_eq!(clusters.len(), 4);
        let metrics = pattern_metrics(&clusters);
        assert!(metrics.periodicity > 0.9, "was {}", metrics.periodicity);
        // equal-size clusters: high randomness score means low size variance
        assert!(metrics.randomness > 0.9);
    }

    #[test]
    fn test_cluster_feature_bounded() {
        let times: Vec<_> = (0..50).map(|i| at(i / 3)).collect();
        let feature = cluster_feature(&times);
        assert!((0.0..=1.0).contains(&feature));
    }

    #[test]
    fn test_cluster_feature_zero_without_clusters() {
        assert_eq!(cluster_feature(&[at(0)]), 0.0);
    }

    #[test]
    fn test_quantile_interpolation() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&sorted, 0.0), 1.0);
        assert_eq!(quantile(&sorted, 1.0), 4.0);
        assert!((quantile(&sorted, 0.5) - 2.5).abs() < 1e-9);
    }
}
