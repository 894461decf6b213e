//! Quarantine policy evaluation
//!
//! Maps a score snapshot to {none, warn, quarantine} through the decision
//! table, with repo-level YAML overrides layered on top of the configured
//! defaults. The emitted rationale is human-readable; it is what lands in
//! check outputs and chat notifications.

use serde::{Deserialize, Serialize};
use std::fmt;

use shared::config::PolicyConfig;

use crate::scorer::{FlakinessFeatures, ScoreOutcome};

/// Action chosen by the decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    None,
    Warn,
    Quarantine,
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyAction::None => "none",
            PolicyAction::Warn => "warn",
            PolicyAction::Quarantine => "quarantine",
        };
        write!(f, "{}", s)
    }
}

/// Priority band mapped from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl PolicyPriority {
    /// Score bands: >= 0.8 critical, >= 0.6 high, >= 0.4 medium, else low
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            PolicyPriority::Critical
        } else if score >= 0.6 {
            PolicyPriority::High
        } else if score >= 0.4 {
            PolicyPriority::Medium
        } else {
            PolicyPriority::Low
        }
    }
}

impl fmt::Display for PolicyPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyPriority::Low => "low",
            PolicyPriority::Medium => "medium",
            PolicyPriority::High => "high",
            PolicyPriority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Repo-level overrides, loaded from a `.flakeguard.yml` in the repository
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoOverrides {
    /// Replaces the quarantine threshold
    pub flaky_threshold: Option<f64>,
    /// Replaces the minimum run count
    pub min_occurrences: Option<u32>,
    /// Tests whose file path matches any pattern are never actioned
    pub exclude_paths: Option<Vec<String>>,
    /// Labels an upstream must attach before enforcement
    pub labels_required: Option<Vec<String>>,
}

impl RepoOverrides {
    /// Parse overrides from repository YAML
    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let overrides = serde_yaml::from_str(raw)?;
        Ok(overrides)
    }

    fn excludes(&self, file: Option<&str>) -> bool {
        let (Some(patterns), Some(file)) = (self.exclude_paths.as_ref(), file) else {
            return false;
        };
        patterns.iter().any(|p| wildcard_match(p, file))
    }
}

/// Decision output with its rationale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub priority: PolicyPriority,
    pub rationale: String,
}

/// Run the decision table over a score snapshot.
///
/// | condition | action |
/// |---|---|
/// | too few runs, or path excluded | none |
/// | score >= quarantine threshold and enough recent failures | quarantine |
/// | score >= warn threshold | warn |
/// | otherwise | none |
pub fn evaluate_policy(
    outcome: &ScoreOutcome,
    test_file: Option<&str>,
    policy: &PolicyConfig,
    overrides: &RepoOverrides,
) -> PolicyDecision {
    let quarantine_threshold = overrides
        .flaky_threshold
        .unwrap_or(policy.quarantine_threshold);
    let min_runs = overrides
        .min_occurrences
        .unwrap_or(policy.min_runs_for_quarantine);

    let features = &outcome.features;
    let priority = PolicyPriority::from_score(outcome.score);

    if features.total_runs < min_runs {
        return PolicyDecision {
            action: PolicyAction::None,
            priority,
            rationale: format!(
                "only {} of {} runs required for a decision",
                features.total_runs, min_runs
            ),
        };
    }

    if overrides.excludes(test_file) {
        return PolicyDecision {
            action: PolicyAction::None,
            priority,
            rationale: "path excluded by repository policy".to_string(),
        };
    }

    let action = if outcome.score >= quarantine_threshold
        && features.recent_failures >= policy.min_recent_failures
    {
        PolicyAction::Quarantine
    } else if outcome.score >= policy.warn_threshold {
        PolicyAction::Warn
    } else {
        PolicyAction::None
    };

    PolicyDecision {
        action,
        priority,
        rationale: rationale(outcome.score, features),
    }
}

/// Dominant features rendered with human-readable percentages
fn rationale(score: f64, features: &FlakinessFeatures) -> String {
    let mut parts = vec![format!("flakiness score {:.0}%", score * 100.0)];

    if features.intermittency_score >= 0.3 {
        parts.push(format!(
            "pass/fail flip rate {:.0}%",
            features.intermittency_score * 100.0
        ));
    }
    if features.rerun_pass_rate > 0.0 {
        parts.push(format!(
            "retries pass {:.0}% of the time",
            features.rerun_pass_rate * 100.0
        ));
    }
    if features.fail_success_ratio >= 0.2 {
        parts.push(format!(
            "fails {:.0}% of runs",
            features.fail_success_ratio * 100.0
        ));
    }
    if features.failure_clustering >= 0.3 {
        parts.push(format!(
            "failures cluster in bursts ({:.0}%)",
            features.failure_clustering * 100.0
        ));
    }
    if features.recent_failures > 0 {
        parts.push(format!(
            "{} failures in the lookback window",
            features.recent_failures
        ));
    }
    if features.is_likely_broken() {
        parts.push(format!(
            "likely broken ({} consecutive failures)",
            features.max_consecutive_failures
        ));
    }

    parts.join("; ")
}

/// Minimal `*` wildcard matching for exclude patterns
fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return value == pattern || value.starts_with(&format!("{}/", pattern));
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut position = 0usize;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        match value[position..].find(segment) {
            Some(found) => {
                // a leading literal must anchor at the start
                if i == 0 && found != 0 {
                    return false;
                }
                position += found + segment.len();
            }
            None => return false,
        }
    }
    // a trailing literal must anchor at the end
    if let Some(last) = segments.last() {
        if !last.is_empty() && !value.ends_with(last) {
            return false;
        }
    }
    true
}
