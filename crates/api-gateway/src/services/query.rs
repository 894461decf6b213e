//! Query and plan service
//!
//! Read-side composition over the shared stores and the policy evaluator.
//! Everything here is indexed reads; ingestion workers are never blocked.

use anyhow::{Context, Result};
use chrono::Utc;

use flake_analysis::{evaluate_policy, score_test, PolicyAction, RepoOverrides};
use shared::config::PolicyConfig;
use shared::stores::{DecisionStore, OccurrenceStore, ScoreStore, ScoredTest, TestCaseStore};
use shared::DbPool;

use crate::models::{PlanEntry, PolicyDto, QuarantinePlanResponse};

/// Plan candidates fetched per repository before filtering
const PLAN_CANDIDATE_LIMIT: i64 = 200;

pub struct QueryService;

impl QueryService {
    /// Top-k flakiest tests by current score
    pub async fn flakiest_tests(
        pool: &DbPool,
        repo_id: &str,
        limit: i64,
        min_score: f64,
    ) -> Result<Vec<ScoredTest>> {
        ScoreStore::flakiest_with_tests(pool, repo_id, limit, min_score).await
    }

    /// Build a quarantine plan: re-run the policy over each candidate's
    /// recent history, drop tests already under an effective decision, and
    /// order by priority then score.
    pub async fn quarantine_plan(
        pool: &DbPool,
        repo_id: &str,
        defaults: &PolicyConfig,
        overrides: Option<&PolicyDto>,
        lookback_days: u32,
        include_annotations: bool,
    ) -> Result<QuarantinePlanResponse> {
        let policy = merge_policy(defaults, overrides, lookback_days);
        let repo_overrides = RepoOverrides::default();
        let now = Utc::now();

        let candidates = ScoreStore::flakiest_with_tests(
            pool,
            repo_id,
            PLAN_CANDIDATE_LIMIT,
            policy.warn_threshold,
        )
        .await
        .context("Failed to fetch plan candidates")?;

        let mut entries = Vec::new();
        for candidate in candidates {
            // tests already quarantined need no new proposal
            if DecisionStore::active_for_test(pool, &candidate.test_id)
                .await?
                .is_some()
            {
                continue;
            }

            let window = OccurrenceStore::window_for_test(
                pool,
                &candidate.test_id,
                policy.rolling_window_size as i64,
            )
            .await?;

            let outcome = score_test(&window, now, &policy);
            let test = TestCaseStore::find_by_id(pool, &candidate.test_id).await?;
            let file = test.as_ref().and_then(|t| t.file.clone());
            let decision = evaluate_policy(&outcome, file.as_deref(), &policy, &repo_overrides);

            if decision.action == PolicyAction::None {
                continue;
            }

            let annotation = include_annotations.then(|| {
                format!(
                    "flakeguard: {} suggested for {} ({})",
                    decision.action, candidate.name, decision.rationale
                )
            });

            entries.push(PlanEntry {
                test_id: candidate.test_id,
                suite: candidate.suite,
                class_name: candidate.class_name,
                name: candidate.name,
                score: outcome.score,
                confidence: outcome.confidence,
                action: decision.action,
                priority: decision.priority,
                rationale: decision.rationale,
                annotation,
            });
        }

        // priority first, then score, both descending
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
        });

        Ok(QuarantinePlanResponse {
            repository_id: repo_id.to_string(),
            generated_at: now,
            lookback_days,
            entries,
        })
    }

    /// Tests eligible for quarantine with no effective ACTIVE decision
    pub async fn quarantine_candidates(
        pool: &DbPool,
        repo_id: &str,
        score_threshold: f64,
        min_runs: i32,
    ) -> Result<Vec<(String, f64)>> {
        DecisionStore::candidates(pool, repo_id, score_threshold, min_runs).await
    }
}

/// Layer request overrides over the configured defaults
fn merge_policy(
    defaults: &PolicyConfig,
    overrides: Option<&PolicyDto>,
    lookback_days: u32,
) -> PolicyConfig {
    let mut policy = *defaults;
    policy.lookback_days = lookback_days;

    if let Some(dto) = overrides {
        if let Some(v) = dto.warn_threshold {
            policy.warn_threshold = v;
        }
        if let Some(v) = dto.quarantine_threshold {
            policy.quarantine_threshold = v;
        }
        if let Some(v) = dto.min_runs_for_quarantine {
            policy.min_runs_for_quarantine = v;
        }
        if let Some(v) = dto.min_recent_failures {
            policy.min_recent_failures = v;
        }
        if let Some(v) = dto.lookback_days {
            policy.lookback_days = v;
        }
        if let Some(v) = dto.rolling_window_size {
            policy.rolling_window_size = v;
        }
    }

    policy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_policy_prefers_overrides() {
        let defaults = PolicyConfig::default();
        let dto = PolicyDto {
            warn_threshold: Some(0.2),
            quarantine_threshold: None,
            min_runs_for_quarantine: Some(8),
            min_recent_failures: None,
            lookback_days: None,
            rolling_window_size: None,
        };

        let merged = merge_policy(&defaults, Some(&dto), 14);
        assert_eq!(merged.warn_threshold, 0.2);
        assert_eq!(merged.quarantine_threshold, defaults.quarantine_threshold);
        assert_eq!(merged.min_runs_for_quarantine, 8);
        assert_eq!(merged.lookback_days, 14);
    }

    #[test]
    fn test_merge_policy_request_lookback_wins_over_arg() {
        let defaults = PolicyConfig::default();
        let dto = PolicyDto {
            warn_threshold: None,
            quarantine_threshold: None,
            min_runs_for_quarantine: None,
            min_recent_failures: None,
            lookback_days: Some(30),
            rolling_window_size: None,
        };
        let merged = merge_policy(&defaults, Some(&dto), 14);
        assert_eq!(merged.lookback_days, 30);
    }
}
