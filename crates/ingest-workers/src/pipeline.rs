//! Artifact ingestion pipeline
//!
//! For one completed workflow run: list artifacts, filter to plausible test
//! reports, then with bounded concurrency download → extract → parse →
//! persist each one. A failing artifact never cancels its siblings; the job
//! fails only when nothing produced records. Afterwards every touched test
//! is re-scored, its failures folded into signature clusters, and the
//! policy evaluated.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use flake_analysis::{evaluate_policy, PolicyAction, RepoOverrides};
use junit_parser::{Dialect, TestSuites};
use shared::jobs::{ArtifactProcessJob, JobPayload};
use shared::models::{FlakeScore, OccurrenceStatus, QuarantineState};
use shared::queue::JobEnvelope;
use shared::stores::occurrences::NewOccurrence;
use shared::stores::queue_jobs::JobProgress;
use shared::stores::{
    ClusterStore, DecisionStore, OccurrenceStore, QueueJobStore, ScoreStore, TestCaseKey,
    TestCaseStore,
};
use shared::{Error, Result};

use crate::context::WorkerContext;
use crate::extract;

/// Per-file ingestion failure, attached to the job result
#[derive(Debug, Clone, Serialize)]
pub struct FileError {
    pub file: String,
    pub error: String,
}

/// Job return value surfaced through the queue record
#[derive(Debug, Default, Serialize)]
pub struct IngestionResult {
    pub processed_artifacts: usize,
    pub total_tests: usize,
    pub total_failures: usize,
    pub total_errors: usize,
    pub processing_time_ms: u64,
    pub errors: Vec<FileError>,
    pub warnings: Vec<String>,
}

/// Outcome of one artifact
struct ArtifactOutcome {
    tests: usize,
    failures: usize,
    errors: usize,
    touched_tests: BTreeSet<String>,
    file_errors: Vec<FileError>,
}

/// Run the ingestion pipeline for an artifact-process job
pub async fn process(ctx: &Arc<WorkerContext>, env: &JobEnvelope) -> Result<serde_json::Value> {
    let JobPayload::ArtifactProcess(job) = serde_json::from_value(env.payload.clone())? else {
        return Err(Error::queue("artifact-process job carried a foreign payload"));
    };

    let started = Instant::now();
    let run = resolve_run(ctx, &job).await?;

    // Per-job scratch space; the TempDir guard removes it on every exit path
    let temp_dir = tempfile::TempDir::new()
        .map_err(|e| Error::internal(format!("Failed to create temp dir: {}", e)))?;

    let artifacts = ctx
        .github
        .list_run_artifacts(&job.owner, &job.repo, job.run_id, job.installation_id)
        .await?;

    let ingestion = &ctx.config.ingestion;
    let mut warnings = Vec::new();
    let eligible: Vec<_> = artifacts
        .into_iter()
        .filter(|artifact| {
            if artifact.expired {
                warnings.push(format!("artifact {} already expired", artifact.name));
                return false;
            }
            if !extract::artifact_name_matches(&artifact.name) {
                return false;
            }
            if artifact.size_bytes > ingestion.artifact_max_size_bytes {
                warnings.push(format!(
                    "artifact {} over size cap ({} bytes)",
                    artifact.name, artifact.size_bytes
                ));
                return false;
            }
            artifact.size_bytes >= ingestion.artifact_min_size_bytes
        })
        .collect();

    report_progress(ctx, &env.id, "listing", 0, eligible.len(), None).await;

    let expected_dialect = job
        .expected_format
        .as_deref()
        .and_then(|f| f.parse::<Dialect>().ok());

    // Bounded fan-out; one artifact's failure leaves the rest running
    let outcomes: Vec<(String, Result<ArtifactOutcome>)> = stream::iter(eligible.clone())
        .map(|artifact| {
            let ctx = ctx.clone();
            let job = job.clone();
            let run_row_id = run.clone();
            let temp_root = temp_dir.path().to_path_buf();
            async move {
                let name = artifact.name.clone();
                let outcome = process_artifact(
                    &ctx,
                    &job,
                    &run_row_id,
                    artifact.id,
                    &name,
                    expected_dialect,
                    &temp_root,
                )
                .await;
                (name, outcome)
            }
        })
        .buffer_unordered(ingestion.artifact_parallelism.max(1))
        .collect()
        .await;

    let mut result = IngestionResult {
        warnings,
        ..Default::default()
    };
    let mut touched = BTreeSet::new();
    let mut retryable_failure = false;

    for (index, (name, outcome)) in outcomes.iter().enumerate() {
        report_progress(
            ctx,
            &env.id,
            "processing",
            index + 1,
            eligible.len(),
            Some(name),
        )
        .await;

        match outcome {
            Ok(artifact_outcome) => {
                result.processed_artifacts += 1;
                result.total_tests += artifact_outcome.tests;
                result.total_failures += artifact_outcome.failures;
                result.total_errors += artifact_outcome.errors;
                result
                    .errors
                    .extend(artifact_outcome.file_errors.iter().cloned());
                touched.extend(artifact_outcome.touched_tests.iter().cloned());
                metrics::counter!("artifacts_processed_total", "status" => "ok").increment(1);
            }
            Err(e) => {
                retryable_failure |= e.is_retryable();
                result.errors.push(FileError {
                    file: name.clone(),
                    error: e.to_string(),
                });
                metrics::counter!("artifacts_processed_total", "status" => "failed")
                    .increment(1);
                tracing::warn!(artifact = %name, error = %e, "Artifact failed, continuing siblings");
            }
        }
    }

    // The job itself fails only when every artifact came up empty
    if !eligible.is_empty() && result.processed_artifacts == 0 {
        let summary = format!(
            "all {} artifacts failed: {}",
            eligible.len(),
            result
                .errors
                .first()
                .map(|e| e.error.clone())
                .unwrap_or_default()
        );
        return Err(if retryable_failure {
            Error::network(summary)
        } else {
            Error::internal(summary)
        });
    }

    report_progress(ctx, &env.id, "post-processing", 0, touched.len(), None).await;
    postprocess_tests(ctx, &job.repository_id, &touched).await?;

    result.processing_time_ms = started.elapsed().as_millis() as u64;
    metrics::histogram!("ingestion_duration_seconds").record(started.elapsed().as_secs_f64());
    report_progress(ctx, &env.id, "done", eligible.len(), eligible.len(), None).await;

    tracing::info!(
        run_id = job.run_id,
        artifacts = result.processed_artifacts,
        tests = result.total_tests,
        failures = result.total_failures,
        duration_ms = result.processing_time_ms,
        "Ingestion complete"
    );

    Ok(serde_json::to_value(&result)?)
}

/// Ensure the workflow run row exists and return its id
async fn resolve_run(ctx: &Arc<WorkerContext>, job: &ArtifactProcessJob) -> Result<String> {
    use shared::models::RunStatus;
    use shared::stores::RunStore;

    if let Some(run) =
        RunStore::find_by_external_id(&ctx.pool, &job.repository_id, job.run_id)
            .await
            .map_err(|e| Error::internal(e.to_string()))?
    {
        return Ok(run.id);
    }

    // Polling can race the webhook here; the upsert converges both paths
    let run = RunStore::upsert(
        &ctx.pool,
        &job.repository_id,
        job.run_id,
        RunStatus::Completed,
        Some("unknown"),
    )
    .await
    .map_err(|e| Error::internal(e.to_string()))?;
    Ok(run.id)
}

#[allow(clippy::too_many_arguments)]
async fn process_artifact(
    ctx: &Arc<WorkerContext>,
    job: &ArtifactProcessJob,
    run_row_id: &str,
    artifact_id: i64,
    artifact_name: &str,
    expected_dialect: Option<Dialect>,
    temp_root: &Path,
) -> Result<ArtifactOutcome> {
    let archive_path = download_with_retry(ctx, job, artifact_id, temp_root).await?;

    let ingestion = &ctx.config.ingestion;
    let reports: Vec<PathBuf> = if extract::is_zip(&archive_path).await? {
        let entry_dir = temp_root.join(format!("artifact-{}-entries", artifact_id));
        tokio::fs::create_dir_all(&entry_dir)
            .await
            .map_err(|e| Error::internal(format!("Failed to create entry dir: {}", e)))?;
        extract::extract_xml_files(
            &archive_path,
            &entry_dir,
            ingestion.artifact_min_size_bytes,
            ingestion.artifact_max_size_bytes,
        )
        .await?
        .into_iter()
        .map(|f| f.path)
        .collect()
    } else {
        // a bare XML upload is used as-is
        vec![archive_path.clone()]
    };

    let mut outcome = ArtifactOutcome {
        tests: 0,
        failures: 0,
        errors: 0,
        touched_tests: BTreeSet::new(),
        file_errors: Vec::new(),
    };

    for report in &reports {
        match parse_report(report, expected_dialect, ingestion.artifact_max_size_bytes).await {
            Ok(tree) => {
                let persisted = persist_tree(ctx, job, run_row_id, &tree).await?;
                outcome.tests += tree.totals.tests as usize;
                outcome.failures += tree.totals.failures as usize;
                outcome.errors += tree.totals.errors as usize;
                outcome.touched_tests.extend(persisted);
            }
            Err(e) => {
                metrics::counter!("junit_parse_failures_total").increment(1);
                outcome.file_errors.push(FileError {
                    file: report.display().to_string(),
                    error: e.to_string(),
                });
                tracing::warn!(
                    artifact = artifact_name,
                    report = %report.display(),
                    error = %e,
                    "Report failed to parse, continuing"
                );
            }
        }
    }

    Ok(outcome)
}

/// Download with an independent retry budget; the short-lived URL is
/// re-resolved on every attempt because it expires.
async fn download_with_retry(
    ctx: &Arc<WorkerContext>,
    job: &ArtifactProcessJob,
    artifact_id: i64,
    temp_root: &Path,
) -> Result<PathBuf> {
    let max_attempts = ctx.config.ingestion.download_max_retries.max(1);
    let timeout = ctx.config.timeouts.artifact_download();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let download = ctx.github.download_artifact_zip(
            &job.owner,
            &job.repo,
            artifact_id,
            job.installation_id,
            temp_root,
        );

        let result = match tokio::time::timeout(timeout, download).await {
            Ok(result) => result,
            Err(_) => Err(Error::network(format!(
                "artifact {} download timed out",
                artifact_id
            ))),
        };

        match result {
            Ok(path) => return Ok(path),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let base_ms = 1_000u64 << (attempt - 1).min(8);
                let jitter = rand::thread_rng().gen_range(0.9..=1.1);
                let delay =
                    std::time::Duration::from_millis((base_ms as f64 * jitter) as u64);
                tracing::warn!(
                    artifact_id = artifact_id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying artifact download"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn parse_report(
    path: &Path,
    expected: Option<Dialect>,
    max_bytes: u64,
) -> Result<TestSuites> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)
            .map_err(|e| Error::internal(format!("Failed to open report: {}", e)))?;
        let reader = std::io::BufReader::new(file);
        junit_parser::parse_reader(reader, expected, max_bytes)
            .map_err(|e| Error::parse(e.to_string()))
    })
    .await
    .map_err(|e| Error::internal(format!("Parse task failed: {}", e)))?
}

/// Upsert test cases and insert occurrences for one parsed tree.
/// Returns the set of touched test ids.
async fn persist_tree(
    ctx: &Arc<WorkerContext>,
    job: &ArtifactProcessJob,
    run_row_id: &str,
    tree: &TestSuites,
) -> Result<BTreeSet<String>> {
    let mut rows = Vec::new();
    let mut touched = BTreeSet::new();
    // repeated (suite, class, name) entries in one report are retry attempts
    let mut attempt_counters: BTreeMap<(String, Option<String>, String), i32> = BTreeMap::new();

    for suite in &tree.suites {
        let observed_at = suite.timestamp.unwrap_or_else(Utc::now);

        for case in &suite.cases {
            let key = TestCaseKey {
                suite: case.suite.clone(),
                class_name: case.class_name.clone(),
                name: case.name.clone(),
            };
            let test = TestCaseStore::upsert(&ctx.pool, &job.repository_id, &key, case.file.as_deref())
                .await
                .map_err(|e| Error::internal(e.to_string()))?;

            let counter = attempt_counters
                .entry((case.suite.clone(), case.class_name.clone(), case.name.clone()))
                .or_insert(0);
            *counter += 1;

            let status = match case.status {
                junit_parser::CaseStatus::Passed => OccurrenceStatus::Passed,
                junit_parser::CaseStatus::Failed => OccurrenceStatus::Failed,
                junit_parser::CaseStatus::Skipped => OccurrenceStatus::Skipped,
                junit_parser::CaseStatus::Error => OccurrenceStatus::Error,
            };

            let failure_text = case
                .message
                .clone()
                .or_else(|| case.stack_text.as_deref().map(first_line));
            let signature = if status.is_failing() {
                failure_text.as_deref().map(flake_analysis::signature)
            } else {
                None
            };

            if status.is_failing() {
                if let (Some(sig), Some(example)) = (signature.as_deref(), failure_text.as_deref())
                {
                    ClusterStore::absorb(
                        &ctx.pool,
                        &job.repository_id,
                        sig,
                        example,
                        &test.id,
                        observed_at,
                    )
                    .await
                    .map_err(|e| Error::internal(e.to_string()))?;
                }
            }

            touched.insert(test.id.clone());
            rows.push(NewOccurrence {
                test_id: test.id,
                run_id: run_row_id.to_string(),
                status,
                duration_ms: case.time_seconds.map(|t| (t * 1000.0) as i64),
                failure_msg_signature: signature,
                stack_digest: case
                    .stack_text
                    .as_deref()
                    .map(|s| flake_analysis::signature(s)),
                attempt: *counter,
                created_at: observed_at + chrono::Duration::milliseconds(*counter as i64),
            });
        }
    }

    OccurrenceStore::insert_batch(&ctx.pool, &rows, ctx.config.ingestion.persist_batch_size)
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

    Ok(touched)
}

/// Re-score every touched test, refresh cluster assignments, evaluate the
/// policy and record quarantine decisions. Last-writer-wins on the score
/// keyed by `last_updated_at`.
async fn postprocess_tests(
    ctx: &Arc<WorkerContext>,
    _repo_id: &str,
    touched: &BTreeSet<String>,
) -> Result<()> {
    let policy = &ctx.config.policy;
    let overrides = RepoOverrides::default();

    for test_id in touched {
        let window = OccurrenceStore::window_for_test(
            &ctx.pool,
            test_id,
            policy.rolling_window_size as i64,
        )
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

        let now = Utc::now();
        let outcome = flake_analysis::score_test(&window, now, policy);

        let mut features =
            serde_json::to_value(&outcome.features).unwrap_or(serde_json::Value::Null);
        if let Some(map) = features.as_object_mut() {
            map.insert(
                "recommendation".to_string(),
                serde_json::Value::String(outcome.recommendation.to_string()),
            );
        }

        ScoreStore::upsert(
            &ctx.pool,
            &FlakeScore {
                test_id: test_id.clone(),
                score: outcome.score,
                confidence: outcome.confidence,
                window_n: outcome.features.total_runs as i32,
                features,
                last_updated_at: outcome.last_updated_at,
            },
        )
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

        let decision = evaluate_policy(&outcome, None, policy, &overrides);
        tracing::debug!(
            test_id = %test_id,
            score = outcome.score,
            action = %decision.action,
            priority = %decision.priority,
            "Policy evaluated"
        );

        // A quarantine verdict becomes a recorded decision, advisory for
        // the upstream enforcer. The existing ACTIVE decision wins: the
        // store keeps at most one per test.
        if decision.action == PolicyAction::Quarantine {
            let existing = DecisionStore::active_for_test(&ctx.pool, test_id)
                .await
                .map_err(|e| Error::internal(e.to_string()))?;
            if existing.is_none() {
                DecisionStore::propose(
                    &ctx.pool,
                    test_id,
                    QuarantineState::Active,
                    &decision.rationale,
                    None,
                    None,
                )
                .await
                .map_err(|e| Error::internal(e.to_string()))?;
                metrics::counter!("quarantine_decisions_total").increment(1);
                tracing::info!(
                    test_id = %test_id,
                    score = outcome.score,
                    "Quarantine decision recorded"
                );
            }
        }
    }

    Ok(())
}

async fn report_progress(
    ctx: &Arc<WorkerContext>,
    job_id: &str,
    phase: &str,
    processed: usize,
    total: usize,
    current_file: Option<&str>,
) {
    let progress = JobProgress {
        phase: phase.to_string(),
        processed: processed as u64,
        total: total as u64,
        current_file_name: current_file.map(str::to_string),
    };
    // progress is advisory; a failed write never fails the job
    if let Err(e) = QueueJobStore::update_progress(&ctx.pool, job_id, &progress).await {
        tracing::debug!(job_id = job_id, error = %e, "Progress update failed");
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingestion_result_serializes_for_the_jobs_view() {
        let result = IngestionResult {
            processed_artifacts: 2,
            total_tests: 40,
            total_failures: 3,
            total_errors: 1,
            processing_time_ms: 1234,
            errors: vec![FileError {
                file: "junit.xml".to_string(),
                error: "Malformed XML".to_string(),
            }],
            warnings: vec!["artifact logs over size cap".to_string()],
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["processed_artifacts"], 2);
        assert_eq!(value["errors"][0]["file"], "junit.xml");
        assert_eq!(value["warnings"][0], "artifact logs over size cap");
    }

    #[test]
    fn test_first_line() {
        let text = "AssertionError: boom\n  at foo\n  at bar".to_string();
        assert_eq!(first_line(&text), "AssertionError: boom");
        assert_eq!(first_line(&String::new()), "");
    }
}
