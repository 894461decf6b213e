//! GitHub Actions API operations
//!
//! Every outbound call runs the same gauntlet: rate-limit gate, circuit
//! breaker, installation token, then the request. Transient failures (5xx,
//! transport) retry in-call with jittered exponential backoff; a 429 sets
//! the process-wide wait sentinel and surfaces immediately so the queue's
//! own retry policy takes over after the window resets.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use shared::config::{BreakerConfig, GithubConfig, RateLimitConfig, TimeoutConfig};
use shared::{Error, Result};

use crate::auth::AppAuth;
use crate::breaker::CircuitBreaker;
use crate::rate_limit::{parse_rate_headers, RateLimitGate, RateLimitSentinel};

/// Breaker target for the REST API host
const API_TARGET: &str = "github-api";

/// In-call retry budget for transient failures
const MAX_ATTEMPTS: u32 = 3;

/// Backoff parameters: base 1 s, multiplier 2, jitter 0.1, cap 30 s
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;
const BACKOFF_JITTER: f64 = 0.1;

/// One uploaded artifact as the API reports it
#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub name: String,
    #[serde(rename = "size_in_bytes")]
    pub size_bytes: u64,
    /// Short-lived; must be re-resolved per download attempt
    #[serde(rename = "archive_download_url")]
    pub download_url: String,
    pub expired: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(rename = "workflow_run")]
    pub workflow_run: Option<ArtifactRunRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactRunRef {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct ArtifactPage {
    total_count: u64,
    artifacts: Vec<Artifact>,
}

/// Workflow run as the API reports it
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunInfo {
    pub id: i64,
    pub status: String,
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RunPage {
    workflow_runs: Vec<WorkflowRunInfo>,
}

/// CI job as the API reports it
#[derive(Debug, Clone, Deserialize)]
pub struct JobInfo {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct JobPage {
    jobs: Vec<JobInfo>,
}

/// Authenticated, rate-limit-aware GitHub client
pub struct GithubClient {
    http: reqwest::Client,
    auth: Arc<AppAuth>,
    gate: Arc<RateLimitGate>,
    breaker: Arc<CircuitBreaker>,
    api_base: String,
}

impl GithubClient {
    pub fn new(
        github: &GithubConfig,
        rate_limit: RateLimitConfig,
        breaker: BreakerConfig,
        timeouts: TimeoutConfig,
        sentinel: Arc<dyn RateLimitSentinel>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeouts.http())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        let auth = Arc::new(AppAuth::from_config(github, http.clone())?);

        Ok(Self {
            http,
            auth,
            gate: Arc::new(RateLimitGate::new(rate_limit.reserve, sentinel)),
            breaker: Arc::new(CircuitBreaker::new(breaker)),
            api_base: github.api_base.clone(),
        })
    }

    /// The shared gate, for the polling scheduler's pre-enqueue check
    pub fn rate_gate(&self) -> Arc<RateLimitGate> {
        self.gate.clone()
    }

    /// Artifacts uploaded by one run, 100 per page, all pages
    pub async fn list_run_artifacts(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        installation_id: i64,
    ) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        let mut page = 1u32;

        loop {
            let path = format!(
                "/repos/{}/{}/actions/runs/{}/artifacts?per_page=100&page={}",
                owner, repo, run_id, page
            );
            let body: ArtifactPage = self.get_json(installation_id, &path).await?;
            let fetched = body.artifacts.len();
            artifacts.extend(body.artifacts);

            if artifacts.len() as u64 >= body.total_count || fetched == 0 {
                break;
            }
            page += 1;
        }

        Ok(artifacts)
    }

    /// Resolve the short-lived URL and stream the archive to a fresh file
    /// under `dest_dir`. The URL is re-resolved on every call, so a retry
    /// after expiry gets a fresh one.
    pub async fn download_artifact_zip(
        &self,
        owner: &str,
        repo: &str,
        artifact_id: i64,
        installation_id: i64,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        let now = Utc::now();
        self.gate.check(now).await?;
        self.breaker.allow(API_TARGET, now)?;

        let token = self.auth.installation_token(installation_id).await?;
        let url = format!(
            "{}/repos/{}/{}/actions/artifacts/{}/zip",
            self.api_base, owner, repo, artifact_id
        );

        // reqwest follows the redirect to pre-signed blob storage
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "flakeguard")
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure(API_TARGET, Utc::now());
                Error::network(format!("Artifact download failed: {}", e))
            })?;

        let (remaining, reset) = parse_rate_headers(response.headers());
        self.gate.observe(remaining, reset).await;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::GONE => {
                self.breaker.record_success(API_TARGET, Utc::now());
                return Err(Error::ArtifactExpired(format!(
                    "artifact {} url lapsed",
                    artifact_id
                )));
            }
            reqwest::StatusCode::UNAUTHORIZED => {
                self.auth.evict(installation_id);
                return Err(Error::authentication("Download token rejected"));
            }
            reqwest::StatusCode::NOT_FOUND => {
                return Err(Error::not_found("Artifact", artifact_id.to_string()));
            }
            status => {
                self.breaker.record_failure(API_TARGET, Utc::now());
                return Err(Error::network(format!(
                    "Artifact download returned {}",
                    status.as_u16()
                )));
            }
        }

        self.breaker.record_success(API_TARGET, Utc::now());

        // Stream chunk by chunk; the archive never sits in memory
        let dest = dest_dir.join(format!("artifact-{}.zip", artifact_id));
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| Error::internal(format!("Failed to create temp file: {}", e)))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::network(format!("Download stream broke: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::internal(format!("Failed to write temp file: {}", e)))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::internal(format!("Failed to flush temp file: {}", e)))?;

        tracing::debug!(
            artifact_id = artifact_id,
            dest = %dest.display(),
            "Artifact downloaded"
        );

        Ok(dest)
    }

    /// Jobs belonging to one run
    pub async fn list_jobs_for_run(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        installation_id: i64,
    ) -> Result<Vec<JobInfo>> {
        let path = format!(
            "/repos/{}/{}/actions/runs/{}/jobs?per_page=100",
            owner, repo, run_id
        );
        let body: JobPage = self.get_json(installation_id, &path).await?;
        Ok(body.jobs)
    }

    /// One workflow run
    pub async fn get_workflow_run(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        installation_id: i64,
    ) -> Result<WorkflowRunInfo> {
        let path = format!("/repos/{}/{}/actions/runs/{}", owner, repo, run_id);
        self.get_json(installation_id, &path).await
    }

    /// Recent runs, newest first; the polling sweep diffs these against the
    /// runs already ingested
    pub async fn list_recent_runs(
        &self,
        owner: &str,
        repo: &str,
        installation_id: i64,
        per_page: u32,
    ) -> Result<Vec<WorkflowRunInfo>> {
        let path = format!(
            "/repos/{}/{}/actions/runs?per_page={}",
            owner, repo, per_page
        );
        let body: RunPage = self.get_json(installation_id, &path).await?;
        Ok(body.workflow_runs)
    }

    /// Trigger a rerun of a run's failed jobs. The provider treats repeat
    /// triggers for an in-flight rerun as no-ops.
    pub async fn rerun_failed_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        installation_id: i64,
    ) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/actions/runs/{}/rerun-failed-jobs",
            owner, repo, run_id
        );
        let _: serde_json::Value = self
            .send_json(installation_id, reqwest::Method::POST, &path)
            .await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, installation_id: i64, path: &str) -> Result<T> {
        self.send_json(installation_id, reqwest::Method::GET, path)
            .await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        installation_id: i64,
        method: reqwest::Method,
        path: &str,
    ) -> Result<T> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self
                .send_once(installation_id, method.clone(), path)
                .await
            {
                Ok(value) => {
                    metrics::counter!(
                        "github_api_calls_total",
                        "endpoint" => endpoint_label(path),
                        "outcome" => "ok"
                    )
                    .increment(1);
                    return Ok(value);
                }
                Err(e) if matches!(e, Error::Network(_)) && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        path = path,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying transient API failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::counter!(
                        "github_api_calls_total",
                        "endpoint" => endpoint_label(path),
                        "outcome" => outcome_label(&e)
                    )
                    .increment(1);
                    return Err(e);
                }
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        installation_id: i64,
        method: reqwest::Method,
        path: &str,
    ) -> Result<T> {
        let now = Utc::now();
        self.gate.check(now).await?;
        self.breaker.allow(API_TARGET, now)?;

        let token = self.auth.installation_token(installation_id).await?;
        let url = format!("{}{}", self.api_base, path);

        let response = self
            .http
            .request(method, &url)
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "flakeguard")
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure(API_TARGET, Utc::now());
                Error::network(format!("Request failed: {}", e))
            })?;

        let (remaining, reset) = parse_rate_headers(response.headers());
        self.gate.observe(remaining, reset).await;

        let status = response.status();
        match status {
            s if s.is_success() => {
                self.breaker.record_success(API_TARGET, Utc::now());
                response
                    .json()
                    .await
                    .map_err(|e| Error::network(format!("Malformed API response: {}", e)))
            }
            reqwest::StatusCode::UNAUTHORIZED => {
                self.auth.evict(installation_id);
                Err(Error::authentication("API token rejected"))
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                let reset_at = reset.unwrap_or_else(|| now + chrono::Duration::seconds(60));
                self.gate.observe_throttled(reset_at).await;
                Err(Error::RateLimited { reset_at })
            }
            reqwest::StatusCode::FORBIDDEN => {
                // a 403 with a drained budget is a primary rate limit
                if remaining == Some(0) {
                    let reset_at = reset.unwrap_or_else(|| now + chrono::Duration::seconds(60));
                    self.gate.observe_throttled(reset_at).await;
                    Err(Error::RateLimited { reset_at })
                } else {
                    Err(Error::permission(format!("API returned 403 for {}", path)))
                }
            }
            reqwest::StatusCode::NOT_FOUND => Err(Error::not_found("Resource", path.to_string())),
            s if s.is_server_error() => {
                self.breaker.record_failure(API_TARGET, Utc::now());
                Err(Error::network(format!("API returned {}", s.as_u16())))
            }
            s => Err(Error::internal(format!(
                "Unexpected API status {} for {}",
                s.as_u16(),
                path
            ))),
        }
    }
}

/// Jittered exponential backoff: `base * 2^(attempt-1)` ± 10%, capped
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(8);
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent).min(BACKOFF_CAP_MS);
    let jitter_band = base as f64 * BACKOFF_JITTER;
    let jitter = rand::thread_rng().gen_range(-jitter_band..=jitter_band);
    Duration::from_millis(((base as f64 + jitter).max(0.0)) as u64)
}

/// Bounded-cardinality endpoint label for metrics
fn endpoint_label(path: &str) -> &'static str {
    if path.contains("/artifacts") {
        "artifacts"
    } else if path.contains("/jobs") {
        "jobs"
    } else if path.contains("rerun-failed-jobs") {
        "rerun"
    } else if path.contains("/actions/runs") {
        "runs"
    } else {
        "other"
    }
}

fn outcome_label(error: &Error) -> &'static str {
    match error {
        Error::RateLimited { .. } => "rate_limited",
        Error::Authentication(_) => "auth",
        Error::Permission(_) => "forbidden",
        Error::NotFound { .. } => "not_found",
        Error::Network(_) => "network",
        Error::CircuitOpen(_) => "circuit_open",
        _ => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = backoff_delay(1).as_millis() as f64;
        assert!((900.0..=1100.0).contains(&first), "first was {}", first);

        let second = backoff_delay(2).as_millis() as f64;
        assert!((1800.0..=2200.0).contains(&second), "second was {}", second);

        // attempt 7 would be 64 s uncapped; the cap holds it at 30 s ± 10%
        let capped = backoff_delay(7).as_millis() as f64;
        assert!(capped <= 33_000.0, "capped was {}", capped);
    }

    #[test]
    fn test_endpoint_labels_are_bounded() {
        assert_eq!(
            endpoint_label("/repos/a/b/actions/runs/1/artifacts?page=1"),
            "artifacts"
        );
        assert_eq!(endpoint_label("/repos/a/b/actions/runs/1/jobs"), "jobs");
        assert_eq!(endpoint_label("/repos/a/b/actions/runs?per_page=50"), "runs");
        assert_eq!(endpoint_label("/rate_limit"), "other");
    }

    #[test]
    fn test_artifact_page_deserializes_provider_shape() {
        let body = r#"{
            "total_count": 1,
            "artifacts": [{
                "id": 11,
                "name": "junit-results",
                "size_in_bytes": 2048,
                "archive_download_url": "https://api.github.com/repos/a/b/actions/artifacts/11/zip",
                "expired": false,
                "created_at": "2024-03-01T10:00:00Z",
                "expires_at": "2024-06-01T10:00:00Z",
                "workflow_run": {"id": 99}
            }]
        }"#;
        let page: ArtifactPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.artifacts[0].size_bytes, 2048);
        assert_eq!(page.artifacts[0].workflow_run.as_ref().unwrap().id, 99);
        assert!(!page.artifacts[0].expired);
    }

    #[test]
    fn test_run_and_job_pages_deserialize() {
        let runs: RunPage = serde_json::from_str(
            r#"{"workflow_runs": [{"id": 5, "status": "completed", "conclusion": "failure",
                "created_at": "2024-03-01T10:00:00Z", "updated_at": "2024-03-01T10:05:00Z"}]}"#,
        )
        .unwrap();
        assert_eq!(runs.workflow_runs[0].conclusion.as_deref(), Some("failure"));

        let jobs: JobPage = serde_json::from_str(
            r#"{"jobs": [{"id": 7, "name": "unit", "status": "completed", "conclusion": "success",
                "started_at": null, "completed_at": null}]}"#,
        )
        .unwrap();
        assert_eq!(jobs.jobs[0].name, "unit");
    }
}
