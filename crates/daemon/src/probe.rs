//! One-shot credential tests for endpoint profiles
//!
//! The codex family is tested with a minimal chat-completions request. The
//! claude family is tested by invoking the external `claude` CLI inside an
//! isolated sandbox directory, because several claude-compatible upstreams
//! only accept the CLI's session handshake.

use async_trait::async_trait;
use chrono::Utc;
use paf_http::state::{limit_string, CredentialTester, TestReport};
use paf_core::{EndpointProfile, Family, RequestRecord, RequestSink};
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hard deadline for the external `claude` CLI
const CLI_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the codex HTTP test request
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum bytes of output kept for the preview
const PREVIEW_LIMIT: usize = 512;

/// Production credential tester
pub struct HttpCredentialTester {
    client: reqwest::Client,
    sink: Arc<dyn RequestSink>,
}

impl HttpCredentialTester {
    pub fn new(sink: Arc<dyn RequestSink>) -> paf_core::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| paf_core::Error::internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, sink })
    }

    async fn test_codex(&self, profile: &EndpointProfile) -> TestReport {
        let base = profile.base_url.trim_end_matches('/');
        let path = "/v1/chat/completions";
        let target = format!("{base}{path}");
        let body = json!({
            "model": "gpt-4.1-mini",
            "messages": [{"role": "user", "content": "health check"}],
            "max_tokens": 16,
        });

        let credential = profile
            .api_key
            .as_deref()
            .or(profile.auth_token.as_deref())
            .unwrap_or_default();

        let started = Instant::now();
        let outcome = self
            .client
            .post(&target)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {credential}"))
            .json(&body)
            .send()
            .await;

        match outcome {
            Ok(response) => {
                let status = response.status();
                let duration_ms = started.elapsed().as_millis() as u64;
                let text = response.text().await.unwrap_or_default();
                let message = if text.is_empty() {
                    status.canonical_reason().unwrap_or("").to_string()
                } else {
                    limit_string(&text, PREVIEW_LIMIT)
                };
                TestReport {
                    success: status.is_success(),
                    status_code: Some(status.as_u16()),
                    duration_ms,
                    message: Some(message),
                    response_preview: (!text.is_empty()).then(|| limit_string(&text, 256)),
                    completed_at: Utc::now(),
                    source: "http".to_string(),
                    method: "POST".to_string(),
                    path: path.to_string(),
                }
            }
            Err(err) => TestReport {
                success: false,
                status_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
                message: Some(err.to_string()),
                response_preview: None,
                completed_at: Utc::now(),
                source: "http".to_string(),
                method: "POST".to_string(),
                path: path.to_string(),
            },
        }
    }

    /// Run `claude -p` in a throwaway home directory
    ///
    /// The sandbox keeps the user's real `~/.claude` state out of the probe
    /// and is removed when the `TempDir` drops, success or not.
    async fn test_claude(&self, profile: &EndpointProfile) -> TestReport {
        let sandbox = match tempfile::TempDir::new() {
            Ok(dir) => dir,
            Err(err) => {
                return TestReport::skipped(format!("failed to create sandbox: {err}"));
            }
        };

        let mut command = Command::new("claude");
        command
            .arg("-p")
            .arg("Reply with exactly: OK")
            .arg("--output-format")
            .arg("text")
            .env("HOME", sandbox.path())
            .env("ANTHROPIC_BASE_URL", profile.base_url.trim_end_matches('/'))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = profile.auth_token.as_deref() {
            command.env("ANTHROPIC_AUTH_TOKEN", token);
        }
        if let Some(key) = profile.api_key.as_deref() {
            command.env("ANTHROPIC_API_KEY", key);
        }

        let started = Instant::now();
        // output() drains stdout/stderr concurrently, so a chatty CLI can
        // never deadlock on a full pipe; kill_on_drop reaps it on timeout
        let waited = tokio::time::timeout(CLI_TIMEOUT, command.output()).await;

        let (success, message) = match waited {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    (true, stdout)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    let detail = if stderr.trim().is_empty() { stdout } else { stderr };
                    (false, format!("claude CLI exited with {}: {detail}", output.status))
                }
            }
            Ok(Err(err)) => (false, format!("failed to launch claude CLI: {err}")),
            Err(_) => (
                false,
                format!("claude CLI timed out after {}s", CLI_TIMEOUT.as_secs()),
            ),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!("claude CLI test finished in {duration_ms}ms (success: {success})");

        TestReport {
            success,
            status_code: None,
            duration_ms,
            message: Some(limit_string(message.trim(), PREVIEW_LIMIT)),
            response_preview: (!message.trim().is_empty())
                .then(|| limit_string(message.trim(), 256)),
            completed_at: Utc::now(),
            source: "cli".to_string(),
            method: "CLI".to_string(),
            path: "claude -p".to_string(),
        }
    }

    fn log_report(&self, family: Family, profile: &EndpointProfile, report: &TestReport) {
        let mut record = RequestRecord::started(
            Uuid::new_v4().to_string(),
            family.as_str(),
            &report.method,
            &report.path,
        );
        record.status_code = report.status_code.unwrap_or(0);
        record.duration_ms = report.duration_ms;
        record.success = report.success;
        record.config_name = Some(format!("config-test:{}", profile.name));
        record.target_url = Some(profile.base_url.clone());
        record.response_body = report.response_preview.clone();
        if !report.success {
            record.error_message = report.message.clone();
        }
        self.sink.record(record);
    }
}

#[async_trait]
impl CredentialTester for HttpCredentialTester {
    async fn test(&self, family: Family, profile: &EndpointProfile) -> TestReport {
        let report = match family {
            Family::Codex => self.test_codex(profile).await,
            Family::Claude => self.test_claude(profile).await,
        };
        if !report.success {
            warn!(
                "{family}: credential test for '{}' failed: {}",
                profile.name,
                report.message.as_deref().unwrap_or("unknown error")
            );
        }
        self.log_report(family, profile, &report);
        report
    }
}
