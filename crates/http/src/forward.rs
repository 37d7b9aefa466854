//! Per-family request forwarding
//!
//! One `Forwarder` per family owns the selection, rewrite and bookkeeping
//! pipeline: pick an endpoint, sanitise the body, rewrite headers, send the
//! request upstream, tee the response back to the client while capturing a
//! bounded copy for the request log, and feed the outcome into the health
//! tracker and freeze manager.

use crate::error::proxy_error_body;
use crate::headers::{build_upstream_headers, filter_response_headers};
use crate::realtime::RealtimeHub;
use crate::sanitize::strip_reasoning_blocks;
use crate::usage::extract_usage;
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use paf_core::{
    now_ms, ConfigStore, Family, FreezeManager, HealthTracker, Mode, RequestRecord, RequestSink,
    Selector,
};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Largest request body the proxy will buffer (bodies are small JSON)
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

/// Cap on the response bytes captured for usage parsing and logging
const CAPTURE_CAP: usize = 1024 * 1024;

/// Channel depth between the upstream reader and the client body
const TEE_CHANNEL_DEPTH: usize = 16;

/// Preview bounds for the request log
const REQUEST_PREVIEW_LIMIT: usize = 2048;
const RESPONSE_PREVIEW_LIMIT: usize = 4096;

/// Per-family request forwarding pipeline
pub struct Forwarder {
    family: Family,
    store: Arc<ConfigStore>,
    health: Arc<HealthTracker>,
    selector: Selector,
    freeze: FreezeManager,
    client: reqwest::Client,
    sink: Arc<dyn RequestSink>,
    realtime: RealtimeHub,
}

impl Forwarder {
    /// Build a forwarder with its own connection pool
    ///
    /// `request_timeout` is the overall per-request deadline imposed on
    /// upstream calls (streaming reads included).
    pub fn new(
        family: Family,
        store: Arc<ConfigStore>,
        sink: Arc<dyn RequestSink>,
        request_timeout: Duration,
    ) -> paf_core::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| paf_core::Error::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            family,
            freeze: FreezeManager::new(store.clone()),
            store,
            health: Arc::new(HealthTracker::new()),
            selector: Selector::new(),
            client,
            sink,
            realtime: RealtimeHub::new(family),
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn freeze(&self) -> &FreezeManager {
        &self.freeze
    }

    pub fn realtime(&self) -> &RealtimeHub {
        &self.realtime
    }

    /// Most recent sticky selection, for the dashboard
    pub fn current_server_name(&self) -> Option<String> {
        let snapshot = self.store.snapshot();
        let pool = self.store.eligible_pool();
        self.selector.current(
            &pool,
            &self.health,
            snapshot.loadbalancer.health_check.failure_threshold,
        )
    }

    /// Drop all in-memory state for a deleted profile
    pub fn forget_endpoint(&self, name: &str) {
        self.health.reset(name);
        if self.current_server_name().as_deref() == Some(name) {
            self.selector.clear_current();
        }
    }

    /// Forward one client request to a selected upstream
    pub async fn handle(&self, req: Request) -> Response {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(|q| q.to_string());

        let mut record = RequestRecord::started(
            &request_id,
            self.family.as_str(),
            parts.method.as_str(),
            &path,
        );
        self.realtime
            .request_started(&request_id, parts.method.as_str(), &path);

        let snapshot = self.store.snapshot();
        let settings = snapshot.loadbalancer.clone();
        let pool = self.store.eligible_pool();
        let Some(profile) = self.selector.select(&pool, &settings, &self.health, now_ms()) else {
            debug!("{}: no upstream available for {} {}", self.family, parts.method, path);
            return self.finish_early(record, started, paf_core::Error::NoUpstreamAvailable);
        };
        record.config_name = Some(profile.name.clone());

        let raw_body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = paf_core::Error::internal(format!("failed to read request body: {err}"));
                return self.finish_early(record, started, err);
            }
        };

        let upstream_body = if self.family == Family::Claude && !raw_body.is_empty() {
            let outcome = strip_reasoning_blocks(&raw_body);
            record.stripped_blocks = outcome.removed;
            if outcome.removed > 0 {
                debug!(
                    "{}: removed {} reasoning block(s) from request body",
                    self.family, outcome.removed
                );
            }
            outcome.body
        } else {
            raw_body
        };

        if !upstream_body.is_empty() {
            record.request_body = Some(crate::state::limit_string(
                &String::from_utf8_lossy(&upstream_body),
                REQUEST_PREVIEW_LIMIT,
            ));
        }

        let target = match join_target(&profile.base_url, &path, query.as_deref()) {
            Ok(url) => url,
            Err(err) => {
                warn!("{}: invalid upstream URL for '{}': {}", self.family, profile.name, err);
                self.note_failure(&profile.name, true);
                return self.finish_early(record, started, paf_core::Error::UpstreamTransport(err));
            }
        };
        record.target_url = Some(target.to_string());

        let headers = build_upstream_headers(&parts.headers, &profile, self.family, &target);
        let wants_stream = wants_event_stream(&parts.headers);

        debug!(
            "{}: proxying {} {} -> {} (config: {}, stream: {})",
            self.family, parts.method, path, target, profile.name, wants_stream
        );

        let mut builder = self
            .client
            .request(parts.method.clone(), target.clone())
            .headers(headers);
        if !upstream_body.is_empty() {
            builder = builder.body(upstream_body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    "{}: upstream transport error for '{}': {}",
                    self.family, profile.name, err
                );
                self.note_failure(&profile.name, true);
                let err = paf_core::Error::UpstreamTransport(err.to_string());
                return self.finish_early(record, started, err);
            }
        };

        let status = response.status();
        let success = status.as_u16() < 400;
        if success {
            self.note_success(&profile.name);
        } else {
            info!(
                "{}: upstream '{}' returned {} for {} {}",
                self.family, profile.name, status, parts.method, path
            );
            self.note_failure(&profile.name, false);
        }

        let response_headers = filter_response_headers(response.headers());
        record.status_code = status.as_u16();
        record.success = success;

        let body = self.tee_body(response, record, started, success);
        let mut reply = Response::new(body);
        *reply.status_mut() = status;
        *reply.headers_mut() = response_headers;
        reply
    }

    /// Stream the upstream body to the client while capturing a bounded
    /// copy, then emit the request record
    ///
    /// The reader task owns the upstream response. Chunks are forwarded in
    /// arrival order; when the client goes away the channel send fails and
    /// the upstream response is dropped, cancelling the read.
    fn tee_body(
        &self,
        response: reqwest::Response,
        mut record: RequestRecord,
        started: Instant,
        success: bool,
    ) -> Body {
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(TEE_CHANNEL_DEPTH);
        let sink = self.sink.clone();
        let realtime = self.realtime.clone();
        let family = self.family;

        tokio::spawn(async move {
            let mut response = response;
            let mut captured: Vec<u8> = Vec::new();
            let mut stream_error: Option<String> = None;

            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        if captured.len() < CAPTURE_CAP {
                            let take = (CAPTURE_CAP - captured.len()).min(chunk.len());
                            captured.extend_from_slice(&chunk[..take]);
                        }
                        if tx.send(Ok(chunk)).await.is_err() {
                            debug!("{family}: client disconnected, cancelling upstream read");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let message = err.to_string();
                        let _ = tx.send(Err(io::Error::other(message.clone()))).await;
                        stream_error = Some(message);
                        break;
                    }
                }
            }
            drop(tx);

            record.duration_ms = started.elapsed().as_millis() as u64;
            record.usage = extract_usage(family, &captured);
            if !captured.is_empty() {
                record.response_body = Some(crate::state::limit_string(
                    &String::from_utf8_lossy(&captured),
                    RESPONSE_PREVIEW_LIMIT,
                ));
            }
            if let Some(err) = stream_error {
                record.success = false;
                record.error_message = Some(err);
            } else if !success && record.error_message.is_none() {
                record.error_message = Some(format!("upstream returned status {}", record.status_code));
            }
            realtime.request_completed(
                &record.id,
                record.status_code,
                record.duration_ms,
                record.success,
            );
            sink.record(record);
        });

        Body::from_stream(ReceiverStream::new(rx))
    }

    /// Issue a synthetic probe against one profile
    ///
    /// Probes share the credential pipeline with proxied requests and drive
    /// the same health and freeze transitions. Returns whether the probe
    /// succeeded.
    pub async fn probe(&self, name: &str) -> bool {
        let snapshot = self.store.snapshot();
        let Some(profile) = snapshot.profile(name).cloned() else {
            return false;
        };
        let timeout = Duration::from_millis(snapshot.loadbalancer.health_check.timeout);

        let target = match join_target(&profile.base_url, "/v1/models", None) {
            Ok(url) => url,
            Err(err) => {
                warn!("{}: probe target for '{}' invalid: {}", self.family, name, err);
                self.note_failure(name, true);
                return false;
            }
        };
        let headers = build_upstream_headers(&HeaderMap::new(), &profile, self.family, &target);

        debug!("{}: probing '{}' at {}", self.family, name, target);
        let result = self
            .client
            .request(Method::GET, target)
            .headers(headers)
            .timeout(timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().as_u16() < 400 => {
                info!("{}: probe of '{}' succeeded ({})", self.family, name, response.status());
                self.note_success(name);
                true
            }
            Ok(response) => {
                info!("{}: probe of '{}' failed ({})", self.family, name, response.status());
                self.note_failure(name, false);
                false
            }
            Err(err) => {
                info!("{}: probe of '{}' failed: {}", self.family, name, err);
                self.note_failure(name, true);
                false
            }
        }
    }

    fn note_success(&self, name: &str) {
        let snapshot = self.store.snapshot();
        self.health
            .mark_success(name, snapshot.loadbalancer.health_check.success_threshold);
        if let Err(err) = self.freeze.clear(name) {
            warn!("{}: failed to persist unfreeze of '{}': {}", self.family, name, err);
        }
    }

    /// Record a failure and quarantine the profile when warranted
    ///
    /// Transport errors freeze unconditionally (they signal a configuration
    /// or network fault); status failures freeze only once the threshold is
    /// crossed and the family is load-balancing.
    fn note_failure(&self, name: &str, transport: bool) {
        let snapshot = self.store.snapshot();
        let health_check = &snapshot.loadbalancer.health_check;
        self.health.mark_failure(name, health_check.failure_threshold);

        let should_freeze = transport
            || (snapshot.mode == Mode::LoadBalance
                && self
                    .health
                    .exceeded_failure_threshold(name, health_check.failure_threshold));
        if should_freeze {
            if let Err(err) = self.freeze.freeze(name, snapshot.loadbalancer.freeze_duration) {
                warn!("{}: failed to persist freeze of '{}': {}", self.family, name, err);
            }
        }
    }

    /// Turn a pre-upstream failure into a JSON error response and record it
    fn finish_early(&self, mut record: RequestRecord, started: Instant, err: paf_core::Error) -> Response {
        let status = match &err {
            paf_core::Error::NoUpstreamAvailable => StatusCode::SERVICE_UNAVAILABLE,
            paf_core::Error::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = err.to_string();
        record.status_code = status.as_u16();
        record.duration_ms = started.elapsed().as_millis() as u64;
        record.success = false;
        record.error_message = Some(message.clone());
        self.realtime
            .request_completed(&record.id, record.status_code, record.duration_ms, false);
        self.sink.record(record);

        let mut response = Json(proxy_error_body(&message)).into_response();
        *response.status_mut() = status;
        response
    }
}

/// Whether the client asked for a Server-Sent-Events response
fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

/// Join an endpoint base URL with the inbound path and query, verbatim
fn join_target(base_url: &str, path: &str, query: Option<&str>) -> Result<Url, String> {
    let mut target = format!("{}{}", base_url.trim_end_matches('/'), path);
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    Url::parse(&target).map_err(|e| format!("invalid upstream url {target}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn target_join_preserves_path_and_query() {
        let url = join_target("https://api.example.com/", "/v1/messages", Some("beta=true")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/messages?beta=true");

        let url = join_target("https://api.example.com", "/v1/models", None).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/models");
    }

    #[test]
    fn target_join_rejects_garbage() {
        assert!(join_target("not a url", "/v1/messages", None).is_err());
    }

    #[test]
    fn stream_detection_reads_accept_header() {
        let mut headers = HeaderMap::new();
        assert!(!wants_event_stream(&headers));

        headers.insert("accept", HeaderValue::from_static("application/json"));
        assert!(!wants_event_stream(&headers));

        headers.insert(
            "accept",
            HeaderValue::from_static("text/event-stream, application/json"),
        );
        assert!(wants_event_stream(&headers));
    }
}
