//! End-to-end tests: real listeners, mock upstreams, reqwest clients

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use paf_core::{
    now_ms, ActiveRef, ConfigStore, EndpointProfile, Family, FamilyState, Mode, RequestRecord,
    RequestSink, Strategy,
};
use paf_http::state::{CredentialTester, TestReport};
use paf_http::{dashboard_router, proxy_router, AppState, Forwarder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Programmable mock upstream
#[derive(Default)]
struct MockUpstream {
    hits: AtomicUsize,
    status: AtomicU16,
    sse_body: Mutex<Option<String>>,
    extra_headers: Mutex<Vec<(String, String)>>,
    last_headers: Mutex<Option<HeaderMap>>,
    last_body: Mutex<Option<Bytes>>,
}

impl MockUpstream {
    fn new(status: u16) -> Arc<Self> {
        let mock = Self::default();
        mock.status.store(status, Ordering::SeqCst);
        Arc::new(mock)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn mock_handler(State(mock): State<Arc<MockUpstream>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    // probe endpoint is always healthy
    if parts.uri.path() == "/v1/models" {
        return axum::Json(serde_json::json!({ "data": [] })).into_response();
    }

    mock.hits.fetch_add(1, Ordering::SeqCst);
    *mock.last_headers.lock().unwrap() = Some(parts.headers);
    *mock.last_body.lock().unwrap() = axum::body::to_bytes(body, usize::MAX).await.ok();

    let status = StatusCode::from_u16(mock.status.load(Ordering::SeqCst)).unwrap();
    let mut response = if let Some(sse) = mock.sse_body.lock().unwrap().clone() {
        let mut response = Response::new(axum::body::Body::from(sse));
        response
            .headers_mut()
            .insert("content-type", "text/event-stream".parse().unwrap());
        response
    } else {
        axum::Json(serde_json::json!({
            "ok": true,
            "usage": { "input_tokens": 10, "output_tokens": 3 }
        }))
        .into_response()
    };
    *response.status_mut() = status;
    for (name, value) in mock.extra_headers.lock().unwrap().iter() {
        response.headers_mut().insert(
            axum::http::HeaderName::try_from(name.as_str()).unwrap(),
            value.parse().unwrap(),
        );
    }
    response
}

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_mock(mock: Arc<MockUpstream>) -> SocketAddr {
    let router = Router::new().fallback(mock_handler).with_state(mock);
    spawn_server(router).await
}

/// Sink that remembers every record in memory
#[derive(Default)]
struct CapturingSink(Mutex<Vec<RequestRecord>>);

impl RequestSink for CapturingSink {
    fn record(&self, record: RequestRecord) {
        self.0.lock().unwrap().push(record);
    }
}

impl CapturingSink {
    async fn wait_for(&self, count: usize) -> Vec<RequestRecord> {
        for _ in 0..200 {
            {
                let records = self.0.lock().unwrap();
                if records.len() >= count {
                    return records.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} request records, got {}", self.0.lock().unwrap().len());
    }
}

struct StubTester;

#[async_trait]
impl CredentialTester for StubTester {
    async fn test(&self, _family: Family, _profile: &EndpointProfile) -> TestReport {
        TestReport::skipped("stub tester")
    }
}

fn profile(name: &str, addr: SocketAddr, weight: f64) -> EndpointProfile {
    EndpointProfile {
        weight,
        ..EndpointProfile::new(name, format!("http://{addr}"))
    }
}

fn load_balance_state(configs: Vec<EndpointProfile>) -> FamilyState {
    let mut state = FamilyState {
        mode: Mode::LoadBalance,
        active: ActiveRef::default(),
        configs,
        ..Default::default()
    };
    state.loadbalancer.strategy = Strategy::Weighted;
    state.loadbalancer.freeze_duration = 60_000;
    state.loadbalancer.health_check.failure_threshold = 3;
    state
}

struct Harness {
    _dir: TempDir,
    forwarder: Arc<Forwarder>,
    sink: Arc<CapturingSink>,
    proxy_addr: SocketAddr,
}

async fn harness(family: Family, state: FamilyState) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ConfigStore::open_or_init(family, dir.path()).unwrap());
    store.save(state).unwrap();

    let sink = Arc::new(CapturingSink::default());
    let forwarder = Arc::new(
        Forwarder::new(family, store, sink.clone(), Duration::from_secs(30)).unwrap(),
    );
    let proxy_addr = spawn_server(proxy_router(forwarder.clone())).await;
    Harness {
        _dir: dir,
        forwarder,
        sink,
        proxy_addr,
    }
}

fn messages_body() -> serde_json::Value {
    serde_json::json!({
        "model": "claude-3-haiku",
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[tokio::test]
async fn weighted_selection_is_sticky_across_requests() {
    let mock_a = MockUpstream::new(200);
    let mock_b = MockUpstream::new(200);
    let addr_a = spawn_mock(mock_a.clone()).await;
    let addr_b = spawn_mock(mock_b.clone()).await;

    let state = load_balance_state(vec![profile("A", addr_a, 3.0), profile("B", addr_b, 1.0)]);
    let harness = harness(Family::Claude, state).await;

    let client = reqwest::Client::new();
    for _ in 0..10 {
        let response = client
            .post(format!("http://{}/v1/messages", harness.proxy_addr))
            .json(&messages_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    assert_eq!(mock_a.hits(), 10, "all requests stick to the heavier endpoint");
    assert_eq!(mock_b.hits(), 0);
    assert_eq!(harness.forwarder.current_server_name().as_deref(), Some("A"));
}

#[tokio::test]
async fn consecutive_failures_freeze_then_probe_thaws() {
    let mock_x = MockUpstream::new(500);
    let mock_y = MockUpstream::new(200);
    let addr_x = spawn_mock(mock_x.clone()).await;
    let addr_y = spawn_mock(mock_y.clone()).await;

    // X is preferred; Y is the healthy backup
    let state = load_balance_state(vec![profile("X", addr_x, 5.0), profile("Y", addr_y, 1.0)]);
    let harness = harness(Family::Claude, state).await;
    let store = harness.forwarder.store().clone();

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let response = client
            .post(format!("http://{}/v1/messages", harness.proxy_addr))
            .json(&messages_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500, "failure statuses pass through");
    }

    // third failure crossed the threshold: X is frozen for ~60s
    let frozen_until = store.snapshot().profile("X").unwrap().freeze_until;
    let now = now_ms();
    let deadline = frozen_until.expect("X must be frozen after 3 failures");
    assert!(deadline > now && deadline <= now + 61_000);

    // while frozen, traffic flows to Y
    let before_y = mock_y.hits();
    let response = client
        .post(format!("http://{}/v1/messages", harness.proxy_addr))
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(mock_y.hits(), before_y + 1);
    assert_eq!(mock_x.hits(), 3);

    // simulate the freeze window elapsing, then re-probe
    store
        .mutate(|s| s.profile_mut("X").unwrap().freeze_until = Some(now_ms() - 1))
        .unwrap();
    mock_x.status.store(200, Ordering::SeqCst);
    assert!(harness.forwarder.probe("X").await);
    assert!(store.snapshot().profile("X").unwrap().freeze_until.is_none());
    assert!(
        !harness
            .forwarder
            .health()
            .exceeded_failure_threshold("X", 3),
        "probe success resets the failure streak"
    );
}

#[tokio::test]
async fn streaming_tee_preserves_order_and_extracts_usage() {
    let mock = MockUpstream::new(200);
    *mock.sse_body.lock().unwrap() = Some(
        concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\",\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}\n\n",
        )
        .to_string(),
    );
    let addr = spawn_mock(mock.clone()).await;

    let state = load_balance_state(vec![profile("S", addr, 1.0)]);
    let harness = harness(Family::Claude, state).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/messages", harness.proxy_addr))
        .header("accept", "text/event-stream")
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    let start = body.find("message_start").unwrap();
    let delta = body.find("content_block_delta").unwrap();
    let stop = body.find("message_stop").unwrap();
    assert!(start < delta && delta < stop, "events arrive in upstream order");

    let records = harness.sink.wait_for(1).await;
    let usage = records[0].usage.clone().expect("usage parsed from the tee capture");
    assert_eq!(usage.prompt_tokens, 5);
    assert_eq!(usage.completion_tokens, 2);
}

#[tokio::test]
async fn sanitiser_and_credentials_rewrite_the_upstream_request() {
    let mock = MockUpstream::new(200);
    let addr = spawn_mock(mock.clone()).await;

    let mut endpoint = profile("main", addr, 1.0);
    endpoint.auth_token = Some("abc".into());
    let harness = harness(Family::Claude, load_balance_state(vec![endpoint])).await;

    let body = serde_json::json!({
        "model": "claude-3-haiku",
        "messages": [{
            "role": "assistant",
            "content": [
                {"type": "thinking", "text": "hmm"},
                {"type": "text", "text": "hi"}
            ]
        }]
    });
    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/messages", harness.proxy_addr))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let headers = mock.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers.get("authorization").unwrap(), "Bearer abc");
    assert_eq!(headers.get("x-api-key").unwrap(), "abc");
    assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");

    let seen: serde_json::Value =
        serde_json::from_slice(&mock.last_body.lock().unwrap().clone().unwrap()).unwrap();
    let content = seen["messages"][0]["content"].as_array().unwrap();
    assert_eq!(content.len(), 1);
    assert_eq!(content[0]["type"], "text");

    let records = harness.sink.wait_for(1).await;
    assert_eq!(records[0].stripped_blocks, 1);
}

#[tokio::test]
async fn content_encoding_is_stripped_from_responses() {
    let mock = MockUpstream::new(200);
    mock.extra_headers
        .lock()
        .unwrap()
        .push(("content-encoding".to_string(), "br".to_string()));
    let addr = spawn_mock(mock.clone()).await;

    let harness = harness(Family::Codex, load_balance_state(vec![profile("e", addr, 1.0)])).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/chat/completions", harness.proxy_addr))
        .json(&serde_json::json!({"model": "gpt-4.1", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("content-encoding").is_none());
}

#[tokio::test]
async fn empty_pool_yields_503_not_a_crash() {
    let harness = harness(Family::Codex, load_balance_state(vec![])).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/chat/completions", harness.proxy_addr))
        .json(&serde_json::json!({"model": "gpt-4.1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "no upstream available");
}

#[tokio::test]
async fn transport_errors_freeze_even_in_manual_mode() {
    // point at a port nothing listens on
    let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let mut state = load_balance_state(vec![profile("dead", unreachable, 1.0)]);
    state.mode = Mode::Manual;
    state.active.name = "dead".into();

    let harness = harness(Family::Claude, state).await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/messages", harness.proxy_addr))
        .json(&messages_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    let snapshot = harness.forwarder.store().snapshot();
    assert!(
        snapshot.profile("dead").unwrap().freeze_until.is_some(),
        "transport faults freeze regardless of mode"
    );
}

#[tokio::test]
async fn status_failures_do_not_freeze_in_manual_mode() {
    let mock = MockUpstream::new(500);
    let addr = spawn_mock(mock.clone()).await;

    let mut state = load_balance_state(vec![profile("m", addr, 1.0)]);
    state.mode = Mode::Manual;
    state.active.name = "m".into();
    let harness = harness(Family::Claude, state).await;

    let client = reqwest::Client::new();
    for _ in 0..4 {
        let response = client
            .post(format!("http://{}/v1/messages", harness.proxy_addr))
            .json(&messages_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
    }

    let snapshot = harness.forwarder.store().snapshot();
    assert!(
        snapshot.profile("m").unwrap().freeze_until.is_none(),
        "manual mode never freezes on status alone"
    );
}

#[tokio::test]
async fn dashboard_api_manages_configs_and_reports_status() {
    let dir = TempDir::new().unwrap();
    let claude_store = Arc::new(ConfigStore::open_or_init(Family::Claude, dir.path()).unwrap());
    let codex_store = Arc::new(ConfigStore::open_or_init(Family::Codex, dir.path()).unwrap());

    let logger = Arc::new(
        paf_daemon::SqliteRequestLogger::new(&dir.path().join("log.db"), 100).unwrap(),
    );
    let claude = Arc::new(
        Forwarder::new(Family::Claude, claude_store, logger.clone(), Duration::from_secs(30))
            .unwrap(),
    );
    let codex = Arc::new(
        Forwarder::new(Family::Codex, codex_store, logger.clone(), Duration::from_secs(30))
            .unwrap(),
    );
    let state = AppState::new(claude, codex, logger, Arc::new(StubTester));
    let addr = spawn_server(dashboard_router(state)).await;
    let base = format!("http://{addr}/api");
    let client = reqwest::Client::new();

    // status
    let body: serde_json::Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["uptime"].is_u64());

    // create a codex profile
    let response = client
        .post(format!("{base}/configs?service=codex"))
        .json(&serde_json::json!({
            "name": "main",
            "base_url": "https://api.openai.com",
            "api_key": "sk-test",
            "weight": 2.0
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // duplicate create is a conflict
    let response = client
        .post(format!("{base}/configs?service=codex"))
        .json(&serde_json::json!({"name": "main", "base_url": "https://api.openai.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    // it shows up in the listing, activated by normalisation
    let listing: serde_json::Value = client
        .get(format!("{base}/configs?service=codex"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["configs"][0]["name"], "main");
    assert_eq!(listing["active"]["name"], "main");

    // switch mode, then check the separated view
    let response = client
        .put(format!("{base}/configs/mode?service=codex"))
        .json(&serde_json::json!({"mode": "load_balance"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let separated: serde_json::Value = client
        .get(format!("{base}/configs/separated"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(separated["codex"]["mode"], "load_balance");
    assert!(separated["claude"]["configs"].as_array().unwrap().is_empty());
    assert!(separated.get("last_results").is_some());

    // manual freeze and unfreeze
    let response = client
        .put(format!("{base}/configs/main/freeze?service=codex"))
        .json(&serde_json::json!({"frozen": true, "duration_ms": 5000}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["freeze_until"].as_i64().unwrap() > now_ms());

    let response = client
        .put(format!("{base}/configs/main/freeze?service=codex"))
        .json(&serde_json::json!({"frozen": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // unknown service is rejected
    let response = client
        .get(format!("{base}/configs?service=bard"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // logs endpoints respond (empty log)
    let logs: serde_json::Value = client
        .get(format!("{base}/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs.as_array().unwrap().is_empty());
    let response = client.get(format!("{base}/logs/nope")).send().await.unwrap();
    assert_eq!(response.status(), 404);

    // credential test without credentials short-circuits
    let response = client
        .post(format!("{base}/configs/main/test?service=codex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // delete
    let response = client
        .delete(format!("{base}/configs/main?service=codex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = client
        .delete(format!("{base}/configs/main?service=codex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[test]
fn concurrent_snapshots_never_observe_a_torn_state() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ConfigStore::open_or_init(Family::Claude, dir.path()).unwrap());

    let state_for = |marker: &str| {
        let mut state = FamilyState {
            mode: Mode::LoadBalance,
            ..Default::default()
        };
        for i in 0..3 {
            state.configs.push(EndpointProfile::new(
                format!("{marker}-{i}"),
                format!("https://{marker}.example.com"),
            ));
        }
        state
    };
    store.save(state_for("old")).unwrap();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let stop = stop.clone();
        readers.push(std::thread::spawn(move || {
            let mut observed = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let snapshot = store.snapshot();
                let markers: Vec<&str> = snapshot
                    .configs
                    .iter()
                    .map(|p| p.name.split('-').next().unwrap())
                    .collect();
                assert!(
                    markers.iter().all(|m| *m == markers[0]),
                    "snapshot mixes generations: {markers:?}"
                );
                assert_eq!(snapshot.configs.len(), 3);
                observed += 1;
            }
            observed
        }));
    }

    for round in 0..50 {
        let marker = if round % 2 == 0 { "new" } else { "old" };
        store.save(state_for(marker)).unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}
