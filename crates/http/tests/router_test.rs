//! Router-level tests: listener wiring, convenience proxies, CORS

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use paf_core::{
    ActiveRef, ConfigStore, EndpointProfile, Family, FamilyState, LogStats, Mode,
    RequestLogReader, RequestRecord, RequestSink, Strategy,
};
use paf_http::state::{CredentialTester, TestReport};
use paf_http::{dashboard_router, proxy_router, AppState, Forwarder};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Upstream stub that records the URIs it served
#[derive(Default)]
struct EchoUpstream {
    uris: Mutex<Vec<String>>,
    name: &'static str,
}

async fn echo_handler(State(upstream): State<Arc<EchoUpstream>>, req: Request) -> Response {
    upstream
        .uris
        .lock()
        .unwrap()
        .push(req.uri().to_string());
    axum::Json(serde_json::json!({ "served_by": upstream.name })).into_response()
}

struct DiscardSink;

impl RequestSink for DiscardSink {
    fn record(&self, _record: RequestRecord) {}
}

struct EmptyLogs;

impl RequestLogReader for EmptyLogs {
    fn logs(
        &self,
        _limit: usize,
        _offset: usize,
        _service: Option<&str>,
    ) -> paf_core::Result<Vec<RequestRecord>> {
        Ok(Vec::new())
    }
    fn log_by_id(&self, _id: &str) -> paf_core::Result<Option<RequestRecord>> {
        Ok(None)
    }
    fn clear(&self) -> paf_core::Result<()> {
        Ok(())
    }
    fn stats(&self) -> paf_core::Result<LogStats> {
        Ok(LogStats::default())
    }
}

struct NoTester;

#[async_trait]
impl CredentialTester for NoTester {
    async fn test(&self, _family: Family, _profile: &EndpointProfile) -> TestReport {
        TestReport::skipped("not under test")
    }
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_echo(name: &'static str) -> (Arc<EchoUpstream>, SocketAddr) {
    let upstream = Arc::new(EchoUpstream {
        uris: Mutex::new(Vec::new()),
        name,
    });
    let router = Router::new()
        .fallback(echo_handler)
        .with_state(upstream.clone());
    let addr = serve(router).await;
    (upstream, addr)
}

fn forwarder_for(
    family: Family,
    dir: &TempDir,
    configs: Vec<EndpointProfile>,
    strategy: Strategy,
) -> Arc<Forwarder> {
    let store = Arc::new(ConfigStore::open_or_init(family, dir.path()).unwrap());
    let mut state = FamilyState {
        mode: Mode::LoadBalance,
        active: ActiveRef::default(),
        configs,
        ..Default::default()
    };
    state.loadbalancer.strategy = strategy;
    store.save(state).unwrap();
    Arc::new(Forwarder::new(family, store, Arc::new(DiscardSink), Duration::from_secs(10)).unwrap())
}

fn endpoint(name: &str, addr: SocketAddr) -> EndpointProfile {
    EndpointProfile::new(name, format!("http://{addr}"))
}

async fn app_state(dir: &TempDir, claude_addr: SocketAddr, codex_addr: SocketAddr) -> AppState {
    let claude = forwarder_for(
        Family::Claude,
        dir,
        vec![endpoint("c", claude_addr)],
        Strategy::Weighted,
    );
    let codex = forwarder_for(
        Family::Codex,
        dir,
        vec![endpoint("x", codex_addr)],
        Strategy::Weighted,
    );
    AppState::new(claude, codex, Arc::new(EmptyLogs), Arc::new(NoTester))
}

#[tokio::test]
async fn dashboard_v1_routes_to_claude_with_verbatim_path() {
    let dir = TempDir::new().unwrap();
    let (claude_upstream, claude_addr) = spawn_echo("claude-upstream").await;
    let (_codex_upstream, codex_addr) = spawn_echo("codex-upstream").await;

    let addr = serve(dashboard_router(app_state(&dir, claude_addr, codex_addr).await)).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages?beta=prompt-caching"))
        .json(&serde_json::json!({"model": "claude-3-haiku"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["served_by"], "claude-upstream");
    let uris = claude_upstream.uris.lock().unwrap().clone();
    assert_eq!(uris, vec!["/v1/messages?beta=prompt-caching".to_string()]);
}

#[tokio::test]
async fn dashboard_codex_prefix_is_stripped() {
    let dir = TempDir::new().unwrap();
    let (_claude_upstream, claude_addr) = spawn_echo("claude-upstream").await;
    let (codex_upstream, codex_addr) = spawn_echo("codex-upstream").await;

    let addr = serve(dashboard_router(app_state(&dir, claude_addr, codex_addr).await)).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/codex/v1/chat/completions"))
        .json(&serde_json::json!({"model": "gpt-4.1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["served_by"], "codex-upstream");
    let uris = codex_upstream.uris.lock().unwrap().clone();
    assert_eq!(uris, vec!["/v1/chat/completions".to_string()]);
}

#[tokio::test]
async fn preflight_is_answered_locally_with_204() {
    let dir = TempDir::new().unwrap();
    let (upstream, upstream_addr) = spawn_echo("upstream").await;
    let forwarder = forwarder_for(
        Family::Claude,
        &dir,
        vec![endpoint("only", upstream_addr)],
        Strategy::Weighted,
    );
    let addr = serve(proxy_router(forwarder)).await;

    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/v1/messages"))
        .header("origin", "http://localhost:8800")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 204);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.headers()["access-control-allow-methods"], "*");
    assert!(
        upstream.uris.lock().unwrap().is_empty(),
        "preflights must not reach the upstream"
    );
}

#[tokio::test]
async fn round_robin_strategy_alternates_upstreams() {
    let dir = TempDir::new().unwrap();
    let (upstream_a, addr_a) = spawn_echo("a").await;
    let (upstream_b, addr_b) = spawn_echo("b").await;

    let forwarder = forwarder_for(
        Family::Codex,
        &dir,
        vec![endpoint("a", addr_a), endpoint("b", addr_b)],
        Strategy::RoundRobin,
    );
    let addr = serve(proxy_router(forwarder)).await;

    let client = reqwest::Client::new();
    for _ in 0..4 {
        client
            .post(format!("http://{addr}/v1/chat/completions"))
            .json(&serde_json::json!({"model": "gpt-4.1"}))
            .send()
            .await
            .unwrap();
    }

    assert_eq!(upstream_a.uris.lock().unwrap().len(), 2);
    assert_eq!(upstream_b.uris.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn get_requests_forward_without_a_body() {
    let dir = TempDir::new().unwrap();
    let (upstream, upstream_addr) = spawn_echo("upstream").await;
    let forwarder = forwarder_for(
        Family::Codex,
        &dir,
        vec![endpoint("only", upstream_addr)],
        Strategy::Weighted,
    );
    let addr = serve(proxy_router(forwarder)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        upstream.uris.lock().unwrap().clone(),
        vec!["/v1/models".to_string()]
    );
}
