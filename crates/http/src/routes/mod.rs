//! Router assembly for the three listeners

mod api;
mod proxy;

use crate::forward::Forwarder;
use crate::middleware::cors_middleware;
use crate::state::AppState;
use axum::middleware::from_fn;
use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;

/// Router for a family proxy listener: every request goes to the forwarder
pub fn proxy_router(forwarder: Arc<Forwarder>) -> Router {
    Router::new()
        .fallback(proxy::forward_handler)
        .with_state(forwarder)
        .layer(from_fn(cors_middleware))
}

/// Router for the dashboard/API listener
///
/// Besides the `/api` surface this hosts two convenience proxies:
/// `/v1/...` forwards to the claude family (path kept verbatim) and
/// `/codex/v1/...` forwards to the codex family with the `/codex` prefix
/// stripped by the nesting.
pub fn dashboard_router(state: AppState) -> Router {
    let claude_convenience = Router::new()
        .route("/v1/{*rest}", any(proxy::forward_handler))
        .with_state(state.claude.clone());
    let codex_convenience = Router::new()
        .fallback(proxy::forward_handler)
        .with_state(state.codex.clone());

    let realtime = Router::new()
        .route("/ws/realtime", get(api::realtime_ws))
        .with_state(state.clone());

    Router::new()
        .nest("/api", api::router(state))
        .merge(claude_convenience)
        .merge(realtime)
        .nest_service("/codex", codex_convenience)
        .layer(from_fn(cors_middleware))
}
