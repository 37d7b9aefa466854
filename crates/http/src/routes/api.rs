//! Dashboard REST surface under `/api`

use crate::error::{HttpError, Result};
use crate::forward::Forwarder;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use paf_core::{EndpointProfile, Family, LoadBalancerSettings, Mode, RequestRecord};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/configs/separated", get(configs_separated))
        .route("/configs", get(list_configs).post(create_config))
        .route("/configs/mode", put(set_mode))
        .route("/configs/{name}", put(update_config).delete(delete_config))
        .route("/configs/{name}/activate", post(activate_config))
        .route("/configs/{name}/freeze", put(freeze_config))
        .route("/configs/{name}/test", post(test_config))
        .route("/loadbalancer", get(get_loadbalancer).put(put_loadbalancer))
        .route("/logs", get(list_logs).delete(clear_logs))
        .route("/logs/{id}", get(get_log))
        .route("/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceQuery {
    service: Option<String>,
}

impl ServiceQuery {
    /// Resolve the target family; unprefixed requests default to claude
    fn family(&self) -> Result<Family> {
        match self.service.as_deref() {
            None => Ok(Family::Claude),
            Some(name) => Family::parse(name)
                .ok_or_else(|| HttpError::BadRequest(format!("unknown service '{name}'"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpsertConfigRequest {
    name: String,
    base_url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    enabled: Option<bool>,
}

impl UpsertConfigRequest {
    fn into_profile(self) -> EndpointProfile {
        EndpointProfile {
            auth_token: self.auth_token,
            api_key: self.api_key,
            weight: self.weight.unwrap_or(1.0),
            enabled: self.enabled.unwrap_or(true),
            ..EndpointProfile::new(self.name, self.base_url)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    mode: Mode,
}

#[derive(Debug, Deserialize)]
struct FreezeRequest {
    frozen: bool,
    #[serde(default)]
    duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    /// Restrict the listing to one family
    service: Option<String>,
}

fn family_payload(state: &AppState, family: Family) -> Value {
    let forwarder = state.forwarder(family);
    let snapshot = forwarder.store().snapshot();
    json!({
        "mode": snapshot.mode,
        "active": snapshot.active,
        "configs": snapshot.configs,
        "loadbalancer": snapshot.loadbalancer,
        "current": forwarder.current_server_name(),
        "health": forwarder.health().all(),
    })
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.uptime_secs(),
    }))
}

async fn configs_separated(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "claude": family_payload(&state, Family::Claude),
        "codex": family_payload(&state, Family::Codex),
        "current": {
            "claude": state.claude.current_server_name(),
            "codex": state.codex.current_server_name(),
        },
        "last_results": {
            "claude": state.test_results(Family::Claude),
            "codex": state.test_results(Family::Codex),
        },
    }))
}

async fn list_configs(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> Result<Json<Value>> {
    let family = query.family()?;
    Ok(Json(family_payload(&state, family)))
}

async fn create_config(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    Json(payload): Json<UpsertConfigRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let family = query.family()?;
    if payload.name.trim().is_empty() {
        return Err(HttpError::BadRequest("profile name must not be empty".into()));
    }

    let forwarder = state.forwarder(family);
    if forwarder.store().snapshot().profile(&payload.name).is_some() {
        return Err(HttpError::Conflict(format!(
            "configuration '{}' already exists",
            payload.name
        )));
    }

    let profile = payload.into_profile();
    info!("{family}: creating configuration '{}'", profile.name);
    forwarder.store().mutate(|s| s.configs.push(profile))?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "created" }))))
}

async fn update_config(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    Path(name): Path<String>,
    Json(payload): Json<UpsertConfigRequest>,
) -> Result<Json<Value>> {
    let family = query.family()?;
    let forwarder = state.forwarder(family);
    let snapshot = forwarder.store().snapshot();

    if snapshot.profile(&name).is_none() {
        return Err(HttpError::NotFound(format!("configuration '{name}' not found")));
    }
    if payload.name != name && snapshot.profile(&payload.name).is_some() {
        return Err(HttpError::Conflict(format!(
            "configuration '{}' already exists",
            payload.name
        )));
    }

    let renamed = payload.name != name;
    let replacement = payload.into_profile();
    forwarder.store().mutate(|s| {
        if let Some(slot) = s.configs.iter_mut().find(|p| p.name == name) {
            // whole-profile replacement; freeze state does not survive an edit
            *slot = replacement;
        }
        if renamed && s.active.name == name {
            s.active.name.clear();
        }
    })?;
    if renamed {
        forwarder.forget_endpoint(&name);
        state.forget_test_result(family, &name);
    }

    Ok(Json(json!({ "status": "updated" })))
}

async fn delete_config(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let family = query.family()?;
    let forwarder = state.forwarder(family);
    if forwarder.store().snapshot().profile(&name).is_none() {
        return Err(HttpError::NotFound(format!("configuration '{name}' not found")));
    }

    info!("{family}: deleting configuration '{name}'");
    forwarder.store().mutate(|s| {
        s.configs.retain(|p| p.name != name);
        if s.active.name == name {
            s.active.name.clear();
        }
    })?;
    forwarder.forget_endpoint(&name);
    state.forget_test_result(family, &name);
    Ok(Json(json!({ "status": "deleted" })))
}

async fn activate_config(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let family = query.family()?;
    let forwarder = state.forwarder(family);
    let snapshot = forwarder.store().snapshot();
    let Some(profile) = snapshot.profile(&name) else {
        return Err(HttpError::NotFound(format!("configuration '{name}' not found")));
    };
    if !profile.enabled {
        return Err(HttpError::BadRequest(format!(
            "configuration '{name}' is disabled and cannot be activated"
        )));
    }

    info!("{family}: activating configuration '{name}'");
    forwarder.store().mutate(|s| s.active.name = name.clone())?;
    Ok(Json(json!({ "status": "activated", "active": name })))
}

async fn freeze_config(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    Path(name): Path<String>,
    Json(payload): Json<FreezeRequest>,
) -> Result<Json<Value>> {
    let family = query.family()?;
    let forwarder = state.forwarder(family);
    let snapshot = forwarder.store().snapshot();
    if snapshot.profile(&name).is_none() {
        return Err(HttpError::NotFound(format!("configuration '{name}' not found")));
    }

    if payload.frozen {
        let duration = payload
            .duration_ms
            .unwrap_or(snapshot.loadbalancer.freeze_duration);
        let until = forwarder.freeze().freeze(&name, duration)?;
        Ok(Json(json!({ "status": "frozen", "freeze_until": until })))
    } else {
        forwarder.freeze().clear(&name)?;
        Ok(Json(json!({ "status": "unfrozen" })))
    }
}

async fn set_mode(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    Json(payload): Json<ModeRequest>,
) -> Result<Json<Value>> {
    let family = query.family()?;
    info!("{family}: switching mode to {:?}", payload.mode);
    state
        .forwarder(family)
        .store()
        .mutate(|s| s.mode = payload.mode)?;
    Ok(Json(json!({ "status": "updated" })))
}

async fn get_loadbalancer(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> Result<Json<LoadBalancerSettings>> {
    let family = query.family()?;
    Ok(Json(
        state.forwarder(family).store().snapshot().loadbalancer.clone(),
    ))
}

async fn put_loadbalancer(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    Json(settings): Json<LoadBalancerSettings>,
) -> Result<Json<Value>> {
    let family = query.family()?;
    state
        .forwarder(family)
        .store()
        .mutate(|s| s.loadbalancer = settings)?;
    Ok(Json(json!({ "status": "updated" })))
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<RequestRecord>>> {
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);
    let logs = state.logs.logs(limit, offset, query.service.as_deref())?;
    Ok(Json(logs))
}

async fn clear_logs(State(state): State<AppState>) -> Result<Json<Value>> {
    state.logs.clear()?;
    Ok(Json(json!({ "status": "cleared" })))
}

async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RequestRecord>> {
    state
        .logs
        .log_by_id(&id)?
        .map(Json)
        .ok_or_else(|| HttpError::NotFound(format!("log '{id}' not found")))
}

async fn stats(State(state): State<AppState>) -> Result<Json<paf_core::LogStats>> {
    Ok(Json(state.logs.stats()?))
}

/// Upgrade a dashboard client onto a family's live request feed
pub async fn realtime_ws(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    ws: axum::extract::ws::WebSocketUpgrade,
) -> Result<axum::response::Response> {
    let family = query.family()?;
    let hub = state.forwarder(family).realtime().clone();
    Ok(ws.on_upgrade(move |socket| async move { hub.handle_connection(socket).await }))
}

async fn test_config(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let family = query.family()?;
    let forwarder: &Arc<Forwarder> = state.forwarder(family);
    let Some(profile) = forwarder.store().snapshot().profile(&name).cloned() else {
        return Err(HttpError::NotFound(format!("configuration '{name}' not found")));
    };

    let report = if profile.api_key.is_none() && profile.auth_token.is_none() {
        crate::state::TestReport::skipped("No API credentials configured.")
    } else {
        state.tester.test(family, &profile).await
    };

    state.store_test_result(family, &name, report.clone());
    Ok(Json(serde_json::to_value(report).map_err(|e| {
        HttpError::InternalServerError(format!("failed to serialise report: {e}"))
    })?))
}
