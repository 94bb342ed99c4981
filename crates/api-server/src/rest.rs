//! REST handlers for the control API. Every command returns the
//! `{ "success": bool, ... }` envelope; destructive commands carry the
//! confirmation-token discipline of the kill-switch layer.

use crate::state::{
    ControlPlane, CreateFlagRequest, FlagUpdateRequest, MigrationRequest,
};
use axum::extract::{Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use ledgerpilot_core::types::TenantId;
use ledgerpilot_core::ControlPlaneError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;
use uuid::Uuid;

/// Shared state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok(data: serde_json::Value) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

fn fail(err: ControlPlaneError) -> ApiError {
    let status = match err {
        ControlPlaneError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlPlaneError::Validation(_) => StatusCode::BAD_REQUEST,
        ControlPlaneError::InvalidTransition(_) => StatusCode::CONFLICT,
        ControlPlaneError::ConfirmationRequired(_) => StatusCode::FORBIDDEN,
        ControlPlaneError::WriteDenied(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "success": false, "error": err.to_string() })))
}

fn serialize(data: impl serde::Serialize) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(data).map_err(|e| fail(ControlPlaneError::Serialization(e)))
}

/// Bearer-token check applied to every control route except the probes.
pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == state.plane.config.api.auth_token)
        .unwrap_or(false);

    if !authorized {
        warn!(path = %request.uri().path(), "Rejected unauthenticated control request");
        metrics::counter!("api.auth_failures").increment(1);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "invalid or missing bearer token" })),
        )
            .into_response();
    }
    next.run(request).await
}

fn actor_or_default(actor: &Option<String>) -> &str {
    actor.as_deref().unwrap_or("operator")
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub flag: String,
    pub actor: Option<String>,
}

/// POST /deploy — start the canary rollout of a flag.
pub async fn deploy(State(state): State<AppState>, Json(req): Json<DeployRequest>) -> ApiResult {
    let flag = state
        .plane
        .deploy(&req.flag, actor_or_default(&req.actor))
        .map_err(fail)?;
    Ok(ok(serialize(flag)?))
}

/// POST /flags — create a flag.
pub async fn create_flag(
    State(state): State<AppState>,
    Json(req): Json<CreateFlagRequest>,
) -> ApiResult {
    let flag = state.plane.create_flag(req).map_err(fail)?;
    Ok(ok(serialize(flag)?))
}

#[derive(Debug, Deserialize)]
pub struct FlagUpdateBody {
    #[serde(flatten)]
    pub update: FlagUpdateRequest,
    pub actor: Option<String>,
}

/// PUT /flags/{name} — resume or disable a flag.
pub async fn update_flag(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<FlagUpdateBody>,
) -> ApiResult {
    let flag = state
        .plane
        .update_flag(&name, body.update, actor_or_default(&body.actor))
        .map_err(fail)?;
    Ok(ok(serialize(flag)?))
}

#[derive(Debug, Deserialize)]
pub struct MigrationBody {
    #[serde(flatten)]
    pub migration: MigrationRequest,
    pub actor: Option<String>,
}

/// POST /migrations — register (and by default run) a migration.
pub async fn run_migration(
    State(state): State<AppState>,
    Json(body): Json<MigrationBody>,
) -> ApiResult {
    let migration = state
        .plane
        .run_migration(body.migration, actor_or_default(&body.actor))
        .await
        .map_err(fail)?;
    Ok(ok(serialize(migration)?))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub migration_id: Uuid,
    pub actor: Option<String>,
}

/// POST /rollback — run a migration's paired rollback script.
pub async fn rollback(
    State(state): State<AppState>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult {
    let migration = state
        .plane
        .rollback_migration(req.migration_id, actor_or_default(&req.actor))
        .await
        .map_err(fail)?;
    Ok(ok(serialize(migration)?))
}

#[derive(Debug, Deserialize)]
pub struct EmergencyStopRequest {
    pub reason: String,
    pub confirmation: Option<String>,
    pub actor: Option<String>,
}

/// POST /emergency-stop — arm the emergency-stop kill switch. Rejected
/// without the confirmation token.
pub async fn emergency_stop(
    State(state): State<AppState>,
    Json(req): Json<EmergencyStopRequest>,
) -> ApiResult {
    let record = state
        .plane
        .emergency_stop(
            actor_or_default(&req.actor),
            &req.reason,
            req.confirmation.as_deref(),
        )
        .map_err(fail)?;
    Ok(ok(serialize(record)?))
}

#[derive(Debug, Deserialize)]
pub struct FreezeRequest {
    pub tenant_id: TenantId,
    pub reason: String,
    pub actor: Option<String>,
}

/// POST /freeze — freeze a tenant's writes.
pub async fn freeze(State(state): State<AppState>, Json(req): Json<FreezeRequest>) -> ApiResult {
    let record = state
        .plane
        .freeze_tenant(req.tenant_id, &req.reason, actor_or_default(&req.actor))
        .map_err(fail)?;
    Ok(ok(serialize(record)?))
}

#[derive(Debug, Deserialize)]
pub struct UnfreezeRequest {
    pub tenant_id: TenantId,
    pub actor: Option<String>,
}

/// POST /unfreeze — unfreeze a tenant. Refused while any integrity check
/// still fails for it.
pub async fn unfreeze(
    State(state): State<AppState>,
    Json(req): Json<UnfreezeRequest>,
) -> ApiResult {
    state
        .plane
        .unfreeze_tenant(req.tenant_id, actor_or_default(&req.actor))
        .await
        .map_err(fail)?;
    Ok(ok(json!({ "tenant_id": req.tenant_id })))
}

/// GET /status — compact component summary.
pub async fn status(State(state): State<AppState>) -> ApiResult {
    Ok(ok(serialize(state.plane.status())?))
}

/// GET /dashboard — the full aggregated snapshot.
pub async fn dashboard(State(state): State<AppState>) -> ApiResult {
    Ok(ok(serialize(state.plane.snapshot())?))
}

/// GET /audit — recent audit entries plus chain verification.
pub async fn audit_log(State(state): State<AppState>) -> ApiResult {
    Ok(ok(json!({
        "entries": serialize(state.plane.recent_audit(100))?,
        "verification": serialize(state.plane.audit.verify_chain())?,
    })))
}

/// GET /dashboard/stream — pushes the aggregated snapshot to subscribers on
/// every publish tick. Lagged subscribers skip missed snapshots.
pub async fn dashboard_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.plane.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(snapshot) => Some(Event::default().event("snapshot").json_data(&snapshot)),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /health — liveness of the API process itself.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /ready — ready once at least one metrics snapshot exists.
pub async fn readiness(State(state): State<AppState>) -> Response {
    if state.plane.collector.latest().is_some() {
        (StatusCode::OK, Json(json!({ "ready": true }))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ready": false }))).into_response()
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
