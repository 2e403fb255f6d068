//! JSON-over-HTTP surface for the pipeline.
//!
//! Handlers are thin: they deserialize, call the orchestrator or the
//! configuration manager, and map errors to status codes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::health::HealthState;
use crate::orchestrator::{PipelineOrchestrator, ProcessRequest};

/// Actor recorded in configuration metadata when the caller names none.
const DEFAULT_ACTOR: &str = "api";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<PipelineOrchestrator>,
}

/// Build the router with every pipeline route.
pub fn router(orchestrator: Arc<PipelineOrchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/api/messages", post(process_message))
        .route("/api/messages/batch", post(process_batch))
        .route("/api/health", get(health))
        .route("/api/metrics", get(metrics))
        .route(
            "/api/tenants/{id}/config",
            get(get_tenant_config).put(put_tenant_config),
        )
        .route("/api/tenants/{id}/enabled", put(put_tenant_enabled))
        .route("/api/tenants/{id}/history", get(get_tenant_history))
        .route("/api/tenants/{id}/rollback", post(rollback_tenant))
        .route("/api/config/export", get(export_config))
        .route("/api/config/import", post(import_config))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn default_actor() -> String {
    DEFAULT_ACTOR.to_string()
}

fn error_body(status: StatusCode, errors: Vec<String>) -> Response {
    (status, Json(json!({ "errors": errors }))).into_response()
}

fn configuration_error(err: ConfigurationError) -> Response {
    let status = match err {
        ConfigurationError::TenantNotFound { .. } | ConfigurationError::VersionNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        ConfigurationError::Validation(_) | ConfigurationError::Parse(_) => {
            StatusCode::BAD_REQUEST
        }
    };
    error_body(status, err.messages())
}

// ── Messages ────────────────────────────────────────────────────────

async fn process_message(
    State(state): State<ApiState>,
    Json(request): Json<ProcessRequest>,
) -> Response {
    let outcome = state.orchestrator.process_conversation_message(request).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(outcome)).into_response()
}

async fn process_batch(
    State(state): State<ApiState>,
    Json(requests): Json<Vec<ProcessRequest>>,
) -> impl IntoResponse {
    debug!(count = requests.len(), "Batch request");
    Json(state.orchestrator.process_batch(requests).await)
}

// ── Health and metrics ──────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> Response {
    let health = state.orchestrator.health().await;
    let status = if health.state == HealthState::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health)).into_response()
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.metrics().await)
}

// ── Tenant configuration ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConfigPatch {
    settings: Value,
    #[serde(default = "default_actor")]
    updated_by: String,
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
    #[serde(default = "default_actor")]
    updated_by: String,
}

#[derive(Debug, Deserialize)]
struct RollbackBody {
    version: u64,
    #[serde(default = "default_actor")]
    updated_by: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImportQuery {
    #[serde(default)]
    overwrite: bool,
    #[serde(default = "default_actor")]
    updated_by: String,
}

async fn get_tenant_config(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.tenants().get_configuration(&id).await {
        Some(configuration) => Json(configuration).into_response(),
        None => configuration_error(ConfigurationError::TenantNotFound { tenant_id: id }),
    }
}

async fn put_tenant_config(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ConfigPatch>,
) -> Response {
    match state
        .orchestrator
        .tenants()
        .set_configuration(&id, &body.settings, &body.updated_by)
        .await
    {
        Ok(update) => Json(update).into_response(),
        Err(err) => configuration_error(err),
    }
}

async fn put_tenant_enabled(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<EnabledBody>,
) -> Response {
    match state
        .orchestrator
        .tenants()
        .set_tenant_enabled(&id, body.enabled, &body.updated_by)
        .await
    {
        Ok(configuration) => Json(configuration).into_response(),
        Err(err) => configuration_error(err),
    }
}

async fn get_tenant_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state
        .orchestrator
        .tenants()
        .get_configuration_history(&id, query.limit)
        .await
    {
        Ok(history) => Json(history).into_response(),
        Err(err) => configuration_error(err),
    }
}

async fn rollback_tenant(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> Response {
    match state
        .orchestrator
        .tenants()
        .rollback_configuration(&id, body.version, &body.updated_by)
        .await
    {
        Ok(configuration) => Json(configuration).into_response(),
        Err(err) => configuration_error(err),
    }
}

async fn export_config(
    State(state): State<ApiState>,
    Query(query): Query<ExportQuery>,
) -> Response {
    match state
        .orchestrator
        .tenants()
        .export_configuration(query.tenant_id.as_deref())
        .await
    {
        Ok(document) => ([(header::CONTENT_TYPE, "application/json")], document).into_response(),
        Err(err) => configuration_error(err),
    }
}

async fn import_config(
    State(state): State<ApiState>,
    Query(query): Query<ImportQuery>,
    body: String,
) -> Response {
    match state
        .orchestrator
        .tenants()
        .import_configuration(&body, &query.updated_by, query.overwrite)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(err) => configuration_error(err),
    }
}
