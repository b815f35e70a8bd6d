//! LinkCache HTTP REST API
//!
//! Axum server fronting the sync orchestrator. Each endpoint is a thin axum
//! handler that delegates to an inner function returning `(StatusCode, Value)`,
//! so the request semantics can be tested without router dispatch.
//!
//! Endpoints:
//! - GET  /health                        health check with store size
//! - GET  /version                       server version info
//! - GET  /sessions/status?agentId=      poll remote status (also GET /sessions)
//! - GET  /sessions/:agent_id            poll remote detail, QR artifact included
//! - GET  /sessions/:agent_id/cached     cached view only, no remote call
//! - POST /sessions/:agent_id/reconnect  request a fresh handshake
//! - POST /sessions/reconnect            same, agent id in the JSON body
//! - POST /sessions                      create a remote session

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use linkcache_core::LinkCacheConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::subsystems::sync::{SyncError, SyncOrchestrator};

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub config: LinkCacheConfig,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/sessions", get(status_handler).post(create_handler))
        .route("/sessions/status", get(status_handler))
        .route("/sessions/reconnect", post(reconnect_body_handler))
        .route("/sessions/:agent_id", get(detail_handler))
        .route("/sessions/:agent_id/cached", get(cached_handler))
        .route("/sessions/:agent_id/reconnect", post(reconnect_path_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    orchestrator: Arc<SyncOrchestrator>,
    config: LinkCacheConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = Arc::new(HttpState {
        orchestrator,
        config,
    });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("LinkCache HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

/// Agent id under any of its accepted spellings. Each spelling is its own
/// field so a query carrying several of them still deserializes.
#[derive(Debug, Deserialize, Default)]
pub struct AgentQuery {
    #[serde(rename = "agentId")]
    pub agent_id_camel: Option<String>,
    pub agent_id: Option<String>,
    pub agent: Option<String>,
}

impl AgentQuery {
    pub fn for_agent(agent_id: &str) -> Self {
        Self {
            agent_id_camel: Some(agent_id.to_string()),
            ..Default::default()
        }
    }

    /// First non-blank spelling, in `agentId`, `agent_id`, `agent` order.
    pub fn agent_id(&self) -> Option<&str> {
        [&self.agent_id_camel, &self.agent_id, &self.agent]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .find(|v| !v.trim().is_empty())
    }
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub fn health_inner(orchestrator: &SyncOrchestrator, config: &LinkCacheConfig) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "stored": orchestrator.store().len(),
            "backend": orchestrator.backend_url(),
            "max_entry_age_seconds": config.store.max_entry_age_seconds,
            "sweep_interval_seconds": config.store.sweep_interval_seconds,
        }),
    )
}

pub fn version_inner() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "linkcache/1",
    })
}

pub async fn status_inner(
    orchestrator: &SyncOrchestrator,
    query: AgentQuery,
) -> (StatusCode, Value) {
    respond(orchestrator.poll_status(query.agent_id()).await)
}

pub fn cached_inner(orchestrator: &SyncOrchestrator, agent_id: &str) -> (StatusCode, Value) {
    respond(orchestrator.cached(Some(agent_id)))
}

pub async fn detail_inner(orchestrator: &SyncOrchestrator, agent_id: &str) -> (StatusCode, Value) {
    respond(orchestrator.session_detail(Some(agent_id)).await)
}

pub async fn reconnect_inner(
    orchestrator: &SyncOrchestrator,
    agent_id: Option<&str>,
) -> (StatusCode, Value) {
    respond(orchestrator.reconnect(agent_id).await)
}

/// Create needs a JSON object body; anything else is a caller error.
pub async fn create_inner(orchestrator: &SyncOrchestrator, body: &[u8]) -> (StatusCode, Value) {
    match serde_json::from_slice::<Value>(body) {
        Ok(payload) if payload.is_object() => respond(orchestrator.create_session(&payload).await),
        _ => respond(Err(SyncError::Validation(
            "Request body must be a JSON object".to_string(),
        ))),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.orchestrator, &state.config);
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn status_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<AgentQuery>,
) -> impl IntoResponse {
    let (status, body) = status_inner(&state.orchestrator, query).await;
    (status, Json(body))
}

pub async fn detail_handler(
    State(state): State<Arc<HttpState>>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = detail_inner(&state.orchestrator, &agent_id).await;
    (status, Json(body))
}

pub async fn cached_handler(
    State(state): State<Arc<HttpState>>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = cached_inner(&state.orchestrator, &agent_id);
    (status, Json(body))
}

pub async fn reconnect_path_handler(
    State(state): State<Arc<HttpState>>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = reconnect_inner(&state.orchestrator, Some(&agent_id)).await;
    (status, Json(body))
}

pub async fn reconnect_body_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<AgentQuery>,
    body: Bytes,
) -> impl IntoResponse {
    let agent_id = agent_id_from_body(&body).or_else(|| query.agent_id().map(str::to_string));
    let (status, body) = reconnect_inner(&state.orchestrator, agent_id.as_deref()).await;
    (status, Json(body))
}

pub async fn create_handler(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> impl IntoResponse {
    let (status, body) = create_inner(&state.orchestrator, &body).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

/// Map an orchestrator result onto the HTTP status and document.
pub fn respond(result: std::result::Result<Value, SyncError>) -> (StatusCode, Value) {
    match result {
        Ok(doc) => (StatusCode::OK, doc),
        Err(e) => (e.status_code(), e.to_document()),
    }
}

/// Lenient body lookup; a missing or malformed body just yields nothing.
pub fn agent_id_from_body(body: &[u8]) -> Option<String> {
    let payload: Value = serde_json::from_slice(body).ok()?;
    ["agentId", "agent_id", "agent"]
        .iter()
        .find_map(|key| match payload.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
