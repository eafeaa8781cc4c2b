//! Collection server for testmon's remote sink.
//!
//! Keeps execution contexts, sessions and metrics in memory and speaks the
//! same protocol [`testmon_core::RemoteSink`] uses. Handy for local runs and
//! for exercising the remote path end to end.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::Mutex;

use testmon_core::{ContextCreated, ContextPayload, MetricPayload, SessionPayload};

/// A context as stored, with the identifier this server assigned.
struct StoredContext {
    id: String,
    payload: ContextPayload,
}

#[derive(Default)]
struct Collected {
    contexts: Vec<StoredContext>,
    sessions: Vec<SessionPayload>,
    metrics: Vec<MetricPayload>,
}

/// Shared server state.
#[derive(Default)]
struct AppState {
    data: Mutex<Collected>,
}

fn reject(status: StatusCode, msg: String) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": msg })))
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

fn context_json(ctx: &StoredContext) -> serde_json::Value {
    let mut value = serde_json::to_value(&ctx.payload).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("h".to_string(), serde_json::Value::String(ctx.id.clone()));
        obj.insert(
            "env_h".to_string(),
            serde_json::Value::String(ctx.payload.h.clone()),
        );
    }
    value
}

async fn handle_context_lookup(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Json<serde_json::Value> {
    let data = state.data.lock().await;
    let contexts: Vec<serde_json::Value> = data
        .contexts
        .iter()
        .filter(|c| c.payload.h == hash)
        .map(context_json)
        .collect();
    Json(serde_json::json!({ "contexts": contexts }))
}

async fn handle_context_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ContextPayload>,
) -> (StatusCode, Json<ContextCreated>) {
    let mut data = state.data.lock().await;
    if let Some(existing) = data.contexts.iter().find(|c| c.payload.h == payload.h) {
        return (
            StatusCode::CREATED,
            Json(ContextCreated {
                h: existing.id.clone(),
            }),
        );
    }
    let id = uuid::Uuid::new_v4().to_string();
    data.contexts.push(StoredContext {
        id: id.clone(),
        payload,
    });
    (StatusCode::CREATED, Json(ContextCreated { h: id }))
}

async fn handle_context_list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let data = state.data.lock().await;
    let contexts: Vec<serde_json::Value> = data.contexts.iter().map(context_json).collect();
    Json(serde_json::json!({ "contexts": contexts }))
}

// ---------------------------------------------------------------------------
// Sessions & metrics
// ---------------------------------------------------------------------------

async fn handle_session_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SessionPayload>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut data = state.data.lock().await;
    if data
        .sessions
        .iter()
        .any(|s| s.session_h == payload.session_h)
    {
        return reject(
            StatusCode::CONFLICT,
            format!("session {} already exists", payload.session_h),
        );
    }
    let body = serde_json::json!({ "session_h": payload.session_h });
    data.sessions.push(payload);
    (StatusCode::CREATED, Json(body))
}

async fn handle_session_list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let data = state.data.lock().await;
    Json(serde_json::json!({ "sessions": data.sessions }))
}

async fn handle_metric_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MetricPayload>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut data = state.data.lock().await;
    if !data.sessions.iter().any(|s| s.session_h == payload.session_h) {
        return reject(
            StatusCode::BAD_REQUEST,
            format!("unknown session {}", payload.session_h),
        );
    }
    if !data.contexts.iter().any(|c| c.id == payload.context_h) {
        return reject(
            StatusCode::BAD_REQUEST,
            format!("unknown context {}", payload.context_h),
        );
    }
    data.metrics.push(payload);
    (StatusCode::CREATED, Json(serde_json::json!({})))
}

#[derive(Deserialize)]
struct MetricFilter {
    session_h: Option<String>,
}

async fn handle_metric_list(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<MetricFilter>,
) -> Json<serde_json::Value> {
    let data = state.data.lock().await;
    let metrics: Vec<&MetricPayload> = data
        .metrics
        .iter()
        .filter(|m| {
            filter
                .session_h
                .as_ref()
                .is_none_or(|s| *s == m.session_h)
        })
        .collect();
    Json(serde_json::json!({ "metrics": metrics }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let data = state.data.lock().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": testmon_core::VERSION,
        "contexts": data.contexts.len(),
        "sessions": data.sessions.len(),
        "metrics": data.metrics.len(),
    }))
}

/// Build the axum router over a fresh, empty store.
pub fn build_router() -> Router {
    let state = Arc::new(AppState::default());

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/contexts/",
            post(handle_context_create).get(handle_context_list),
        )
        .route("/contexts/{hash}", get(handle_context_lookup))
        .route(
            "/sessions/",
            post(handle_session_create).get(handle_session_list),
        )
        .route(
            "/metrics/",
            post(handle_metric_create).get(handle_metric_list),
        )
        .with_state(state)
}

/// Serve the collector on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener) -> std::io::Result<()> {
    axum::serve(listener, build_router()).await
}

/// Run the collection server.
pub async fn run_server(host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve(listener).await
}
