use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::hub::BroadcastHub;
use crate::metadata::{format_timestamp, ResolvedMetadata};
use crate::publisher::{PushStatus, PushStatusMap};
use crate::supervisor::PipelineHealth;

/// Shared state for the HTTP handlers; everything is read-only snapshots
pub struct AppState {
    pub hub: BroadcastHub,
    pub metadata: watch::Receiver<ResolvedMetadata>,
    pub health: watch::Receiver<PipelineHealth>,
    pub push_status: PushStatusMap,
    pub session_id: String,
}

pub fn router(state: Arc<AppState>, stream_path: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(stream_path, get(stream_handler))
        .route("/metadata", get(metadata_handler))
        .route("/health", get(health_handler))
        .route("/health/pipeline", get(pipeline_health_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until `shutdown` is cancelled
pub async fn serve(
    state: Arc<AppState>,
    bind: &str,
    port: u16,
    stream_path: &str,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;

    println!("Listening on: http://{}", addr);
    println!("Endpoints:");
    println!("  GET {}  - Live audio stream", stream_path);
    println!("  GET /metadata  - Current program metadata");
    println!("  GET /health  - Health check");
    println!("  GET /health/pipeline  - Transcoder status");

    axum::serve(listener, router(state, stream_path))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn stream_handler(State(state): State<Arc<AppState>>) -> Response {
    let subscription = state.hub.subscribe();
    log::info!(
        "Listener connected ({} listening)",
        state.hub.listener_count()
    );

    // disconnect drops the body stream, which drops the subscription
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(subscription.into_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Serialize)]
struct MetadataResponse {
    #[serde(flatten)]
    metadata: ResolvedMetadata,
    listeners: usize,
    session_id: String,
    server_time: String,
}

async fn metadata_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metadata = state.metadata.borrow().clone();
    Json(MetadataResponse {
        metadata,
        listeners: state.hub.listener_count(),
        session_id: state.session_id.clone(),
        server_time: format_timestamp(chrono::Utc::now()),
    })
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Debug, Serialize)]
struct PipelineHealthResponse {
    #[serde(flatten)]
    pipeline: PipelineHealth,
    listeners: usize,
    mounts: BTreeMap<String, PushStatus>,
}

async fn pipeline_health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pipeline = state.health.borrow().clone();
    let status = if pipeline.phase.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let mounts = state
        .push_status
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();

    (
        status,
        Json(PipelineHealthResponse {
            pipeline,
            listeners: state.hub.listener_count(),
            mounts,
        }),
    )
}
