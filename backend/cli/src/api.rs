use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use chatdigest_core::{ClearAck, DigestError, ServerSummaryResponse};
use chatdigest_logging::redact_sensitive_data;
use chatdigest_pipeline::{SyncOrchestrator, SyncState};

use crate::auth::RequireAdmin;

/// Shared application state for API handlers.
pub struct AppState {
    pub orchestrator: SyncOrchestrator,
    pub admin_token: Option<String>,
}

/// Build the Axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/summarize/:server_id", get(summarize))
        .route("/api/sync/:server_id", get(force_sync).post(force_sync))
        .route("/api/clear-cache/:server_id", post(clear_cache))
        .route("/api/sync-status/:server_id", get(sync_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// CORS for the dashboard origins. Unparseable origins are skipped.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Orchestrator failure rendered as a 500 with a redacted message.
pub struct ApiError(DigestError);

impl From<DigestError> for ApiError {
    fn from(e: DigestError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = redact_sensitive_data(&format!("{:#}", anyhow::Error::from(self.0)));
        tracing::error!(error = %message, "Request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": message })),
        )
            .into_response()
    }
}

/// Health check endpoint.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "chatdigest",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn summarize(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerSummaryResponse>, ApiError> {
    Ok(Json(state.orchestrator.get_summaries(&server_id).await?))
}

async fn force_sync(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerSummaryResponse>, ApiError> {
    Ok(Json(state.orchestrator.force_sync(&server_id).await?))
}

async fn clear_cache(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<ClearAck>, ApiError> {
    Ok(Json(state.orchestrator.clear_cache(&server_id).await?))
}

async fn sync_status(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<SyncState>, (StatusCode, Json<Value>)> {
    state.orchestrator.sync_state(&server_id).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no sync recorded for server {server_id}") })),
        )
    })
}
