//! HTTP serving edge.
//!
//! Everything consults the catalog first; artifacts stream out of storage
//! through the decompressing reader, never via an in-memory copy. Handlers
//! that hit storage or decode failures after headers are committed close
//! the connection instead of retrying.

mod api;
mod artifact;
mod display;
mod git_http;
mod logs;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::catalog::{Catalog, CatalogError};
use crate::pipeline::{Pipeline, PipelineError, ValidationError};
use crate::storage::StorageError;
use crate::worker::ArtifactStore;

/// Shared handler state, constructed once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub storage: Arc<ArtifactStore>,
    pub pipeline: Arc<Pipeline>,
    /// Root of the unpacked-git cache trees.
    pub cache_path: PathBuf,
    /// Per-short-id unpack locks; readers skip locking once the tree
    /// exists.
    pub git_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    pub fn new(
        catalog: Catalog,
        storage: Arc<ArtifactStore>,
        pipeline: Arc<Pipeline>,
        cache_path: PathBuf,
    ) -> Self {
        Self {
            catalog,
            storage,
            pipeline,
            cache_path,
            git_locks: Arc::new(DashMap::new()),
        }
    }
}

/// Error type all handlers funnel into; maps the error taxonomy onto HTTP
/// statuses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Internal(message) => {
                error!("internal error: {message}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { .. } => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(v) => ApiError::BadRequest(v.to_string()),
            PipelineError::Catalog(c) => c.into(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

/// Builds the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/archive", post(api::create_archive))
        .route("/api/v1/past-archives", get(api::past_archives))
        .route("/api/v1/retry-failed", post(api::retry_failed))
        .route("/archive/:short_id/mhtml/html", get(artifact::mhtml_as_html))
        .route("/archive/:short_id/:kind", get(artifact::download))
        .route("/git/:short_id/*rest", any(git_http::backend))
        .route("/logs/:short_id/:kind", get(logs::item_logs))
        .route("/:short_id", get(display::page))
        .route("/:short_id/:kind", get(artifact::download))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// DB ping.
async fn health(State(state): State<AppState>) -> Response {
    match state.catalog.ping().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => {
            error!("health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded" })),
            )
                .into_response()
        }
    }
}
