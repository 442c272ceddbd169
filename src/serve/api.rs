//! Authenticated JSON API.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::catalog::ArchiveType;

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    url: String,
    #[serde(default)]
    types: Option<Vec<String>>,
}

/// `POST /api/v1/archive` with `{"url": ..., "types": [...]?}`.
pub async fn create_archive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ArchiveRequest>,
) -> Result<Response, ApiError> {
    let api_key_id = authorize(&state, &headers).await?;

    let types = request
        .types
        .map(|names| {
            names
                .iter()
                .map(|name| {
                    ArchiveType::parse(name)
                        .ok_or_else(|| ApiError::BadRequest(format!("unknown archive type {name:?}")))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    let capture = state
        .pipeline
        .queue_capture(&request.url, types, Some(api_key_id))
        .await?;

    let display_url = format!("{}/{}", request_origin(&headers), capture.short_id);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "url": display_url, "short_id": capture.short_id })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct PastArchivesQuery {
    url: String,
}

/// `GET /api/v1/past-archives?url=...`
pub async fn past_archives(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PastArchivesQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers).await?;

    let archives = state.catalog.past_archives(&query.url).await?;
    let body: Vec<_> = archives
        .into_iter()
        .map(|(capture, items)| {
            json!({
                "short_id": capture.short_id,
                "timestamp": capture.created_at.to_rfc3339(),
                "items": items
                    .iter()
                    .map(|item| json!({
                        "type": item.kind.as_str(),
                        "status": item.status.as_str(),
                    }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(Json(json!({ "archives": body })).into_response())
}

/// `POST /api/v1/retry-failed`: operator bulk retry. Resets every failed
/// item to pending with a fresh retry budget and re-enqueues it.
pub async fn retry_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers).await?;
    let count = state.pipeline.retry_failed().await?;
    Ok(Json(json!({ "retried": count })).into_response())
}

/// Accepts `Authorization: Bearer <key>` or `X-API-Key: <key>`.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<i64, ApiError> {
    let key = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .ok_or(ApiError::Unauthorized)?;

    state
        .catalog
        .find_api_key(key.trim())
        .await?
        .ok_or(ApiError::Unauthorized)
}

/// Scheme + host for the returned display URL, trusting forwarding proxies
/// when present.
fn request_origin(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}
