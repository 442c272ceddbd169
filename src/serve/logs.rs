//! Per-item log endpoint. Unlike artifact routes, this serves every status
//! so in-flight jobs can be watched.

use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};

use crate::catalog::ArchiveType;

use super::{ApiError, AppState};

/// `GET /logs/{shortid}/{type}` → current status and accumulated logs.
pub async fn item_logs(
    State(state): State<AppState>,
    Path((short_id, kind)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let kind = ArchiveType::parse(&kind).ok_or(ApiError::NotFound)?;
    let capture = state
        .catalog
        .capture_by_short_id(&short_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let (status, logs) = state
        .catalog
        .item_logs(capture.id, kind)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(json!({
        "type": kind.as_str(),
        "status": status.as_str(),
        "logs": logs,
    })))
}
