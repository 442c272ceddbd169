//! Git-over-HTTP bridge.
//!
//! Archived repositories are stored as tars of a bare mirror. On first
//! access the tar is streamed out of storage (decompressing on the way)
//! and unpacked into `{cache_path}/{shortid}`; requests are then handed to
//! `git http-backend` as a CGI child with the request body and response
//! streamed through untouched. The unpack is guarded by a per-short-id
//! mutex so concurrent clones trigger exactly one extraction; readers skip
//! the lock once the tree exists.

use std::process::Stdio;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, warn};

use crate::catalog::ArchiveType;
use crate::storage::Storage;

use super::artifact::completed_item;
use super::{ApiError, AppState};

/// `ANY /git/{shortid}/...`
pub async fn backend(
    State(state): State<AppState>,
    Path((short_id, rest)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let (_, item) = completed_item(&state, &short_id, ArchiveType::Git).await?;
    ensure_unpacked(&state, &short_id, &item.storage_key).await?;

    let mut cmd = Command::new("git");
    cmd.arg("http-backend")
        .env("GIT_PROJECT_ROOT", &state.cache_path)
        .env("GIT_HTTP_EXPORT_ALL", "true")
        .env("PATH_INFO", format!("/{short_id}/{rest}"))
        .env("QUERY_STRING", request.uri().query().unwrap_or_default())
        .env("REQUEST_METHOD", request.method().as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(content_type) = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        cmd.env("CONTENT_TYPE", content_type);
    }
    if let Some(content_length) = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
    {
        cmd.env("CONTENT_LENGTH", content_length);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ApiError::Internal(format!("failed to spawn git http-backend: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| ApiError::Internal("git http-backend stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ApiError::Internal("git http-backend stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ApiError::Internal("git http-backend stderr not captured".into()))?;

    // Request body streams into the CGI child concurrently with the
    // response read; closing stdin signals end of input.
    let mut body_stream = request.into_body().into_data_stream();
    tokio::spawn(async move {
        while let Some(chunk) = body_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if stdin.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = stdin.shutdown().await;
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("git http-backend: {line}");
        }
    });
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    // CGI response: header block, blank line, then the payload.
    let mut stdout = BufReader::new(stdout);
    let mut status = StatusCode::OK;
    let mut builder = Response::builder();
    loop {
        let mut line = String::new();
        let n = stdout
            .read_line(&mut line)
            .await
            .map_err(|e| ApiError::Internal(format!("CGI header read failed: {e}")))?;
        if n == 0 {
            return Err(ApiError::Internal("git http-backend closed early".into()));
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            warn!("ignoring malformed CGI header line: {line:?}");
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            if let Some(code) = value
                .split_whitespace()
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .and_then(|c| StatusCode::from_u16(c).ok())
            {
                status = code;
            }
        } else {
            builder = builder.header(name, value);
        }
    }

    builder
        .status(status)
        .body(Body::from_stream(ReaderStream::new(stdout)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Extracts the stored tar into the cache tree exactly once per short ID.
async fn ensure_unpacked(
    state: &AppState,
    short_id: &str,
    storage_key: &str,
) -> Result<(), ApiError> {
    let cache_dir = state.cache_path.join(short_id);
    if tokio::fs::try_exists(&cache_dir).await.unwrap_or(false) {
        return Ok(());
    }

    let lock = {
        let entry = state
            .git_locks
            .entry(short_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    };
    let _unpacking = lock.lock().await;

    // A concurrent request may have finished the unpack while this one
    // waited on the lock.
    if tokio::fs::try_exists(&cache_dir).await.unwrap_or(false) {
        return Ok(());
    }

    let reader = state.storage.reader(storage_key).await?;

    // Extract into a staging directory and rename, so a crash mid-unpack
    // never leaves a half-populated tree that later requests would trust.
    let staging = state.cache_path.join(format!(".unpack-{short_id}"));
    let _ = tokio::fs::remove_dir_all(&staging).await;
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to create staging dir: {e}")))?;

    let unpack_dir = staging.clone();
    tokio::task::spawn_blocking(move || {
        let mut archive = tar::Archive::new(SyncIoBridge::new(reader));
        archive.unpack(&unpack_dir)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("unpack task panicked: {e}")))?
    .map_err(|e| ApiError::Internal(format!("tar extraction failed: {e}")))?;

    tokio::fs::rename(&staging, &cache_dir)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to move unpacked tree: {e}")))?;

    debug!(short_id, "git cache tree unpacked");
    Ok(())
}
