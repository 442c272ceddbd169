//! Artifact streaming: typed downloads and on-the-fly MHTML→HTML.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::catalog::{ArchiveItem, ArchiveType, Capture, ItemStatus};
use crate::mhtml;
use crate::storage::Storage;

use super::{ApiError, AppState};

/// `GET /{shortid}/{type}` and `GET /archive/{shortid}/{type}`.
///
/// Streams the decompressed artifact with strong caching headers. Honors
/// `If-None-Match` and single byte ranges.
pub async fn download(
    State(state): State<AppState>,
    Path((short_id, kind)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let kind = ArchiveType::parse(&kind).ok_or(ApiError::NotFound)?;
    let (capture, item) = completed_item(&state, &short_id, kind).await?;

    let etag = format!("\"{}-{}\"", item.storage_key, item.file_size);
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|candidates| candidates.split(',').any(|c| c.trim() == etag))
    {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag)
            .body(Body::empty())
            .map_err(|e| ApiError::Internal(e.to_string()));
    }

    let total = state.storage.uncompressed_size(&item.storage_key).await?;
    let content_type = content_type_for(kind, &item.extension);

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ETAG, etag)
        .header(header::ACCEPT_RANGES, "bytes");

    if is_attachment(kind) {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"",
                download_filename(&capture, &item)
            ),
        );
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, total));

    let mut reader = state.storage.seekable_reader(&item.storage_key).await?;

    let response = match range {
        Some((start, end)) => {
            reader
                .seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let len = end - start + 1;
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, len)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )
                .body(Body::from_stream(ReaderStream::new(reader.take(len))))
        }
        None => builder
            .header(header::CONTENT_LENGTH, total)
            .body(Body::from_stream(ReaderStream::new(reader))),
    };

    response.map_err(|e| ApiError::Internal(e.to_string()))
}

/// `GET /archive/{shortid}/mhtml/html`: stream-decompress the stored MHTML
/// and materialize it as one self-contained HTML document.
pub async fn mhtml_as_html(
    State(state): State<AppState>,
    Path(short_id): Path<String>,
) -> Result<Response, ApiError> {
    let (_, item) = completed_item(&state, &short_id, ArchiveType::Mhtml).await?;

    // The converter needs two passes; storage readers are cheap to open.
    let first = BufReader::new(state.storage.reader(&item.storage_key).await?);
    let second = BufReader::new(state.storage.reader(&item.storage_key).await?);

    let (writer, reader) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let mut writer = writer;
        if let Err(e) = mhtml::mhtml_to_html(first, second, &mut writer).await {
            // Headers are committed; dropping the writer aborts the
            // connection mid-stream.
            warn!("MHTML conversion failed mid-stream: {e}");
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Resolves a completed item or 404s; only completed artifacts are served.
pub async fn completed_item(
    state: &AppState,
    short_id: &str,
    kind: ArchiveType,
) -> Result<(Capture, ArchiveItem), ApiError> {
    let capture = state
        .catalog
        .capture_by_short_id(short_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let item = state
        .catalog
        .item(capture.id, kind)
        .await?
        .ok_or(ApiError::NotFound)?;
    if item.status != ItemStatus::Completed || item.storage_key.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok((capture, item))
}

fn content_type_for(kind: ArchiveType, extension: &str) -> &'static str {
    match kind {
        ArchiveType::Mhtml => "multipart/related",
        ArchiveType::Screenshot => {
            if extension == ".jpg" {
                "image/jpeg"
            } else {
                "image/webp"
            }
        }
        ArchiveType::Git => "application/x-tar",
        ArchiveType::Youtube => "video/mp4",
    }
}

/// Screenshots render inline on the display page; everything else is a
/// download.
fn is_attachment(kind: ArchiveType) -> bool {
    !matches!(kind, ArchiveType::Screenshot)
}

/// `YYYY-MM-DD_sanitized-url.ext`
fn download_filename(capture: &Capture, item: &ArchiveItem) -> String {
    let date = capture.created_at.format("%Y-%m-%d");
    let bare = capture
        .original_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let mut sanitized = sanitize_filename::sanitize(bare.replace('/', "-"));
    sanitized.truncate(120);
    format!("{date}_{sanitized}{}", item.extension)
}

/// Single-range `bytes=a-b` parser; anything else falls back to a full
/// response.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let ranges = value.strip_prefix("bytes=")?;
    if ranges.contains(',') {
        return None;
    }
    let (start, end) = ranges.split_once('-')?;
    let range = match (start.trim(), end.trim()) {
        ("", suffix) => {
            let len: u64 = suffix.parse().ok()?;
            if len == 0 {
                return None;
            }
            (total.saturating_sub(len), total - 1)
        }
        (start, "") => (start.parse().ok()?, total - 1),
        (start, end) => (start.parse().ok()?, end.parse::<u64>().ok()?.min(total - 1)),
    };
    if range.0 > range.1 || range.0 >= total {
        return None;
    }
    Some(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=0-5000", 1000), Some((0, 999)));
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=5-2", 1000), None);
        assert_eq!(parse_range("bytes=0-1,5-9", 1000), None);
        assert_eq!(parse_range("items=0-1", 1000), None);
    }

    #[test]
    fn content_types_follow_item_kind_and_extension() {
        assert_eq!(content_type_for(ArchiveType::Mhtml, ".mhtml"), "multipart/related");
        assert_eq!(content_type_for(ArchiveType::Screenshot, ".webp"), "image/webp");
        assert_eq!(content_type_for(ArchiveType::Screenshot, ".jpg"), "image/jpeg");
        assert_eq!(content_type_for(ArchiveType::Git, ".tar"), "application/x-tar");
        assert_eq!(content_type_for(ArchiveType::Youtube, ".mp4"), "video/mp4");
    }

    #[test]
    fn filenames_are_dated_and_sanitized() {
        let capture = Capture {
            id: 1,
            archived_url_id: 1,
            short_id: "Ab3xY".into(),
            api_key_id: None,
            created_at: chrono::DateTime::parse_from_rfc3339("2026-03-05T10:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
            original_url: "https://example.com/some/page".into(),
        };
        let item = ArchiveItem {
            id: 1,
            capture_id: 1,
            kind: ArchiveType::Mhtml,
            status: ItemStatus::Completed,
            storage_key: "Ab3xY/mhtml.mhtml.zst".into(),
            extension: ".mhtml".into(),
            file_size: 10,
            logs: String::new(),
            retry_count: 1,
            created_at: capture.created_at,
        };
        let name = download_filename(&capture, &item);
        assert_eq!(name, "2026-03-05_example.com-some-page.mhtml");
    }
}
