//! Postgres-backed catalog of archived URLs, captures and archive items.
//!
//! The catalog is the durable record every other component observes: a
//! status or storage-key mutation is committed here before the next stage
//! can see it. Ownership is strict and acyclic (URL → Capture → Item, both
//! edges cascade on delete).

mod log_sink;

pub use log_sink::LogSink;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::debug;

/// Idempotent schema, applied at startup.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS archived_urls (
    id BIGSERIAL PRIMARY KEY,
    original TEXT NOT NULL UNIQUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS captures (
    id BIGSERIAL PRIMARY KEY,
    archived_url_id BIGINT NOT NULL REFERENCES archived_urls(id) ON DELETE CASCADE,
    short_id TEXT NOT NULL UNIQUE,
    api_key_id BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_captures_archived_url ON captures(archived_url_id);

CREATE TABLE IF NOT EXISTS archive_items (
    id BIGSERIAL PRIMARY KEY,
    capture_id BIGINT NOT NULL REFERENCES captures(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    storage_key TEXT NOT NULL DEFAULT '',
    extension TEXT NOT NULL DEFAULT '',
    file_size BIGINT NOT NULL DEFAULT 0,
    logs TEXT NOT NULL DEFAULT '',
    retry_count INT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE(capture_id, kind)
);

CREATE INDEX IF NOT EXISTS idx_archive_items_status ON archive_items(status);

CREATE TABLE IF NOT EXISTS api_keys (
    id BIGSERIAL PRIMARY KEY,
    key TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Short IDs are 5 characters of base62, generated uniformly at random and
/// re-rolled on collision against the captures index.
pub const SHORT_ID_LEN: usize = 5;

const SHORT_ID_ALPHABET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Upper bound on short-id collision re-rolls before giving up. At 62^5
/// possible IDs this only trips when the instance is effectively full.
const SHORT_ID_MAX_ATTEMPTS: usize = 32;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("short id generation kept colliding; id space is effectively full")]
    ShortIdExhausted,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// The four capture strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    Mhtml,
    Screenshot,
    Git,
    Youtube,
}

impl ArchiveType {
    pub const ALL: [ArchiveType; 4] = [
        ArchiveType::Mhtml,
        ArchiveType::Screenshot,
        ArchiveType::Git,
        ArchiveType::Youtube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveType::Mhtml => "mhtml",
            ArchiveType::Screenshot => "screenshot",
            ArchiveType::Git => "git",
            ArchiveType::Youtube => "youtube",
        }
    }

    /// Parses an archive type from its URL segment. `web` is the public
    /// alias for `mhtml`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mhtml" | "web" => Some(ArchiveType::Mhtml),
            "screenshot" => Some(ArchiveType::Screenshot),
            "git" => Some(ArchiveType::Git),
            "youtube" => Some(ArchiveType::Youtube),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an archive item. Transitions run
/// `pending → processing → {completed, failed}`; `failed` may be reset to
/// `pending` by operator retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "processing" => Some(ItemStatus::Processing),
            "completed" => Some(ItemStatus::Completed),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Capture {
    pub id: i64,
    pub archived_url_id: i64,
    pub short_id: String,
    pub api_key_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Original URL, joined in for display and filenames.
    pub original_url: String,
}

#[derive(Debug, Clone)]
pub struct ArchiveItem {
    pub id: i64,
    pub capture_id: i64,
    pub kind: ArchiveType,
    pub status: ItemStatus,
    pub storage_key: String,
    pub extension: String,
    pub file_size: i64,
    pub logs: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Everything a worker needs to (re-)drive one item.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub item_id: i64,
    pub capture_id: i64,
    pub kind: ArchiveType,
    pub short_id: String,
    pub url: String,
}

/// Cloneable handle over the catalog pool.
#[derive(Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub async fn connect(db_url: &str) -> Result<Self, CatalogError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema. Safe to run on every startup.
    pub async fn migrate(&self) -> Result<(), CatalogError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), CatalogError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// One row per distinct original URL, created on first request.
    pub async fn upsert_archived_url(&self, original: &str) -> Result<i64, CatalogError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO archived_urls (original) VALUES ($1)
             ON CONFLICT (original) DO UPDATE SET original = EXCLUDED.original
             RETURNING id",
        )
        .bind(original)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Creates a capture with a fresh short ID, re-rolling on collision.
    pub async fn create_capture(
        &self,
        archived_url_id: i64,
        api_key_id: Option<i64>,
    ) -> Result<Capture, CatalogError> {
        for _ in 0..SHORT_ID_MAX_ATTEMPTS {
            let short_id = generate_short_id();
            let result = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
                "INSERT INTO captures (archived_url_id, short_id, api_key_id)
                 VALUES ($1, $2, $3)
                 RETURNING id, created_at",
            )
            .bind(archived_url_id)
            .bind(&short_id)
            .bind(api_key_id)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok((id, created_at)) => {
                    let (original_url,): (String,) =
                        sqlx::query_as("SELECT original FROM archived_urls WHERE id = $1")
                            .bind(archived_url_id)
                            .fetch_one(&self.pool)
                            .await?;
                    return Ok(Capture {
                        id,
                        archived_url_id,
                        short_id,
                        api_key_id,
                        created_at,
                        original_url,
                    });
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    debug!(short_id, "short id collision, re-rolling");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CatalogError::ShortIdExhausted)
    }

    /// Creates the item row for one (capture, type). The unique constraint
    /// makes this idempotent.
    pub async fn create_item(
        &self,
        capture_id: i64,
        kind: ArchiveType,
    ) -> Result<i64, CatalogError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO archive_items (capture_id, kind) VALUES ($1, $2)
             ON CONFLICT (capture_id, kind)
             DO UPDATE SET kind = EXCLUDED.kind
             RETURNING id",
        )
        .bind(capture_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn capture_by_short_id(
        &self,
        short_id: &str,
    ) -> Result<Option<Capture>, CatalogError> {
        let row = sqlx::query(
            "SELECT c.id, c.archived_url_id, c.short_id, c.api_key_id, c.created_at, u.original
             FROM captures c JOIN archived_urls u ON u.id = c.archived_url_id
             WHERE c.short_id = $1",
        )
        .bind(short_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Capture {
            id: row.get(0),
            archived_url_id: row.get(1),
            short_id: row.get(2),
            api_key_id: row.get(3),
            created_at: row.get(4),
            original_url: row.get(5),
        }))
    }

    pub async fn item(
        &self,
        capture_id: i64,
        kind: ArchiveType,
    ) -> Result<Option<ArchiveItem>, CatalogError> {
        let row = sqlx::query(
            "SELECT id, capture_id, kind, status, storage_key, extension, file_size, logs,
                    retry_count, created_at
             FROM archive_items WHERE capture_id = $1 AND kind = $2",
        )
        .bind(capture_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(item_from_row).transpose()
    }

    pub async fn items_for_capture(
        &self,
        capture_id: i64,
    ) -> Result<Vec<ArchiveItem>, CatalogError> {
        let rows = sqlx::query(
            "SELECT id, capture_id, kind, status, storage_key, extension, file_size, logs,
                    retry_count, created_at
             FROM archive_items WHERE capture_id = $1 ORDER BY id",
        )
        .bind(capture_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(item_from_row).collect()
    }

    /// Compare-and-swap transition into `processing`, bumping the retry
    /// counter. Returns false when another worker already advanced the item
    /// (or it reached a terminal state), which makes re-enqueues harmless.
    pub async fn try_begin_processing(
        &self,
        item_id: i64,
        seen_status: ItemStatus,
        seen_retry_count: i32,
    ) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "UPDATE archive_items
             SET status = 'processing', retry_count = retry_count + 1, updated_at = now()
             WHERE id = $1 AND status = $2 AND retry_count = $3 AND retry_count < 3",
        )
        .bind(item_id)
        .bind(seen_status.as_str())
        .bind(seen_retry_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn complete_item(
        &self,
        item_id: i64,
        storage_key: &str,
        extension: &str,
        file_size: i64,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE archive_items
             SET status = 'completed', storage_key = $2, extension = $3, file_size = $4,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(item_id)
        .bind(storage_key)
        .bind(extension)
        .bind(file_size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_item(&self, item_id: i64) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE archive_items SET status = 'failed', updated_at = now() WHERE id = $1",
        )
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Appends to the item's log. Serialized per item by [`LogSink`].
    pub async fn append_log(&self, item_id: i64, text: &str) -> Result<(), CatalogError> {
        sqlx::query("UPDATE archive_items SET logs = logs || $2 WHERE id = $1")
            .bind(item_id)
            .bind(text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn item_logs(
        &self,
        capture_id: i64,
        kind: ArchiveType,
    ) -> Result<Option<(ItemStatus, String)>, CatalogError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT status, logs FROM archive_items WHERE capture_id = $1 AND kind = $2",
        )
        .bind(capture_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(status, logs)| ItemStatus::parse(&status).map(|s| (s, logs))))
    }

    /// Items eligible for (re-)processing: pending or processing with retry
    /// budget left. Used by the startup resume scan and the periodic sweep.
    pub async fn resumable_items(&self) -> Result<Vec<PendingItem>, CatalogError> {
        let rows = sqlx::query(
            "SELECT i.id, i.capture_id, i.kind, c.short_id, u.original
             FROM archive_items i
             JOIN captures c ON c.id = i.capture_id
             JOIN archived_urls u ON u.id = c.archived_url_id
             WHERE i.status IN ('pending', 'processing') AND i.retry_count < 3
             ORDER BY i.id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let kind: String = row.get(2);
                Some(PendingItem {
                    item_id: row.get(0),
                    capture_id: row.get(1),
                    kind: ArchiveType::parse(&kind)?,
                    short_id: row.get(3),
                    url: row.get(4),
                })
            })
            .collect())
    }

    /// Pending items that have sat untouched for five minutes. These fell
    /// out of the in-memory queue (full queue or a crash) and are
    /// re-enqueued by the periodic sweep; fresh pending items are still in
    /// the queue and are left alone.
    pub async fn stale_pending_items(&self) -> Result<Vec<PendingItem>, CatalogError> {
        let rows = sqlx::query(
            "SELECT i.id, i.capture_id, i.kind, c.short_id, u.original
             FROM archive_items i
             JOIN captures c ON c.id = i.capture_id
             JOIN archived_urls u ON u.id = c.archived_url_id
             WHERE i.status = 'pending' AND i.retry_count < 3
               AND i.updated_at < now() - interval '5 minutes'
             ORDER BY i.id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let kind: String = row.get(2);
                Some(PendingItem {
                    item_id: row.get(0),
                    capture_id: row.get(1),
                    kind: ArchiveType::parse(&kind)?,
                    short_id: row.get(3),
                    url: row.get(4),
                })
            })
            .collect())
    }

    /// Operator bulk retry: failed items go back to pending with a fresh
    /// retry budget. Returns the reset items for re-enqueueing.
    pub async fn reset_failed(&self) -> Result<Vec<PendingItem>, CatalogError> {
        let rows = sqlx::query(
            "UPDATE archive_items i
             SET status = 'pending', retry_count = 0, updated_at = now()
             FROM captures c, archived_urls u
             WHERE i.status = 'failed' AND c.id = i.capture_id AND u.id = c.archived_url_id
             RETURNING i.id, i.capture_id, i.kind, c.short_id, u.original",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let kind: String = row.get(2);
                Some(PendingItem {
                    item_id: row.get(0),
                    capture_id: row.get(1),
                    kind: ArchiveType::parse(&kind)?,
                    short_id: row.get(3),
                    url: row.get(4),
                })
            })
            .collect())
    }

    /// Queue position shown on the display page: pending items created
    /// before this one, plus one.
    pub async fn queue_position(&self, item_id: i64) -> Result<i64, CatalogError> {
        let (ahead,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM archive_items WHERE status = 'pending' AND id < $1",
        )
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ahead + 1)
    }

    /// Prior captures of a URL, newest first, with their items.
    pub async fn past_archives(
        &self,
        url: &str,
    ) -> Result<Vec<(Capture, Vec<ArchiveItem>)>, CatalogError> {
        let rows = sqlx::query(
            "SELECT c.id, c.archived_url_id, c.short_id, c.api_key_id, c.created_at, u.original
             FROM captures c JOIN archived_urls u ON u.id = c.archived_url_id
             WHERE u.original = $1
             ORDER BY c.created_at DESC",
        )
        .bind(url)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let capture = Capture {
                id: row.get(0),
                archived_url_id: row.get(1),
                short_id: row.get(2),
                api_key_id: row.get(3),
                created_at: row.get(4),
                original_url: row.get(5),
            };
            let items = self.items_for_capture(capture.id).await?;
            out.push((capture, items));
        }
        Ok(out)
    }

    /// Log-retention sweep: completed items older than 30 days lose their
    /// logs.
    pub async fn truncate_old_logs(&self) -> Result<u64, CatalogError> {
        let result = sqlx::query(
            "UPDATE archive_items
             SET logs = ''
             WHERE status = 'completed' AND logs <> ''
               AND updated_at < now() - interval '30 days'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// API-key check for the JSON API. Key CRUD lives outside the core.
    pub async fn find_api_key(&self, key: &str) -> Result<Option<i64>, CatalogError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM api_keys WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }
}

fn item_from_row(row: sqlx::postgres::PgRow) -> Result<ArchiveItem, CatalogError> {
    let kind: String = row.get(2);
    let status: String = row.get(3);
    Ok(ArchiveItem {
        id: row.get(0),
        capture_id: row.get(1),
        kind: ArchiveType::parse(&kind)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown archive type {kind:?}").into()))?,
        status: ItemStatus::parse(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown item status {status:?}").into()))?,
        storage_key: row.get(4),
        extension: row.get(5),
        file_size: row.get(6),
        logs: row.get(7),
        retry_count: row.get(8),
        created_at: row.get(9),
    })
}

/// Uniform random base62 short ID.
fn generate_short_id() -> String {
    let mut rng = rand::rng();
    (0..SHORT_ID_LEN)
        .map(|_| SHORT_ID_ALPHABET[rng.random_range(0..SHORT_ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_use_base62_alphabet() {
        for _ in 0..1000 {
            let id = generate_short_id();
            assert_eq!(id.len(), SHORT_ID_LEN);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn archive_type_parses_public_aliases() {
        assert_eq!(ArchiveType::parse("web"), Some(ArchiveType::Mhtml));
        assert_eq!(ArchiveType::parse("mhtml"), Some(ArchiveType::Mhtml));
        assert_eq!(ArchiveType::parse("screenshot"), Some(ArchiveType::Screenshot));
        assert_eq!(ArchiveType::parse("pdf"), None);
    }

    #[test]
    fn status_terminality() {
        assert!(ItemStatus::Completed.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(!ItemStatus::Processing.is_terminal());
    }
}
