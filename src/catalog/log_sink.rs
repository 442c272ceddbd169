//! Incremental per-item log writer.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use super::Catalog;

/// Appends job diagnostics to one item's catalog row, flushing on every
/// write so `/logs/{shortid}/{type}` shows progress in real time. Writes
/// are serialized by a per-item mutex; log failures are reported to the
/// process log but never fail the job.
#[derive(Clone)]
pub struct LogSink {
    catalog: Catalog,
    item_id: i64,
    guard: Arc<Mutex<()>>,
}

impl LogSink {
    pub fn new(catalog: Catalog, item_id: i64) -> Self {
        Self {
            catalog,
            item_id,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn item_id(&self) -> i64 {
        self.item_id
    }

    /// Appends one line (newline added) to the item's log.
    pub async fn line(&self, text: &str) {
        self.append(&format!("{text}\n")).await;
    }

    /// Appends raw text to the item's log.
    pub async fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let _serialized = self.guard.lock().await;
        if let Err(e) = self.catalog.append_log(self.item_id, text).await {
            warn!(item_id = self.item_id, error = %e, "failed to persist job log");
        }
    }
}
