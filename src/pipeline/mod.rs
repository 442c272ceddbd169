//! Capture pipeline: request in, catalog rows and queued jobs out.

pub mod classify;
pub mod validate;

pub use classify::archive_types_for;
pub use validate::{ValidationError, validate_url};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{ArchiveType, Capture, Catalog, CatalogError};
use crate::worker::{Job, JobQueue};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Accepts capture requests, assigns short IDs, creates catalog rows and
/// feeds the worker queue. Constructed once in `main`.
pub struct Pipeline {
    catalog: Catalog,
    jobs: JobQueue,
}

impl Pipeline {
    pub fn new(catalog: Catalog, jobs: JobQueue) -> Self {
        Self { catalog, jobs }
    }

    /// Validates the URL, creates one capture with one item per selected
    /// type, and enqueues the jobs. Items that do not fit the queue stay
    /// `pending` for the sweep.
    pub async fn queue_capture(
        &self,
        url: &str,
        requested_types: Option<Vec<ArchiveType>>,
        api_key_id: Option<i64>,
    ) -> Result<Capture, PipelineError> {
        let validated = validate_url(url).await?;
        let canonical = validated.to_string();

        let types = match requested_types {
            Some(requested) if !requested.is_empty() => {
                let mut deduped = Vec::new();
                for t in requested {
                    if !deduped.contains(&t) {
                        deduped.push(t);
                    }
                }
                deduped
            }
            _ => archive_types_for(&canonical),
        };

        let archived_url_id = self.catalog.upsert_archived_url(&canonical).await?;
        let capture = self.catalog.create_capture(archived_url_id, api_key_id).await?;

        for kind in types {
            let item_id = self.catalog.create_item(capture.id, kind).await?;
            self.jobs.try_submit(Job {
                item_id,
                capture_id: capture.id,
                kind,
                short_id: capture.short_id.clone(),
                url: canonical.clone(),
            });
        }

        info!(short_id = %capture.short_id, url = %canonical, "capture queued");
        Ok(capture)
    }

    /// Startup resume: every pending/processing item with retry budget is
    /// re-enqueued. Safe to run repeatedly; workers re-drive the item state
    /// machine idempotently.
    pub async fn resume_unfinished(&self) -> Result<usize, PipelineError> {
        let items = self.catalog.resumable_items().await?;
        let mut enqueued = 0;
        for item in items {
            if self.jobs.try_submit(Job::from(item)) {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!(count = enqueued, "resumed unfinished archive items");
        }
        Ok(enqueued)
    }

    /// Operator bulk retry of everything failed.
    pub async fn retry_failed(&self) -> Result<usize, PipelineError> {
        let items = self.catalog.reset_failed().await?;
        let count = items.len();
        for item in items {
            self.jobs.try_submit(Job::from(item));
        }
        Ok(count)
    }

    /// Background sweeps: re-enqueue stale pending items every minute, and
    /// truncate logs of old completed items daily.
    pub fn spawn_sweeps(self: Arc<Self>) {
        let pipeline = Arc::clone(&self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match pipeline.catalog.stale_pending_items().await {
                    Ok(items) => {
                        for item in items {
                            pipeline.jobs.try_submit(Job::from(item));
                        }
                    }
                    Err(e) => warn!(error = %e, "pending sweep failed"),
                }
            }
        });

        let catalog = self.catalog.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match catalog.truncate_old_logs().await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "truncated logs of old completed items"),
                    Err(e) => warn!(error = %e, "log truncation sweep failed"),
                }
            }
        });
    }
}
