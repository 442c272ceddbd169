//! Bounded job queue and the worker pool that drives archivers.
//!
//! Workers own the per-item state machine: read the item, bail on terminal
//! states, compare-and-swap into `processing`, run the archiver, stream the
//! artifact into storage, then commit `completed` or `failed`. Every status
//! write is durable before the next stage can observe it, and any fault
//! becomes a logged `failed` rather than a panic.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::archiver::{ArchiveOutput, Archivers};
use crate::catalog::{ArchiveType, Catalog, LogSink, PendingItem};
use crate::storage::{ObjectStorage, Storage, ZstdStorage};

/// In-memory queue bound. Submitters that hit a full queue leave the item
/// `pending`; the resume scan or the periodic sweep picks it up later.
pub const QUEUE_CAPACITY: usize = 100;

/// One unit of work: a single (capture, type) item.
#[derive(Debug, Clone)]
pub struct Job {
    pub item_id: i64,
    pub capture_id: i64,
    pub kind: ArchiveType,
    pub short_id: String,
    pub url: String,
}

impl From<PendingItem> for Job {
    fn from(item: PendingItem) -> Self {
        Self {
            item_id: item.item_id,
            capture_id: item.capture_id,
            kind: item.kind,
            short_id: item.short_id,
            url: item.url,
        }
    }
}

/// Cloneable submitter half of the queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Non-blocking submit. Returns false when the queue is full; the item
    /// stays `pending` and is re-enqueued by the sweep.
    pub fn try_submit(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    item_id = job.item_id,
                    "job queue full, leaving item pending for the sweep"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Handles for the running workers; dropped on shutdown after the queue
/// sender side is gone.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Waits for all workers to drain and exit. Only returns once every
    /// queue sender (every [`JobQueue`] clone) has been dropped.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub type ArtifactStore = ZstdStorage<ObjectStorage>;

/// Storage key convention: `{short_id}/{type}{extension}.zst`.
pub fn storage_key(short_id: &str, kind: ArchiveType, extension: &str) -> String {
    format!("{short_id}/{kind}{extension}.zst")
}

/// Launches `count` workers over a fresh bounded queue.
pub fn start(
    count: usize,
    catalog: Catalog,
    storage: Arc<ArtifactStore>,
    archivers: Arc<Archivers>,
) -> (JobQueue, WorkerPool) {
    let (tx, rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));

    let handles = (0..count)
        .map(|worker_id| {
            let rx = Arc::clone(&rx);
            let catalog = catalog.clone();
            let storage = Arc::clone(&storage);
            let archivers = Arc::clone(&archivers);
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    run_job(&catalog, &storage, &archivers, job).await;
                }
                info!(worker_id, "worker exiting");
            })
        })
        .collect();

    (JobQueue { tx }, WorkerPool { handles })
}

/// Drives one job through the item state machine. Idempotent against
/// duplicate enqueues: terminal items are skipped and the
/// compare-and-swap transition lets exactly one worker proceed.
async fn run_job(catalog: &Catalog, storage: &ArtifactStore, archivers: &Archivers, job: Job) {
    let item = match catalog.item(job.capture_id, job.kind).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            warn!(item_id = job.item_id, "job for unknown item, dropping");
            return;
        }
        Err(e) => {
            warn!(item_id = job.item_id, error = %e, "failed to load item, dropping job");
            return;
        }
    };

    if item.status.is_terminal() {
        return;
    }

    if item.retry_count >= 3 {
        if let Err(e) = catalog.fail_item(item.id).await {
            warn!(item_id = item.id, error = %e, "failed to mark exhausted item");
        }
        return;
    }

    match catalog
        .try_begin_processing(item.id, item.status, item.retry_count)
        .await
    {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!(item_id = item.id, error = %e, "processing transition failed");
            return;
        }
    }

    let log = LogSink::new(catalog.clone(), item.id);
    log.line(&format!(
        "starting {} archive of {} (attempt {})",
        job.kind,
        job.url,
        item.retry_count + 1
    ))
    .await;

    let deadline = archivers.deadline(job.kind);
    let key = match tokio::time::timeout(deadline, execute(storage, archivers, &job, &log)).await {
        Ok(Ok((key, extension, size))) => {
            log.line(&format!("archived {size} bytes")).await;
            if let Err(e) = catalog
                .complete_item(item.id, &key, extension, size as i64)
                .await
            {
                warn!(item_id = item.id, error = %e, "failed to commit completion");
            }
            return;
        }
        Ok(Err(e)) => {
            log.line(&format!("archive failed: {e:#}")).await;
            storage_key(&job.short_id, job.kind, guessed_extension(job.kind))
        }
        Err(_) => {
            log.line(&format!(
                "archive timed out after {}s",
                deadline.as_secs()
            ))
            .await;
            storage_key(&job.short_id, job.kind, guessed_extension(job.kind))
        }
    };

    // Failed path: a partially-written object must never be readable.
    if let Err(e) = storage.delete(&key).await {
        warn!(item_id = item.id, key = %key, error = %e, "failed to drop partial object");
    }
    if let Err(e) = catalog.fail_item(item.id).await {
        warn!(item_id = item.id, error = %e, "failed to mark item failed");
    }
}

/// Default extension per type, used only to locate partial objects for
/// cleanup when the archiver failed before reporting one.
fn guessed_extension(kind: ArchiveType) -> &'static str {
    match kind {
        ArchiveType::Mhtml => ".mhtml",
        ArchiveType::Screenshot => ".webp",
        ArchiveType::Git => ".tar",
        ArchiveType::Youtube => ".mp4",
    }
}

async fn execute(
    storage: &ArtifactStore,
    archivers: &Archivers,
    job: &Job,
    log: &LogSink,
) -> Result<(String, &'static str, u64)> {
    let ArchiveOutput {
        mut data,
        extension,
        content_type,
        cleanup,
    } = archivers.archive(job.kind, &job.url, log).await?;

    let key = storage_key(&job.short_id, job.kind, extension);
    log.line(&format!("storing {content_type} artifact as {key}"))
        .await;

    // Stream straight into the compressed writer; nothing is buffered
    // beyond the codec's frame.
    let copied: Result<u64> = async {
        let mut writer = storage
            .writer(&key)
            .await
            .context("failed to open storage writer")?;
        let n = tokio::io::copy(&mut data, &mut writer)
            .await
            .context("artifact stream failed")?;
        writer
            .shutdown()
            .await
            .context("failed to finalize storage object")?;
        Ok(n)
    }
    .await;

    let cleanup_result = cleanup.run().await;

    let size = match (copied, cleanup_result) {
        (Ok(size), Ok(())) => size,
        (Err(e), _) => {
            let _ = storage.delete(&key).await;
            return Err(e);
        }
        (Ok(_), Err(e)) => {
            // The stream drained but its producer failed; the artifact is
            // not trustworthy.
            let _ = storage.delete(&key).await;
            return Err(e.into());
        }
    };

    Ok((key, extension, size))
}
