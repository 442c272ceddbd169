//! The four capture strategies behind one contract.
//!
//! An archiver turns a URL into a byte stream plus metadata; the worker
//! pipes the stream into storage and releases the [`Cleanup`] guard on
//! every exit path. MHTML and screenshot share the process-wide browser;
//! git and yt-dlp drive external processes.

mod git;
mod mhtml;
mod screenshot;
mod youtube;

pub use git::GitArchiver;
pub use mhtml::MhtmlArchiver;
pub use screenshot::ScreenshotArchiver;
pub use youtube::YoutubeArchiver;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::browser::BrowserManager;
use crate::catalog::{ArchiveType, LogSink};
use crate::storage::BoxedReader;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("browser unavailable: {0}")]
    Browser(String),
    #[error("page load failed: {0}")]
    PageLoad(String),
    #[error("subprocess failed: {0}")]
    Subprocess(String),
    #[error("archiving timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// What an archiver hands back to the worker. `data` is consumed exactly
/// once; `cleanup` must be released on every exit path afterwards.
pub struct ArchiveOutput {
    pub data: BoxedReader,
    pub extension: &'static str,
    pub content_type: &'static str,
    pub cleanup: Cleanup,
}

/// Closes a page even when the owning future is dropped mid-flight
/// (job deadline, shutdown): the explicit close path consumes the guard,
/// the drop path spawns a detached close so no tab leaks.
pub struct PageGuard {
    page: Option<chromiumoxide::Page>,
}

impl PageGuard {
    pub fn new(page: chromiumoxide::Page) -> Self {
        Self { page: Some(page) }
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("failed to close page: {e}");
            }
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            tokio::spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}

/// Resources released after the artifact stream has drained. Closing order:
/// page first, then child processes, then temp trees.
#[derive(Default)]
pub struct Cleanup {
    page: Option<PageGuard>,
    child: Option<Child>,
    child_name: &'static str,
    temp_dir: Option<tempfile::TempDir>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cleanup {
    pub fn page(guard: PageGuard) -> Self {
        Self {
            page: Some(guard),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_child(mut self, child: Child, name: &'static str) -> Self {
        self.child = Some(child);
        self.child_name = name;
        self
    }

    pub fn with_temp_dir(mut self, dir: tempfile::TempDir) -> Self {
        self.temp_dir = Some(dir);
        self
    }

    /// Releases everything. A child process that exits nonzero turns the
    /// job into a failure even though its stream already drained; a
    /// truncated artifact must never be recorded as completed.
    pub async fn run(mut self) -> Result<(), ArchiveError> {
        if let Some(page) = self.page.take() {
            page.close().await;
        }

        let mut result = Ok(());
        if let Some(mut child) = self.child.take() {
            result = reap_child(&mut child, self.child_name).await;
        }

        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                debug!("cleanup task did not finish in time");
            }
        }

        // Temp trees are removed by TempDir on drop, after the stream that
        // read from them has drained.
        drop(self.temp_dir.take());

        result
    }
}

async fn reap_child(child: &mut Child, name: &'static str) -> Result<(), ArchiveError> {
    match tokio::time::timeout(Duration::from_secs(30), child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(ArchiveError::Subprocess(format!(
            "{name} exited with {status}"
        ))),
        Ok(Err(e)) => Err(ArchiveError::Io(e)),
        Err(_) => {
            warn!("{name} still running after stream end, terminating");
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ArchiveError::Subprocess(format!(
                "{name} had to be terminated"
            )))
        }
    }
}

/// Tagged dispatch over the four strategies. The browser handle is injected
/// only into the two that need it.
pub struct Archivers {
    mhtml: MhtmlArchiver,
    screenshot: ScreenshotArchiver,
    git: GitArchiver,
    youtube: YoutubeArchiver,
}

impl Archivers {
    pub fn new(browser: Arc<BrowserManager>, proxy: Option<String>) -> Self {
        Self {
            mhtml: MhtmlArchiver::new(Arc::clone(&browser)),
            screenshot: ScreenshotArchiver::new(browser),
            git: GitArchiver::new(proxy.clone()),
            youtube: YoutubeArchiver::new(proxy),
        }
    }

    pub async fn archive(
        &self,
        kind: ArchiveType,
        url: &str,
        log: &LogSink,
    ) -> Result<ArchiveOutput, ArchiveError> {
        match kind {
            ArchiveType::Mhtml => self.mhtml.archive(url, log).await,
            ArchiveType::Screenshot => self.screenshot.archive(url, log).await,
            ArchiveType::Git => self.git.archive(url, log).await,
            ArchiveType::Youtube => self.youtube.archive(url, log).await,
        }
    }

    /// Whole-job deadline per strategy (archive plus the storage copy).
    pub fn deadline(&self, kind: ArchiveType) -> Duration {
        match kind {
            ArchiveType::Mhtml | ArchiveType::Screenshot | ArchiveType::Git => {
                Duration::from_secs(30 * 60)
            }
            ArchiveType::Youtube => Duration::from_secs(45 * 60),
        }
    }
}
