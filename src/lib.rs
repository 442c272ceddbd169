//! arkiv — self-hostable web archiver.
//!
//! Point it at a URL and it produces durable, content-addressed snapshots
//! in parallel representations (MHTML with inlined resources, full-page
//! screenshot, git mirror tarball, downloaded video) and serves them back
//! behind stable short URLs, including Git-over-HTTP for cloning archived
//! repositories.

pub mod archiver;
pub mod browser;
pub mod catalog;
pub mod config;
pub mod mhtml;
pub mod pipeline;
pub mod serve;
pub mod storage;
pub mod worker;

pub use archiver::{ArchiveError, ArchiveOutput, Archivers};
pub use browser::BrowserManager;
pub use catalog::{ArchiveItem, ArchiveType, Capture, Catalog, ItemStatus, LogSink};
pub use config::{Config, StorageKind};
pub use mhtml::{MhtmlError, PartWalker, mhtml_to_html};
pub use pipeline::{Pipeline, archive_types_for, validate_url};
pub use serve::{AppState, router};
pub use storage::{ObjectStorage, Storage, StorageError, ZstdStorage};
pub use worker::{Job, JobQueue, WorkerPool, storage_key};
