//! Key/blob object storage for archive artifacts.
//!
//! Two layers: [`ObjectStorage`] maps the storage contract onto an
//! `object_store` backend (local filesystem, in-memory, or S3), and
//! [`ZstdStorage`] decorates any [`Storage`] with seekable zstd compression
//! so large artifacts can be range-read without full decompression.

mod object;
mod zstd;

pub use object::ObjectStorage;
pub use zstd::ZstdStorage;

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// Errors surfaced by the storage layer.
///
/// Backend I/O errors pass through verbatim; a missing key is a typed
/// `NotFound` so callers can map it to a 404 instead of a 500.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("invalid storage key: {key}")]
    InvalidKey { key: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    Backend(#[from] object_store::Error),
}

/// Combined read + seek bound for random-access readers.
pub trait ReadSeek: AsyncRead + AsyncSeek + Send {}
impl<T: AsyncRead + AsyncSeek + Send> ReadSeek for T {}

/// Streaming writer handle. The object becomes durable (and visible to
/// readers) only after `shutdown()` completes; callers that fail mid-write
/// must `Storage::delete` the key so partial objects never surface.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Sequential reader over stored bytes.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Random-access reader over stored bytes.
pub type BoxedSeekableReader = Pin<Box<dyn ReadSeek>>;

/// Key→blob store contract shared by all backends and decorators.
///
/// Keys are `/`-separated; parents of hierarchical keys are created
/// implicitly on write.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create (or replace) the object at `key` and stream data into it.
    async fn writer(&self, key: &str) -> Result<BoxedWriter, StorageError>;

    /// Sequential read of the stored bytes.
    async fn reader(&self, key: &str) -> Result<BoxedReader, StorageError>;

    /// Random access over the stored bytes.
    async fn seekable_reader(&self, key: &str) -> Result<BoxedSeekableReader, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Stored size in bytes (post-decorator, i.e. compressed when decorated).
    async fn size(&self, key: &str) -> Result<u64, StorageError>;

    /// Remove the object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
