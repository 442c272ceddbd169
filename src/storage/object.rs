//! `object_store`-backed implementation of the storage contract.

use std::sync::Arc;

use async_trait::async_trait;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::{BufReader, BufWriter};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;

use crate::config::S3Config;

use super::{BoxedReader, BoxedSeekableReader, BoxedWriter, Storage, StorageError};

/// Storage over an `object_store` backend.
///
/// The same struct serves the local filesystem (keys become path segments
/// under the base directory), the in-memory store used by tests, and
/// S3-compatible object stores.
#[derive(Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStorage {
    /// Filesystem backend rooted at `root`. The directory is created if
    /// missing.
    pub fn filesystem(root: &std::path::Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// In-memory backend for tests.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }

    /// S3-compatible backend. Objects land under `{prefix}{key}` when a
    /// prefix is configured.
    pub fn s3(config: &S3Config) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_virtual_hosted_style_request(!config.force_path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build()?;
        let store: Arc<dyn ObjectStore> = match &config.prefix {
            Some(prefix) if !prefix.is_empty() => {
                Arc::new(PrefixStore::new(store, prefix.as_str()))
            }
            _ => Arc::new(store),
        };

        Ok(Self { store })
    }

    fn path(&self, key: &str) -> Result<ObjectPath, StorageError> {
        ObjectPath::parse(key).map_err(|_| StorageError::InvalidKey {
            key: key.to_string(),
        })
    }

    async fn head(&self, key: &str) -> Result<object_store::ObjectMeta, StorageError> {
        let path = self.path(key)?;
        self.store.head(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound {
                key: key.to_string(),
            },
            other => other.into(),
        })
    }
}

#[async_trait]
impl Storage for ObjectStorage {
    async fn writer(&self, key: &str) -> Result<BoxedWriter, StorageError> {
        let path = self.path(key)?;
        let writer = BufWriter::new(Arc::clone(&self.store), path);
        Ok(Box::pin(writer))
    }

    async fn reader(&self, key: &str) -> Result<BoxedReader, StorageError> {
        let meta = self.head(key).await?;
        let reader = BufReader::new(Arc::clone(&self.store), &meta);
        Ok(Box::pin(reader))
    }

    async fn seekable_reader(&self, key: &str) -> Result<BoxedSeekableReader, StorageError> {
        let meta = self.head(key).await?;
        let reader = BufReader::new(Arc::clone(&self.store), &meta);
        Ok(Box::pin(reader))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        Ok(self.head(key).await?.size)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key)?;
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let storage = ObjectStorage::memory();

        let mut writer = storage.writer("ab1cd/mhtml.mhtml").await.unwrap();
        writer.write_all(b"hello archive").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = storage.reader("ab1cd/mhtml.mhtml").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello archive");

        assert!(storage.exists("ab1cd/mhtml.mhtml").await.unwrap());
        assert_eq!(storage.size("ab1cd/mhtml.mhtml").await.unwrap(), 13);
    }

    #[tokio::test]
    async fn missing_key_is_typed_not_found() {
        let storage = ObjectStorage::memory();

        assert!(!storage.exists("zzzzz/none.bin").await.unwrap());
        match storage.reader("zzzzz/none.bin").await {
            Err(StorageError::NotFound { key }) => assert_eq!(key, "zzzzz/none.bin"),
            Err(other) => panic!("expected NotFound, got {other:?}"),
            Ok(_) => panic!("expected NotFound, got Ok"),
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let storage = ObjectStorage::memory();

        let mut writer = storage.writer("k/v.bin").await.unwrap();
        writer.write_all(b"x").await.unwrap();
        writer.shutdown().await.unwrap();

        storage.delete("k/v.bin").await.unwrap();
        storage.delete("k/v.bin").await.unwrap();
        assert!(!storage.exists("k/v.bin").await.unwrap());
    }

    #[tokio::test]
    async fn filesystem_backend_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ObjectStorage::filesystem(dir.path()).unwrap();

        let mut writer = storage.writer("ab1cd/screenshot.webp").await.unwrap();
        writer.write_all(b"RIFF....WEBP").await.unwrap();
        writer.shutdown().await.unwrap();

        assert!(storage.exists("ab1cd/screenshot.webp").await.unwrap());
    }
}
