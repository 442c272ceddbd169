//! Process configuration, read from the environment in one place.
//!
//! Every knob the server honors is enumerated here; defaults are applied
//! here and nowhere else. Unknown `STORAGE_TYPE` values fail startup rather
//! than falling back silently.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use rand::RngCore;

/// S3-compatible backend options.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub force_path_style: bool,
}

/// Which object-store backend artifacts are written to.
#[derive(Debug, Clone)]
pub enum StorageKind {
    Filesystem,
    S3(S3Config),
}

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL DSN for the catalog.
    pub db_url: String,
    /// Base directory for the filesystem storage backend.
    pub storage_path: PathBuf,
    /// Directory for unpacked git trees served over Git-over-HTTP.
    pub cache_path: PathBuf,
    /// Number of archive workers.
    pub max_workers: usize,
    /// HTTP listen port.
    pub port: u16,
    pub storage: StorageKind,
    /// SOCKS5 proxy applied to archivers only (browser, git, yt-dlp); the
    /// serving edge never uses it.
    pub socks5_proxy: Option<String>,
    /// Secret for the session layer. Auto-generated and persisted under the
    /// storage path when unset.
    pub session_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_url = require("DB_URL")?;
        let storage_path = PathBuf::from(var_or("STORAGE_PATH", "./storage"));
        let cache_path = PathBuf::from(var_or("CACHE_PATH", "./cache"));

        let max_workers: usize = var_or("MAX_WORKERS", "5")
            .parse()
            .context("MAX_WORKERS must be a positive integer")?;
        if max_workers == 0 {
            bail!("MAX_WORKERS must be at least 1");
        }

        let port: u16 = var_or("PORT", "8080")
            .parse()
            .context("PORT must be a valid TCP port")?;

        let storage = match var_or("STORAGE_TYPE", "filesystem").as_str() {
            "filesystem" => StorageKind::Filesystem,
            "s3" => StorageKind::S3(S3Config {
                bucket: require("S3_BUCKET")?,
                region: var_or("S3_REGION", "us-east-1"),
                access_key_id: require("S3_ACCESS_KEY_ID")?,
                secret_access_key: require("S3_SECRET_ACCESS_KEY")?,
                endpoint: std::env::var("S3_ENDPOINT").ok().filter(|v| !v.is_empty()),
                prefix: std::env::var("S3_PREFIX").ok().filter(|v| !v.is_empty()),
                force_path_style: var_or("S3_FORCE_PATH_STYLE", "false") == "true",
            }),
            other => bail!("unsupported STORAGE_TYPE {other:?} (expected filesystem or s3)"),
        };

        let socks5_proxy = std::env::var("SOCKS5_PROXY").ok().filter(|v| !v.is_empty());

        let session_secret = match std::env::var("SESSION_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => load_or_generate_session_secret(&storage_path)?,
        };

        Ok(Self {
            db_url,
            storage_path,
            cache_path,
            max_workers,
            port,
            storage,
            socks5_proxy,
            session_secret,
        })
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Reads the persisted session secret, or generates one and persists it so
/// sessions survive restarts.
fn load_or_generate_session_secret(storage_path: &std::path::Path) -> Result<String> {
    let path = storage_path.join(".session_secret");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let secret = hex::encode(bytes);

    std::fs::create_dir_all(storage_path)
        .with_context(|| format!("failed to create {}", storage_path.display()))?;
    std::fs::write(&path, &secret)
        .with_context(|| format!("failed to persist session secret to {}", path.display()))?;

    Ok(secret)
}
