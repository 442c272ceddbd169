//! Server binary: wires configuration, catalog, storage, the shared
//! browser, the worker pool and the HTTP edge together.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use arkiv::archiver::Archivers;
use arkiv::browser::BrowserManager;
use arkiv::catalog::Catalog;
use arkiv::config::{Config, StorageKind};
use arkiv::pipeline::Pipeline;
use arkiv::serve::{self, AppState};
use arkiv::storage::{ObjectStorage, ZstdStorage};
use arkiv::worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("arkiv=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let catalog = Catalog::connect(&config.db_url)
        .await
        .context("failed to connect to the catalog database")?;
    catalog.migrate().await.context("schema migration failed")?;

    let object_storage = match &config.storage {
        StorageKind::Filesystem => ObjectStorage::filesystem(&config.storage_path)
            .context("failed to open filesystem storage")?,
        StorageKind::S3(s3) => ObjectStorage::s3(s3).context("failed to configure S3 storage")?,
    };
    let storage = Arc::new(ZstdStorage::new(object_storage));

    std::fs::create_dir_all(&config.cache_path)
        .with_context(|| format!("failed to create {}", config.cache_path.display()))?;

    let browser = Arc::new(BrowserManager::new(config.socks5_proxy.clone()));
    if let Err(e) = browser.start().await {
        // Capture jobs will retry the launch with backoff; serving works
        // regardless.
        warn!("browser failed to launch at startup: {e:#}");
    }

    let archivers = Arc::new(Archivers::new(
        Arc::clone(&browser),
        config.socks5_proxy.clone(),
    ));
    let (jobs, _workers) = worker::start(
        config.max_workers,
        catalog.clone(),
        Arc::clone(&storage),
        archivers,
    );

    let pipeline = Arc::new(Pipeline::new(catalog.clone(), jobs));
    pipeline
        .resume_unfinished()
        .await
        .context("resume scan failed")?;
    Arc::clone(&pipeline).spawn_sweeps();

    let state = AppState::new(
        catalog,
        storage,
        Arc::clone(&pipeline),
        config.cache_path.clone(),
    );
    let app = serve::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, workers = config.max_workers, "arkiv listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // In-flight jobs are dropped here and recovered by the resume scan on
    // the next start.
    browser.shutdown().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install ctrl-c handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
