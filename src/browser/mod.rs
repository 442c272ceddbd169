//! Shared headless-browser lifecycle.
//!
//! One Chrome process serves every MHTML/screenshot job; pages are opened
//! per job and never reused. The manager health-checks the CDP connection
//! before handing out pages and restarts a dead browser with bounded
//! backoff, after which it reports unhealthy and capture jobs fail fast.

pub mod page_load;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

/// Restart backoff schedule. After the last attempt fails the manager is
/// marked unhealthy until process restart.
const RESTART_BACKOFF: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

struct BrowserHandle {
    browser: Browser,
    handler_task: JoinHandle<()>,
    user_data_dir: PathBuf,
}

struct ManagerState {
    handle: Option<BrowserHandle>,
    unhealthy: bool,
}

/// Process-wide browser manager. Constructed in `main` and passed
/// explicitly to the archivers that need it.
pub struct BrowserManager {
    state: Mutex<ManagerState>,
    proxy: Option<String>,
}

impl BrowserManager {
    pub fn new(proxy: Option<String>) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                handle: None,
                unhealthy: false,
            }),
            proxy,
        }
    }

    /// Launches the browser. Called once at startup; later disconnects are
    /// handled by [`BrowserManager::page`].
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.handle.is_none() {
            state.handle = Some(launch(self.proxy.as_deref()).await?);
        }
        Ok(())
    }

    /// True until the restart budget is exhausted.
    pub async fn healthy(&self) -> bool {
        !self.state.lock().await.unhealthy
    }

    /// Opens a fresh page, restarting the browser first if the CDP
    /// connection died.
    pub async fn page(&self) -> Result<Page> {
        let mut state = self.state.lock().await;
        if state.unhealthy {
            return Err(anyhow!("browser manager is unhealthy; restart the process"));
        }

        let alive = match &state.handle {
            Some(handle) => handle.browser.version().await.is_ok(),
            None => false,
        };

        if !alive {
            if let Some(dead) = state.handle.take() {
                warn!("browser connection lost, tearing down old process");
                teardown(dead).await;
            }
            match relaunch_with_backoff(self.proxy.as_deref()).await {
                Ok(handle) => state.handle = Some(handle),
                Err(e) => {
                    state.unhealthy = true;
                    return Err(e.context("browser restart attempts exhausted"));
                }
            }
        }

        let handle = state
            .handle
            .as_ref()
            .ok_or_else(|| anyhow!("browser not started"))?;
        handle
            .browser
            .new_page("about:blank")
            .await
            .context("failed to open page")
    }

    /// Shutdown ordering: pages die with the browser, then the process is
    /// reaped, then the CDP driver task stops after a short settle delay.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.handle.take() {
            teardown(handle).await;
        }
    }
}

async fn relaunch_with_backoff(proxy: Option<&str>) -> Result<BrowserHandle> {
    let mut last_err = anyhow!("browser restart never attempted");
    for (attempt, delay) in RESTART_BACKOFF.iter().enumerate() {
        if !delay.is_zero() {
            tokio::time::sleep(*delay).await;
        }
        match launch(proxy).await {
            Ok(handle) => {
                info!(attempt = attempt + 1, "browser restarted");
                return Ok(handle);
            }
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "browser restart failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn launch(proxy: Option<&str>) -> Result<BrowserHandle> {
    let user_data_dir =
        std::env::temp_dir().join(format!("arkiv_chrome_{}", std::process::id()));
    std::fs::create_dir_all(&user_data_dir).context("failed to create user data directory")?;

    // Containerized-stability arguments. Each one matters:
    //   --no-sandbox / --disable-setuid-sandbox: unprivileged containers
    //   --disable-dev-shm-usage: small /dev/shm would otherwise OOM renderers
    //   --no-zygote / --single-process: no orphaned child processes under a
    //     minimal PID-1 (the host must still reap zombies)
    let mut config_builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .user_data_dir(user_data_dir.clone())
        .headless_mode(HeadlessMode::default())
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--no-zygote")
        .arg("--single-process")
        .arg("--disable-gpu")
        .arg("--hide-scrollbars")
        .arg("--mute-audio");

    if let Some(proxy) = proxy {
        config_builder = config_builder.arg(format!("--proxy-server=socks5://{proxy}"));
    }

    let browser_config = config_builder
        .build()
        .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("failed to launch browser")?;

    let handler_task = tokio::task::spawn(async move {
        while let Some(h) = handler.next().await {
            if let Err(e) = h {
                let message = e.to_string();
                // Chrome emits CDP events chromiumoxide cannot deserialize;
                // those are noise, everything else is a real driver fault.
                let benign = message
                    .contains("data did not match any variant of untagged enum Message")
                    || message.contains("Failed to deserialize WS response");
                if benign {
                    trace!("suppressed benign CDP serialization error: {message}");
                } else {
                    error!("browser handler error: {message}");
                }
            }
        }
        info!("browser handler task completed");
    });

    info!("browser launched");
    Ok(BrowserHandle {
        browser,
        handler_task,
        user_data_dir,
    })
}

async fn teardown(mut handle: BrowserHandle) {
    if let Err(e) = handle.browser.close().await {
        warn!("failed to close browser: {e}");
    }
    if let Err(e) = handle.browser.wait().await {
        warn!("failed to reap browser process: {e}");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.handler_task.abort();
    if let Err(e) = std::fs::remove_dir_all(&handle.user_data_dir) {
        warn!(
            "failed to remove user data dir {}: {e}",
            handle.user_data_dir.display()
        );
    }
}
