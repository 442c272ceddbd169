//! Robust page loading for the browser-backed archivers.
//!
//! A navigated page is not a settled page: lazy images, XHR-driven layout
//! and animations all keep mutating it. This module drives a deterministic
//! settle sequence — navigate, promote lazy content, wait for a custom
//! network-idle condition over the CDP request event stream, wait for media
//! readiness, scroll the full height to force lazy loaders, then a second
//! shorter idle pass.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestServedFromCache,
    EventRequestWillBeSent, RequestId,
};
use chromiumoxide::listeners::EventStream;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::catalog::LogSink;

/// Navigation (and load event) budget.
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests to these hosts never count against network idle; analytics
/// beacons can keep firing forever.
const IGNORED_HOST_SUBSTRINGS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "googlesyndication.com",
    "doubleclick.net",
    "adservice.google",
    "facebook.net",
    "connect.facebook.com",
    "hotjar.com",
    "mixpanel.com",
    "segment.io",
    "segment.com",
    "sentry.io",
    "intercom.io",
    "amplitude.com",
    "clarity.ms",
    "newrelic.com",
    "nr-data.net",
    "plausible.io",
    "matomo",
];

/// One network-idle wait. `accept_after` is the (elapsed, residual) pair
/// that accepts early when only stragglers remain; at `soft_deadline` the
/// wait gives up on perfect idle and accepts; `hard_deadline`, when set,
/// fails the load instead.
#[derive(Debug, Clone, Copy)]
pub struct IdleOptions {
    pub window: Duration,
    pub accept_after: Option<(Duration, usize)>,
    pub soft_deadline: Duration,
    pub hard_deadline: Option<Duration>,
}

impl IdleOptions {
    /// First pass: 2 s idle window; accept 3 stragglers after 5 s; accept
    /// whatever remains at 15 s; fail outright at 20 s.
    pub fn initial() -> Self {
        Self {
            window: Duration::from_secs(2),
            accept_after: Some((Duration::from_secs(5), 3)),
            soft_deadline: Duration::from_secs(15),
            hard_deadline: Some(Duration::from_secs(20)),
        }
    }

    /// Post-scroll pass: 1 s window, 10 s cap, never fatal.
    pub fn after_scroll() -> Self {
        Self {
            window: Duration::from_secs(1),
            accept_after: None,
            soft_deadline: Duration::from_secs(10),
            hard_deadline: None,
        }
    }
}

/// Tracks in-flight requests from the CDP event stream.
///
/// Must be created before navigation so requests issued during the initial
/// load are observed. This is an explicit state machine over
/// request/requestFinished/requestFailed events plus a monotonic clock, not
/// a callback pile.
pub struct NetworkWatcher {
    started: EventStream<EventRequestWillBeSent>,
    finished: EventStream<EventLoadingFinished>,
    failed: EventStream<EventLoadingFailed>,
    cached: EventStream<EventRequestServedFromCache>,
    in_flight: HashSet<RequestId>,
}

impl NetworkWatcher {
    pub async fn attach(page: &Page) -> Result<Self> {
        Ok(Self {
            started: page
                .event_listener::<EventRequestWillBeSent>()
                .await
                .context("failed to listen for request events")?,
            finished: page
                .event_listener::<EventLoadingFinished>()
                .await
                .context("failed to listen for loading-finished events")?,
            failed: page
                .event_listener::<EventLoadingFailed>()
                .await
                .context("failed to listen for loading-failed events")?,
            cached: page
                .event_listener::<EventRequestServedFromCache>()
                .await
                .context("failed to listen for cache events")?,
            in_flight: HashSet::new(),
        })
    }

    fn track(&mut self, id: &RequestId, url: &str) {
        if ignored_url(url) {
            return;
        }
        self.in_flight.insert(id.clone());
    }

    fn settle(&mut self, id: &RequestId) {
        self.in_flight.remove(id);
    }

    /// Waits for the in-flight set to stay empty for `opts.window`.
    ///
    /// After `soft_deadline` the windowed requirement is dropped: a
    /// momentarily-empty set is accepted (no hard deadline configured means
    /// accepting outright, with a warning into the job log). The hard
    /// deadline fails the load.
    pub async fn wait_idle(&mut self, opts: IdleOptions, log: &LogSink) -> Result<()> {
        let started = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let mut empty_since: Option<Instant> = None;

        loop {
            tokio::select! {
                Some(event) = self.started.next() => {
                    self.track(&event.request_id, &event.request.url);
                }
                Some(event) = self.finished.next() => self.settle(&event.request_id),
                Some(event) = self.failed.next() => self.settle(&event.request_id),
                Some(event) = self.cached.next() => self.settle(&event.request_id),
                _ = tick.tick() => {}
            }

            let now = Instant::now();
            let elapsed = now.duration_since(started);
            let past_soft = elapsed >= opts.soft_deadline;

            if self.in_flight.is_empty() {
                let since = *empty_since.get_or_insert(now);
                if past_soft || now.duration_since(since) >= opts.window {
                    return Ok(());
                }
            } else {
                empty_since = None;
            }

            if let Some((after, residual)) = opts.accept_after {
                if elapsed >= after && self.in_flight.len() <= residual {
                    debug!(remaining = self.in_flight.len(), "accepting near-idle network");
                    return Ok(());
                }
            }

            match opts.hard_deadline {
                Some(hard) if elapsed >= hard => {
                    return Err(anyhow!(
                        "page network activity did not settle within {}s ({} in flight)",
                        hard.as_secs(),
                        self.in_flight.len()
                    ));
                }
                None if past_soft => {
                    log.line(&format!(
                        "network never fully settled ({} request(s) still in flight), continuing",
                        self.in_flight.len()
                    ))
                    .await;
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

fn ignored_url(url: &str) -> bool {
    let url = url.to_ascii_lowercase();
    url.starts_with("data:")
        || IGNORED_HOST_SUBSTRINGS
            .iter()
            .any(|needle| url.contains(needle))
}

#[derive(Debug, Deserialize)]
struct PageMetrics {
    height: f64,
    viewport: f64,
    scroll_y: f64,
}

const SETTLE_SCRIPT: &str = r#"
(() => {
    const style = document.createElement('style');
    style.textContent = '*, *::before, *::after { transition: none !important; animation: none !important; scroll-behavior: auto !important; }';
    if (document.head) { document.head.appendChild(style); }

    document.querySelectorAll('img[loading="lazy"]').forEach((img) => {
        img.loading = 'eager';
    });
    document.querySelectorAll('img[data-src]').forEach((img) => {
        if (!img.src || img.src.startsWith('data:')) { img.src = img.getAttribute('data-src'); }
    });
    document.querySelectorAll('img[data-lazy-src]').forEach((img) => {
        img.src = img.getAttribute('data-lazy-src');
    });
    return true;
})()
"#;

const PENDING_MEDIA_SCRIPT: &str = r#"
(() => {
    let pending = 0;
    document.querySelectorAll('img').forEach((img) => {
        if (!(img.complete && img.naturalWidth > 0)) { pending += 1; }
    });
    document.querySelectorAll('video').forEach((video) => {
        if (video.readyState < 2) { pending += 1; }
    });
    return pending;
})()
"#;

const METRICS_SCRIPT: &str = r#"
({
    height: document.documentElement.scrollHeight,
    viewport: window.innerHeight,
    scroll_y: window.scrollY
})
"#;

/// Drives the full settle sequence against an already-created page.
///
/// Navigation timeouts and a hard idle failure are fatal; media readiness
/// timeouts only warn into the job log.
pub async fn load_settled(page: &Page, url: &str, log: &LogSink) -> Result<()> {
    let mut watcher = NetworkWatcher::attach(page).await?;

    log.line(&format!("navigating to {url}")).await;
    tokio::time::timeout(NAVIGATION_TIMEOUT, page.goto(url))
        .await
        .map_err(|_| anyhow!("navigation timed out after {}s", NAVIGATION_TIMEOUT.as_secs()))?
        .with_context(|| format!("navigation to {url} failed"))?;
    tokio::time::timeout(NAVIGATION_TIMEOUT, page.wait_for_navigation())
        .await
        .map_err(|_| anyhow!("load event timed out after {}s", NAVIGATION_TIMEOUT.as_secs()))?
        .context("page load failed")?;

    page.evaluate(SETTLE_SCRIPT)
        .await
        .context("failed to inject settle script")?;

    log.line("waiting for network idle").await;
    watcher.wait_idle(IdleOptions::initial(), log).await?;

    wait_for_media(page, log).await;
    scroll_through_page(page).await?;

    log.line("second network idle pass").await;
    watcher.wait_idle(IdleOptions::after_scroll(), log).await?;

    Ok(())
}

/// Up to 10 s for every `<img>` to be decoded and every `<video>` to have
/// current data. Never fatal.
async fn wait_for_media(page: &Page, log: &LogSink) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let pending = match page.evaluate(PENDING_MEDIA_SCRIPT).await {
            Ok(result) => result.into_value::<i64>().unwrap_or(0),
            Err(e) => {
                debug!("media readiness probe failed: {e}");
                return;
            }
        };
        if pending == 0 {
            return;
        }
        if Instant::now() >= deadline {
            log.line(&format!(
                "warning: {pending} image/video element(s) still loading after 10s"
            ))
            .await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Scrolls to the bottom in 80%-viewport steps with 500 ms pauses until the
/// page height stabilizes (5 unchanged checks) or the bottom is reached,
/// then returns to the top.
async fn scroll_through_page(page: &Page) -> Result<()> {
    let mut stable_checks = 0u32;
    let mut last_height = 0f64;

    for _ in 0..120 {
        let metrics: PageMetrics = page
            .evaluate(METRICS_SCRIPT)
            .await
            .context("failed to read page metrics")?
            .into_value()
            .context("unexpected page metrics shape")?;

        if (metrics.height - last_height).abs() < 1.0 {
            stable_checks += 1;
        } else {
            stable_checks = 0;
            last_height = metrics.height;
        }

        let at_bottom = metrics.scroll_y + metrics.viewport >= metrics.height - 1.0;
        if at_bottom && stable_checks >= 5 {
            break;
        }

        if !at_bottom {
            let step = metrics.viewport * 0.8;
            page.evaluate(format!("window.scrollBy(0, {step})"))
                .await
                .context("scroll step failed")?;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    page.evaluate("window.scrollTo(0, 0)")
        .await
        .context("failed to scroll back to top")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_hosts_are_ignored() {
        assert!(ignored_url(
            "https://www.google-analytics.com/collect?v=1"
        ));
        assert!(ignored_url("https://cdn.segment.com/analytics.js"));
        assert!(ignored_url("data:image/png;base64,AAAA"));
        assert!(!ignored_url("https://example.com/app.js"));
    }

    #[test]
    fn initial_idle_options_match_documented_caps() {
        let opts = IdleOptions::initial();
        assert_eq!(opts.window, Duration::from_secs(2));
        assert_eq!(opts.accept_after, Some((Duration::from_secs(5), 3)));
        assert_eq!(opts.soft_deadline, Duration::from_secs(15));
        assert_eq!(opts.hard_deadline, Some(Duration::from_secs(20)));
    }
}
