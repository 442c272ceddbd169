//! Full-page MHTML capture through the shared browser.

use std::io::Cursor;
use std::sync::Arc;

use chromiumoxide::cdp::browser_protocol::page::{
    CaptureSnapshotFormat, CaptureSnapshotParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{EventConsoleApiCalled, EventExceptionThrown};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::browser::{BrowserManager, page_load};
use crate::catalog::LogSink;

use super::{ArchiveError, ArchiveOutput, Cleanup, PageGuard};

pub struct MhtmlArchiver {
    browser: Arc<BrowserManager>,
}

impl MhtmlArchiver {
    pub fn new(browser: Arc<BrowserManager>) -> Self {
        Self { browser }
    }

    pub async fn archive(&self, url: &str, log: &LogSink) -> Result<ArchiveOutput, ArchiveError> {
        let page = self
            .browser
            .page()
            .await
            .map_err(|e| ArchiveError::Browser(format!("{e:#}")))?;
        let guard = PageGuard::new(page.clone());
        let console_task = forward_console(&page, log).await?;

        page_load::load_settled(&page, url, log)
            .await
            .map_err(|e| ArchiveError::PageLoad(format!("{e:#}")))?;

        let snapshot = page
            .execute(CaptureSnapshotParams {
                format: Some(CaptureSnapshotFormat::Mhtml),
                ..Default::default()
            })
            .await
            .map_err(|e| ArchiveError::Browser(format!("captureSnapshot failed: {e}")))?;
        let data = snapshot.data.clone().into_bytes();

        log.line(&format!("captured MHTML snapshot ({} bytes)", data.len()))
            .await;

        Ok(ArchiveOutput {
            data: Box::pin(Cursor::new(data)),
            extension: ".mhtml",
            content_type: "application/x-mhtml",
            cleanup: Cleanup::page(guard).with_task(console_task),
        })
    }
}

/// Mirrors console output and uncaught page errors into the job log.
async fn forward_console(page: &Page, log: &LogSink) -> Result<JoinHandle<()>, ArchiveError> {
    let mut console = page
        .event_listener::<EventConsoleApiCalled>()
        .await
        .map_err(|e| ArchiveError::Browser(format!("console listener failed: {e}")))?;
    let mut exceptions = page
        .event_listener::<EventExceptionThrown>()
        .await
        .map_err(|e| ArchiveError::Browser(format!("exception listener failed: {e}")))?;

    let log = log.clone();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                event = console.next() => {
                    let Some(event) = event else { break };
                    let text = event
                        .args
                        .iter()
                        .map(|arg| {
                            arg.value
                                .as_ref()
                                .map(|v| v.to_string())
                                .or_else(|| arg.description.clone())
                                .unwrap_or_default()
                        })
                        .collect::<Vec<_>>()
                        .join(" ");
                    let level = format!("{:?}", event.r#type).to_lowercase();
                    log.line(&format!("console.{level}: {text}")).await;
                }
                event = exceptions.next() => {
                    let Some(event) = event else { break };
                    let details = &event.exception_details;
                    let message = details
                        .exception
                        .as_ref()
                        .and_then(|e| e.description.clone())
                        .unwrap_or_else(|| details.text.clone());
                    log.line(&format!("page error: {message}")).await;
                }
                else => break,
            }
        }
    }))
}
