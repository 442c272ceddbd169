//! Video download through yt-dlp.
//!
//! Handles YouTube, Vimeo and any other yt-dlp-supported host; URL
//! classification routes all of them here. The artifact is labeled
//! `.mp4`/`video/mp4` regardless of the container yt-dlp actually
//! delivers — a known limitation, probing the stream is deliberately not
//! done.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::catalog::LogSink;

use super::{ArchiveError, ArchiveOutput, Cleanup};

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct YoutubeArchiver {
    proxy: Option<String>,
}

impl YoutubeArchiver {
    pub fn new(proxy: Option<String>) -> Self {
        Self { proxy }
    }

    pub async fn archive(&self, url: &str, log: &LogSink) -> Result<ArchiveOutput, ArchiveError> {
        self.probe(url, log).await?;

        let mut cmd = Command::new("yt-dlp");
        cmd.arg("-f")
            .arg("bestvideo+bestaudio/best")
            .arg("--no-playlist")
            .arg("--no-write-thumbnail")
            .arg("--verbose")
            .arg("-o")
            .arg("-")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(proxy) = &self.proxy {
            cmd.arg("--proxy").arg(format!("socks5://{proxy}"));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ArchiveError::Subprocess(format!("failed to spawn yt-dlp: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArchiveError::Subprocess("yt-dlp stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ArchiveError::Subprocess("yt-dlp stderr not captured".into()))?;

        let stderr_log = log.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_log.line(&line).await;
            }
        });

        Ok(ArchiveOutput {
            data: Box::pin(stdout),
            extension: ".mp4",
            content_type: "video/mp4",
            cleanup: Cleanup::default()
                .with_child(child, "yt-dlp")
                .with_task(stderr_task),
        })
    }

    /// Metadata probe before committing to a download. A nonzero exit fails
    /// the job with yt-dlp's stderr in the log.
    async fn probe(&self, url: &str, log: &LogSink) -> Result<(), ArchiveError> {
        let mut cmd = Command::new("yt-dlp");
        cmd.arg("--print")
            .arg("title,duration,uploader")
            .arg("--no-playlist")
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(proxy) = &self.proxy {
            cmd.arg("--proxy").arg(format!("socks5://{proxy}"));
        }

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                ArchiveError::Subprocess(format!(
                    "yt-dlp probe did not finish within {}s",
                    PROBE_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| ArchiveError::Subprocess(format!("failed to run yt-dlp probe: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|l| !l.is_empty()) {
            log.line(line).await;
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log.append(&stderr).await;
            return Err(ArchiveError::Subprocess(format!(
                "yt-dlp probe exited with {}",
                output.status
            )));
        }
        Ok(())
    }
}
