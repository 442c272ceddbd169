//! Bare-mirror clone streamed out as a tar archive.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::catalog::LogSink;

use super::{ArchiveError, ArchiveOutput, Cleanup};

/// Clone phase budget; the overall job deadline covers the tar stream.
const CLONE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub struct GitArchiver {
    proxy: Option<String>,
}

impl GitArchiver {
    pub fn new(proxy: Option<String>) -> Self {
        Self { proxy }
    }

    pub async fn archive(&self, url: &str, log: &LogSink) -> Result<ArchiveOutput, ArchiveError> {
        let temp = tempfile::tempdir()?;
        let repo_dir = temp.path().join("mirror.git");

        self.clone_mirror(url, &repo_dir, log).await?;
        log.line("clone complete, packing tree").await;

        // Tar is built on the blocking pool and streamed through a channel;
        // a packing error is delivered in-band so the artifact can never
        // silently truncate.
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
        let pack_dir = repo_dir.clone();
        let pack_task = tokio::task::spawn_blocking(move || {
            if let Err(e) = pack_tree(&pack_dir, tx.clone()) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        let data = StreamReader::new(ReceiverStream::new(rx));

        Ok(ArchiveOutput {
            data: Box::pin(data),
            extension: ".tar",
            content_type: "application/x-tar",
            cleanup: Cleanup::default()
                .with_temp_dir(temp)
                .with_task(pack_task),
        })
    }

    async fn clone_mirror(
        &self,
        url: &str,
        repo_dir: &Path,
        log: &LogSink,
    ) -> Result<(), ArchiveError> {
        let mut cmd = Command::new("git");
        cmd.arg("clone")
            .arg("--mirror")
            .arg("--progress")
            .arg(url)
            .arg(repo_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(proxy) = &self.proxy {
            cmd.env("ALL_PROXY", format!("socks5://{proxy}"));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ArchiveError::Subprocess(format!("failed to spawn git: {e}")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ArchiveError::Subprocess("git stderr not captured".into()))?;

        let status = tokio::time::timeout(CLONE_TIMEOUT, async {
            // Progress arrives on stderr; stream it line by line into the
            // job log while the clone runs.
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log.line(&line).await;
            }
            child.wait().await
        })
        .await
        .map_err(|_| {
            ArchiveError::Subprocess(format!(
                "git clone did not finish within {}s",
                CLONE_TIMEOUT.as_secs()
            ))
        })??;

        if !status.success() {
            return Err(ArchiveError::Subprocess(format!(
                "git clone exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Tars the mirror tree (regular files and directories, mode and mtime
/// preserved) into the channel.
fn pack_tree(dir: &std::path::Path, tx: mpsc::Sender<std::io::Result<Bytes>>) -> std::io::Result<()> {
    let mut builder = tar::Builder::new(ChannelWriter { tx });
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?;
    Ok(())
}

struct ChannelWriter {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn packed_tree_roundtrips_through_tar() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("objects")).unwrap();
        std::fs::write(src.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(src.path().join("objects/pack-keep"), b"x").unwrap();

        let (tx, rx) = mpsc::channel(16);
        let dir = src.path().to_path_buf();
        let task = tokio::task::spawn_blocking(move || {
            if let Err(e) = pack_tree(&dir, tx.clone()) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        let mut reader = StreamReader::new(ReceiverStream::new(rx));
        let mut tar_bytes = Vec::new();
        reader.read_to_end(&mut tar_bytes).await.unwrap();
        task.await.unwrap();

        let dst = tempfile::tempdir().unwrap();
        tar::Archive::new(std::io::Cursor::new(tar_bytes))
            .unpack(dst.path())
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dst.path().join("HEAD")).unwrap(),
            "ref: refs/heads/main\n"
        );
        assert!(dst.path().join("objects/pack-keep").exists());
    }
}
