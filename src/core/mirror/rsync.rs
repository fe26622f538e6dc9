use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{Instrument, debug, info, info_span};

use crate::core::mirror::{MirrorEngine, MirrorReport, ensure_source};
use crate::core::models::BackupTask;
use crate::core::ownership::BackupOwner;
use crate::error::MirrorError;
use crate::logging::LogThrottle;

// "  12,345,678   45%   10.20MB/s    0:00:03 (xfr#3, to-chk=7/12)"
static PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([\d,]+)\s+(\d+)%").expect("progress pattern is valid"));

/// Mirrors with `rsync -a --delete`.
pub struct RsyncEngine {
    pub owner: Option<BackupOwner>,
}

#[async_trait]
impl MirrorEngine for RsyncEngine {
    async fn mirror(&self, task: &BackupTask) -> Result<MirrorReport, MirrorError> {
        let span = info_span!(
            "rsync_mirror",
            device = %task.key,
            destination = %task.target.display()
        );

        async {
            ensure_source(&task.source)?;

            tokio::fs::create_dir_all(&task.target)
                .await
                .map_err(|source| MirrorError::Prepare {
                    path: task.target.clone(),
                    source,
                })?;

            let start = Instant::now();
            let mut command = Command::new("rsync");
            command
                .args(["-a", "--delete", "--info=progress2", "--no-inc-recursive"])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(owner) = &self.owner {
                command.arg(format!("--chown={}", owner.as_chown_arg()));
            }

            // Trailing slashes: copy the contents, not the directory itself.
            command.arg(dir_arg(&task.source)).arg(dir_arg(&task.target));

            info!("Starting rsync mirror");
            let mut child = command
                .spawn()
                .map_err(|e| MirrorError::Process(format!("Failed to spawn rsync: {}", e)))?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| MirrorError::Process("Failed to capture rsync stdout".into()))?;
            let mut stderr = child
                .stderr
                .take()
                .ok_or_else(|| MirrorError::Process("Failed to capture rsync stderr".into()))?;

            let stderr_reader = tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            });

            let bytes_copied = follow_progress(stdout).await;

            let status = child
                .wait()
                .await
                .map_err(|e| MirrorError::Process(format!("Failed to wait for rsync: {}", e)))?;
            let stderr = stderr_reader.await.unwrap_or_default();

            if !status.success() {
                if !task.source.exists() {
                    return Err(MirrorError::DeviceRemoved(task.source.display().to_string()));
                }
                return Err(MirrorError::Process(format!(
                    "rsync failed with {}: {}",
                    status,
                    stderr.trim()
                )));
            }

            let report = MirrorReport {
                bytes_copied,
                duration_secs: start.elapsed().as_secs(),
                ..MirrorReport::default()
            };
            info!(bytes = report.bytes_copied, duration_secs = report.duration_secs, "Rsync mirror complete");
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

fn dir_arg(path: &Path) -> OsString {
    let mut arg = path.as_os_str().to_owned();
    arg.push("/");
    arg
}

/// Parse a `--info=progress2` line into (bytes transferred, percent).
fn parse_progress(line: &str) -> Option<(u64, u8)> {
    let caps = PROGRESS.captures(line)?;
    let bytes = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let percent = caps.get(2)?.as_str().parse().ok()?;
    Some((bytes, percent))
}

/// Log rsync's progress lines until stdout closes; returns the last byte count seen.
async fn follow_progress(stdout: impl AsyncRead + Unpin) -> u64 {
    let throttle = LogThrottle::new(Duration::from_secs(2));
    let mut reader = tokio::io::BufReader::new(stdout);
    let mut chunk = [0u8; 4096];
    let mut line = Vec::new();
    let mut bytes_copied = 0;

    // progress2 rewrites its line with '\r', so split on both terminators.
    while let Ok(n) = reader.read(&mut chunk).await {
        if n == 0 {
            break;
        }

        for &b in &chunk[..n] {
            if b != b'\r' && b != b'\n' {
                line.push(b);
                continue;
            }
            if line.is_empty() {
                continue;
            }

            if let Some((bytes, percent)) = parse_progress(&String::from_utf8_lossy(&line)) {
                bytes_copied = bytes;
                if throttle.should_log() {
                    info!(bytes_copied = bytes, percent, "Mirror progress");
                }
            } else {
                debug!(line = %String::from_utf8_lossy(&line), "rsync");
            }
            line.clear();
        }
    }

    bytes_copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress("     12,345,678  45%   10.20MB/s    0:00:03 (xfr#3, to-chk=7/12)"),
            Some((12_345_678, 45))
        );
        assert_eq!(parse_progress("0 100%    0.00kB/s    0:00:00"), Some((0, 100)));
        assert_eq!(parse_progress("sending incremental file list"), None);
    }

    #[test]
    fn test_dir_arg_appends_slash() {
        assert_eq!(dir_arg(Path::new("/media/usb1")), OsString::from("/media/usb1/"));
    }

    #[tokio::test]
    async fn test_follow_progress_keeps_last_count() {
        let output: &[u8] = b"sending incremental file list\n   1,024  10%  1.00MB/s 0:00:01\r   10,240 100%  1.00MB/s 0:00:01\n";
        assert_eq!(follow_progress(output).await, 10_240);
    }
}
