//! Device-tree snapshots from `lsblk --json`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, trace};

use crate::core::hardware::{DeviceRecord, DeviceTreeSource, Transport};
use crate::error::QueryError;

const COLUMNS: &str = "NAME,TRAN,MOUNTPOINTS";
// util-linux < 2.37 has no MOUNTPOINTS column.
const LEGACY_COLUMNS: &str = "NAME,TRAN,MOUNTPOINT";

/// Queries the whole block-device tree with a single `lsblk` call, so that
/// transport tags and mountpoints always come from the same instant.
pub struct LsblkSource {
    program: String,
    timeout: Duration,
    legacy: AtomicBool,
}

impl LsblkSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "lsblk".to_string(),
            timeout,
            legacy: AtomicBool::new(false),
        }
    }

    /// Use a different executable, e.g. a wrapper script.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn query(&self, columns: &str) -> Result<Vec<DeviceRecord>, QueryError> {
        let query = Command::new(&self.program)
            .args(["--json", "--output", columns])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, query).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(QueryError::Spawn {
                    command: self.program.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(QueryError::Timeout {
                    command: self.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(QueryError::Exited {
                command: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let devices = parse_lsblk(&String::from_utf8_lossy(&output.stdout))?;
        debug!(roots = devices.len(), "Queried block devices");
        Ok(devices)
    }
}

#[async_trait]
impl DeviceTreeSource for LsblkSource {
    async fn snapshot(&self) -> Result<Vec<DeviceRecord>, QueryError> {
        if self.legacy.load(Ordering::Relaxed) {
            return self.query(LEGACY_COLUMNS).await;
        }

        match self.query(COLUMNS).await {
            Err(QueryError::Exited { stderr, .. }) if stderr.contains("unknown column") => {
                info!(%stderr, "lsblk lacks MOUNTPOINTS, using the single-valued MOUNTPOINT column");
                self.legacy.store(true, Ordering::Relaxed);
                self.query(LEGACY_COLUMNS).await
            }
            result => result,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    tran: Option<String>,
    // util-linux < 2.37 only knows the single-valued column.
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl From<LsblkDevice> for DeviceRecord {
    fn from(dev: LsblkDevice) -> Self {
        let mut mountpoints: Vec<PathBuf> = Vec::new();
        let reported = dev.mountpoints.into_iter().flatten().chain(dev.mountpoint);

        for mountpoint in reported {
            let path = PathBuf::from(mountpoint);
            if !mountpoints.contains(&path) {
                mountpoints.push(path);
            }
        }

        trace!(device = %dev.name, tran = ?dev.tran, ?mountpoints, "lsblk node");

        DeviceRecord {
            id: dev.name,
            transport: Transport::from_tag(dev.tran.as_deref()),
            mountpoints,
            children: dev.children.into_iter().map(DeviceRecord::from).collect(),
        }
    }
}

/// Parse the JSON tree printed by `lsblk --json`.
pub fn parse_lsblk(json: &str) -> Result<Vec<DeviceRecord>, QueryError> {
    let parsed: LsblkOutput = serde_json::from_str(json)?;
    Ok(parsed.blockdevices.into_iter().map(DeviceRecord::from).collect())
}
