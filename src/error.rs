//! Error types shared by the classifier, the mirror engines and startup.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The device-tree or bus-property query could not complete.
///
/// A query error never means "no devices": the orchestrator skips the tick
/// and leaves its tracked state alone.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command} exited with {status}: {stderr}")]
    Exited {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("malformed device tree: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("bus property lookup for {device} failed: {source}")]
    BusProbe {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("simulated query failure")]
    Simulated,
}

/// Mirroring a single device failed. The device stays untracked and is
/// retried on the next poll while it remains mounted.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("source {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("device removed during mirror: {0}")]
    DeviceRemoved(String),

    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Process(String),

    #[error("mirror completed with {count} error(s):\n{summary}")]
    Copy { count: usize, summary: String },

    #[error("mirror task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("simulated mirror failure for {0}")]
    Simulated(PathBuf),
}

/// Startup configuration is unusable. Fatal: the daemon never starts with
/// a broken target.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("cannot create backup directory {path}: {source}")]
    BackupDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup path {0} exists but is not a directory")]
    NotADirectory(PathBuf),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}
