//! Mirror engines: make a target directory an exact copy of a source tree.
//!
//! Every engine honours the same contract:
//! - an existing target is brought in line with the source, stale entries removed
//! - a missing source fails before anything is created at the target
//! - the returned future completes only when the mirror has finished

pub mod native_copy;
pub mod rsync;
pub mod simulated;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::models::BackupTask;
use crate::core::ownership::BackupOwner;
use crate::error::MirrorError;

pub use native_copy::NativeCopyEngine;
pub use rsync::RsyncEngine;
pub use simulated::SimulatedEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MirrorEngineType {
    #[default]
    Rsync,
    NativeCopy,
    Simulated,
}

/// Summary of a finished mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub bytes_copied: u64,
    pub files_copied: u64,
    pub files_removed: u64,
    pub duration_secs: u64,
}

#[async_trait]
pub trait MirrorEngine: Send + Sync {
    async fn mirror(&self, task: &BackupTask) -> Result<MirrorReport, MirrorError>;
}

pub fn create_engine(
    engine_type: MirrorEngineType,
    owner: Option<BackupOwner>,
) -> Arc<dyn MirrorEngine> {
    match engine_type {
        MirrorEngineType::Rsync => Arc::new(RsyncEngine { owner }),
        MirrorEngineType::NativeCopy => Arc::new(NativeCopyEngine {
            sync_files: true,
            owner,
        }),
        MirrorEngineType::Simulated => Arc::new(SimulatedEngine::default()),
    }
}

/// Fail cleanly when the device vanished between classification and mirroring.
pub(crate) fn ensure_source(source: &Path) -> Result<(), MirrorError> {
    match std::fs::metadata(source) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(MirrorError::Prepare {
            path: source.to_path_buf(),
            source: std::io::Error::other("source is not a directory"),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(MirrorError::SourceMissing(source.to_path_buf()))
        }
        Err(source_err) => Err(MirrorError::Prepare {
            path: source.to_path_buf(),
            source: source_err,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_source() {
        let temp = tempfile::tempdir().unwrap();
        assert!(ensure_source(temp.path()).is_ok());

        let missing = temp.path().join("gone");
        assert!(matches!(
            ensure_source(&missing),
            Err(MirrorError::SourceMissing(p)) if p == missing
        ));

        let file = temp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(ensure_source(&file), Err(MirrorError::Prepare { .. })));
    }
}
