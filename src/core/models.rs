use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a backup: which device, mounted where.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceKey {
    pub device_id: String,
    pub mountpoint: PathBuf,
}

impl DeviceKey {
    pub fn new(device_id: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            device_id: device_id.into(),
            mountpoint: mountpoint.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.device_id, self.mountpoint.display())
    }
}

/// A key that has been mirrored successfully during this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedDevice {
    pub key: DeviceKey,
    pub backed_up_at: DateTime<Utc>,
}

/// How a backup target path is derived from a device key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TargetLayout {
    /// `<root>/<mountpoint basename>`. Devices sharing a basename collide.
    #[default]
    Basename,
    /// `<root>/<device id>/<mountpoint basename>`.
    Device,
}

/// A single mirror job: copy `source` into `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTask {
    pub key: DeviceKey,
    pub source: PathBuf,
    pub target: PathBuf,
}

impl BackupTask {
    /// Derive the task for `key`. Returns None when the mountpoint has no
    /// final path component to name the target after (e.g. `/`).
    pub fn plan(key: &DeviceKey, target_root: &Path, layout: TargetLayout) -> Option<Self> {
        let name = key.mountpoint.file_name()?;

        let target = match layout {
            TargetLayout::Basename => target_root.join(name),
            TargetLayout::Device => target_root.join(&key.device_id).join(name),
        };

        Some(Self {
            key: key.clone(),
            source: key.mountpoint.clone(),
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_basename_layout() {
        let key = DeviceKey::new("sda", "/media/usb1");
        let task = BackupTask::plan(&key, Path::new("/backup"), TargetLayout::Basename).unwrap();

        assert_eq!(task.source, PathBuf::from("/media/usb1"));
        assert_eq!(task.target, PathBuf::from("/backup/usb1"));
    }

    #[test]
    fn test_plan_device_layout() {
        let key = DeviceKey::new("sdc", "/run/media/joe/CAMERA");
        let task = BackupTask::plan(&key, Path::new("/backup"), TargetLayout::Device).unwrap();

        assert_eq!(task.target, PathBuf::from("/backup/sdc/CAMERA"));
    }

    #[test]
    fn test_basename_layout_collides_across_devices() {
        let a = DeviceKey::new("sdb", "/media/alice/DISK");
        let b = DeviceKey::new("sdc", "/media/bob/DISK");
        let root = Path::new("/backup");

        let ta = BackupTask::plan(&a, root, TargetLayout::Basename).unwrap();
        let tb = BackupTask::plan(&b, root, TargetLayout::Basename).unwrap();
        assert_eq!(ta.target, tb.target);

        let ta = BackupTask::plan(&a, root, TargetLayout::Device).unwrap();
        let tb = BackupTask::plan(&b, root, TargetLayout::Device).unwrap();
        assert_ne!(ta.target, tb.target);
    }

    #[test]
    fn test_plan_root_mountpoint_has_no_target() {
        let key = DeviceKey::new("sda", "/");
        assert!(BackupTask::plan(&key, Path::new("/backup"), TargetLayout::Basename).is_none());
    }

    #[test]
    fn test_device_key_display() {
        assert_eq!(DeviceKey::new("sda", "/media/usb1").to_string(), "sda@/media/usb1");
    }
}
