//! Device classification: which mounted filesystems belong to USB storage.
//!
//! Classification is two-tiered. The transport tag from the device-tree
//! snapshot is authoritative; only nodes reported without a tag (and without
//! an already classified parent) fall back to a bus-property lookup. Mount
//! paths never identify a device as USB, they only exclude mountpoints.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::core::hardware::{BusProbe, DeviceRecord, DeviceTreeSource, Transport};
use crate::core::models::DeviceKey;
use crate::error::QueryError;

/// Mountpoint filters applied to every USB-backed mount.
#[derive(Debug, Clone, Default)]
pub struct ClassifierRules {
    /// Reserved system paths and why they are reserved. `/` matches only
    /// itself; every other entry also covers the paths below it.
    pub forbidden: BTreeMap<PathBuf, String>,
    /// Final path components that are never backed up.
    pub excluded_names: BTreeSet<String>,
    /// Mountpoints containing this path are skipped so the backup
    /// destination is never mirrored into itself.
    pub backup_root: Option<PathBuf>,
}

/// Why a USB mountpoint was left out of the candidate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotAbsolute,
    Forbidden { path: PathBuf, reason: String },
    Excluded(String),
    HoldsBackupRoot,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAbsolute => write!(f, "not a filesystem path"),
            Self::Forbidden { path, reason } => {
                write!(f, "reserved system path {} ({})", path.display(), reason)
            }
            Self::Excluded(name) => write!(f, "name '{}' is excluded", name),
            Self::HoldsBackupRoot => write!(f, "contains the backup directory"),
        }
    }
}

impl ClassifierRules {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            forbidden: config.forbidden_mountpoints.clone(),
            excluded_names: config.excluded_names.clone(),
            backup_root: Some(config.backup_directory.clone()),
        }
    }

    pub fn rejection(&self, mountpoint: &Path) -> Option<Rejection> {
        if !mountpoint.is_absolute() {
            return Some(Rejection::NotAbsolute);
        }

        for (path, reason) in &self.forbidden {
            let covered = if path.parent().is_none() {
                mountpoint == path
            } else {
                mountpoint.starts_with(path)
            };

            if covered {
                return Some(Rejection::Forbidden {
                    path: path.clone(),
                    reason: reason.clone(),
                });
            }
        }

        if let Some(name) = mountpoint.file_name().and_then(|n| n.to_str()) {
            if self.excluded_names.contains(name) {
                return Some(Rejection::Excluded(name.to_string()));
            }
        }

        if let Some(root) = &self.backup_root {
            if root.starts_with(mountpoint) {
                return Some(Rejection::HoldsBackupRoot);
            }
        }

        None
    }
}

pub struct Classifier {
    source: Arc<dyn DeviceTreeSource>,
    probe: Arc<dyn BusProbe>,
    rules: ClassifierRules,
}

impl Classifier {
    pub fn new(
        source: Arc<dyn DeviceTreeSource>,
        probe: Arc<dyn BusProbe>,
        rules: ClassifierRules,
    ) -> Self {
        Self {
            source,
            probe,
            rules,
        }
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    /// Return every currently mounted, USB-backed `(device, mountpoint)` pair
    /// that passes the mountpoint filters.
    ///
    /// Errors mean the host could not be queried; callers must not read an
    /// error as an empty device list.
    pub async fn enumerate_candidates(&self) -> Result<BTreeSet<DeviceKey>, QueryError> {
        let roots = self.source.snapshot().await?;
        let mut candidates = BTreeSet::new();

        // (node, id of the topmost USB ancestor, whether an ancestor was classified)
        let mut stack: Vec<(&DeviceRecord, Option<&str>, bool)> =
            roots.iter().rev().map(|node| (node, None, false)).collect();

        while let Some((node, owner, under_classified)) = stack.pop() {
            let owner = match owner {
                Some(id) => Some(id),
                None => {
                    if self.qualifies(node, under_classified).await? {
                        debug!(device = %node.id, transport = node.transport.as_str(), "USB device");
                        Some(node.id.as_str())
                    } else {
                        None
                    }
                }
            };

            if let Some(device_id) = owner {
                for mountpoint in &node.mountpoints {
                    match self.rules.rejection(mountpoint) {
                        Some(reason) => debug!(
                            device = %node.id,
                            mountpoint = %mountpoint.display(),
                            %reason,
                            "Skipping mountpoint"
                        ),
                        None => {
                            candidates.insert(DeviceKey::new(device_id, mountpoint.clone()));
                        }
                    }
                }
            }

            for child in node.children.iter().rev() {
                stack.push((child, owner, true));
            }
        }

        Ok(candidates)
    }

    async fn qualifies(&self, node: &DeviceRecord, under_classified: bool) -> Result<bool, QueryError> {
        match node.transport {
            Transport::Usb => Ok(true),
            Transport::Internal | Transport::Other => Ok(false),
            // Partitions inherit the verdict already reached for their disk.
            Transport::Unknown if under_classified => Ok(false),
            Transport::Unknown => {
                let is_usb = self.probe.is_usb(&node.id).await?;
                trace!(device = %node.id, is_usb, "Bus property fallback");
                Ok(is_usb)
            }
        }
    }
}
