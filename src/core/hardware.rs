use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Physical connection bus of a block device, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Usb,
    Internal,
    Other,
    /// No bus metadata was reported for this node.
    Unknown,
}

impl Transport {
    /// Map an `lsblk` TRAN value onto a transport class.
    pub fn from_tag(tag: Option<&str>) -> Self {
        let Some(tag) = tag.map(str::trim).filter(|t| !t.is_empty()) else {
            return Self::Unknown;
        };

        match tag.to_lowercase().as_str() {
            "usb" => Self::Usb,
            "sata" | "ata" | "nvme" | "pcie" | "sas" | "scsi" | "mmc" | "virtio" => {
                Self::Internal
            }
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::Internal => "internal",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

/// One node of the host's block-device tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Kernel device name, e.g. `sda` or `sda1`.
    pub id: String,
    pub transport: Transport,
    /// Active mount paths of this node only, in the order the host reported them.
    pub mountpoints: Vec<PathBuf>,
    /// Partitions and other nested devices.
    pub children: Vec<DeviceRecord>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, transport: Transport) -> Self {
        Self {
            id: id.into(),
            transport,
            mountpoints: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_mountpoint(mut self, mountpoint: impl Into<PathBuf>) -> Self {
        self.mountpoints.push(mountpoint.into());
        self
    }

    pub fn with_child(mut self, child: DeviceRecord) -> Self {
        self.children.push(child);
        self
    }
}

/// Produces a snapshot of the whole block-device tree.
///
/// Implementations must answer from a single query so that transport tags
/// and mountpoints are consistent with each other.
#[async_trait]
pub trait DeviceTreeSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<DeviceRecord>, QueryError>;
}

/// Fallback lookup of a device's connection bus, used only for nodes the
/// device tree reported without a transport tag.
#[async_trait]
pub trait BusProbe: Send + Sync {
    async fn is_usb(&self, device_id: &str) -> Result<bool, QueryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_from_tag() {
        assert_eq!(Transport::from_tag(Some("usb")), Transport::Usb);
        assert_eq!(Transport::from_tag(Some("USB")), Transport::Usb);
        assert_eq!(Transport::from_tag(Some("nvme")), Transport::Internal);
        assert_eq!(Transport::from_tag(Some("sata")), Transport::Internal);
        assert_eq!(Transport::from_tag(Some("iscsi")), Transport::Other);
        assert_eq!(Transport::from_tag(Some("")), Transport::Unknown);
        assert_eq!(Transport::from_tag(Some("  ")), Transport::Unknown);
        assert_eq!(Transport::from_tag(None), Transport::Unknown);
    }

    #[test]
    fn test_device_record_builder() {
        let disk = DeviceRecord::new("sdb", Transport::Usb)
            .with_child(DeviceRecord::new("sdb1", Transport::Unknown).with_mountpoint("/media/a"));

        assert_eq!(disk.children.len(), 1);
        assert_eq!(disk.children[0].mountpoints, vec![PathBuf::from("/media/a")]);
        assert!(disk.mountpoints.is_empty());
    }
}
