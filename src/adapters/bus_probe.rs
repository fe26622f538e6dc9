use std::io::ErrorKind;

use async_trait::async_trait;
use tracing::debug;

use crate::core::hardware::BusProbe;
use crate::error::QueryError;

/// Reads the `ID_BUS` udev property of a block device.
pub struct UdevBusProbe;

#[async_trait]
impl BusProbe for UdevBusProbe {
    async fn is_usb(&self, device_id: &str) -> Result<bool, QueryError> {
        let sysname = device_id.to_string();

        // libudev handles are not Send; the whole lookup stays on one thread.
        tokio::task::spawn_blocking(move || lookup_usb_bus(&sysname))
            .await
            .map_err(|e| QueryError::BusProbe {
                device: device_id.to_string(),
                source: std::io::Error::other(e),
            })?
    }
}

fn lookup_usb_bus(sysname: &str) -> Result<bool, QueryError> {
    match udev::Device::from_subsystem_sysname("block".to_string(), sysname.to_string()) {
        Ok(device) => {
            let bus = device.property_value("ID_BUS").and_then(|v| v.to_str());
            debug!(device = sysname, bus = ?bus, "udev bus property");
            Ok(bus == Some("usb"))
        }
        // Gone between the tree query and this lookup.
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(device = sysname, "Device vanished before bus lookup");
            Ok(false)
        }
        Err(source) => Err(QueryError::BusProbe {
            device: sysname.to_string(),
            source,
        }),
    }
}
