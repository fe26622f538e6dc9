use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core::hardware::{BusProbe, DeviceRecord, DeviceTreeSource, Transport};

#[cfg(target_os = "linux")]
mod bus_probe;
mod lsblk;
mod simulated;

#[cfg(target_os = "linux")]
pub use bus_probe::UdevBusProbe;
pub use lsblk::{LsblkSource, parse_lsblk};
pub use simulated::SimulatedHost;

/// The host collaborators the classifier pulls device state from.
pub struct HostAdapters {
    pub source: Arc<dyn DeviceTreeSource>,
    pub probe: Arc<dyn BusProbe>,
}

impl HostAdapters {
    pub fn simulated(host: &SimulatedHost) -> Self {
        Self {
            source: Arc::new(host.clone()),
            probe: Arc::new(host.clone()),
        }
    }
}

pub fn get_host(config: &AppConfig) -> HostAdapters {
    if config.simulation {
        let host = SimulatedHost::new();
        spawn_console(host.clone());
        return HostAdapters::simulated(&host);
    }

    #[cfg(target_os = "linux")]
    {
        HostAdapters {
            source: Arc::new(LsblkSource::new(config.query_timeout())),
            probe: Arc::new(UdevBusProbe),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        warn!("Hardware detection is only supported on Linux, falling back to simulation");
        let host = SimulatedHost::new();
        spawn_console(host.clone());
        HostAdapters::simulated(&host)
    }
}

/// Drive a simulated host from stdin.
fn spawn_console(host: SimulatedHost) {
    std::thread::spawn(move || {
        info!("Simulator ready: 'plug <id> <mountpoint>', 'unplug <id>', 'fail'");

        for line in std::io::stdin().lines().map_while(Result::ok) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["plug", id, mountpoint] => {
                    let partition = DeviceRecord::new(format!("{id}1"), Transport::Unknown)
                        .with_mountpoint(*mountpoint);
                    host.plug(DeviceRecord::new(*id, Transport::Usb).with_child(partition));
                    info!(device = id, mountpoint, "(Simulator) plugged");
                }
                ["unplug", id] => {
                    if host.unplug(id) {
                        info!(device = id, "(Simulator) unplugged");
                    } else {
                        warn!(device = id, attached = ?host.device_ids(), "(Simulator) no such device");
                    }
                }
                ["fail"] => {
                    host.fail_next_queries(1);
                    info!("(Simulator) next device query will fail");
                }
                [] => {}
                _ => warn!("(Simulator) use: 'plug <id> <mountpoint>', 'unplug <id>' or 'fail'"),
            }
        }
    });
}
