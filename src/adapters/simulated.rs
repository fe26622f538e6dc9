use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::core::hardware::{BusProbe, DeviceRecord, DeviceTreeSource};
use crate::error::QueryError;

#[derive(Default)]
struct HostState {
    devices: Vec<DeviceRecord>,
    usb_ids: BTreeSet<String>,
    failing_queries: u32,
    failing_probes: u32,
    probes: usize,
}

/// In-memory stand-in for the host's block-device layer.
///
/// Clones share state, so one handle can be given to the classifier while
/// another plugs and unplugs devices.
#[derive(Clone, Default)]
pub struct SimulatedHost {
    state: Arc<Mutex<HostState>>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a device tree, replacing any device with the same id.
    pub fn plug(&self, device: DeviceRecord) {
        let mut state = self.state();
        state.devices.retain(|d| d.id != device.id);
        state.devices.push(device);
    }

    /// Detach a device. Returns false if it was not attached.
    pub fn unplug(&self, device_id: &str) -> bool {
        let mut state = self.state();
        let before = state.devices.len();
        state.devices.retain(|d| d.id != device_id);
        state.devices.len() != before
    }

    /// Make the bus-property fallback report `device_id` as USB.
    pub fn mark_usb(&self, device_id: &str) {
        self.state().usb_ids.insert(device_id.to_string());
    }

    /// Fail the next `count` device-tree queries.
    pub fn fail_next_queries(&self, count: u32) {
        self.state().failing_queries = count;
    }

    /// Fail the next `count` bus-property lookups with an I/O error.
    pub fn fail_next_probes(&self, count: u32) {
        self.state().failing_probes = count;
    }

    /// Number of bus-property lookups served so far.
    pub fn probe_count(&self) -> usize {
        self.state().probes
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.state().devices.iter().map(|d| d.id.clone()).collect()
    }
}

#[async_trait]
impl DeviceTreeSource for SimulatedHost {
    async fn snapshot(&self) -> Result<Vec<DeviceRecord>, QueryError> {
        let mut state = self.state();
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(QueryError::Simulated);
        }
        Ok(state.devices.clone())
    }
}

#[async_trait]
impl BusProbe for SimulatedHost {
    async fn is_usb(&self, device_id: &str) -> Result<bool, QueryError> {
        let mut state = self.state();
        state.probes += 1;
        if state.failing_probes > 0 {
            state.failing_probes -= 1;
            return Err(QueryError::BusProbe {
                device: device_id.to_string(),
                source: std::io::Error::other("simulated udev failure"),
            });
        }
        Ok(state.usb_ids.contains(device_id))
    }
}
