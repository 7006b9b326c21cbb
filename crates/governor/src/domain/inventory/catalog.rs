use dashmap::DashMap;

use super::types::DeviceGuard;
use super::types::DeviceId;
use super::types::GpuDevice;
use super::types::UnitKind;

/// Devices currently known to the governor.
///
/// Written by the partition manager under the device guard, read by the
/// profile registry to decide which unit kinds the fleet can produce.
#[derive(Debug)]
pub struct DeviceCatalog {
    devices: DashMap<DeviceId, GpuDevice>,
    headroom_mib: u64,
}

impl DeviceCatalog {
    pub fn new(headroom_mib: u64) -> Self {
        Self {
            devices: DashMap::new(),
            headroom_mib,
        }
    }

    pub fn upsert(&self, guard: &DeviceGuard, device: GpuDevice) -> Option<GpuDevice> {
        debug_assert_eq!(guard.key(), &device.id);
        self.devices.insert(device.id.clone(), device)
    }

    pub fn remove(&self, guard: &DeviceGuard) -> Option<GpuDevice> {
        self.devices.remove(guard.key()).map(|(_, device)| device)
    }

    pub fn get(&self, id: &DeviceId) -> Option<GpuDevice> {
        self.devices.get(id).map(|device| device.clone())
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Largest per-unit memory share any known device can offer for `kind`,
    /// whether or not its current scheme produces that kind. `None` when no
    /// known device can produce it at all.
    ///
    /// Shared slots address the whole device but concurrent use is capped at
    /// `total - headroom`, which is what a single workload can rely on.
    pub fn max_unit_share_mib(&self, kind: &UnitKind) -> Option<u64> {
        self.devices
            .iter()
            .filter_map(|device| match kind {
                UnitKind::WholeDevice => Some(device.total_memory_mib),
                UnitKind::SharedSlot => {
                    Some(device.total_memory_mib.saturating_sub(self.headroom_mib))
                        .filter(|share| *share > 0)
                }
                UnitKind::IsolatedSlice(profile) => (device.mig_capable
                    && profile.memory_mib() <= device.total_memory_mib)
                    .then(|| profile.memory_mib()),
            })
            .max()
    }
}
