//! Derives allocatable units from devices and their active partition scheme
//!
//! The reconciler owns every [`AllocatableUnit`]. All mutating operations take
//! a [`DeviceGuard`] so unit changes for one device are serialized with its
//! scheme transitions and capacity reservations.

use api_types::DeviceHealth;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::mig::MAX_COMPUTE_SLICES;
use super::types::AllocatableUnit;
use super::types::DeviceGuard;
use super::types::DeviceId;
use super::types::GpuDevice;
use super::types::MemoryPlacement;
use super::types::PartitionScheme;
use super::types::UnitId;
use super::types::UnitKind;
use crate::domain::error::SchemeError;

const EVENT_CAPACITY: usize = 256;

/// Changes of the unit pool, consumed by admission and the device workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryEvent {
    /// A device's unit set was (re)derived
    UnitSetChanged {
        device: DeviceId,
        generation: u64,
        units: usize,
    },
    /// Units of a device stopped being allocatable
    UnitsWithdrawn { device: DeviceId },
    /// Units of a device became allocatable again
    UnitsRestored { device: DeviceId },
    /// In-use units of a device were freed
    UnitsReleased { device: DeviceId, units: usize },
    DeviceRemoved { device: DeviceId },
}

/// Whether a reconcile pass changed the unit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Changed,
}

/// Errors marking units as used or free.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("unit {0} does not exist")]
    UnknownUnit(String),
    #[error("unit {0} is not allocatable")]
    NotAllocatable(String),
}

#[derive(Debug, Default)]
struct DeviceUnits {
    units: Vec<AllocatableUnit>,
    health: DeviceHealth,
    /// New consumption blocked while a scheme transition is pending
    blocked: bool,
    /// Device is in a failed transition and reports no allocatable units
    failed: bool,
}

impl DeviceUnits {
    fn allocatable(&self) -> bool {
        self.health != DeviceHealth::Unreachable && !self.failed
    }

    fn refresh_availability(&mut self) -> bool {
        let available = self.allocatable();
        let mut changed = false;
        for unit in &mut self.units {
            if unit.available != available {
                unit.available = available;
                changed = true;
            }
        }
        changed
    }
}

/// Computes the unit set a scheme yields on a device.
///
/// `TimeSliced{r}` yields `r` shared slots that each address the whole device
/// memory. `Mig{slices}` yields one isolated slice per entry, packed at
/// consecutive, non-overlapping memory offsets.
pub fn derive_units(
    device: &GpuDevice,
    scheme: &PartitionScheme,
    generation: u64,
) -> Result<Vec<AllocatableUnit>, SchemeError> {
    let unit = |ordinal: u32, kind: UnitKind, memory_mib: u64, placement| AllocatableUnit {
        id: UnitId {
            device: device.id.clone(),
            ordinal,
        },
        kind,
        memory_mib,
        placement,
        generation,
        in_use: false,
        available: device.health != DeviceHealth::Unreachable,
    };

    match scheme {
        PartitionScheme::Unpartitioned => Ok(vec![unit(
            0,
            UnitKind::WholeDevice,
            device.total_memory_mib,
            None,
        )]),
        PartitionScheme::TimeSliced { replicas: 0 } => Err(SchemeError::ZeroReplicas),
        PartitionScheme::TimeSliced { replicas } => Ok((0..*replicas)
            .map(|ordinal| unit(ordinal, UnitKind::SharedSlot, device.total_memory_mib, None))
            .collect()),
        PartitionScheme::Mig { slices } => {
            if slices.is_empty() {
                return Err(SchemeError::EmptyMig);
            }
            if !device.mig_capable {
                return Err(SchemeError::MigUnsupported {
                    device: device.id.to_string(),
                });
            }
            let compute: u32 = slices.iter().map(|s| s.compute_slices()).sum();
            if compute > MAX_COMPUTE_SLICES {
                return Err(SchemeError::ComputeExhausted {
                    used: compute,
                    max: MAX_COMPUTE_SLICES,
                });
            }
            let memory: u64 = slices.iter().map(|s| s.memory_mib()).sum();
            if memory > device.total_memory_mib {
                return Err(SchemeError::MemoryExhausted {
                    required_mib: memory,
                    total_mib: device.total_memory_mib,
                });
            }

            let mut offset = 0;
            let units = slices
                .iter()
                .zip(0u32..)
                .map(|(slice, ordinal)| {
                    let placement = MemoryPlacement {
                        offset_mib: offset,
                        size_mib: slice.memory_mib(),
                    };
                    offset = placement.end_mib();
                    unit(
                        ordinal,
                        UnitKind::IsolatedSlice(*slice),
                        slice.memory_mib(),
                        Some(placement),
                    )
                })
                .collect();
            Ok(units)
        }
    }
}

/// Owner of the allocatable unit pool.
#[derive(Debug)]
pub struct InventoryReconciler {
    devices: DashMap<DeviceId, DeviceUnits>,
    events: broadcast::Sender<InventoryEvent>,
}

impl Default for InventoryReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl InventoryReconciler {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InventoryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: InventoryEvent) {
        // no receivers is fine, e.g. before the event loop starts
        let _ = self.events.send(event);
    }

    /// Recomputes the unit set of `device` under `scheme`.
    ///
    /// Re-applying the same device, scheme and generation leaves the unit set
    /// untouched (in-use flags included) and emits nothing.
    pub fn reconcile(
        &self,
        guard: &DeviceGuard,
        device: &GpuDevice,
        scheme: &PartitionScheme,
        generation: u64,
    ) -> Result<ReconcileOutcome, SchemeError> {
        debug_assert_eq!(guard.key(), &device.id);
        let mut derived = derive_units(device, scheme, generation)?;

        let mut entry = self.devices.entry(device.id.clone()).or_default();
        let health_changed = entry.health != device.health;
        entry.health = device.health;

        let same_set = entry.units.len() == derived.len()
            && entry
                .units
                .iter()
                .zip(derived.iter())
                .all(|(current, next)| current.same_shape(next));

        if same_set {
            let availability_changed = entry.refresh_availability();
            let allocatable = entry.allocatable();
            drop(entry);
            if health_changed || availability_changed {
                debug!(device = %device.id, health = %device.health, "Device health updated");
                self.emit(if allocatable {
                    InventoryEvent::UnitsRestored {
                        device: device.id.clone(),
                    }
                } else {
                    InventoryEvent::UnitsWithdrawn {
                        device: device.id.clone(),
                    }
                });
            }
            return Ok(ReconcileOutcome::Unchanged);
        }

        for unit in &mut derived {
            if let Some(previous) = entry.units.iter().find(|u| u.id == unit.id) {
                if previous.in_use {
                    if previous.kind == unit.kind {
                        unit.in_use = true;
                    } else {
                        warn!(unit = %unit.id, "In-use unit changed kind during reconcile");
                    }
                }
            }
        }
        entry.units = derived;
        entry.refresh_availability();
        let units = entry.units.len();
        drop(entry);

        info!(
            device = %device.id,
            scheme = %scheme,
            generation = generation,
            units = units,
            "Unit set reconciled"
        );
        self.emit(InventoryEvent::UnitSetChanged {
            device: device.id.clone(),
            generation,
            units,
        });
        Ok(ReconcileOutcome::Changed)
    }

    /// Records a health transition. `Unreachable` withdraws all units at once.
    pub fn set_health(&self, guard: &DeviceGuard, health: DeviceHealth) {
        let Some(mut entry) = self.devices.get_mut(guard.key()) else {
            return;
        };
        if entry.health == health {
            return;
        }
        entry.health = health;
        let changed = entry.refresh_availability();
        let allocatable = entry.allocatable();
        drop(entry);

        if health == DeviceHealth::Unreachable {
            warn!(device = %guard.key(), "Device unreachable, units withdrawn");
        }
        if changed {
            self.emit(if allocatable {
                InventoryEvent::UnitsRestored {
                    device: guard.key().clone(),
                }
            } else {
                InventoryEvent::UnitsWithdrawn {
                    device: guard.key().clone(),
                }
            });
        }
    }

    /// Blocks or unblocks new consumption of the device's units.
    pub fn set_blocked(&self, guard: &DeviceGuard, blocked: bool) {
        if let Some(mut entry) = self.devices.get_mut(guard.key()) {
            entry.blocked = blocked;
        }
    }

    /// Marks the device failed (zero allocatable units) or recovered.
    pub fn set_failed(&self, guard: &DeviceGuard, failed: bool) {
        let Some(mut entry) = self.devices.get_mut(guard.key()) else {
            return;
        };
        entry.failed = failed;
        let changed = entry.refresh_availability();
        let allocatable = entry.allocatable();
        drop(entry);
        if changed {
            self.emit(if allocatable {
                InventoryEvent::UnitsRestored {
                    device: guard.key().clone(),
                }
            } else {
                InventoryEvent::UnitsWithdrawn {
                    device: guard.key().clone(),
                }
            });
        }
    }

    pub fn remove_device(&self, guard: &DeviceGuard) -> Vec<AllocatableUnit> {
        let removed = self
            .devices
            .remove(guard.key())
            .map(|(_, entry)| entry.units)
            .unwrap_or_default();
        self.emit(InventoryEvent::DeviceRemoved {
            device: guard.key().clone(),
        });
        removed
    }

    /// Marks units as consumed. Fails without changing anything if any unit
    /// is unknown, blocked, unavailable or already in use.
    pub fn mark_in_use(&self, guard: &DeviceGuard, ids: &[UnitId]) -> Result<(), UnitError> {
        let mut entry = self
            .devices
            .get_mut(guard.key())
            .ok_or_else(|| UnitError::UnknownUnit(guard.key().to_string()))?;
        let blocked = entry.blocked;

        for id in ids {
            let unit = entry
                .units
                .iter()
                .find(|u| &u.id == id)
                .ok_or_else(|| UnitError::UnknownUnit(id.to_string()))?;
            if blocked || unit.in_use || !unit.available {
                return Err(UnitError::NotAllocatable(id.to_string()));
            }
        }
        for unit in entry.units.iter_mut().filter(|u| ids.contains(&u.id)) {
            unit.in_use = true;
        }
        Ok(())
    }

    /// Frees units and announces the release.
    pub fn release_units(&self, guard: &DeviceGuard, ids: &[UnitId]) -> usize {
        let released = self.clear_in_use(guard, ids);
        if released > 0 {
            self.emit(InventoryEvent::UnitsReleased {
                device: guard.key().clone(),
                units: released,
            });
        }
        released
    }

    /// Frees units without an event, used to roll back an aborted admission.
    pub fn rollback_in_use(&self, guard: &DeviceGuard, ids: &[UnitId]) -> usize {
        self.clear_in_use(guard, ids)
    }

    fn clear_in_use(&self, guard: &DeviceGuard, ids: &[UnitId]) -> usize {
        let Some(mut entry) = self.devices.get_mut(guard.key()) else {
            return 0;
        };
        let mut released = 0;
        for unit in entry.units.iter_mut().filter(|u| ids.contains(&u.id)) {
            if unit.in_use {
                unit.in_use = false;
                released += 1;
            }
        }
        released
    }

    pub fn in_use_count(&self, device: &DeviceId) -> usize {
        self.devices
            .get(device)
            .map(|entry| entry.units.iter().filter(|u| u.in_use).count())
            .unwrap_or(0)
    }

    /// Units that may be handed out right now.
    pub fn allocatable_count(&self, device: &DeviceId) -> usize {
        self.devices
            .get(device)
            .map(|entry| {
                if entry.blocked || !entry.allocatable() {
                    0
                } else {
                    entry.units.iter().filter(|u| !u.in_use).count()
                }
            })
            .unwrap_or(0)
    }

    pub fn unit(&self, id: &UnitId) -> Option<AllocatableUnit> {
        self.devices
            .get(&id.device)
            .and_then(|entry| entry.units.iter().find(|u| &u.id == id).cloned())
    }

    /// Whether `id` exists, is available, free and on an unblocked device.
    pub fn is_free(&self, id: &UnitId) -> bool {
        self.devices
            .get(&id.device)
            .map(|entry| {
                !entry.blocked
                    && entry
                        .units
                        .iter()
                        .any(|u| &u.id == id && u.available && !u.in_use)
            })
            .unwrap_or(false)
    }

    /// Free units of `kind`, ordered by device then ordinal.
    pub fn free_units(&self, kind: &UnitKind) -> Vec<AllocatableUnit> {
        let mut units: Vec<AllocatableUnit> = self
            .devices
            .iter()
            .filter(|entry| !entry.blocked)
            .flat_map(|entry| {
                entry
                    .units
                    .iter()
                    .filter(|u| &u.kind == kind && u.available && !u.in_use)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    pub fn units(&self, device: &DeviceId) -> Vec<AllocatableUnit> {
        self.devices
            .get(device)
            .map(|entry| entry.units.clone())
            .unwrap_or_default()
    }

    /// Every unit of every device, for display.
    pub fn snapshot(&self) -> Vec<AllocatableUnit> {
        let mut units: Vec<AllocatableUnit> = self
            .devices
            .iter()
            .flat_map(|entry| entry.units.clone())
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use utils::keyed_lock::KeyedAsyncLock;

    use super::*;
    use crate::domain::inventory::types::ComputeCapability;

    fn a100(node: &str, index: u32) -> GpuDevice {
        GpuDevice {
            id: DeviceId::new(node, index),
            product: "NVIDIA A100-SXM4-40GB".to_string(),
            total_memory_mib: 40 * 1024,
            compute: ComputeCapability { major: 8, minor: 0 },
            mig_capable: true,
            health: DeviceHealth::Healthy,
        }
    }

    fn seven_small_slices() -> PartitionScheme {
        PartitionScheme::Mig {
            slices: vec!["1g.5gb".parse().unwrap(); 7],
        }
    }

    #[test]
    fn time_sliced_device_yields_shared_slots() {
        let device = a100("node-a", 0);
        let units = derive_units(&device, &PartitionScheme::TimeSliced { replicas: 4 }, 1).unwrap();

        assert_eq!(units.len(), 4);
        for unit in &units {
            assert_eq!(unit.kind, UnitKind::SharedSlot);
            assert_eq!(unit.memory_mib, device.total_memory_mib);
            assert!(unit.placement.is_none());
        }
    }

    #[test]
    fn mig_slices_do_not_overlap() {
        let device = a100("node-a", 0);
        let units = derive_units(&device, &seven_small_slices(), 1).unwrap();

        assert_eq!(units.len(), 7);
        for (i, a) in units.iter().enumerate() {
            assert_eq!(a.memory_mib, 5 * 1024);
            for b in units.iter().skip(i + 1) {
                assert!(!a.placement.unwrap().overlaps(&b.placement.unwrap()));
            }
        }
        let last = units.last().unwrap().placement.unwrap();
        assert!(last.end_mib() <= device.total_memory_mib);
    }

    #[test]
    fn mig_scheme_is_checked_against_device() {
        let mut device = a100("node-a", 0);
        let too_much_compute = PartitionScheme::Mig {
            slices: vec!["4g.20gb".parse().unwrap(), "4g.20gb".parse().unwrap()],
        };
        assert_eq!(
            derive_units(&device, &too_much_compute, 1),
            Err(SchemeError::ComputeExhausted { used: 8, max: 7 })
        );

        let too_much_memory = PartitionScheme::Mig {
            slices: vec!["3g.40gb".parse().unwrap(), "1g.5gb".parse().unwrap()],
        };
        assert!(matches!(
            derive_units(&device, &too_much_memory, 1),
            Err(SchemeError::MemoryExhausted { .. })
        ));

        device.mig_capable = false;
        assert!(matches!(
            derive_units(&device, &seven_small_slices(), 1),
            Err(SchemeError::MigUnsupported { .. })
        ));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let locks = KeyedAsyncLock::new();
        let inventory = InventoryReconciler::new();
        let device = a100("node-a", 0);
        let scheme = PartitionScheme::TimeSliced { replicas: 4 };
        let guard = locks.lock(&device.id).await;

        let first = inventory.reconcile(&guard, &device, &scheme, 1).unwrap();
        let before = inventory.units(&device.id);
        inventory
            .mark_in_use(&guard, &[before[1].id.clone()])
            .unwrap();

        let mut events = inventory.subscribe();
        let second = inventory.reconcile(&guard, &device, &scheme, 1).unwrap();
        let after = inventory.units(&device.id);

        assert_eq!(first, ReconcileOutcome::Changed);
        assert_eq!(second, ReconcileOutcome::Unchanged);
        assert_eq!(after.len(), before.len());
        assert!(after[1].in_use, "in-use flag survives re-application");
        assert!(events.try_recv().is_err(), "no event for unchanged set");
    }

    #[tokio::test]
    async fn unreachable_device_withdraws_units_immediately() {
        let locks = KeyedAsyncLock::new();
        let inventory = InventoryReconciler::new();
        let device = a100("node-a", 0);
        let guard = locks.lock(&device.id).await;
        inventory
            .reconcile(&guard, &device, &seven_small_slices(), 1)
            .unwrap();
        let mut events = inventory.subscribe();

        inventory.set_health(&guard, DeviceHealth::Unreachable);

        assert_eq!(inventory.allocatable_count(&device.id), 0);
        assert!(inventory.units(&device.id).iter().all(|u| !u.available));
        assert_eq!(
            events.try_recv().unwrap(),
            InventoryEvent::UnitsWithdrawn {
                device: device.id.clone()
            }
        );

        inventory.set_health(&guard, DeviceHealth::Degraded);
        assert_eq!(inventory.allocatable_count(&device.id), 7);
    }

    #[tokio::test]
    async fn blocked_device_offers_no_free_units() {
        let locks = KeyedAsyncLock::new();
        let inventory = InventoryReconciler::new();
        let device = a100("node-a", 0);
        let guard = locks.lock(&device.id).await;
        inventory
            .reconcile(&guard, &device, &PartitionScheme::TimeSliced { replicas: 2 }, 1)
            .unwrap();

        inventory.set_blocked(&guard, true);
        assert!(inventory.free_units(&UnitKind::SharedSlot).is_empty());
        let id = inventory.units(&device.id)[0].id.clone();
        assert_eq!(
            inventory.mark_in_use(&guard, &[id.clone()]),
            Err(UnitError::NotAllocatable(id.to_string()))
        );

        inventory.set_blocked(&guard, false);
        assert_eq!(inventory.free_units(&UnitKind::SharedSlot).len(), 2);
    }

    #[tokio::test]
    async fn mark_in_use_is_all_or_nothing() {
        let locks = KeyedAsyncLock::new();
        let inventory = InventoryReconciler::new();
        let device = a100("node-a", 0);
        let guard = locks.lock(&device.id).await;
        inventory
            .reconcile(&guard, &device, &PartitionScheme::TimeSliced { replicas: 2 }, 1)
            .unwrap();
        let ids: Vec<UnitId> = inventory.units(&device.id).into_iter().map(|u| u.id).collect();
        inventory.mark_in_use(&guard, &ids[1..]).unwrap();

        assert!(inventory.mark_in_use(&guard, &ids).is_err());
        assert_eq!(inventory.in_use_count(&device.id), 1);

        let mut events = inventory.subscribe();
        assert_eq!(inventory.release_units(&guard, &ids), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            InventoryEvent::UnitsReleased {
                device: device.id.clone(),
                units: 1
            }
        );
    }
}
