//! Per-device memory accounting
//!
//! Every reservation and release for a device happens while its
//! [`DeviceGuard`] is held, so the ledger of one device is never observed
//! half-updated by a concurrent admission attempt.

use std::collections::HashMap;

use dashmap::DashMap;
use thiserror::Error;
use tracing::error;

use super::inventory::AllocatableUnit;
use super::inventory::DeviceGuard;
use super::inventory::DeviceId;
use super::inventory::UnitId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("insufficient capacity on {device}: requested {requested_mib} MiB, {available_mib} MiB available")]
    Insufficient {
        device: String,
        requested_mib: u64,
        available_mib: u64,
    },

    /// An exclusive unit was asked for more memory than it owns. Admission
    /// only ever requests the exact share, so this indicates a bug.
    #[error("reservation of {requested_mib} MiB exceeds the {share_mib} MiB share of unit {unit}")]
    ExceedsUnitShare {
        unit: String,
        requested_mib: u64,
        share_mib: u64,
    },

    #[error("unit {0} already holds a reservation")]
    AlreadyReserved(String),

    #[error("no capacity ledger for device {0}")]
    UnknownDevice(String),

    #[error("unit {unit} does not belong to the locked device {device}")]
    ForeignUnit { unit: String, device: String },
}

impl CapacityError {
    /// Whether the failure is a shortfall that may resolve by waiting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Insufficient { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    memory_mib: u64,
    shared: bool,
}

#[derive(Debug, Default)]
struct DeviceLedger {
    total_mib: u64,
    reservations: HashMap<UnitId, Reservation>,
}

impl DeviceLedger {
    fn shared_reserved(&self) -> u64 {
        self.reservations
            .values()
            .filter(|r| r.shared)
            .map(|r| r.memory_mib)
            .sum()
    }

    fn reserved(&self) -> u64 {
        self.reservations.values().map(|r| r.memory_mib).sum()
    }
}

/// Tracks reserved memory per device.
#[derive(Debug)]
pub struct CapacityAccountant {
    headroom_mib: u64,
    ledgers: DashMap<DeviceId, DeviceLedger>,
}

impl CapacityAccountant {
    pub fn new(headroom_mib: u64) -> Self {
        Self {
            headroom_mib,
            ledgers: DashMap::new(),
        }
    }

    pub fn headroom_mib(&self) -> u64 {
        self.headroom_mib
    }

    /// Creates or resizes the ledger of a device. Existing reservations are kept.
    pub fn track_device(&self, guard: &DeviceGuard, total_mib: u64) {
        self.ledgers
            .entry(guard.key().clone())
            .or_default()
            .total_mib = total_mib;
    }

    pub fn forget_device(&self, guard: &DeviceGuard) {
        self.ledgers.remove(guard.key());
    }

    /// Memory that concurrent shared reservations may use on the device.
    pub fn shared_ceiling_mib(&self, device: &DeviceId) -> Option<u64> {
        self.ledgers
            .get(device)
            .map(|ledger| ledger.total_mib.saturating_sub(self.headroom_mib))
    }

    /// Reserves `memory_mib` for `unit`.
    ///
    /// Exclusive units (whole device, isolated slice) are recorded at their
    /// fixed share; asking for more is reported as [`CapacityError::ExceedsUnitShare`].
    /// Shared slots are admitted while the device's shared total stays within
    /// `total - headroom`.
    pub fn reserve(
        &self,
        guard: &DeviceGuard,
        unit: &AllocatableUnit,
        memory_mib: u64,
    ) -> Result<(), CapacityError> {
        let device = guard.key();
        if unit.device() != device {
            return Err(CapacityError::ForeignUnit {
                unit: unit.id.to_string(),
                device: device.to_string(),
            });
        }
        let mut ledger = self
            .ledgers
            .get_mut(device)
            .ok_or_else(|| CapacityError::UnknownDevice(device.to_string()))?;
        if ledger.reservations.contains_key(&unit.id) {
            return Err(CapacityError::AlreadyReserved(unit.id.to_string()));
        }

        let reservation = if unit.kind.is_exclusive() {
            if memory_mib > unit.memory_mib {
                let err = CapacityError::ExceedsUnitShare {
                    unit: unit.id.to_string(),
                    requested_mib: memory_mib,
                    share_mib: unit.memory_mib,
                };
                error!(error = %err, "BUG: exclusive reservation larger than unit share");
                return Err(err);
            }
            let available = ledger.total_mib.saturating_sub(ledger.reserved());
            if unit.memory_mib > available {
                return Err(CapacityError::Insufficient {
                    device: device.to_string(),
                    requested_mib: unit.memory_mib,
                    available_mib: available,
                });
            }
            Reservation {
                memory_mib: unit.memory_mib,
                shared: false,
            }
        } else {
            let ceiling = ledger.total_mib.saturating_sub(self.headroom_mib);
            let available = ceiling.saturating_sub(ledger.shared_reserved());
            if memory_mib > available {
                return Err(CapacityError::Insufficient {
                    device: device.to_string(),
                    requested_mib: memory_mib,
                    available_mib: available,
                });
            }
            Reservation {
                memory_mib,
                shared: true,
            }
        };

        ledger.reservations.insert(unit.id.clone(), reservation);
        Ok(())
    }

    /// Releases the reservation held by `unit`, returning the freed memory.
    pub fn release(&self, guard: &DeviceGuard, unit: &UnitId) -> u64 {
        self.ledgers
            .get_mut(guard.key())
            .and_then(|mut ledger| ledger.reservations.remove(unit))
            .map(|r| r.memory_mib)
            .unwrap_or(0)
    }

    pub fn reserved_mib(&self, device: &DeviceId) -> u64 {
        self.ledgers
            .get(device)
            .map(|ledger| ledger.reserved())
            .unwrap_or(0)
    }

    pub fn reservation_count(&self, device: &DeviceId) -> usize {
        self.ledgers
            .get(device)
            .map(|ledger| ledger.reservations.len())
            .unwrap_or(0)
    }
}
