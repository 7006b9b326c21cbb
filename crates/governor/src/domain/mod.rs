//! Domain logic of the governor
//!
//! Components in dependency order: capacity accounting, the device catalog
//! and unit inventory, the profile registry, the partition scheme manager and
//! the admission controller. [`engine::GovernanceEngine`] wires them up.

use std::sync::Arc;

use utils::keyed_lock::KeyedAsyncLock;

use self::capacity::CapacityAccountant;
use self::inventory::DeviceCatalog;
use self::inventory::DeviceId;
use self::inventory::InventoryReconciler;

pub mod admission;
pub mod capacity;
pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod inventory;
pub mod partition;
pub mod profiles;

/// Per-device state shared by the partition manager and admission.
///
/// Every mutation of a device's catalog entry, units or reservations happens
/// while holding that device's lock from `locks`.
#[derive(Clone)]
pub struct Fleet {
    pub locks: Arc<KeyedAsyncLock<DeviceId>>,
    pub catalog: Arc<DeviceCatalog>,
    pub inventory: Arc<InventoryReconciler>,
    pub capacity: Arc<CapacityAccountant>,
}

impl Fleet {
    pub fn new(headroom_mib: u64) -> Self {
        Self {
            locks: Arc::new(KeyedAsyncLock::new()),
            catalog: Arc::new(DeviceCatalog::new(headroom_mib)),
            inventory: Arc::new(InventoryReconciler::new()),
            capacity: Arc::new(CapacityAccountant::new(headroom_mib)),
        }
    }
}
