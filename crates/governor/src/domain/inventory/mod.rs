//! Physical GPU inventory and the allocatable units derived from it

mod catalog;
mod mig;
mod reconciler;
mod types;

pub use catalog::DeviceCatalog;
pub use mig::MigProfile;
pub use mig::MAX_COMPUTE_SLICES;
pub use reconciler::derive_units;
pub use reconciler::InventoryEvent;
pub use reconciler::InventoryReconciler;
pub use reconciler::ReconcileOutcome;
pub use reconciler::UnitError;
pub use types::*;
