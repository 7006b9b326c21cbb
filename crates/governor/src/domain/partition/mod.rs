//! Partition scheme transitions: drain, reconfigure, verify

mod manager;
#[cfg(test)]
pub(crate) mod mock;
mod state;
mod traits;

pub use manager::PartitionManager;
pub use manager::PartitionSettings;
pub use manager::DEVICE_NAMESPACE;
pub use state::describe_shape;
pub use state::expected_shape;
pub use state::scheme_shape;
pub use state::DeviceRecord;
pub use state::RealizedShape;
pub use state::TransitionPhase;
pub use traits::Orchestrator;
pub use traits::OrchestratorError;
pub use traits::StateStore;
pub use traits::StoreError;
pub use traits::StoredRecord;
