//! Collaborator traits used by the partition manager and admission controller

use core::error::Error;

use async_trait::async_trait;
use error_stack::Report;

use super::state::RealizedShape;
use crate::domain::inventory::DeviceId;
use crate::domain::inventory::PartitionScheme;
use crate::domain::inventory::UnitId;

/// Errors reported by the orchestrator collaborator.
#[derive(Debug, derive_more::Display)]
pub enum OrchestratorError {
    #[display("Failed to cordon node {node}")]
    Cordon { node: String },
    #[display("Failed to uncordon node {node}")]
    Uncordon { node: String },
    #[display("Failed to evict workloads: {message}")]
    Eviction { message: String },
    #[display("Failed to apply partition scheme to {device}")]
    Apply { device: String },
    #[display("Failed to read realized shape of {device}")]
    ReadShape { device: String },
}

impl Error for OrchestratorError {}

/// Node and workload lifecycle operations the governor delegates.
///
/// Every operation must be idempotent: after a restart the partition manager
/// re-issues whatever the persisted phase implies.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn cordon(&self, node: &str) -> Result<(), Report<OrchestratorError>>;

    async fn uncordon(&self, node: &str) -> Result<(), Report<OrchestratorError>>;

    /// Requests eviction of every workload bound to the device's units.
    async fn evict_device_workloads(&self, device: &DeviceId) -> Result<(), Report<OrchestratorError>>;

    /// Requests eviction of one preempted workload.
    async fn evict_workload(
        &self,
        workload: &str,
        units: &[UnitId],
    ) -> Result<(), Report<OrchestratorError>>;

    /// Whether no workload remains bound to the device.
    async fn drain_complete(&self, device: &DeviceId) -> Result<bool, Report<OrchestratorError>>;

    /// Publishes the scheme declaration for the device.
    async fn apply_scheme(
        &self,
        device: &DeviceId,
        scheme: &PartitionScheme,
    ) -> Result<(), Report<OrchestratorError>>;

    /// Shape the device actually exposes, `None` while nothing was reported.
    async fn realized_shape(
        &self,
        device: &DeviceId,
    ) -> Result<Option<RealizedShape>, Report<OrchestratorError>>;
}

/// Errors reported by a [`StateStore`].
#[derive(Debug, derive_more::Display)]
pub enum StoreError {
    #[display("Failed to read {namespace}/{key}")]
    Read { namespace: String, key: String },
    #[display("Failed to write {namespace}/{key}")]
    Write { namespace: String, key: String },
    #[display("Stale write to {namespace}/{key}: version {version} is not newer than {stored}")]
    StaleVersion {
        namespace: String,
        key: String,
        version: u64,
        stored: u64,
    },
    #[display("Failed to decode {namespace}/{key}")]
    Decode { namespace: String, key: String },
}

impl Error for StoreError {}

/// One persisted document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: String,
    pub version: u64,
    pub value: serde_json::Value,
}

/// Versioned key-value persistence for governor state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_all(&self, namespace: &str) -> Result<Vec<StoredRecord>, Report<StoreError>>;

    /// Writes `value` if `version` is newer than the stored version.
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
        value: serde_json::Value,
    ) -> Result<(), Report<StoreError>>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), Report<StoreError>>;
}
