use std::sync::Arc;

use api_types::PolicyDocument;

use crate::api::Readiness;
use crate::domain::engine::GovernanceEngine;
use crate::infrastructure::k8s::NodeDeviceWatcher;
use crate::infrastructure::nvml_feed::NvmlDeviceFeed;

/// Live source of device events.
pub enum DeviceFeed {
    Kube(Arc<NodeDeviceWatcher>),
    Nvml(Arc<NvmlDeviceFeed>),
    /// Devices come from the policy document only
    Static,
}

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub engine: Arc<GovernanceEngine>,
    pub readiness: Readiness,
    pub device_feed: DeviceFeed,
    /// Policy applied during initialization
    pub initial_policy: PolicyDocument,
}
