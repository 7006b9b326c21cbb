use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use error_stack::Report;
use tracing::info;

use crate::domain::inventory::DeviceId;
use crate::domain::inventory::PartitionScheme;
use crate::domain::inventory::UnitId;
use crate::domain::partition::scheme_shape;
use crate::domain::partition::Orchestrator;
use crate::domain::partition::OrchestratorError;
use crate::domain::partition::RealizedShape;

/// In-process orchestrator for standalone runs.
///
/// Schemes are realized as soon as they are applied. There is no workload
/// runtime to talk to, so eviction requests are only logged and drains
/// complete once the governor itself sees no units in use.
#[derive(Default)]
pub struct LocalOrchestrator {
    cordoned: Mutex<BTreeSet<String>>,
    realized: DashMap<DeviceId, RealizedShape>,
}

impl LocalOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cordoned(&self, node: &str) -> bool {
        self.cordoned
            .lock()
            .map(|cordoned| cordoned.contains(node))
            .unwrap_or(false)
    }

    fn set_cordoned(&self, node: &str, cordoned: bool) {
        if let Ok(mut nodes) = self.cordoned.lock() {
            if cordoned {
                nodes.insert(node.to_string());
            } else {
                nodes.remove(node);
            }
        }
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn cordon(&self, node: &str) -> Result<(), Report<OrchestratorError>> {
        self.set_cordoned(node, true);
        info!(node, "Node cordoned");
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<(), Report<OrchestratorError>> {
        self.set_cordoned(node, false);
        info!(node, "Node uncordoned");
        Ok(())
    }

    async fn evict_device_workloads(&self, device: &DeviceId) -> Result<(), Report<OrchestratorError>> {
        info!(device = %device, "Workloads on device asked to stop");
        Ok(())
    }

    async fn evict_workload(
        &self,
        workload: &str,
        units: &[UnitId],
    ) -> Result<(), Report<OrchestratorError>> {
        info!(workload, units = units.len(), "Preempted workload asked to stop");
        Ok(())
    }

    async fn drain_complete(&self, _device: &DeviceId) -> Result<bool, Report<OrchestratorError>> {
        Ok(true)
    }

    async fn apply_scheme(
        &self,
        device: &DeviceId,
        scheme: &PartitionScheme,
    ) -> Result<(), Report<OrchestratorError>> {
        self.realized.insert(device.clone(), scheme_shape(scheme));
        info!(device = %device, scheme = %scheme, "Partition scheme realized");
        Ok(())
    }

    async fn realized_shape(
        &self,
        device: &DeviceId,
    ) -> Result<Option<RealizedShape>, Report<OrchestratorError>> {
        Ok(self.realized.get(device).map(|shape| shape.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use api_types::DeviceHealth;
    use api_types::SchemeSpec;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::inventory::ComputeCapability;
    use crate::domain::inventory::GpuDevice;
    use crate::domain::partition::PartitionManager;
    use crate::domain::partition::PartitionSettings;
    use crate::domain::partition::TransitionPhase;
    use crate::domain::Fleet;
    use crate::infrastructure::state_store::MemoryStateStore;

    #[tokio::test]
    async fn realizes_applied_schemes() {
        let orchestrator = LocalOrchestrator::new();
        let device = DeviceId::new("local", 0);
        assert_eq!(orchestrator.realized_shape(&device).await.unwrap(), None);

        let scheme = PartitionScheme::TimeSliced { replicas: 3 };
        orchestrator.apply_scheme(&device, &scheme).await.unwrap();
        assert_eq!(
            orchestrator.realized_shape(&device).await.unwrap(),
            Some(scheme_shape(&scheme))
        );

        orchestrator.cordon("local").await.unwrap();
        assert!(orchestrator.is_cordoned("local"));
        orchestrator.uncordon("local").await.unwrap();
        assert!(!orchestrator.is_cordoned("local"));
        assert!(orchestrator.drain_complete(&device).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn drives_a_partition_transition_to_active() {
        let fleet = Fleet::new(1024);
        let orchestrator = Arc::new(LocalOrchestrator::new());
        let manager = PartitionManager::new(
            fleet.clone(),
            orchestrator.clone(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(ManualClock::new()),
            PartitionSettings::default(),
        );
        let device = GpuDevice {
            id: DeviceId::new("local", 0),
            product: "NVIDIA L4".to_string(),
            total_memory_mib: 23034,
            compute: ComputeCapability { major: 8, minor: 9 },
            mig_capable: false,
            health: DeviceHealth::Healthy,
        };
        manager.observe_device(device.clone()).await;
        let scheme = PartitionScheme::try_from(&SchemeSpec::TimeSliced { replicas: 4 }).unwrap();
        manager.declare_desired(&device.id, scheme).await.unwrap();

        assert_eq!(manager.phase(&device.id), Some(TransitionPhase::Active));
        assert_eq!(fleet.inventory.snapshot().len(), 4);
        assert!(!orchestrator.is_cordoned("local"));
    }
}
