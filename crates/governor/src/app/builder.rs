use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use api_types::PolicyDocument;

use crate::api::Readiness;
use crate::app::services::ApplicationServices;
use crate::app::services::DeviceFeed;
use crate::app::Application;
use crate::config::policy::load_policy;
use crate::config::DaemonArgs;
use crate::config::DeviceSource;
use crate::domain::clock::SystemClock;
use crate::domain::engine::GovernanceEngine;
use crate::domain::inventory::GpuDevice;
use crate::domain::partition::Orchestrator;
use crate::domain::partition::StateStore;
use crate::infrastructure::k8s::KubeOrchestrator;
use crate::infrastructure::k8s::NodeDeviceWatcher;
use crate::infrastructure::kube_client::init_kube_client;
use crate::infrastructure::local_orchestrator::LocalOrchestrator;
use crate::infrastructure::nvml_feed::NvmlDeviceFeed;
use crate::infrastructure::state_store::FileStateStore;
use crate::infrastructure::state_store::MemoryStateStore;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Builds and initializes the engine. The application is ready once this
    /// returns.
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let policy = self.load_initial_policy().await?;
        let store = self.create_state_store();
        let orchestrator = self.create_orchestrator().await?;
        let engine = Arc::new(GovernanceEngine::new(
            args.engine_settings(),
            orchestrator,
            store,
            Arc::new(SystemClock),
        ));

        let (device_feed, devices) = self.create_device_feed()?;
        let outcome = engine
            .initialize(devices, &policy)
            .await
            .map_err(|e| anyhow!("Failed to initialize governance engine: {e:?}"))?;
        for rejected in &outcome.rejected {
            tracing::warn!("Declaration skipped: {rejected}");
        }
        for pending in &outcome.pending {
            tracing::info!("Waiting for a suitable device: {pending}");
        }

        let readiness = Readiness::default();
        readiness.mark_ready();

        let services = ApplicationServices {
            engine,
            readiness,
            device_feed,
            initial_policy: policy,
        };
        Ok(Application::new(services, self.daemon_args))
    }

    async fn load_initial_policy(&self) -> Result<PolicyDocument> {
        match &self.daemon_args.policy_file {
            Some(path) => load_policy(path)
                .await
                .map_err(|e| anyhow!("Failed to load policy: {e:?}")),
            None => {
                tracing::warn!("No policy file configured, starting without profiles and quotas");
                Ok(PolicyDocument::default())
            }
        }
    }

    fn create_state_store(&self) -> Arc<dyn StateStore> {
        match &self.daemon_args.state_dir {
            Some(dir) => {
                tracing::info!("Persisting partition state under {}", dir.display());
                Arc::new(FileStateStore::new(dir.clone()))
            }
            None => {
                tracing::warn!("No state directory configured, partition state is not persisted");
                Arc::new(MemoryStateStore::new())
            }
        }
    }

    async fn create_orchestrator(&self) -> Result<Arc<dyn Orchestrator>> {
        match self.daemon_args.device_source {
            DeviceSource::Kube => {
                let client = init_kube_client(self.daemon_args.kubeconfig.clone())
                    .await
                    .map_err(|e| anyhow!("Failed to create Kubernetes client: {e:?}"))?;
                Ok(Arc::new(KubeOrchestrator::new(client)))
            }
            DeviceSource::Nvml | DeviceSource::Static => Ok(Arc::new(LocalOrchestrator::new())),
        }
    }

    /// Feed for live device events plus the devices known right now.
    fn create_device_feed(&self) -> Result<(DeviceFeed, Vec<GpuDevice>)> {
        let args = &self.daemon_args;
        match args.device_source {
            DeviceSource::Kube => Ok((
                DeviceFeed::Kube(Arc::new(NodeDeviceWatcher::new(args.kubeconfig.clone()))),
                Vec::new(),
            )),
            DeviceSource::Nvml => {
                let feed = NvmlDeviceFeed::init(args.node_name.clone(), Duration::from_millis(args.nvml_poll_ms))
                    .map_err(|e| anyhow!("Failed to initialize NVML: {e:?}"))?;
                let devices = feed
                    .snapshot(&BTreeMap::new())
                    .map_err(|e| anyhow!("Failed to discover GPUs: {e:?}"))?;
                tracing::info!("Discovered {} GPU device(s)", devices.len());
                Ok((DeviceFeed::Nvml(Arc::new(feed)), devices.into_values().collect()))
            }
            DeviceSource::Static => Ok((DeviceFeed::Static, Vec::new())),
        }
    }
}
