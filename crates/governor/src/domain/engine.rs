//! Process-wide governance engine
//!
//! Owns the fleet state and the components operating on it. Startup order is
//! fixed: persisted device records, then devices, desired schemes, profiles
//! and quotas, after which interrupted transitions resume.

use std::sync::Arc;
use std::time::Duration;

use api_types::DeviceView;
use api_types::FaultResolution;
use api_types::HardwareProfileSpec;
use api_types::PolicyDocument;
use api_types::ProfileValidation;
use api_types::QuotaSpec;
use api_types::SchemeSpec;
use api_types::UnitView;
use core::error::Error;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::admission::AdmissionController;
use super::admission::AdmissionPolicy;
use super::clock::Clock;
use super::error::GovernanceError;
use super::error::ValidationError;
use super::events::DeviceEvent;
use super::events::DeviceEventRouter;
use super::inventory::DeviceId;
use super::inventory::GpuDevice;
use super::inventory::InventoryEvent;
use super::inventory::PartitionScheme;
use super::partition::Orchestrator;
use super::partition::PartitionManager;
use super::partition::PartitionSettings;
use super::partition::StateStore;
use super::profiles::ProfileRegistry;
use super::Fleet;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Memory kept free on time-sliced devices
    pub headroom_mib: u64,
    pub partition: PartitionSettings,
    pub policy: AdmissionPolicy,
    /// Period of deadline checks and queue re-evaluation
    pub tick_interval: Duration,
    /// Buffered events per device worker
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            headroom_mib: 1024,
            partition: PartitionSettings::default(),
            policy: AdmissionPolicy::default(),
            tick_interval: Duration::from_secs(1),
            event_buffer: 64,
        }
    }
}

#[derive(Debug, derive_more::Display)]
pub enum EngineError {
    #[display("Failed to restore persisted device records")]
    Restore,
    #[display("Policy rejected: {reason}")]
    Policy { reason: String },
}

impl Error for EngineError {}

/// Declarations of a policy document that were not applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub rejected: Vec<String>,
    /// Profiles registered once a device that can serve them is known
    pub pending: Vec<String>,
}

impl PolicyOutcome {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.pending.is_empty()
    }
}

pub struct GovernanceEngine {
    fleet: Fleet,
    registry: Arc<ProfileRegistry>,
    partitions: Arc<PartitionManager>,
    admission: Arc<AdmissionController>,
    router: DeviceEventRouter,
    tick_interval: Duration,
}

impl GovernanceEngine {
    pub fn new(
        settings: EngineSettings,
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fleet = Fleet::new(settings.headroom_mib);
        let registry = Arc::new(ProfileRegistry::new(fleet.catalog.clone()));
        let partitions = Arc::new(PartitionManager::new(
            fleet.clone(),
            orchestrator.clone(),
            store,
            clock.clone(),
            settings.partition,
        ));
        let admission = Arc::new(AdmissionController::new(
            fleet.clone(),
            registry.clone(),
            orchestrator,
            clock,
            settings.policy,
        ));
        let router = DeviceEventRouter::new(partitions.clone(), settings.event_buffer);
        Self {
            fleet,
            registry,
            partitions,
            admission,
            router,
            tick_interval: settings.tick_interval,
        }
    }

    /// Brings the engine up from persisted state, the initially known
    /// devices and the policy document.
    ///
    /// Invalid profile and scheme declarations are skipped and reported;
    /// an invalid quota set fails startup.
    pub async fn initialize(
        &self,
        devices: Vec<GpuDevice>,
        policy: &PolicyDocument,
    ) -> Result<PolicyOutcome, Report<EngineError>> {
        let restored = self
            .partitions
            .restore()
            .await
            .change_context(EngineError::Restore)?;

        let declared = policy.devices.iter().cloned().map(GpuDevice::from);
        let mut observed = 0;
        for device in devices.into_iter().chain(declared) {
            self.partitions.observe_device(device).await;
            observed += 1;
        }

        let outcome = self.apply_policy(policy).await.map_err(|e| {
            Report::new(EngineError::Policy {
                reason: e.to_string(),
            })
        })?;

        // resume transitions interrupted by the last shutdown
        self.partitions.tick().await;
        self.admission.evaluate().await;
        info!(
            restored,
            observed,
            profiles = self.registry.list().len(),
            rejected = outcome.rejected.len(),
            pending = outcome.pending.len(),
            "Governance engine initialized"
        );
        Ok(outcome)
    }

    /// Applies desired schemes, profiles and quotas, in that order.
    ///
    /// Statically declared devices are only read by [`Self::initialize`].
    pub async fn apply_policy(
        &self,
        policy: &PolicyDocument,
    ) -> Result<PolicyOutcome, ValidationError> {
        let mut outcome = PolicyOutcome::default();

        for desired in &policy.desired_schemes {
            let id = DeviceId::new(desired.node.clone(), desired.index);
            if let Err(e) = self.declare_desired(&id, &desired.scheme).await {
                warn!(device = %id, error = %e, "Desired scheme rejected");
                outcome.rejected.push(format!("desired scheme of {id}: {e}"));
            }
        }

        for (name, e) in self.registry.replace_all(&policy.profiles) {
            if e.depends_on_fleet() {
                outcome.pending.push(format!("profile {name}: {e}"));
            } else {
                warn!(profile = %name, error = %e, "Hardware profile rejected");
                outcome.rejected.push(format!("profile {name}: {e}"));
            }
        }

        self.admission.set_quotas(&policy.quotas).await?;
        Ok(outcome)
    }

    /// Drives partition deadlines and admission from inventory changes until
    /// cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, token: CancellationToken) {
        let mut events = self.fleet.inventory.subscribe();
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Governance event loop started");

        loop {
            select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => self.resync().await,
                event = events.recv() => match event {
                    Ok(event) => self.on_inventory_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Inventory events lagged, resynchronizing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("Governance event loop stopped");
    }

    async fn resync(&self) {
        self.partitions.tick().await;
        self.admission.evaluate().await;
    }

    async fn on_inventory_event(&self, event: InventoryEvent) {
        match event {
            InventoryEvent::UnitsReleased { device, .. } => {
                // a draining device may be idle now
                self.router.dispatch(DeviceEvent::Step(device)).await;
                self.admission.evaluate().await;
            }
            InventoryEvent::UnitSetChanged { .. } | InventoryEvent::UnitsRestored { .. } => {
                for name in self.registry.activate_pending() {
                    info!(profile = %name, "Pending hardware profile activated");
                }
                self.admission.evaluate().await;
            }
            InventoryEvent::UnitsWithdrawn { .. } | InventoryEvent::DeviceRemoved { .. } => {}
        }
    }

    /// Hands a device feed event to the device's worker.
    pub async fn dispatch(&self, event: DeviceEvent) {
        self.router.dispatch(event).await;
    }

    /// Stops intake, rejects queued requests and stops the device workers.
    pub async fn shutdown(&self) {
        self.admission.shutdown().await;
        self.router.shutdown().await;
        info!("Governance engine stopped");
    }

    pub async fn declare_desired(
        &self,
        id: &DeviceId,
        scheme: &SchemeSpec,
    ) -> Result<(), GovernanceError> {
        let scheme = PartitionScheme::try_from(scheme).map_err(ValidationError::from)?;
        self.partitions.declare_desired(id, scheme).await?;
        Ok(())
    }

    pub async fn clear_fault(
        &self,
        id: &DeviceId,
        resolution: FaultResolution,
    ) -> Result<(), GovernanceError> {
        self.partitions.clear_fault(id, resolution).await
    }

    pub fn units(&self) -> Vec<UnitView> {
        self.fleet
            .inventory
            .snapshot()
            .iter()
            .map(|unit| unit.to_view())
            .collect()
    }

    pub fn devices(&self) -> Vec<DeviceView> {
        self.partitions.device_views()
    }

    pub fn profiles(&self) -> Vec<HardwareProfileSpec> {
        self.registry.list().iter().map(|p| p.to_spec()).collect()
    }

    pub fn validate_profile(&self, spec: &HardwareProfileSpec) -> ProfileValidation {
        self.registry.validation_report(spec)
    }

    /// Replaces the registered profiles, reporting each declaration.
    pub async fn replace_profiles(&self, specs: &[HardwareProfileSpec]) -> Vec<ProfileValidation> {
        let rejected = self.registry.replace_all(specs);
        let reports = specs
            .iter()
            .map(|spec| match rejected.iter().find(|(name, _)| name == &spec.name) {
                Some((name, e)) => ProfileValidation {
                    name: name.clone(),
                    valid: false,
                    reason: Some(e.to_string()),
                },
                None => ProfileValidation {
                    name: spec.name.clone(),
                    valid: true,
                    reason: None,
                },
            })
            .collect();
        self.admission.evaluate().await;
        reports
    }

    pub async fn remove_profile(&self, name: &str) -> bool {
        let removed = self.registry.remove(name);
        if removed {
            self.admission.evaluate().await;
        }
        removed
    }

    pub async fn set_quotas(&self, specs: &[QuotaSpec]) -> Result<(), ValidationError> {
        self.admission.set_quotas(specs).await
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }
}

#[cfg(test)]
mod tests {
    use api_types::CountBounds;
    use api_types::DesiredSchemeSpec;
    use api_types::DeviceHealth;
    use api_types::DeviceSpec;
    use api_types::ResourceLimits;
    use api_types::WorkloadSubmission;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::admission::Decision;
    use crate::domain::admission::RejectReason;
    use crate::domain::clock::ManualClock;
    use crate::domain::partition::mock::MockOrchestrator;
    use crate::domain::partition::TransitionPhase;
    use crate::infrastructure::state_store::MemoryStateStore;

    fn engine_with(store: Arc<MemoryStateStore>) -> Arc<GovernanceEngine> {
        Arc::new(GovernanceEngine::new(
            EngineSettings {
                tick_interval: Duration::from_millis(20),
                ..Default::default()
            },
            Arc::new(MockOrchestrator::new()),
            store,
            Arc::new(ManualClock::new()),
        ))
    }

    fn device_spec() -> DeviceSpec {
        DeviceSpec {
            node: "node-a".into(),
            index: 0,
            product: "NVIDIA A100-SXM4-40GB".into(),
            total_memory_mib: 40960,
            compute_major: 8,
            compute_minor: 0,
            mig_capable: true,
            health: DeviceHealth::Healthy,
        }
    }

    fn policy(scheme: SchemeSpec) -> PolicyDocument {
        PolicyDocument {
            profiles: vec![
                HardwareProfileSpec {
                    name: "shared-gpu".into(),
                    identifier: "nvidia.com/gpu.shared".into(),
                    count: CountBounds {
                        min: 1,
                        default: 1,
                        max: 4,
                    },
                    limits: ResourceLimits {
                        memory_mib: Some(3072),
                        compute_percent: None,
                    },
                    queue: None,
                },
                HardwareProfileSpec {
                    name: "mig-1g.5gb".into(),
                    identifier: "nvidia.com/mig-1g.5gb".into(),
                    count: CountBounds {
                        min: 1,
                        default: 1,
                        max: 8,
                    },
                    limits: ResourceLimits::default(),
                    queue: None,
                },
            ],
            quotas: vec![QuotaSpec {
                team: "vision".into(),
                nominal_units: 8,
                borrowing_limit: 0,
                priority_weight: 1,
            }],
            desired_schemes: vec![DesiredSchemeSpec {
                node: "node-a".into(),
                index: 0,
                scheme,
            }],
            devices: vec![device_spec()],
        }
    }

    fn submission(id: &str, profile: &str) -> WorkloadSubmission {
        WorkloadSubmission {
            id: Some(id.into()),
            team: "vision".into(),
            profile: profile.into(),
            count: None,
            priority: 0,
            timeout_secs: None,
            gang: false,
        }
    }

    fn device() -> DeviceId {
        DeviceId::new("node-a", 0)
    }

    async fn wait_for_phase(engine: &GovernanceEngine, phase: TransitionPhase) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.partitions().phase(&device()) != Some(phase) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn initialize_applies_policy_in_dependency_order() {
        let engine = engine_with(Arc::new(MemoryStateStore::new()));
        let outcome = engine
            .initialize(Vec::new(), &policy(SchemeSpec::TimeSliced { replicas: 4 }))
            .await
            .unwrap();

        assert!(outcome.is_clean(), "{outcome:?}");
        assert_eq!(engine.units().len(), 4);
        assert_eq!(engine.profiles().len(), 2);

        for i in 0..4 {
            let decision = engine
                .admission()
                .submit(submission(&format!("job-{i}"), "shared-gpu"))
                .await
                .unwrap();
            assert!(matches!(decision, Decision::Admitted { .. }));
        }
        assert_eq!(
            engine
                .admission()
                .submit(submission("job-4", "shared-gpu"))
                .await
                .unwrap(),
            Decision::Queued { position: 1 }
        );
    }

    #[test_log::test(tokio::test)]
    async fn drain_waits_for_running_workloads_then_reconfigures() {
        let engine = engine_with(Arc::new(MemoryStateStore::new()));
        engine
            .initialize(Vec::new(), &policy(SchemeSpec::TimeSliced { replicas: 4 }))
            .await
            .unwrap();
        let token = CancellationToken::new();
        let runner = {
            let engine = engine.clone();
            let token = token.clone();
            tokio::spawn(async move { engine.run(token).await })
        };

        for id in ["a", "b"] {
            engine
                .admission()
                .submit(submission(id, "shared-gpu"))
                .await
                .unwrap();
        }
        engine
            .declare_desired(
                &device(),
                &SchemeSpec::Mig {
                    slices: vec!["1g.5gb".into(); 7],
                },
            )
            .await
            .unwrap();
        assert_eq!(
            engine.partitions().phase(&device()),
            Some(TransitionPhase::DrainRequested)
        );

        engine.admission().complete(&"a".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            engine.partitions().phase(&device()),
            Some(TransitionPhase::DrainRequested)
        );

        engine.admission().complete(&"b".into()).await.unwrap();
        wait_for_phase(&engine, TransitionPhase::Active).await;
        assert_eq!(engine.units().len(), 7);

        let decision = engine
            .admission()
            .submit(submission("slice", "mig-1g.5gb"))
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Admitted { .. }));

        token.cancel();
        runner.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn invalid_declarations_are_reported_not_fatal() {
        let engine = engine_with(Arc::new(MemoryStateStore::new()));
        let mut doc = policy(SchemeSpec::TimeSliced { replicas: 0 });
        doc.profiles.push(HardwareProfileSpec {
            name: "tpu".into(),
            identifier: "google.com/tpu".into(),
            count: CountBounds::default(),
            limits: ResourceLimits::default(),
            queue: None,
        });

        let outcome = engine.initialize(Vec::new(), &doc).await.unwrap();
        assert_eq!(outcome.rejected.len(), 2, "{outcome:?}");
        assert_eq!(engine.profiles().len(), 2);

        // re-applying is idempotent
        let again = engine.apply_policy(&doc).await.unwrap();
        assert_eq!(again, outcome);
    }

    #[test_log::test(tokio::test)]
    async fn profiles_wait_for_devices_discovered_after_startup() {
        let engine = engine_with(Arc::new(MemoryStateStore::new()));
        let mut doc = policy(SchemeSpec::TimeSliced { replicas: 4 });
        doc.devices.clear();
        let outcome = engine.initialize(Vec::new(), &doc).await.unwrap();
        assert!(outcome.rejected.is_empty(), "{outcome:?}");
        assert_eq!(outcome.pending.len(), 2);
        assert!(engine.profiles().is_empty());

        let token = CancellationToken::new();
        let runner = {
            let engine = engine.clone();
            let token = token.clone();
            tokio::spawn(async move { engine.run(token).await })
        };
        engine
            .dispatch(DeviceEvent::Observed(GpuDevice::from(device_spec())))
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.profiles().len() < 2 || engine.units().len() != 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let decision = engine
            .admission()
            .submit(submission("job", "shared-gpu"))
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Admitted { .. }), "{decision:?}");

        token.cancel();
        runner.await.unwrap();
        engine.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn pending_profile_resolves_on_first_submission() {
        let engine = engine_with(Arc::new(MemoryStateStore::new()));
        let mut doc = policy(SchemeSpec::Unpartitioned);
        doc.devices.clear();
        doc.desired_schemes.clear();
        engine.initialize(Vec::new(), &doc).await.unwrap();

        engine
            .partitions()
            .observe_device(GpuDevice::from(device_spec()))
            .await;
        engine
            .declare_desired(&device(), &SchemeSpec::TimeSliced { replicas: 4 })
            .await
            .unwrap();

        let decision = engine
            .admission()
            .submit(submission("job", "shared-gpu"))
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Admitted { .. }), "{decision:?}");
        engine.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn invalid_quota_set_fails_startup() {
        let engine = engine_with(Arc::new(MemoryStateStore::new()));
        let mut doc = policy(SchemeSpec::Unpartitioned);
        doc.quotas.push(doc.quotas[0].clone());

        let err = engine.initialize(Vec::new(), &doc).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            EngineError::Policy { .. }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn restart_resumes_interrupted_transition() {
        let store = Arc::new(MemoryStateStore::new());
        let first = engine_with(store.clone());
        first
            .initialize(Vec::new(), &policy(SchemeSpec::TimeSliced { replicas: 4 }))
            .await
            .unwrap();
        first
            .admission()
            .submit(submission("running", "shared-gpu"))
            .await
            .unwrap();
        first
            .declare_desired(&device(), &SchemeSpec::Unpartitioned)
            .await
            .unwrap();
        assert_eq!(
            first.partitions().phase(&device()),
            Some(TransitionPhase::DrainRequested)
        );

        // the new process holds no admissions, so the drain completes at once
        let second = engine_with(store);
        let mut doc = policy(SchemeSpec::Unpartitioned);
        doc.devices.clear();
        second
            .initialize(vec![GpuDevice::from(device_spec())], &doc)
            .await
            .unwrap();

        assert_eq!(
            second.partitions().phase(&device()),
            Some(TransitionPhase::Active)
        );
        assert_eq!(second.units().len(), 1);
        assert_eq!(second.devices()[0].current_scheme, SchemeSpec::Unpartitioned);
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_rejects_queued_work() {
        let engine = engine_with(Arc::new(MemoryStateStore::new()));
        engine
            .initialize(Vec::new(), &policy(SchemeSpec::TimeSliced { replicas: 1 }))
            .await
            .unwrap();
        engine
            .admission()
            .submit(submission("a", "shared-gpu"))
            .await
            .unwrap();
        engine
            .admission()
            .submit(submission("b", "shared-gpu"))
            .await
            .unwrap();

        engine.shutdown().await;
        assert_eq!(
            engine.admission().status(&"b".into()).await.unwrap(),
            Decision::Rejected(RejectReason::ShuttingDown)
        );
    }

    #[test_log::test(tokio::test)]
    async fn device_events_flow_through_workers() {
        let engine = engine_with(Arc::new(MemoryStateStore::new()));
        let mut doc = policy(SchemeSpec::Unpartitioned);
        doc.devices.clear();
        engine.initialize(Vec::new(), &doc).await.unwrap();
        assert!(engine.units().is_empty());

        engine
            .dispatch(DeviceEvent::Observed(GpuDevice::from(device_spec())))
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.units().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        engine.dispatch(DeviceEvent::Removed(device())).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.units().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(engine.devices().is_empty());
        engine.shutdown().await;
    }
}
