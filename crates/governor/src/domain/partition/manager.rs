//! Per-device partition scheme state machine
//!
//! ```text
//! Active(scheme) -> DrainRequested -> Draining -> Reconfiguring -> Verifying -> Active(newScheme)
//!                         |              |              |              |
//!                         +--------------+--------------+--------------+--> Failed
//! ```
//!
//! Each device is stepped while its [`DeviceGuard`] is held. Steps never
//! sleep: verification retries are scheduled by deadline and picked up by the
//! next [`PartitionManager::tick`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::DeviceHealth;
use api_types::DeviceView;
use api_types::FaultResolution;
use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use error_stack::Report;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::logging::AUDIT_TARGET;

use super::state::describe_shape;
use super::state::expected_shape;
use super::state::DeviceRecord;
use super::state::TransitionPhase;
use super::traits::Orchestrator;
use super::traits::OrchestratorError;
use super::traits::StateStore;
use super::traits::StoreError;
use crate::domain::clock::Clock;
use crate::domain::error::GovernanceError;
use crate::domain::error::TransitionError;
use crate::domain::error::ValidationError;
use crate::domain::inventory::derive_units;
use crate::domain::inventory::AllocatableUnit;
use crate::domain::inventory::DeviceGuard;
use crate::domain::inventory::DeviceId;
use crate::domain::inventory::GpuDevice;
use crate::domain::inventory::PartitionScheme;
use crate::domain::Fleet;

/// Store namespace of device records.
pub const DEVICE_NAMESPACE: &str = "devices";

/// Bounds of a partition transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSettings {
    pub drain_timeout: Duration,
    pub verify_max_attempts: u32,
    /// Delay before the second verification; doubles with each further attempt
    pub verify_backoff: Duration,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(300),
            verify_max_attempts: 5,
            verify_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Wait,
}

pub struct PartitionManager {
    fleet: Fleet,
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    settings: PartitionSettings,
    records: DashMap<DeviceId, DeviceRecord>,
    /// Desired schemes declared before their device was observed
    pending_desired: DashMap<DeviceId, PartitionScheme>,
    /// Devices holding a cordon on each node
    cordons: DashMap<String, BTreeSet<DeviceId>>,
}

impl PartitionManager {
    pub fn new(
        fleet: Fleet,
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        settings: PartitionSettings,
    ) -> Self {
        Self {
            fleet,
            orchestrator,
            store,
            clock,
            settings,
            records: DashMap::new(),
            pending_desired: DashMap::new(),
            cordons: DashMap::new(),
        }
    }

    /// Reloads persisted device records. Transitions that were in flight
    /// resume from their last durable phase on the next step.
    pub async fn restore(&self) -> Result<usize, Report<StoreError>> {
        let stored = self.store.load_all(DEVICE_NAMESPACE).await?;
        let mut restored = 0;
        for entry in stored {
            let mut record: DeviceRecord = match serde_json::from_value(entry.value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "Skipping undecodable device record");
                    continue;
                }
            };
            record.version = record.version.max(entry.version);
            // orchestrator requests are re-issued after a restart
            record.eviction_requested = false;

            let guard = self.fleet.locks.lock(&record.device.id).await;
            self.install(&guard, &record);
            info!(
                device = %record.device.id,
                phase = %record.phase,
                scheme = %record.current,
                generation = record.generation,
                "Device record restored"
            );
            self.records.insert(record.device.id.clone(), record);
            restored += 1;
        }
        Ok(restored)
    }

    fn install(&self, guard: &DeviceGuard, record: &DeviceRecord) {
        self.fleet.catalog.upsert(guard, record.device.clone());
        self.fleet
            .capacity
            .track_device(guard, record.device.total_memory_mib);
        if let Err(e) =
            self.fleet
                .inventory
                .reconcile(guard, &record.device, &record.current, record.generation)
        {
            error!(device = %record.device.id, error = %e, "Current scheme no longer fits device");
        }
        self.fleet
            .inventory
            .set_blocked(guard, record.phase.blocks_consumption());
        self.fleet
            .inventory
            .set_failed(guard, record.phase == TransitionPhase::Failed);
        if record.cordoned {
            self.cordons
                .entry(record.device.id.node.clone())
                .or_default()
                .insert(record.device.id.clone());
        }
    }

    /// Registers a device or applies changes to its properties and health.
    pub async fn observe_device(&self, device: GpuDevice) {
        let guard = self.fleet.locks.lock(&device.id).await;
        let now = self.clock.now();

        match self.records.get(&device.id).map(|r| r.clone()) {
            Some(mut record) => {
                if record.device == device {
                    return;
                }
                if record.device.health != device.health {
                    info!(
                        device = %device.id,
                        from = %record.device.health,
                        to = %device.health,
                        "Device health changed"
                    );
                }
                record.device = device;
                self.install(&guard, &record);
                self.save(&guard, record).await;
            }
            None => {
                let desired = self
                    .pending_desired
                    .remove(&device.id)
                    .map(|(_, scheme)| scheme)
                    .filter(|scheme| match derive_units(&device, scheme, 0) {
                        Ok(_) => true,
                        Err(e) => {
                            warn!(device = %device.id, scheme = %scheme, error = %e, "Dropping desired scheme that does not fit the device");
                            false
                        }
                    })
                    .unwrap_or_default();
                info!(
                    device = %device.id,
                    product = %device.product,
                    memory_mib = device.total_memory_mib,
                    mig_capable = device.mig_capable,
                    "Device discovered"
                );
                let record = DeviceRecord::new(device, desired, now);
                self.install(&guard, &record);
                self.save(&guard, record).await;
            }
        }

        self.step(&guard).await;
    }

    /// Forgets a device that disappeared, returning the units it had.
    pub async fn remove_device(&self, id: &DeviceId) -> Vec<AllocatableUnit> {
        let guard = self.fleet.locks.lock(id).await;
        let Some((_, record)) = self.records.remove(id) else {
            return Vec::new();
        };
        let units = self.fleet.inventory.remove_device(&guard);
        self.fleet.capacity.forget_device(&guard);
        self.fleet.catalog.remove(&guard);
        if record.cordoned {
            self.release_cordon(id).await;
        }
        if let Err(e) = self.store.delete(DEVICE_NAMESPACE, &id.storage_key()).await {
            error!(device = %id, "Failed to delete device record: {e:?}");
        }
        info!(device = %id, units = units.len(), "Device removed");
        units
    }

    /// Declares the scheme a device should run.
    ///
    /// Declarations for devices not observed yet are kept and validated once
    /// the device shows up. A declaration equal to the current scheme cancels
    /// a transition that is still draining.
    pub async fn declare_desired(
        &self,
        id: &DeviceId,
        scheme: PartitionScheme,
    ) -> Result<(), ValidationError> {
        let guard = self.fleet.locks.lock(id).await;
        let Some(mut record) = self.records.get(id).map(|r| r.clone()) else {
            debug!(device = %id, scheme = %scheme, "Desired scheme recorded for unknown device");
            self.pending_desired.insert(id.clone(), scheme);
            return Ok(());
        };
        derive_units(&record.device, &scheme, 0)?;
        if record.desired == scheme {
            return Ok(());
        }

        info!(device = %id, from = %record.desired, to = %scheme, "Desired scheme declared");
        record.desired = scheme.clone();
        if record.phase.is_draining() {
            if scheme == record.current {
                self.cancel_drain(&guard, &mut record).await;
            } else {
                record.target = Some(scheme);
            }
        }
        self.save(&guard, record).await;
        self.step(&guard).await;
        Ok(())
    }

    async fn cancel_drain(&self, guard: &DeviceGuard, record: &mut DeviceRecord) {
        info!(
            target: AUDIT_TARGET,
            device = %guard.key(),
            phase = %record.phase,
            "Partition transition cancelled"
        );
        record.target = None;
        record.drain_deadline = None;
        record.eviction_requested = false;
        if record.cordoned {
            self.release_cordon(guard.key()).await;
            record.cordoned = false;
        }
        record.enter(TransitionPhase::Active, self.clock.now());
        self.fleet.inventory.set_blocked(guard, false);
    }

    /// Operator action on a failed device.
    pub async fn clear_fault(
        &self,
        id: &DeviceId,
        resolution: FaultResolution,
    ) -> Result<(), GovernanceError> {
        let guard = self.fleet.locks.lock(id).await;
        let mut record = self
            .records
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| ValidationError::UnknownDevice(id.to_string()))?;
        if record.phase != TransitionPhase::Failed {
            return Err(TransitionError::NotFailed {
                device: id.to_string(),
                phase: record.phase.to_string(),
            }
            .into());
        }
        if record.device.health == DeviceHealth::Unreachable {
            return Err(GovernanceError::DeviceUnavailable {
                device: id.to_string(),
            });
        }

        let now = self.clock.now();
        if resolution == FaultResolution::Rollback {
            record.target = Some(record.current.clone());
            record.desired = record.current.clone();
        } else if record.target.is_none() {
            record.target = Some(record.desired.clone());
        }
        record.failure = None;
        record.verify_attempts = 0;
        record.next_check_at = None;
        self.fleet.inventory.set_failed(&guard, false);

        if self.fleet.inventory.in_use_count(id) > 0 {
            record.drain_deadline = Some(now + self.drain_timeout());
            record.eviction_requested = false;
            record.enter(TransitionPhase::DrainRequested, now);
        } else {
            record.enter(TransitionPhase::Reconfiguring, now);
        }
        info!(
            target: AUDIT_TARGET,
            device = %id,
            resolution = ?resolution,
            target_scheme = %record.transition_target(),
            phase = %record.phase,
            "Device fault cleared"
        );
        self.save(&guard, record).await;
        self.step(&guard).await;
        Ok(())
    }

    /// Steps one device, e.g. after units on it were released.
    pub async fn step_device(&self, id: &DeviceId) {
        let guard = self.fleet.locks.lock(id).await;
        self.step(&guard).await;
    }

    /// Steps every device: drain deadlines, verification retries and
    /// orchestrator requests that failed earlier.
    pub async fn tick(&self) {
        let ids: Vec<DeviceId> = self.records.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.step_device(&id).await;
        }
    }

    async fn step(&self, guard: &DeviceGuard) {
        loop {
            let Some(before) = self.records.get(guard.key()).map(|r| r.clone()) else {
                return;
            };
            let mut record = before.clone();
            let now = self.clock.now();

            let step = match record.phase {
                TransitionPhase::Active => self.begin_transition(guard, &mut record, now).await,
                TransitionPhase::DrainRequested => {
                    self.await_idle(guard, &mut record, now).await
                }
                TransitionPhase::Draining => self.await_drained(guard, &mut record, now).await,
                TransitionPhase::Reconfiguring => self.reconfigure(guard, &mut record, now).await,
                TransitionPhase::Verifying => self.verify(guard, &mut record, now).await,
                TransitionPhase::Failed => Step::Wait,
            };

            if record != before {
                self.save(guard, record).await;
            }
            if step == Step::Wait {
                return;
            }
        }
    }

    async fn begin_transition(
        &self,
        guard: &DeviceGuard,
        record: &mut DeviceRecord,
        now: DateTime<Utc>,
    ) -> Step {
        if record.desired == record.current {
            return Step::Wait;
        }
        self.fleet.inventory.set_blocked(guard, true);
        record.target = Some(record.desired.clone());
        record.drain_deadline = Some(now + self.drain_timeout());
        record.verify_attempts = 0;
        record.failure = None;
        record.enter(TransitionPhase::DrainRequested, now);
        info!(
            target: AUDIT_TARGET,
            device = %guard.key(),
            from = %record.current,
            to = %record.desired,
            in_use = self.fleet.inventory.in_use_count(guard.key()),
            "Partition transition started"
        );
        self.request_drain(guard, record).await;
        Step::Continue
    }

    async fn request_drain(&self, guard: &DeviceGuard, record: &mut DeviceRecord) {
        let id = guard.key();
        if !record.cordoned {
            match self.acquire_cordon(id).await {
                Ok(()) => record.cordoned = true,
                Err(e) => warn!(device = %id, "Cordon failed, will retry: {e:?}"),
            }
        }
        if !record.eviction_requested {
            match self.orchestrator.evict_device_workloads(id).await {
                Ok(()) => record.eviction_requested = true,
                Err(e) => warn!(device = %id, "Eviction request failed, will retry: {e:?}"),
            }
        }
    }

    async fn await_idle(
        &self,
        guard: &DeviceGuard,
        record: &mut DeviceRecord,
        now: DateTime<Utc>,
    ) -> Step {
        if !record.cordoned || !record.eviction_requested {
            self.request_drain(guard, record).await;
        }
        let in_use = self.fleet.inventory.in_use_count(guard.key());
        if in_use == 0 {
            record.enter(TransitionPhase::Draining, now);
            return Step::Continue;
        }
        self.check_drain_deadline(guard, record, now, in_use)
    }

    async fn await_drained(
        &self,
        guard: &DeviceGuard,
        record: &mut DeviceRecord,
        now: DateTime<Utc>,
    ) -> Step {
        let in_use = self.fleet.inventory.in_use_count(guard.key());
        if in_use > 0 {
            record.enter(TransitionPhase::DrainRequested, now);
            return Step::Continue;
        }
        match self.orchestrator.drain_complete(guard.key()).await {
            Ok(true) => {
                record.enter(TransitionPhase::Reconfiguring, now);
                Step::Continue
            }
            Ok(false) => self.check_drain_deadline(guard, record, now, 0),
            Err(e) => {
                warn!(device = %guard.key(), "Drain status unavailable: {e:?}");
                self.check_drain_deadline(guard, record, now, 0)
            }
        }
    }

    fn check_drain_deadline(
        &self,
        guard: &DeviceGuard,
        record: &mut DeviceRecord,
        now: DateTime<Utc>,
        in_use: usize,
    ) -> Step {
        let Some(deadline) = record.drain_deadline else {
            return Step::Wait;
        };
        if now < deadline {
            return Step::Wait;
        }
        let started = deadline - self.drain_timeout();
        self.fail(
            guard,
            record,
            TransitionError::DrainTimeout {
                device: guard.key().to_string(),
                waited_secs: (now - started).num_seconds(),
                in_use,
            },
            now,
        );
        Step::Continue
    }

    async fn reconfigure(
        &self,
        guard: &DeviceGuard,
        record: &mut DeviceRecord,
        now: DateTime<Utc>,
    ) -> Step {
        if self.fleet.inventory.in_use_count(guard.key()) > 0 {
            error!(device = %guard.key(), "Units in use while reconfiguring, draining again");
            record.drain_deadline = Some(now + self.drain_timeout());
            record.enter(TransitionPhase::DrainRequested, now);
            return Step::Continue;
        }
        let target = record.transition_target().clone();
        match self.orchestrator.apply_scheme(guard.key(), &target).await {
            Ok(()) => {
                debug!(device = %guard.key(), scheme = %target, "Scheme declaration applied");
                record.verify_attempts = 0;
                record.next_check_at = Some(now);
                record.enter(TransitionPhase::Verifying, now);
            }
            Err(e) => {
                self.fail(
                    guard,
                    record,
                    TransitionError::ApplyFailed {
                        device: guard.key().to_string(),
                        message: format!("{e:?}"),
                    },
                    now,
                );
            }
        }
        Step::Continue
    }

    async fn verify(
        &self,
        guard: &DeviceGuard,
        record: &mut DeviceRecord,
        now: DateTime<Utc>,
    ) -> Step {
        if record.next_check_at.is_some_and(|at| at > now) {
            return Step::Wait;
        }
        let target = record.transition_target().clone();
        let expected = match expected_shape(&record.device, &target) {
            Ok(shape) => shape,
            Err(e) => {
                self.fail(
                    guard,
                    record,
                    TransitionError::ApplyFailed {
                        device: guard.key().to_string(),
                        message: e.to_string(),
                    },
                    now,
                );
                return Step::Continue;
            }
        };
        let realized = match self.orchestrator.realized_shape(guard.key()).await {
            Ok(shape) => shape,
            Err(e) => {
                warn!(device = %guard.key(), "Realized shape unavailable: {e:?}");
                None
            }
        };

        if realized.as_ref() == Some(&expected) {
            self.commit(guard, record, target, now).await;
            return Step::Continue;
        }

        record.verify_attempts += 1;
        let realized = realized
            .as_ref()
            .map(describe_shape)
            .unwrap_or_else(|| "nothing".to_string());
        if record.verify_attempts >= self.settings.verify_max_attempts {
            self.fail(
                guard,
                record,
                TransitionError::VerificationMismatch {
                    device: guard.key().to_string(),
                    expected: describe_shape(&expected),
                    realized,
                    attempts: record.verify_attempts,
                },
                now,
            );
            return Step::Continue;
        }

        let backoff = self
            .settings
            .verify_backoff
            .saturating_mul(2u32.saturating_pow(record.verify_attempts - 1));
        record.next_check_at = Some(now + to_chrono(backoff));
        debug!(
            device = %guard.key(),
            attempt = record.verify_attempts,
            expected = %describe_shape(&expected),
            realized = %realized,
            retry_in_ms = backoff.as_millis() as u64,
            "Realized shape does not match yet"
        );
        Step::Wait
    }

    async fn commit(
        &self,
        guard: &DeviceGuard,
        record: &mut DeviceRecord,
        target: PartitionScheme,
        now: DateTime<Utc>,
    ) {
        let generation = record.generation + 1;
        if let Err(e) = self
            .fleet
            .inventory
            .reconcile(guard, &record.device, &target, generation)
        {
            self.fail(
                guard,
                record,
                TransitionError::ApplyFailed {
                    device: guard.key().to_string(),
                    message: e.to_string(),
                },
                now,
            );
            return;
        }

        let previous = std::mem::replace(&mut record.current, target);
        record.generation = generation;
        record.target = None;
        record.drain_deadline = None;
        record.next_check_at = None;
        record.verify_attempts = 0;
        record.eviction_requested = false;
        if record.cordoned {
            self.release_cordon(guard.key()).await;
            record.cordoned = false;
        }
        record.enter(TransitionPhase::Active, now);
        self.fleet.inventory.set_blocked(guard, false);
        info!(
            target: AUDIT_TARGET,
            device = %guard.key(),
            from = %previous,
            to = %record.current,
            generation = generation,
            "Partition transition completed"
        );
    }

    fn fail(
        &self,
        guard: &DeviceGuard,
        record: &mut DeviceRecord,
        error: TransitionError,
        now: DateTime<Utc>,
    ) {
        warn!(
            target: AUDIT_TARGET,
            device = %guard.key(),
            phase = %record.phase,
            error = %error,
            "Partition transition failed"
        );
        record.failure = Some(error.to_string());
        record.next_check_at = None;
        record.enter(TransitionPhase::Failed, now);
        self.fleet.inventory.set_failed(guard, true);
    }

    async fn acquire_cordon(&self, id: &DeviceId) -> Result<(), Report<OrchestratorError>> {
        self.orchestrator.cordon(&id.node).await?;
        self.cordons
            .entry(id.node.clone())
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    /// Drops the device's cordon and uncordons the node once no other device
    /// on it is transitioning.
    async fn release_cordon(&self, id: &DeviceId) {
        let last = match self.cordons.get_mut(&id.node) {
            Some(mut holders) => {
                holders.remove(id);
                holders.is_empty()
            }
            None => true,
        };
        if !last {
            return;
        }
        self.cordons.remove_if(&id.node, |_, holders| holders.is_empty());
        if let Err(e) = self.orchestrator.uncordon(&id.node).await {
            warn!(node = %id.node, "Uncordon failed: {e:?}");
        }
    }

    async fn save(&self, guard: &DeviceGuard, mut record: DeviceRecord) {
        record.version += 1;
        let id = guard.key();
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(e) = self
                    .store
                    .put(DEVICE_NAMESPACE, &id.storage_key(), record.version, value)
                    .await
                {
                    error!(device = %id, "Failed to persist device record: {e:?}");
                }
            }
            Err(e) => error!(device = %id, error = %e, "Failed to encode device record"),
        }
        self.records.insert(id.clone(), record);
    }

    fn drain_timeout(&self) -> chrono::Duration {
        to_chrono(self.settings.drain_timeout)
    }

    pub fn phase(&self, id: &DeviceId) -> Option<TransitionPhase> {
        self.records.get(id).map(|r| r.phase)
    }

    pub fn record(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn device_views(&self) -> Vec<DeviceView> {
        let mut views: Vec<DeviceView> = self
            .records
            .iter()
            .map(|record| {
                let id = &record.device.id;
                DeviceView {
                    node: id.node.clone(),
                    index: id.index,
                    product: record.device.product.clone(),
                    total_memory_mib: record.device.total_memory_mib,
                    health: record.device.health,
                    current_scheme: record.current.to_spec(),
                    desired_scheme: record.desired.to_spec(),
                    phase: record.phase.to_string(),
                    failure: record.failure.clone(),
                    generation: record.generation,
                    allocatable_units: self.fleet.inventory.allocatable_count(id),
                    reserved_memory_mib: self.fleet.capacity.reserved_mib(id),
                }
            })
            .collect();
        views.sort_by(|a, b| (&a.node, a.index).cmp(&(&b.node, b.index)));
        views
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
