//! Test adapter for the orchestrator trait

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;

use super::state::scheme_shape;
use super::state::RealizedShape;
use super::traits::Orchestrator;
use super::traits::OrchestratorError;
use crate::domain::inventory::DeviceId;
use crate::domain::inventory::PartitionScheme;
use crate::domain::inventory::UnitId;

/// Orchestrator that realizes schemes in memory and records every request.
#[derive(Default)]
pub struct MockOrchestrator {
    cordoned: Mutex<BTreeSet<String>>,
    cordon_calls: Mutex<usize>,
    evicted_devices: Mutex<Vec<DeviceId>>,
    evicted_workloads: Mutex<Vec<(String, Vec<UnitId>)>>,
    applied: Mutex<Vec<(DeviceId, PartitionScheme)>>,
    realized: Mutex<HashMap<DeviceId, RealizedShape>>,
    overrides: Mutex<HashMap<DeviceId, RealizedShape>>,
    drain_incomplete: Mutex<bool>,
    apply_fails: Mutex<bool>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_drain_complete(&self, complete: bool) {
        *self.drain_incomplete.lock().unwrap() = !complete;
    }

    pub fn fail_apply(&self, fail: bool) {
        *self.apply_fails.lock().unwrap() = fail;
    }

    /// Reports `shape` for the device regardless of what was applied.
    pub fn override_realized(&self, device: &DeviceId, shape: RealizedShape) {
        self.overrides.lock().unwrap().insert(device.clone(), shape);
    }

    pub fn clear_override(&self, device: &DeviceId) {
        self.overrides.lock().unwrap().remove(device);
    }

    pub fn cordoned_nodes(&self) -> Vec<String> {
        self.cordoned.lock().unwrap().iter().cloned().collect()
    }

    pub fn cordon_calls(&self) -> usize {
        *self.cordon_calls.lock().unwrap()
    }

    pub fn evicted_devices(&self) -> Vec<DeviceId> {
        self.evicted_devices.lock().unwrap().clone()
    }

    pub fn evicted_workloads(&self) -> Vec<String> {
        self.evicted_workloads
            .lock()
            .unwrap()
            .iter()
            .map(|(workload, _)| workload.clone())
            .collect()
    }

    pub fn applied(&self) -> Vec<(DeviceId, PartitionScheme)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn cordon(&self, node: &str) -> Result<(), Report<OrchestratorError>> {
        *self.cordon_calls.lock().unwrap() += 1;
        self.cordoned.lock().unwrap().insert(node.to_string());
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<(), Report<OrchestratorError>> {
        self.cordoned.lock().unwrap().remove(node);
        Ok(())
    }

    async fn evict_device_workloads(&self, device: &DeviceId) -> Result<(), Report<OrchestratorError>> {
        self.evicted_devices.lock().unwrap().push(device.clone());
        Ok(())
    }

    async fn evict_workload(
        &self,
        workload: &str,
        units: &[UnitId],
    ) -> Result<(), Report<OrchestratorError>> {
        self.evicted_workloads
            .lock()
            .unwrap()
            .push((workload.to_string(), units.to_vec()));
        Ok(())
    }

    async fn drain_complete(&self, _device: &DeviceId) -> Result<bool, Report<OrchestratorError>> {
        Ok(!*self.drain_incomplete.lock().unwrap())
    }

    async fn apply_scheme(
        &self,
        device: &DeviceId,
        scheme: &PartitionScheme,
    ) -> Result<(), Report<OrchestratorError>> {
        if *self.apply_fails.lock().unwrap() {
            return Err(Report::new(OrchestratorError::Apply {
                device: device.to_string(),
            })
            .attach_printable("injected failure"));
        }
        self.applied
            .lock()
            .unwrap()
            .push((device.clone(), scheme.clone()));
        self.realized
            .lock()
            .unwrap()
            .insert(device.clone(), scheme_shape(scheme));
        Ok(())
    }

    async fn realized_shape(
        &self,
        device: &DeviceId,
    ) -> Result<Option<RealizedShape>, Report<OrchestratorError>> {
        if let Some(shape) = self.overrides.lock().unwrap().get(device) {
            return Ok(Some(shape.clone()));
        }
        Ok(self.realized.lock().unwrap().get(device).cloned())
    }
}
