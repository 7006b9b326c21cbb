use core::error::Error;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::time::Duration;

use api_types::DeviceHealth;
use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::Nvml;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::events::DeviceEvent;
use crate::domain::inventory::ComputeCapability;
use crate::domain::inventory::DeviceId;
use crate::domain::inventory::GpuDevice;

const BYTES_PER_MIB: u64 = 1024 * 1024;

#[derive(Debug, derive_more::Display)]
pub enum DeviceFeedError {
    #[display("Failed to initialize NVML")]
    Init,
    #[display("Failed to enumerate GPUs")]
    Enumerate,
    #[display("Failed to query GPU {index}")]
    Query { index: u32 },
}

impl Error for DeviceFeedError {}

/// Polls the GPUs of the local machine through NVML.
pub struct NvmlDeviceFeed {
    nvml: Nvml,
    node: String,
    poll_interval: Duration,
}

impl NvmlDeviceFeed {
    pub fn init(node: impl Into<String>, poll_interval: Duration) -> Result<Self, Report<DeviceFeedError>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(_) => {
                warn!("Standard NVML init failed, trying with explicit library path");
                Nvml::builder()
                    .lib_path(OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .change_context(DeviceFeedError::Init)?
            }
        };
        info!("NVML initialized");
        Ok(Self {
            nvml,
            node: node.into(),
            poll_interval,
        })
    }

    fn probe(&self, index: u32) -> Result<GpuDevice, Report<DeviceFeedError>> {
        let query_error = || DeviceFeedError::Query { index };
        let device = self.nvml.device_by_index(index).change_context_lazy(query_error)?;
        let product = device.name().change_context_lazy(query_error)?;
        let memory = device.memory_info().change_context_lazy(query_error)?;
        let capability = device
            .cuda_compute_capability()
            .change_context_lazy(query_error)?;
        Ok(GpuDevice {
            id: DeviceId::new(self.node.clone(), index),
            product,
            total_memory_mib: memory.total / BYTES_PER_MIB,
            compute: ComputeCapability {
                major: u32::try_from(capability.major).unwrap_or(0),
                minor: u32::try_from(capability.minor).unwrap_or(0),
            },
            // Devices without MIG support answer NotSupported
            mig_capable: device.mig_mode().is_ok(),
            health: DeviceHealth::Healthy,
        })
    }

    /// Current devices. A device that stops answering keeps its last known
    /// properties and is reported unreachable.
    pub fn snapshot(
        &self,
        previous: &BTreeMap<u32, GpuDevice>,
    ) -> Result<BTreeMap<u32, GpuDevice>, Report<DeviceFeedError>> {
        let count = self.nvml.device_count().change_context(DeviceFeedError::Enumerate)?;
        let mut current = BTreeMap::new();
        for index in 0..count {
            match self.probe(index) {
                Ok(device) => {
                    current.insert(index, device);
                }
                Err(e) => {
                    warn!("GPU query failed: {e:?}");
                    if let Some(known) = previous.get(&index) {
                        current.insert(
                            index,
                            GpuDevice {
                                health: DeviceHealth::Unreachable,
                                ..known.clone()
                            },
                        );
                    }
                }
            }
        }
        Ok(current)
    }

    #[tracing::instrument(skip_all, fields(node = %self.node))]
    pub async fn run(&self, sender: mpsc::Sender<DeviceEvent>, cancellation_token: CancellationToken) {
        info!("Starting NVML device feed");
        let mut interval = tokio::time::interval(self.poll_interval);
        let mut known = BTreeMap::new();
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("NVML device feed shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    let current = match self.snapshot(&known) {
                        Ok(current) => current,
                        Err(e) => {
                            error!("Failed to poll GPUs: {e:?}");
                            continue;
                        }
                    };
                    for event in changes(&known, &current) {
                        if sender.send(event).await.is_err() {
                            debug!("Device event receiver gone, stopping feed");
                            return;
                        }
                    }
                    known = current;
                }
            }
        }
    }
}

/// Events turning `previous` into `current`.
fn changes(previous: &BTreeMap<u32, GpuDevice>, current: &BTreeMap<u32, GpuDevice>) -> Vec<DeviceEvent> {
    let removed = previous
        .iter()
        .filter(|(index, _)| !current.contains_key(index))
        .map(|(_, device)| DeviceEvent::Removed(device.id.clone()));
    let observed = current
        .iter()
        .filter(|(index, device)| previous.get(index) != Some(device))
        .map(|(_, device)| DeviceEvent::Observed(device.clone()));
    removed.chain(observed).collect()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn gpu(index: u32, health: DeviceHealth) -> GpuDevice {
        GpuDevice {
            id: DeviceId::new("workstation", index),
            product: "NVIDIA RTX A6000".to_string(),
            total_memory_mib: 49140,
            compute: ComputeCapability { major: 8, minor: 6 },
            mig_capable: false,
            health,
        }
    }

    #[test]
    fn reports_only_changed_devices() {
        let previous = BTreeMap::from([(0, gpu(0, DeviceHealth::Healthy)), (1, gpu(1, DeviceHealth::Healthy))]);
        let current = BTreeMap::from([(0, gpu(0, DeviceHealth::Healthy)), (1, gpu(1, DeviceHealth::Unreachable))]);
        assert_eq!(
            changes(&previous, &current),
            vec![DeviceEvent::Observed(gpu(1, DeviceHealth::Unreachable))]
        );
        assert!(changes(&current, &current).is_empty());
    }

    #[test]
    fn reports_vanished_devices_first() {
        let previous = BTreeMap::from([(0, gpu(0, DeviceHealth::Healthy)), (1, gpu(1, DeviceHealth::Healthy))]);
        let current = BTreeMap::from([(0, gpu(0, DeviceHealth::Degraded))]);
        assert_eq!(
            changes(&previous, &current),
            vec![
                DeviceEvent::Removed(DeviceId::new("workstation", 1)),
                DeviceEvent::Observed(gpu(0, DeviceHealth::Degraded)),
            ]
        );
    }
}
