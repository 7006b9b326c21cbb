//! Persisted per-device transition state

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::error::SchemeError;
use crate::domain::inventory::derive_units;
use crate::domain::inventory::GpuDevice;
use crate::domain::inventory::PartitionScheme;
use crate::domain::inventory::UnitKind;

/// Phase of a device's partition transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display, Default)]
pub enum TransitionPhase {
    /// Serving units of the current scheme
    #[default]
    Active,
    /// New consumption blocked, waiting for in-use units to be freed
    DrainRequested,
    /// No unit in use, waiting for the orchestrator to confirm the drain
    Draining,
    /// Scheme declaration is being applied
    Reconfiguring,
    /// Waiting for the realized shape to match the declared one
    Verifying,
    /// Transition aborted, waiting for an operator
    Failed,
}

impl TransitionPhase {
    pub fn is_draining(self) -> bool {
        matches!(self, Self::DrainRequested | Self::Draining)
    }

    /// Phases in which new consumption is blocked on the device.
    pub fn blocks_consumption(self) -> bool {
        self != Self::Active
    }
}

/// Unit count per extended resource name, as realized on a device.
pub type RealizedShape = BTreeMap<String, u32>;

/// Unit count per resource a scheme declares, without checking any device.
pub fn scheme_shape(scheme: &PartitionScheme) -> RealizedShape {
    let mut shape = RealizedShape::new();
    match scheme {
        PartitionScheme::Unpartitioned => {
            shape.insert(UnitKind::WholeDevice.resource_name(), 1);
        }
        PartitionScheme::TimeSliced { replicas } => {
            shape.insert(UnitKind::SharedSlot.resource_name(), *replicas);
        }
        PartitionScheme::Mig { slices } => {
            for slice in slices {
                *shape
                    .entry(UnitKind::IsolatedSlice(*slice).resource_name())
                    .or_default() += 1;
            }
        }
    }
    shape
}

/// Shape a scheme is expected to realize on `device`.
pub fn expected_shape(device: &GpuDevice, scheme: &PartitionScheme) -> Result<RealizedShape, SchemeError> {
    derive_units(device, scheme, 0)?;
    Ok(scheme_shape(scheme))
}

pub fn describe_shape(shape: &RealizedShape) -> String {
    if shape.is_empty() {
        return "nothing".to_string();
    }
    shape
        .iter()
        .map(|(resource, count)| format!("{count}x{resource}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Everything the partition manager knows about one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device: GpuDevice,
    /// Scheme whose units are currently served
    pub current: PartitionScheme,
    /// Scheme the operator declared
    pub desired: PartitionScheme,
    /// Scheme the in-flight transition moves to
    #[serde(default)]
    pub target: Option<PartitionScheme>,
    pub phase: TransitionPhase,
    pub generation: u64,
    pub phase_entered_at: DateTime<Utc>,
    #[serde(default)]
    pub drain_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verify_attempts: u32,
    #[serde(default)]
    pub next_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub cordoned: bool,
    /// Eviction of the device's workloads was accepted by the orchestrator
    #[serde(default)]
    pub eviction_requested: bool,
    /// Monotonic persistence version
    #[serde(default)]
    pub version: u64,
}

impl DeviceRecord {
    pub fn new(device: GpuDevice, desired: PartitionScheme, now: DateTime<Utc>) -> Self {
        Self {
            device,
            current: PartitionScheme::Unpartitioned,
            desired,
            target: None,
            phase: TransitionPhase::Active,
            generation: 1,
            phase_entered_at: now,
            drain_deadline: None,
            verify_attempts: 0,
            next_check_at: None,
            failure: None,
            cordoned: false,
            eviction_requested: false,
            version: 0,
        }
    }

    pub fn enter(&mut self, phase: TransitionPhase, now: DateTime<Utc>) {
        self.phase = phase;
        self.phase_entered_at = now;
    }

    /// Target of the transition, falling back to the declared scheme.
    pub fn transition_target(&self) -> &PartitionScheme {
        self.target.as_ref().unwrap_or(&self.desired)
    }
}
