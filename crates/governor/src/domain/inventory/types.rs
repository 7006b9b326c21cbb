//! Core inventory types: devices, partition schemes and allocatable units

use std::fmt;

use api_types::DeviceHealth;
use api_types::DeviceSpec;
use api_types::SchemeSpec;
use api_types::UnitView;
use serde::Deserialize;
use serde::Serialize;
use utils::keyed_lock::KeyedLockGuard;

use super::mig::MigProfile;
use crate::domain::error::SchemeError;
use crate::domain::error::ValidationError;

/// Proof that the per-device serialization is held for `guard.key()`.
pub type DeviceGuard = KeyedLockGuard<DeviceId>;

/// Extended resource names understood by the governor.
pub const WHOLE_GPU_RESOURCE: &str = "nvidia.com/gpu";
pub const SHARED_GPU_RESOURCE: &str = "nvidia.com/gpu.shared";
pub const MIG_RESOURCE_PREFIX: &str = "nvidia.com/mig-";

/// Physical GPU identity: the node it is attached to and its index there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub node: String,
    pub index: u32,
}

impl DeviceId {
    pub fn new(node: impl Into<String>, index: u32) -> Self {
        Self {
            node: node.into(),
            index,
        }
    }

    /// Stable key for persisted records. Node names are DNS subdomains and
    /// never contain `_`.
    pub fn storage_key(&self) -> String {
        format!("{}_{}", self.node, self.index)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    pub id: DeviceId,
    pub product: String,
    pub total_memory_mib: u64,
    pub compute: ComputeCapability,
    pub mig_capable: bool,
    pub health: DeviceHealth,
}

impl From<DeviceSpec> for GpuDevice {
    fn from(spec: DeviceSpec) -> Self {
        Self {
            id: DeviceId::new(spec.node, spec.index),
            product: spec.product,
            total_memory_mib: spec.total_memory_mib,
            compute: ComputeCapability {
                major: spec.compute_major,
                minor: spec.compute_minor,
            },
            mig_capable: spec.mig_capable,
            health: spec.health,
        }
    }
}

/// Partitioning mode applied to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PartitionScheme {
    #[default]
    Unpartitioned,
    TimeSliced {
        replicas: u32,
    },
    Mig {
        slices: Vec<MigProfile>,
    },
}

impl PartitionScheme {
    pub fn to_spec(&self) -> SchemeSpec {
        match self {
            Self::Unpartitioned => SchemeSpec::Unpartitioned,
            Self::TimeSliced { replicas } => SchemeSpec::TimeSliced {
                replicas: *replicas,
            },
            Self::Mig { slices } => SchemeSpec::Mig {
                slices: slices.iter().map(ToString::to_string).collect(),
            },
        }
    }
}

impl TryFrom<&SchemeSpec> for PartitionScheme {
    type Error = SchemeError;

    fn try_from(spec: &SchemeSpec) -> Result<Self, Self::Error> {
        match spec {
            SchemeSpec::Unpartitioned => Ok(Self::Unpartitioned),
            SchemeSpec::TimeSliced { replicas: 0 } => Err(SchemeError::ZeroReplicas),
            SchemeSpec::TimeSliced { replicas } => Ok(Self::TimeSliced {
                replicas: *replicas,
            }),
            SchemeSpec::Mig { slices } if slices.is_empty() => Err(SchemeError::EmptyMig),
            SchemeSpec::Mig { slices } => Ok(Self::Mig {
                slices: slices
                    .iter()
                    .map(|s| s.parse())
                    .collect::<Result<_, _>>()?,
            }),
        }
    }
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpartitioned => write!(f, "Unpartitioned"),
            Self::TimeSliced { replicas } => write!(f, "TimeSliced{{{replicas}}}"),
            Self::Mig { slices } => {
                let names: Vec<String> = slices.iter().map(ToString::to_string).collect();
                write!(f, "MIG{{{}}}", names.join(","))
            }
        }
    }
}

/// What kind of schedulable quantum a unit is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitKind {
    /// The whole physical GPU of an unpartitioned device
    WholeDevice,
    /// One time-sliced replica; memory is shared, not divided
    SharedSlot,
    /// One hardware-isolated slice with dedicated memory
    IsolatedSlice(MigProfile),
}

impl UnitKind {
    /// Parses an extended resource name into the unit kind it denotes.
    pub fn from_identifier(identifier: &str) -> Result<Self, ValidationError> {
        match identifier {
            WHOLE_GPU_RESOURCE => Ok(Self::WholeDevice),
            SHARED_GPU_RESOURCE => Ok(Self::SharedSlot),
            other => other
                .strip_prefix(MIG_RESOURCE_PREFIX)
                .and_then(|profile| profile.parse::<MigProfile>().ok())
                .map(Self::IsolatedSlice)
                .ok_or_else(|| ValidationError::UnknownIdentifier(identifier.to_string())),
        }
    }

    pub fn resource_name(&self) -> String {
        match self {
            Self::WholeDevice => WHOLE_GPU_RESOURCE.to_string(),
            Self::SharedSlot => SHARED_GPU_RESOURCE.to_string(),
            Self::IsolatedSlice(profile) => format!("{MIG_RESOURCE_PREFIX}{profile}"),
        }
    }

    /// Exclusive units are reserved exactly at their fixed memory share.
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, Self::SharedSlot)
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub device: DeviceId,
    pub ordinal: u32,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.ordinal)
    }
}

/// Physical memory range owned by an isolated slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPlacement {
    pub offset_mib: u64,
    pub size_mib: u64,
}

impl MemoryPlacement {
    pub fn end_mib(&self) -> u64 {
        self.offset_mib + self.size_mib
    }

    pub fn overlaps(&self, other: &MemoryPlacement) -> bool {
        self.offset_mib < other.end_mib() && other.offset_mib < self.end_mib()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatableUnit {
    pub id: UnitId,
    pub kind: UnitKind,
    /// Memory the unit can address: the whole device for shared slots, the
    /// dedicated share for isolated slices.
    pub memory_mib: u64,
    pub placement: Option<MemoryPlacement>,
    pub generation: u64,
    pub in_use: bool,
    pub available: bool,
}

impl AllocatableUnit {
    pub fn device(&self) -> &DeviceId {
        &self.id.device
    }

    /// Same identity and shape, ignoring runtime flags.
    pub fn same_shape(&self, other: &AllocatableUnit) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.memory_mib == other.memory_mib
            && self.placement == other.placement
            && self.generation == other.generation
    }

    pub fn to_view(&self) -> UnitView {
        UnitView {
            id: self.id.to_string(),
            device: self.id.device.to_string(),
            kind: self.kind.resource_name(),
            memory_mib: self.memory_mib,
            in_use: self.in_use,
            available: self.available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_resolve_to_unit_kinds() {
        assert_eq!(
            UnitKind::from_identifier("nvidia.com/gpu").unwrap(),
            UnitKind::WholeDevice
        );
        assert_eq!(
            UnitKind::from_identifier("nvidia.com/gpu.shared").unwrap(),
            UnitKind::SharedSlot
        );
        assert_eq!(
            UnitKind::from_identifier("nvidia.com/mig-1g.5gb").unwrap(),
            UnitKind::IsolatedSlice("1g.5gb".parse().unwrap())
        );
        assert_eq!(
            UnitKind::from_identifier("amd.com/gpu"),
            Err(ValidationError::UnknownIdentifier("amd.com/gpu".into()))
        );
        assert!(UnitKind::from_identifier("nvidia.com/mig-9g.5gb").is_err());
    }

    #[test]
    fn resource_name_round_trips_through_identifier() {
        let kind = UnitKind::IsolatedSlice("3g.20gb".parse().unwrap());
        assert_eq!(kind.resource_name(), "nvidia.com/mig-3g.20gb");
        assert_eq!(UnitKind::from_identifier(&kind.resource_name()).unwrap(), kind);
    }

    #[test]
    fn scheme_spec_conversion_validates() {
        assert_eq!(
            PartitionScheme::try_from(&SchemeSpec::TimeSliced { replicas: 0 }),
            Err(SchemeError::ZeroReplicas)
        );
        assert_eq!(
            PartitionScheme::try_from(&SchemeSpec::Mig { slices: vec![] }),
            Err(SchemeError::EmptyMig)
        );
        let mig = PartitionScheme::try_from(&SchemeSpec::Mig {
            slices: vec!["2g.10gb".into(), "1g.5gb".into()],
        })
        .unwrap();
        assert_eq!(mig.to_string(), "MIG{2g.10gb,1g.5gb}");
        assert_eq!(
            mig.to_spec(),
            SchemeSpec::Mig {
                slices: vec!["2g.10gb".into(), "1g.5gb".into()]
            }
        );
    }

    #[test]
    fn placements_detect_overlap() {
        let a = MemoryPlacement {
            offset_mib: 0,
            size_mib: 5120,
        };
        let b = MemoryPlacement {
            offset_mib: 5120,
            size_mib: 5120,
        };
        let c = MemoryPlacement {
            offset_mib: 4096,
            size_mib: 2048,
        };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }
}
