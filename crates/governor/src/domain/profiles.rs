//! Hardware profile registry
//!
//! Profiles map a user-facing name to a unit kind plus per-unit limits. They
//! are validated against the device fleet at registration; admission resolves
//! the profile again at each decision so updates only affect later decisions.
//! A profile no known device can serve yet is kept pending and registered as
//! soon as a suitable device is known.

use std::sync::Arc;

use api_types::CountBounds;
use api_types::HardwareProfileSpec;
use api_types::ProfileValidation;
use api_types::ResourceLimits;
use dashmap::DashMap;
use tracing::debug;
use tracing::info;

use super::error::ValidationError;
use super::inventory::AllocatableUnit;
use super::inventory::DeviceCatalog;
use super::inventory::UnitKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProfile {
    pub name: String,
    pub kind: UnitKind,
    pub count: CountBounds,
    pub limits: ResourceLimits,
    pub queue: Option<String>,
}

impl HardwareProfile {
    /// Memory to reserve on `unit` for one workload of this profile: the
    /// declared ceiling on shared slots, the fixed share otherwise.
    pub fn reservation_mib(&self, unit: &AllocatableUnit) -> u64 {
        if unit.kind.is_exclusive() {
            unit.memory_mib
        } else {
            self.limits.memory_mib.unwrap_or(unit.memory_mib)
        }
    }

    /// Whether `unit` can host the declared memory ceiling.
    pub fn fits(&self, unit: &AllocatableUnit) -> bool {
        unit.kind == self.kind
            && self
                .limits
                .memory_mib
                .is_none_or(|ceiling| ceiling <= unit.memory_mib)
    }

    /// Checks a requested count against the profile bounds.
    pub fn check_count(&self, requested: u32) -> Result<(), ValidationError> {
        if requested < self.count.min || requested > self.count.max {
            return Err(ValidationError::CountOutOfRange {
                profile: self.name.clone(),
                requested,
                min: self.count.min,
                max: self.count.max,
            });
        }
        Ok(())
    }

    pub fn to_spec(&self) -> HardwareProfileSpec {
        HardwareProfileSpec {
            name: self.name.clone(),
            identifier: self.kind.resource_name(),
            count: self.count,
            limits: self.limits,
            queue: self.queue.clone(),
        }
    }
}

/// Validated store of hardware profiles.
#[derive(Debug)]
pub struct ProfileRegistry {
    catalog: Arc<DeviceCatalog>,
    profiles: DashMap<String, Arc<HardwareProfile>>,
    /// Declarations waiting for a device that can produce their unit kind
    pending: DashMap<String, HardwareProfileSpec>,
}

impl ProfileRegistry {
    pub fn new(catalog: Arc<DeviceCatalog>) -> Self {
        Self {
            catalog,
            profiles: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Validates a profile declaration without registering it.
    pub fn validate(&self, spec: &HardwareProfileSpec) -> Result<HardwareProfile, ValidationError> {
        if spec.name.trim().is_empty() {
            return Err(ValidationError::EmptyProfileName);
        }
        let CountBounds { min, default, max } = spec.count;
        if min < 1 || min > default || default > max {
            return Err(ValidationError::InvalidCountBounds {
                profile: spec.name.clone(),
                min,
                default,
                max,
            });
        }
        if let Some(percent) = spec.limits.compute_percent {
            if percent == 0 || percent > 100 {
                return Err(ValidationError::InvalidComputeCeiling(percent));
            }
        }

        let kind = UnitKind::from_identifier(&spec.identifier)?;
        if spec.limits.memory_mib.is_none() && !kind.is_exclusive() {
            return Err(ValidationError::MissingMemoryCeiling(spec.name.clone()));
        }
        let share_mib = self
            .catalog
            .max_unit_share_mib(&kind)
            .ok_or_else(|| ValidationError::UnproducibleUnitKind(spec.identifier.clone()))?;

        if let Some(ceiling_mib) = spec.limits.memory_mib {
            if ceiling_mib > share_mib {
                return Err(ValidationError::MemoryCeilingExceedsShare {
                    identifier: spec.identifier.clone(),
                    ceiling_mib,
                    share_mib,
                });
            }
        }

        Ok(HardwareProfile {
            name: spec.name.clone(),
            kind,
            count: spec.count,
            limits: spec.limits,
            queue: spec.queue.clone(),
        })
    }

    /// Validation result in the form exposed to the presentation layer.
    pub fn validation_report(&self, spec: &HardwareProfileSpec) -> ProfileValidation {
        match self.validate(spec) {
            Ok(_) => ProfileValidation {
                name: spec.name.clone(),
                valid: true,
                reason: None,
            },
            Err(e) => ProfileValidation {
                name: spec.name.clone(),
                valid: false,
                reason: Some(e.to_string()),
            },
        }
    }

    /// Registers or replaces a profile.
    ///
    /// A declaration rejected only because of the current fleet is kept
    /// pending; the error is still returned.
    pub fn register(&self, spec: &HardwareProfileSpec) -> Result<Arc<HardwareProfile>, ValidationError> {
        let profile = match self.validate(spec) {
            Ok(profile) => Arc::new(profile),
            Err(e) => {
                if e.depends_on_fleet() {
                    info!(profile = %spec.name, reason = %e, "Hardware profile pending");
                    self.pending.insert(spec.name.clone(), spec.clone());
                }
                return Err(e);
            }
        };
        self.pending.remove(&spec.name);
        let previous = self
            .profiles
            .insert(profile.name.clone(), profile.clone());
        info!(
            profile = %profile.name,
            kind = %profile.kind,
            updated = previous.is_some(),
            "Hardware profile registered"
        );
        Ok(profile)
    }

    /// Removes a registered or pending profile. Returns whether one existed.
    pub fn remove(&self, name: &str) -> bool {
        let registered = self.profiles.remove(name).is_some();
        let pending = self.pending.remove(name).is_some();
        if registered || pending {
            info!(profile = %name, "Hardware profile removed");
        }
        registered || pending
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<HardwareProfile>, ValidationError> {
        if let Some(profile) = self.profiles.get(name) {
            return Ok(profile.clone());
        }
        let spec = self.pending.get(name).map(|spec| spec.clone());
        match spec {
            Some(spec) => self
                .register(&spec)
                .map_err(|_| ValidationError::UnknownProfile(name.to_string())),
            None => Err(ValidationError::UnknownProfile(name.to_string())),
        }
    }

    /// Registers every pending profile the fleet can now serve. Returns the
    /// names registered.
    pub fn activate_pending(&self) -> Vec<String> {
        let specs: Vec<HardwareProfileSpec> = self.pending.iter().map(|spec| spec.clone()).collect();
        let mut activated = Vec::new();
        for spec in specs {
            match self.validate(&spec) {
                Ok(_) => {
                    if self.register(&spec).is_ok() {
                        activated.push(spec.name);
                    }
                }
                Err(e) => debug!(profile = %spec.name, reason = %e, "Hardware profile still pending"),
            }
        }
        activated
    }

    pub fn pending_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub fn list(&self) -> Vec<Arc<HardwareProfile>> {
        let mut profiles: Vec<_> = self.profiles.iter().map(|p| p.clone()).collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    /// Makes the registered set equal to `specs`. Invalid declarations are
    /// skipped and reported; profiles absent from `specs` are removed.
    pub fn replace_all(&self, specs: &[HardwareProfileSpec]) -> Vec<(String, ValidationError)> {
        let mut rejected = Vec::new();
        for spec in specs {
            let unchanged = self
                .profiles
                .get(&spec.name)
                .is_some_and(|current| current.to_spec() == *spec);
            if unchanged {
                self.pending.remove(&spec.name);
                continue;
            }
            if let Err(e) = self.register(spec) {
                rejected.push((spec.name.clone(), e));
            }
        }

        let stale: Vec<String> = self
            .profiles
            .iter()
            .filter(|p| !specs.iter().any(|s| &s.name == p.key()))
            .map(|p| p.key().clone())
            .collect();
        for name in stale {
            self.remove(&name);
        }
        self.pending
            .retain(|name, _| specs.iter().any(|s| &s.name == name));
        rejected
    }
}

#[cfg(test)]
mod tests {
    use api_types::DeviceHealth;
    use similar_asserts::assert_eq;
    use utils::keyed_lock::KeyedAsyncLock;

    use super::*;
    use crate::domain::inventory::ComputeCapability;
    use crate::domain::inventory::DeviceId;
    use crate::domain::inventory::GpuDevice;

    async fn registry_with_a100() -> ProfileRegistry {
        let locks = KeyedAsyncLock::new();
        let catalog = Arc::new(DeviceCatalog::new(1024));
        let device = GpuDevice {
            id: DeviceId::new("node-a", 0),
            product: "NVIDIA A100-SXM4-40GB".into(),
            total_memory_mib: 40960,
            compute: ComputeCapability { major: 8, minor: 0 },
            mig_capable: true,
            health: DeviceHealth::Healthy,
        };
        catalog.upsert(&locks.lock(&device.id).await, device);
        ProfileRegistry::new(catalog)
    }

    fn spec(name: &str, identifier: &str, memory_mib: Option<u64>) -> HardwareProfileSpec {
        HardwareProfileSpec {
            name: name.into(),
            identifier: identifier.into(),
            count: CountBounds {
                min: 1,
                default: 1,
                max: 4,
            },
            limits: ResourceLimits {
                memory_mib,
                compute_percent: None,
            },
            queue: None,
        }
    }

    #[tokio::test]
    async fn registers_and_resolves_profiles() {
        let registry = registry_with_a100().await;
        registry
            .register(&spec("shared-gpu", "nvidia.com/gpu.shared", Some(3072)))
            .unwrap();
        registry
            .register(&spec("mig-1g.5gb", "nvidia.com/mig-1g.5gb", None))
            .unwrap();

        let shared = registry.resolve("shared-gpu").unwrap();
        assert_eq!(shared.kind, UnitKind::SharedSlot);
        assert_eq!(shared.limits.memory_mib, Some(3072));
        assert_eq!(
            registry.list().iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["mig-1g.5gb", "shared-gpu"]
        );

        assert!(registry.remove("shared-gpu"));
        assert!(!registry.remove("shared-gpu"));
        assert_eq!(
            registry.resolve("shared-gpu").unwrap_err(),
            ValidationError::UnknownProfile("shared-gpu".into())
        );
    }

    #[tokio::test]
    async fn rejects_structurally_invalid_profiles() {
        let registry = registry_with_a100().await;

        let mut bounds = spec("bad-bounds", "nvidia.com/gpu", None);
        bounds.count = CountBounds {
            min: 2,
            default: 1,
            max: 4,
        };
        assert!(matches!(
            registry.validate(&bounds),
            Err(ValidationError::InvalidCountBounds { .. })
        ));

        let mut zero_min = spec("zero-min", "nvidia.com/gpu", None);
        zero_min.count.min = 0;
        assert!(registry.validate(&zero_min).is_err());

        assert_eq!(
            registry.validate(&spec("shared", "nvidia.com/gpu.shared", None)),
            Err(ValidationError::MissingMemoryCeiling("shared".into()))
        );
        assert_eq!(
            registry.validate(&spec("weird", "vendor.io/tpu", None)),
            Err(ValidationError::UnknownIdentifier("vendor.io/tpu".into()))
        );
        assert_eq!(
            registry.validate(&spec("big", "nvidia.com/mig-7g.80gb", None)),
            Err(ValidationError::UnproducibleUnitKind("nvidia.com/mig-7g.80gb".into()))
        );
        assert_eq!(
            registry.validate(&spec("greedy", "nvidia.com/mig-1g.5gb", Some(6000))),
            Err(ValidationError::MemoryCeilingExceedsShare {
                identifier: "nvidia.com/mig-1g.5gb".into(),
                ceiling_mib: 6000,
                share_mib: 5120,
            })
        );

        let mut compute = spec("compute", "nvidia.com/gpu", None);
        compute.limits.compute_percent = Some(0);
        assert_eq!(
            registry.validate(&compute),
            Err(ValidationError::InvalidComputeCeiling(0))
        );
    }

    #[tokio::test]
    async fn count_bounds_are_enforced() {
        let registry = registry_with_a100().await;
        let profile = registry
            .register(&spec("whole", "nvidia.com/gpu", None))
            .unwrap();
        assert!(profile.check_count(4).is_ok());
        assert_eq!(
            profile.check_count(5),
            Err(ValidationError::CountOutOfRange {
                profile: "whole".into(),
                requested: 5,
                min: 1,
                max: 4,
            })
        );
    }

    #[tokio::test]
    async fn profile_waits_for_a_device_that_can_serve_it() {
        let locks = KeyedAsyncLock::new();
        let catalog = Arc::new(DeviceCatalog::new(1024));
        let registry = ProfileRegistry::new(catalog.clone());

        let rejected = registry.replace_all(&[
            spec("shared-gpu", "nvidia.com/gpu.shared", Some(3072)),
            spec("mig-1g.5gb", "nvidia.com/mig-1g.5gb", None),
            spec("broken", "nvidia.com/gpu.shared", None),
        ]);
        assert_eq!(rejected.len(), 3);
        assert!(registry.list().is_empty());
        assert_eq!(registry.pending_names(), vec!["mig-1g.5gb", "shared-gpu"]);
        assert_eq!(registry.activate_pending(), Vec::<String>::new());

        let device = GpuDevice {
            id: DeviceId::new("node-a", 0),
            product: "NVIDIA L4".into(),
            total_memory_mib: 24576,
            compute: ComputeCapability { major: 8, minor: 9 },
            mig_capable: false,
            health: DeviceHealth::Healthy,
        };
        catalog.upsert(&locks.lock(&device.id).await, device);

        assert_eq!(registry.resolve("shared-gpu").unwrap().kind, UnitKind::SharedSlot);
        assert!(registry.resolve("mig-1g.5gb").is_err());
        assert_eq!(registry.activate_pending(), Vec::<String>::new());
        assert_eq!(registry.pending_names(), vec!["mig-1g.5gb"]);

        registry.replace_all(&[spec("shared-gpu", "nvidia.com/gpu.shared", Some(3072))]);
        assert!(registry.pending_names().is_empty());
        assert!(registry.remove("shared-gpu"));
    }

    #[tokio::test]
    async fn replace_all_syncs_registered_set() {
        let registry = registry_with_a100().await;
        registry
            .register(&spec("old", "nvidia.com/gpu", None))
            .unwrap();

        let rejected = registry.replace_all(&[
            spec("whole", "nvidia.com/gpu", None),
            spec("broken", "nvidia.com/gpu.shared", None),
        ]);

        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, "broken");
        assert!(registry.resolve("old").is_err());
        assert!(registry.resolve("whole").is_ok());

        let report = registry.validation_report(&spec("broken", "nvidia.com/gpu.shared", None));
        assert!(!report.valid);
        assert!(report.reason.unwrap().contains("memory ceiling"));
    }
}
