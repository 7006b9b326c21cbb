//! Shared API type definitions
//!
//! This crate contains the declarative objects and response formats the
//! governor exchanges with its collaborators: hardware profile and quota
//! declarations, desired partition schemes, workload submissions, and the
//! inventory/status views exposed for display.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Health of a physical GPU as reported by the device feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum DeviceHealth {
    #[default]
    Healthy,
    Degraded,
    Unreachable,
}

impl std::fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Declarative partitioning mode for one device.
///
/// Serialized externally tagged, e.g. `unpartitioned`,
/// `{"timeSliced": {"replicas": 4}}` or `{"mig": {"slices": ["1g.5gb"]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub enum SchemeSpec {
    #[default]
    Unpartitioned,
    TimeSliced { replicas: u32 },
    Mig { slices: Vec<String> },
}

/// Requested unit count bounds of a hardware profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CountBounds {
    pub min: u32,
    pub default: u32,
    pub max: u32,
}

impl Default for CountBounds {
    fn default() -> Self {
        Self {
            min: 1,
            default: 1,
            max: 1,
        }
    }
}

/// Per-unit resource ceilings enforced for workloads using a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Memory ceiling per unit in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u64>,
    /// Compute ceiling per unit in percent of the unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_percent: Option<u8>,
}

/// User-facing allocation template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfileSpec {
    /// Profile name referenced by workload submissions
    pub name: String,
    /// Extended resource name, e.g. `nvidia.com/gpu.shared` or `nvidia.com/mig-1g.5gb`
    pub identifier: String,
    #[serde(default)]
    pub count: CountBounds,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Queue (team) that workloads using this profile are charged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

/// Per-team admission budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSpec {
    pub team: String,
    /// Units the team is entitled to
    pub nominal_units: u32,
    /// Units the team may borrow beyond its nominal share
    #[serde(default)]
    pub borrowing_limit: u32,
    #[serde(default = "default_priority_weight")]
    pub priority_weight: u32,
}

fn default_priority_weight() -> u32 {
    1
}

/// Desired partition scheme for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSchemeSpec {
    pub node: String,
    pub index: u32,
    pub scheme: SchemeSpec,
}

/// Statically declared physical GPU, used when no live device feed is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub node: String,
    pub index: u32,
    #[serde(default)]
    pub product: String,
    pub total_memory_mib: u64,
    #[serde(default)]
    pub compute_major: u32,
    #[serde(default)]
    pub compute_minor: u32,
    #[serde(default)]
    pub mig_capable: bool,
    #[serde(default)]
    pub health: DeviceHealth,
}

/// Workload submission as received from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSubmission {
    /// Caller supplied identifier; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub team: String,
    pub profile: String,
    /// Requested units; the profile default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    /// Give up waiting in the queue after this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Admit all requested units together or none
    #[serde(default)]
    pub gang: bool,
}

/// Operator action clearing a failed partition transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum FaultResolution {
    /// Re-apply the scheme the failed transition targeted
    Retry,
    /// Re-apply the scheme the device had before the transition
    Rollback,
}

/// Declarative policy: everything an operator declares about the fleet.
///
/// Re-applying the same document is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default)]
    pub profiles: Vec<HardwareProfileSpec>,
    #[serde(default)]
    pub quotas: Vec<QuotaSpec>,
    #[serde(default)]
    pub desired_schemes: Vec<DesiredSchemeSpec>,
    /// Devices declared statically instead of discovered
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

/// Allocatable unit as exposed for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitView {
    pub id: String,
    pub device: String,
    pub kind: String,
    pub memory_mib: u64,
    pub in_use: bool,
    pub available: bool,
}

/// Per-device partition status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub node: String,
    pub index: u32,
    pub product: String,
    pub total_memory_mib: u64,
    pub health: DeviceHealth,
    pub current_scheme: SchemeSpec,
    pub desired_scheme: SchemeSpec,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub generation: u64,
    pub allocatable_units: usize,
    pub reserved_memory_mib: u64,
}

/// Result of validating a hardware profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileValidation {
    pub name: String,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Admission state of a workload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum AdmissionStatus {
    Admitted {
        units: Vec<String>,
    },
    PartiallyAdmitted {
        units: Vec<String>,
        position: usize,
        remaining: u32,
    },
    Queued {
        position: usize,
    },
    Rejected {
        reason: String,
    },
    Cancelled,
    Completed,
}

/// Workload request status as exposed to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadView {
    pub id: String,
    pub team: String,
    pub profile: String,
    pub requested: u32,
    pub status: AdmissionStatus,
}

/// Response envelope used by every API endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Payload, present on success
    pub data: Option<T>,
    /// Human readable message
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_spec_uses_external_tagging() {
        let shared: SchemeSpec = serde_json::from_str(r#"{"timeSliced":{"replicas":4}}"#).unwrap();
        assert_eq!(shared, SchemeSpec::TimeSliced { replicas: 4 });

        let whole: SchemeSpec = serde_json::from_str(r#""unpartitioned""#).unwrap();
        assert_eq!(whole, SchemeSpec::Unpartitioned);

        let yaml = "mig:\n  slices: [1g.5gb, 1g.5gb]\n";
        let mig: SchemeSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            mig,
            SchemeSpec::Mig {
                slices: vec!["1g.5gb".into(), "1g.5gb".into()]
            }
        );
    }

    #[test]
    fn profile_spec_defaults() {
        let spec: HardwareProfileSpec = serde_json::from_str(
            r#"{"name":"whole-gpu","identifier":"nvidia.com/gpu"}"#,
        )
        .unwrap();
        assert_eq!(spec.count, CountBounds::default());
        assert_eq!(spec.limits, ResourceLimits::default());
        assert!(spec.queue.is_none());
    }

    #[test]
    fn quota_priority_weight_defaults_to_one() {
        let quota: QuotaSpec =
            serde_json::from_str(r#"{"team":"vision","nominalUnits":4}"#).unwrap();
        assert_eq!(quota.priority_weight, 1);
        assert_eq!(quota.borrowing_limit, 0);
    }

    #[test]
    fn policy_document_from_yaml() {
        let yaml = r#"
profiles:
  - name: shared-gpu
    identifier: nvidia.com/gpu.shared
    count: { min: 1, default: 1, max: 4 }
    limits: { memoryMib: 3072 }
quotas:
  - team: vision
    nominalUnits: 4
desiredSchemes:
  - node: node-a
    index: 0
    scheme:
      timeSliced: { replicas: 4 }
"#;
        let doc: PolicyDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.profiles[0].limits.memory_mib, Some(3072));
        assert_eq!(doc.quotas[0].nominal_units, 4);
        assert_eq!(
            doc.desired_schemes[0].scheme,
            SchemeSpec::TimeSliced { replicas: 4 }
        );
        assert!(doc.devices.is_empty());

        assert!(serde_yaml::from_str::<PolicyDocument>("profile: []").is_err());
    }

    #[test]
    fn admission_status_is_internally_tagged() {
        let json = serde_json::to_value(AdmissionStatus::Queued { position: 2 }).unwrap();
        assert_eq!(json["state"], "queued");
        assert_eq!(json["position"], 2);
    }
}
