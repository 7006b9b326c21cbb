//! Error taxonomy of the governance engine
//!
//! - [`ValidationError`]: malformed profile, quota, scheme or request. Rejected
//!   at the boundary closest to the cause and never retried.
//! - [`CapacityError`](super::capacity::CapacityError): transient shortfall,
//!   surfaced as queue state rather than as an error to the submitter.
//! - [`TransitionError`]: drain timeout or reconfiguration mismatch; the device
//!   enters `Failed` and waits for an operator.
//! - [`GovernanceError::DeviceUnavailable`]: the device cannot be used right now.

use thiserror::Error;

use super::capacity::CapacityError;

/// Rejections of structurally invalid partition schemes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemeError {
    #[error("invalid MIG profile `{0}`, expected `<g>g.<m>gb`")]
    InvalidMigProfile(String),

    #[error("device {device} does not support hardware-isolated slices")]
    MigUnsupported { device: String },

    #[error("time-sliced scheme needs at least one replica")]
    ZeroReplicas,

    #[error("MIG scheme declares no slices")]
    EmptyMig,

    #[error("MIG slices use {used} compute slices, device provides {max}")]
    ComputeExhausted { used: u32, max: u32 },

    #[error("MIG slices need {required_mib} MiB, device has {total_mib} MiB")]
    MemoryExhausted { required_mib: u64, total_mib: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown hardware profile `{0}`")]
    UnknownProfile(String),

    #[error("requested count {requested} outside [{min}, {max}] for profile `{profile}`")]
    CountOutOfRange {
        profile: String,
        requested: u32,
        min: u32,
        max: u32,
    },

    #[error("profile `{profile}` needs 1 <= min <= default <= max, got {min}/{default}/{max}")]
    InvalidCountBounds {
        profile: String,
        min: u32,
        default: u32,
        max: u32,
    },

    #[error("profile name must not be empty")]
    EmptyProfileName,

    #[error("unknown resource identifier `{0}`")]
    UnknownIdentifier(String),

    #[error("no known device can produce `{0}`")]
    UnproducibleUnitKind(String),

    #[error("memory ceiling {ceiling_mib} MiB exceeds the {share_mib} MiB per-unit share of `{identifier}`")]
    MemoryCeilingExceedsShare {
        identifier: String,
        ceiling_mib: u64,
        share_mib: u64,
    },

    #[error("profile `{0}` targets shared slots and must declare a memory ceiling")]
    MissingMemoryCeiling(String),

    #[error("compute ceiling must be within 1..=100 percent, got {0}")]
    InvalidComputeCeiling(u8),

    #[error("no quota declared for team `{0}`")]
    UnknownTeam(String),

    #[error("invalid quota for team `{team}`: {reason}")]
    InvalidQuota { team: String, reason: String },

    #[error("request `{0}` already exists")]
    DuplicateRequest(String),

    #[error("unknown device `{0}`")]
    UnknownDevice(String),

    #[error("invalid partition scheme: {0}")]
    InvalidScheme(#[from] SchemeError),
}

impl ValidationError {
    /// Whether the declaration may become valid once other devices join the
    /// fleet.
    pub fn depends_on_fleet(&self) -> bool {
        matches!(
            self,
            Self::UnproducibleUnitKind(_) | Self::MemoryCeilingExceedsShare { .. }
        )
    }
}

/// Failures of a partition scheme transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("drain of {device} timed out after {waited_secs}s with {in_use} unit(s) in use")]
    DrainTimeout {
        device: String,
        waited_secs: i64,
        in_use: usize,
    },

    #[error("applying scheme to {device} failed: {message}")]
    ApplyFailed { device: String, message: String },

    #[error("{device} realized {realized} instead of {expected} after {attempts} verification attempt(s)")]
    VerificationMismatch {
        device: String,
        expected: String,
        realized: String,
        attempts: u32,
    },

    #[error("{device} is not in a failed state (phase {phase})")]
    NotFailed { device: String, phase: String },
}

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("device {device} is unavailable")]
    DeviceUnavailable { device: String },

    #[error("unknown workload request `{0}`")]
    UnknownRequest(String),

    #[error("workload request `{0}` holds no admitted units")]
    NotAdmitted(String),
}
