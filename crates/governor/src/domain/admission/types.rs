use std::fmt;
use std::time::Duration;

use api_types::AdmissionStatus;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::error::ValidationError;
use crate::domain::inventory::UnitId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How team quotas bound admission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "camelCase")]
pub enum AdmissionPolicy {
    /// Only the team's nominal share
    StrictQuota,
    /// Nominal share plus other teams' unused share, up to the borrowing limit
    #[default]
    BorrowWithLimit,
    /// Like `BorrowWithLimit`; requests within nominal share may reclaim
    /// units from lower-priority borrowers
    PriorityPreemptive,
}

impl AdmissionPolicy {
    pub fn allows_borrowing(self) -> bool {
        self != Self::StrictQuota
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("timed out after {waited_secs}s in the admission queue")]
    Timeout { waited_secs: i64 },

    #[error("governor is shutting down")]
    ShuttingDown,
}

/// A validated workload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRequest {
    pub id: RequestId,
    /// Team the request is charged to
    pub team: String,
    pub profile: String,
    pub count: u32,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub gang: bool,
    pub submitted_at: DateTime<Utc>,
}

impl WorkloadRequest {
    /// Latest time the request may wait in the queue. A timeout too large to
    /// represent means no deadline.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.timeout
            .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
            .and_then(|timeout| self.submitted_at.checked_add_signed(timeout))
    }
}

/// One unit held by an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub unit: UnitId,
    pub memory_mib: u64,
    /// Charged beyond the team's nominal share
    pub borrowed: bool,
}

/// Admission outcome as observed by the submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admitted {
        units: Vec<UnitId>,
    },
    PartiallyAdmitted {
        units: Vec<UnitId>,
        position: usize,
        remaining: u32,
    },
    Queued {
        position: usize,
    },
    Rejected(RejectReason),
    Cancelled,
    Completed,
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Cancelled | Self::Completed)
    }

    pub fn to_status(&self) -> AdmissionStatus {
        let names = |units: &[UnitId]| units.iter().map(ToString::to_string).collect();
        match self {
            Self::Admitted { units } => AdmissionStatus::Admitted {
                units: names(units),
            },
            Self::PartiallyAdmitted {
                units,
                position,
                remaining,
            } => AdmissionStatus::PartiallyAdmitted {
                units: names(units),
                position: *position,
                remaining: *remaining,
            },
            Self::Queued { position } => AdmissionStatus::Queued {
                position: *position,
            },
            Self::Rejected(reason) => AdmissionStatus::Rejected {
                reason: reason.to_string(),
            },
            Self::Cancelled => AdmissionStatus::Cancelled,
            Self::Completed => AdmissionStatus::Completed,
        }
    }
}
