//! Hardware-isolated slice profiles (`<g>g.<m>gb`)

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::domain::error::SchemeError;

/// Compute slices a MIG-capable GPU can be split into.
pub const MAX_COMPUTE_SLICES: u32 = 7;

const MIB_PER_GB: u64 = 1024;

/// A slice shape, e.g. `1g.5gb` = one compute slice with 5 GB of dedicated memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigProfile {
    compute_slices: u32,
    memory_gb: u32,
}

impl MigProfile {
    pub fn new(compute_slices: u32, memory_gb: u32) -> Result<Self, SchemeError> {
        if compute_slices == 0 || compute_slices > MAX_COMPUTE_SLICES || memory_gb == 0 {
            return Err(SchemeError::InvalidMigProfile(format!(
                "{compute_slices}g.{memory_gb}gb"
            )));
        }
        Ok(Self {
            compute_slices,
            memory_gb,
        })
    }

    pub fn compute_slices(&self) -> u32 {
        self.compute_slices
    }

    /// Dedicated memory of one slice in MiB.
    pub fn memory_mib(&self) -> u64 {
        u64::from(self.memory_gb) * MIB_PER_GB
    }
}

impl fmt::Display for MigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}g.{}gb", self.compute_slices, self.memory_gb)
    }
}

impl FromStr for MigProfile {
    type Err = SchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemeError::InvalidMigProfile(s.to_string());
        let (compute, memory) = s.trim().split_once('.').ok_or_else(invalid)?;
        let compute = compute
            .strip_suffix('g')
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let memory = memory
            .strip_suffix("gb")
            .and_then(|m| m.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        Self::new(compute, memory).map_err(|_| invalid())
    }
}

impl TryFrom<String> for MigProfile {
    type Error = SchemeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MigProfile> for String {
    fn from(value: MigProfile) -> Self {
        value.to_string()
    }
}
