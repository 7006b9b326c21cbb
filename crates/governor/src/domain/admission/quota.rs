//! Team quotas and their current usage, counted in units

use std::collections::BTreeMap;
use std::collections::HashMap;

use api_types::QuotaSpec;

use super::types::AdmissionPolicy;
use crate::domain::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub team: String,
    pub nominal: u32,
    pub borrowing_limit: u32,
    pub priority_weight: u32,
}

impl TryFrom<&QuotaSpec> for Quota {
    type Error = ValidationError;

    fn try_from(spec: &QuotaSpec) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| ValidationError::InvalidQuota {
            team: spec.team.clone(),
            reason: reason.to_string(),
        };
        if spec.team.trim().is_empty() {
            return Err(invalid("team name must not be empty"));
        }
        if spec.priority_weight == 0 {
            return Err(invalid("priority weight must be at least 1"));
        }
        Ok(Self {
            team: spec.team.clone(),
            nominal: spec.nominal_units,
            borrowing_limit: spec.borrowing_limit,
            priority_weight: spec.priority_weight,
        })
    }
}

#[derive(Debug, Default)]
pub struct QuotaBook {
    quotas: BTreeMap<String, Quota>,
    used: HashMap<String, u32>,
}

impl QuotaBook {
    /// Validates and installs a complete quota set. Usage is kept, so teams
    /// removed while holding units stay charged until those are released.
    pub fn replace(&mut self, specs: &[QuotaSpec]) -> Result<(), ValidationError> {
        let mut quotas = BTreeMap::new();
        for spec in specs {
            let quota = Quota::try_from(spec)?;
            if quotas.insert(quota.team.clone(), quota).is_some() {
                return Err(ValidationError::InvalidQuota {
                    team: spec.team.clone(),
                    reason: "declared more than once".to_string(),
                });
            }
        }
        self.quotas = quotas;
        Ok(())
    }

    pub fn get(&self, team: &str) -> Option<&Quota> {
        self.quotas.get(team)
    }

    pub fn list(&self) -> Vec<Quota> {
        self.quotas.values().cloned().collect()
    }

    pub fn used(&self, team: &str) -> u32 {
        self.used.get(team).copied().unwrap_or(0)
    }

    /// Units the team holds beyond its nominal share.
    pub fn borrowed(&self, team: &str) -> u32 {
        let nominal = self.get(team).map(|q| q.nominal).unwrap_or(0);
        self.used(team).saturating_sub(nominal)
    }

    pub fn is_borrowing(&self, team: &str) -> bool {
        self.borrowed(team) > 0
    }

    /// Unused nominal share of the team.
    pub fn nominal_room(&self, team: &str) -> u32 {
        let nominal = self.get(team).map(|q| q.nominal).unwrap_or(0);
        nominal.saturating_sub(self.used(team))
    }

    /// Unused nominal share of the other teams that nobody borrows yet.
    fn lendable_to(&self, team: &str) -> u32 {
        let total_nominal: u64 = self.quotas.values().map(|q| u64::from(q.nominal)).sum();
        let total_used: u64 = self.used.values().map(|u| u64::from(*u)).sum();
        let own_room = u64::from(self.nominal_room(team));
        let lendable = total_nominal.saturating_sub(total_used).saturating_sub(own_room);
        u32::try_from(lendable).unwrap_or(u32::MAX)
    }

    /// Units the team may still be charged under `policy`.
    pub fn allowance(&self, team: &str, policy: AdmissionPolicy) -> u32 {
        let Some(quota) = self.get(team) else {
            return 0;
        };
        let room = self.nominal_room(team);
        if !policy.allows_borrowing() {
            return room;
        }
        let borrow_room = quota.borrowing_limit.saturating_sub(self.borrowed(team));
        room + borrow_room.min(self.lendable_to(team))
    }

    /// Charges one unit; returns whether it was borrowed.
    pub fn charge(&mut self, team: &str) -> bool {
        let borrowed = self.nominal_room(team) == 0;
        *self.used.entry(team.to_string()).or_default() += 1;
        borrowed
    }

    pub fn refund(&mut self, team: &str, units: u32) {
        if let Some(used) = self.used.get_mut(team) {
            *used = used.saturating_sub(units);
            if *used == 0 {
                self.used.remove(team);
            }
        }
    }
}
