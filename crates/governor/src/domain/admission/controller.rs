//! Admission controller
//!
//! Admission state lives behind one async mutex. An admission attempt takes
//! that mutex first and the device locks of every candidate unit second, in
//! sorted order, so concurrent attempts never deadlock with each other or with
//! the partition manager (which only takes device locks).

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use api_types::QuotaSpec;
use api_types::WorkloadSubmission;
use api_types::WorkloadView;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::logging::AUDIT_TARGET;

use super::queue::FairShareQueue;
use super::queue::QueueKey;
use super::quota::Quota;
use super::quota::QuotaBook;
use super::types::AdmissionPolicy;
use super::types::Allocation;
use super::types::Decision;
use super::types::RejectReason;
use super::types::RequestId;
use super::types::WorkloadRequest;
use crate::domain::clock::Clock;
use crate::domain::error::GovernanceError;
use crate::domain::error::ValidationError;
use crate::domain::inventory::DeviceId;
use crate::domain::inventory::UnitId;
use crate::domain::inventory::UnitKind;
use crate::domain::partition::Orchestrator;
use crate::domain::profiles::HardwareProfile;
use crate::domain::profiles::ProfileRegistry;
use crate::domain::Fleet;

/// Terminal requests kept around for status queries.
const TERMINAL_RETENTION: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    Queued,
    Admitted,
    Rejected(RejectReason),
    Cancelled,
    Completed,
}

struct RequestEntry {
    request: WorkloadRequest,
    arrival: u64,
    state: EntryState,
    allocations: Vec<Allocation>,
    status: watch::Sender<Decision>,
}

impl RequestEntry {
    fn remaining(&self) -> u32 {
        self.request
            .count
            .saturating_sub(self.allocations.len() as u32)
    }

    fn units(&self) -> Vec<UnitId> {
        self.allocations.iter().map(|a| a.unit.clone()).collect()
    }

    fn decision(&self, queue: &FairShareQueue) -> Decision {
        match &self.state {
            EntryState::Queued => {
                let position = queue.position(&self.request.id).unwrap_or(0);
                if self.allocations.is_empty() {
                    Decision::Queued { position }
                } else {
                    Decision::PartiallyAdmitted {
                        units: self.units(),
                        position,
                        remaining: self.remaining(),
                    }
                }
            }
            EntryState::Admitted => Decision::Admitted {
                units: self.units(),
            },
            EntryState::Rejected(reason) => Decision::Rejected(reason.clone()),
            EntryState::Cancelled => Decision::Cancelled,
            EntryState::Completed => Decision::Completed,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            EntryState::Rejected(_) | EntryState::Cancelled | EntryState::Completed
        )
    }
}

struct AdmissionBook {
    policy: AdmissionPolicy,
    quotas: QuotaBook,
    queue: FairShareQueue,
    entries: HashMap<RequestId, RequestEntry>,
    terminal: VecDeque<RequestId>,
    next_arrival: u64,
}

impl AdmissionBook {
    fn publish(&self, id: &RequestId) {
        if let Some(entry) = self.entries.get(id) {
            entry.status.send_replace(entry.decision(&self.queue));
        }
    }

    fn publish_all(&self) {
        for entry in self.entries.values().filter(|e| !e.is_terminal()) {
            entry.status.send_replace(entry.decision(&self.queue));
        }
    }

    /// Moves an entry to a terminal state and prunes old terminal entries.
    fn finish(&mut self, id: &RequestId, state: EntryState) {
        self.queue.remove(id);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.state = state;
            entry.status.send_replace(entry.decision(&self.queue));
        }
        self.terminal.push_back(id.clone());
        while self.terminal.len() > TERMINAL_RETENTION {
            if let Some(old) = self.terminal.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

/// Matches workload requests to free units under quota and priority.
pub struct AdmissionController {
    fleet: Fleet,
    registry: Arc<ProfileRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    clock: Arc<dyn Clock>,
    book: Mutex<AdmissionBook>,
    accepting: AtomicBool,
}

impl AdmissionController {
    pub fn new(
        fleet: Fleet,
        registry: Arc<ProfileRegistry>,
        orchestrator: Arc<dyn Orchestrator>,
        clock: Arc<dyn Clock>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            fleet,
            registry,
            orchestrator,
            clock,
            book: Mutex::new(AdmissionBook {
                policy,
                quotas: QuotaBook::default(),
                queue: FairShareQueue::new(),
                entries: HashMap::new(),
                terminal: VecDeque::new(),
                next_arrival: 0,
            }),
            accepting: AtomicBool::new(true),
        }
    }

    pub async fn policy(&self) -> AdmissionPolicy {
        self.book.lock().await.policy
    }

    pub async fn set_policy(&self, policy: AdmissionPolicy) {
        let mut book = self.book.lock().await;
        if book.policy != policy {
            info!(from = %book.policy, to = %policy, "Admission policy changed");
            book.policy = policy;
            self.evaluate_locked(&mut book).await;
        }
    }

    /// Installs a complete quota set and re-evaluates the queue.
    pub async fn set_quotas(&self, specs: &[QuotaSpec]) -> Result<(), ValidationError> {
        let mut book = self.book.lock().await;
        book.quotas.replace(specs)?;
        let waiting = book.queue.ordered();
        for id in waiting {
            let weight = book
                .entries
                .get(&id)
                .and_then(|entry| book.quotas.get(&entry.request.team))
                .map(|quota| quota.priority_weight)
                .unwrap_or(1);
            book.queue.reweight(&id, weight);
        }
        info!(teams = specs.len(), "Quotas updated");
        self.evaluate_locked(&mut book).await;
        Ok(())
    }

    pub async fn quotas(&self) -> Vec<Quota> {
        self.book.lock().await.quotas.list()
    }

    /// Submits a workload request.
    ///
    /// Structurally invalid requests are rejected immediately; capacity and
    /// quota shortfalls always queue.
    pub async fn submit(&self, submission: WorkloadSubmission) -> Result<Decision, GovernanceError> {
        let id = RequestId(
            submission
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        let mut book = self.book.lock().await;
        if book.entries.contains_key(&id) {
            return Err(ValidationError::DuplicateRequest(id.0).into());
        }

        let now = self.clock.now();
        let arrival = book.next_arrival;
        book.next_arrival += 1;

        let validated = self.validate(&book, &submission);
        let team = validated
            .as_ref()
            .map(|(team, _)| team.clone())
            .unwrap_or_else(|_| submission.team.clone());
        let request = WorkloadRequest {
            id: id.clone(),
            team,
            profile: submission.profile.clone(),
            count: validated.as_ref().map(|(_, count)| *count).unwrap_or(0),
            priority: submission.priority,
            timeout: submission.timeout_secs.map(Duration::from_secs),
            gang: submission.gang,
            submitted_at: now,
        };
        let (status, _) = watch::channel(Decision::Queued { position: 0 });
        book.entries.insert(
            id.clone(),
            RequestEntry {
                request,
                arrival,
                state: EntryState::Queued,
                allocations: Vec::new(),
                status,
            },
        );

        if !self.accepting.load(Ordering::SeqCst) {
            book.finish(&id, EntryState::Rejected(RejectReason::ShuttingDown));
            return Ok(Decision::Rejected(RejectReason::ShuttingDown));
        }
        if let Err(e) = validated {
            info!(
                target: AUDIT_TARGET,
                request = %id,
                team = %submission.team,
                profile = %submission.profile,
                reason = %e,
                "Workload rejected"
            );
            book.finish(&id, EntryState::Rejected(e.clone().into()));
            return Ok(Decision::Rejected(e.into()));
        }

        let (team, weight) = {
            let entry = &book.entries[&id];
            let weight = book
                .quotas
                .get(&entry.request.team)
                .map(|q| q.priority_weight)
                .unwrap_or(1);
            (entry.request.team.clone(), weight)
        };
        book.queue
            .push(id.clone(), QueueKey::new(submission.priority, weight, arrival));
        debug!(request = %id, team = %team, profile = %submission.profile, "Workload queued for admission");

        self.evaluate_locked(&mut book).await;
        Ok(book.entries[&id].decision(&book.queue))
    }

    /// Returns the charged team and the requested count.
    fn validate(
        &self,
        book: &AdmissionBook,
        submission: &WorkloadSubmission,
    ) -> Result<(String, u32), ValidationError> {
        let profile = self.registry.resolve(&submission.profile)?;
        let count = submission.count.unwrap_or(profile.count.default);
        profile.check_count(count)?;
        let team = profile
            .queue
            .clone()
            .unwrap_or_else(|| submission.team.clone());
        if book.quotas.get(&team).is_none() {
            return Err(ValidationError::UnknownTeam(team));
        }
        Ok((team, count))
    }

    /// Withdraws a request, releasing whatever it holds.
    pub async fn cancel(&self, id: &RequestId) -> Result<Decision, GovernanceError> {
        let mut book = self.book.lock().await;
        let entry = book
            .entries
            .get(id)
            .ok_or_else(|| GovernanceError::UnknownRequest(id.to_string()))?;
        if entry.is_terminal() {
            return Ok(entry.decision(&book.queue));
        }
        let held = self.release_entry(&mut book, id).await;
        info!(target: AUDIT_TARGET, request = %id, released = held, "Workload cancelled");
        book.finish(id, EntryState::Cancelled);
        self.evaluate_locked(&mut book).await;
        Ok(Decision::Cancelled)
    }

    /// Marks an admitted workload finished and frees its units.
    pub async fn complete(&self, id: &RequestId) -> Result<Decision, GovernanceError> {
        let mut book = self.book.lock().await;
        let entry = book
            .entries
            .get(id)
            .ok_or_else(|| GovernanceError::UnknownRequest(id.to_string()))?;
        if entry.state == EntryState::Completed {
            return Ok(Decision::Completed);
        }
        if entry.allocations.is_empty() || entry.is_terminal() {
            return Err(GovernanceError::NotAdmitted(id.to_string()));
        }
        let held = self.release_entry(&mut book, id).await;
        info!(target: AUDIT_TARGET, request = %id, released = held, "Workload completed");
        book.finish(id, EntryState::Completed);
        self.evaluate_locked(&mut book).await;
        Ok(Decision::Completed)
    }

    pub async fn status(&self, id: &RequestId) -> Result<Decision, GovernanceError> {
        let book = self.book.lock().await;
        book.entries
            .get(id)
            .map(|entry| entry.decision(&book.queue))
            .ok_or_else(|| GovernanceError::UnknownRequest(id.to_string()))
    }

    pub async fn view(&self, id: &RequestId) -> Result<WorkloadView, GovernanceError> {
        let book = self.book.lock().await;
        let entry = book
            .entries
            .get(id)
            .ok_or_else(|| GovernanceError::UnknownRequest(id.to_string()))?;
        Ok(WorkloadView {
            id: id.to_string(),
            team: entry.request.team.clone(),
            profile: entry.request.profile.clone(),
            requested: entry.request.count,
            status: entry.decision(&book.queue).to_status(),
        })
    }

    /// Subscribes to decision changes of a request.
    pub async fn watch(&self, id: &RequestId) -> Result<watch::Receiver<Decision>, GovernanceError> {
        let book = self.book.lock().await;
        book.entries
            .get(id)
            .map(|entry| entry.status.subscribe())
            .ok_or_else(|| GovernanceError::UnknownRequest(id.to_string()))
    }

    pub async fn queue_len(&self) -> usize {
        self.book.lock().await.queue.len()
    }

    /// Re-evaluates the queue, e.g. after the unit pool or profiles changed.
    pub async fn evaluate(&self) {
        let mut book = self.book.lock().await;
        self.evaluate_locked(&mut book).await;
    }

    /// Stops intake and rejects every waiting request.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let mut book = self.book.lock().await;
        let waiting = book.queue.ordered();
        for id in &waiting {
            self.release_entry(&mut book, id).await;
            book.finish(id, EntryState::Rejected(RejectReason::ShuttingDown));
        }
        info!(rejected = waiting.len(), "Admission intake stopped");
    }

    async fn evaluate_locked(&self, book: &mut AdmissionBook) {
        self.expire(book).await;

        // kinds whose first waiting request could not get enough units
        let mut capacity_blocked: HashSet<UnitKind> = HashSet::new();
        for id in book.queue.ordered() {
            let Some((profile_name, team, remaining, gang)) = book.entries.get(&id).map(|e| {
                (
                    e.request.profile.clone(),
                    e.request.team.clone(),
                    e.remaining(),
                    e.request.gang,
                )
            }) else {
                book.queue.remove(&id);
                continue;
            };
            let profile = match self.registry.resolve(&profile_name) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(request = %id, error = %e, "Profile of waiting request disappeared");
                    self.release_entry(book, &id).await;
                    book.finish(&id, EntryState::Rejected(e.into()));
                    continue;
                }
            };
            if capacity_blocked.contains(&profile.kind) {
                continue;
            }

            let allowance = book.quotas.allowance(&team, book.policy);
            let want = if gang {
                if allowance < remaining {
                    debug!(request = %id, team = %team, allowance, remaining, "Gang request waiting for quota");
                    continue;
                }
                remaining
            } else {
                remaining.min(allowance)
            };
            if want == 0 {
                debug!(request = %id, team = %team, "Request waiting for quota");
                continue;
            }

            let mut taken = self.try_admit(&profile, want, gang).await;
            if (taken.len() as u32) < want && book.policy == AdmissionPolicy::PriorityPreemptive {
                let needed = want - taken.len() as u32;
                if self.preempt(book, &id, &profile, needed).await > 0 {
                    let retry = self.try_admit(&profile, want - taken.len() as u32, gang).await;
                    taken.extend(retry);
                }
            }
            if (taken.len() as u32) < want {
                capacity_blocked.insert(profile.kind);
            }
            if !taken.is_empty() {
                self.commit(book, &id, taken);
            }
        }
        book.publish_all();
    }

    /// Reserves up to `want` units of the profile's kind. All-or-nothing for
    /// gang requests. Returns the reserved units with `borrowed` unset.
    async fn try_admit(&self, profile: &HardwareProfile, want: u32, gang: bool) -> Vec<Allocation> {
        let candidates: Vec<_> = self
            .fleet
            .inventory
            .free_units(&profile.kind)
            .into_iter()
            .filter(|unit| profile.fits(unit))
            .collect();
        if candidates.is_empty() || (gang && (candidates.len() as u32) < want) {
            return Vec::new();
        }

        let devices: BTreeSet<DeviceId> = candidates.iter().map(|u| u.device().clone()).collect();
        let guards = self.fleet.locks.lock_many(devices.iter()).await;

        let mut taken = Vec::new();
        for unit in candidates {
            if taken.len() as u32 == want {
                break;
            }
            let Some(guard) = guards.get(unit.device()) else {
                continue;
            };
            // the snapshot was taken before the locks
            if !self.fleet.inventory.is_free(&unit.id) {
                continue;
            }
            let memory_mib = profile.reservation_mib(&unit);
            match self.fleet.capacity.reserve(guard, &unit, memory_mib) {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    debug!(unit = %unit.id, error = %e, "Unit skipped, device out of memory");
                    continue;
                }
                Err(e) => {
                    error!(unit = %unit.id, error = %e, "Reservation refused");
                    continue;
                }
            }
            if let Err(e) = self.fleet.inventory.mark_in_use(guard, &[unit.id.clone()]) {
                warn!(unit = %unit.id, error = %e, "Unit vanished during admission");
                self.fleet.capacity.release(guard, &unit.id);
                continue;
            }
            taken.push(Allocation {
                unit: unit.id,
                memory_mib,
                borrowed: false,
            });
        }

        if gang && (taken.len() as u32) < want {
            for allocation in &taken {
                if let Some(guard) = guards.get(&allocation.unit.device) {
                    self.fleet.capacity.release(guard, &allocation.unit);
                    self.fleet
                        .inventory
                        .rollback_in_use(guard, std::slice::from_ref(&allocation.unit));
                }
            }
            taken.clear();
        }
        taken
    }

    fn commit(&self, book: &mut AdmissionBook, id: &RequestId, taken: Vec<Allocation>) {
        let Some(team) = book.entries.get(id).map(|e| e.request.team.clone()) else {
            return;
        };
        let mut admitted = Vec::with_capacity(taken.len());
        for mut allocation in taken {
            allocation.borrowed = book.quotas.charge(&team);
            admitted.push(allocation);
        }
        let Some(entry) = book.entries.get_mut(id) else {
            return;
        };
        let units: Vec<String> = admitted.iter().map(|a| a.unit.to_string()).collect();
        let borrowed = admitted.iter().filter(|a| a.borrowed).count();
        entry.allocations.extend(admitted);
        let remaining = entry.remaining();
        if remaining == 0 {
            entry.state = EntryState::Admitted;
            book.queue.remove(id);
        }
        info!(
            target: AUDIT_TARGET,
            request = %id,
            team = %team,
            units = ?units,
            borrowed = borrowed,
            remaining = remaining,
            "Workload admitted"
        );
    }

    /// Releases lower-priority borrowing allocations of the requested kind
    /// for a request within its team's nominal share. Returns units freed.
    async fn preempt(
        &self,
        book: &mut AdmissionBook,
        id: &RequestId,
        profile: &HardwareProfile,
        needed: u32,
    ) -> u32 {
        let Some(requester) = book.entries.get(id).map(|e| e.request.clone()) else {
            return 0;
        };
        let room = book.quotas.nominal_room(&requester.team);
        let needed = needed.min(room);
        if needed == 0 {
            return 0;
        }

        let mut victims: Vec<(i32, u64, RequestId)> = book
            .entries
            .values()
            .filter(|e| !e.is_terminal() && !e.allocations.is_empty())
            .filter(|e| e.request.team != requester.team)
            .filter(|e| e.request.priority < requester.priority)
            .filter(|e| book.quotas.is_borrowing(&e.request.team))
            .filter(|e| {
                e.allocations.iter().any(|a| {
                    a.borrowed
                        && self
                            .fleet
                            .inventory
                            .unit(&a.unit)
                            .is_some_and(|u| u.kind == profile.kind)
                })
            })
            .map(|e| (e.request.priority, e.arrival, e.request.id.clone()))
            .collect();
        // lowest priority, latest arrival first
        victims.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut freed = 0;
        for (_, _, victim) in victims {
            if freed >= needed {
                break;
            }
            let Some(team) = book.entries.get(&victim).map(|e| e.request.team.clone()) else {
                continue;
            };
            if !book.quotas.is_borrowing(&team) {
                continue;
            }
            let units = book
                .entries
                .get(&victim)
                .map(RequestEntry::units)
                .unwrap_or_default();
            let released = self.release_entry(book, &victim).await;
            freed += released;
            if let Err(e) = self.orchestrator.evict_workload(&victim.0, &units).await {
                warn!(request = %victim, "Eviction of preempted workload failed: {e:?}");
            }
            if let Some(entry) = book.entries.get_mut(&victim) {
                entry.state = EntryState::Queued;
                let weight = book
                    .quotas
                    .get(&team)
                    .map(|q| q.priority_weight)
                    .unwrap_or(1);
                book.queue.push(
                    victim.clone(),
                    QueueKey::new(entry.request.priority, weight, entry.arrival),
                );
            }
            info!(
                target: AUDIT_TARGET,
                request = %victim,
                team = %team,
                preempted_by = %id,
                released = released,
                "Workload preempted"
            );
            book.publish(&victim);
        }
        freed
    }

    /// Releases every unit held by a request and refunds its team.
    async fn release_entry(&self, book: &mut AdmissionBook, id: &RequestId) -> u32 {
        let Some(entry) = book.entries.get_mut(id) else {
            return 0;
        };
        let allocations = std::mem::take(&mut entry.allocations);
        if allocations.is_empty() {
            return 0;
        }
        let team = entry.request.team.clone();

        let by_device = group_by_device(&allocations);
        let guards = self.fleet.locks.lock_many(by_device.keys()).await;
        for (device, units) in &by_device {
            let Some(guard) = guards.get(device) else {
                continue;
            };
            for unit in units {
                self.fleet.capacity.release(guard, unit);
            }
            self.fleet.inventory.release_units(guard, units);
        }
        let released = allocations.len() as u32;
        book.quotas.refund(&team, released);
        released
    }

    /// Rejects waiting requests whose timeout elapsed.
    async fn expire(&self, book: &mut AdmissionBook) {
        let now = self.clock.now();
        let expired: Vec<(RequestId, i64)> = book
            .queue
            .ordered()
            .into_iter()
            .filter_map(|id| {
                let entry = book.entries.get(&id)?;
                let deadline = entry.request.deadline()?;
                (deadline < now)
                    .then(|| (id, (now - entry.request.submitted_at).num_seconds()))
            })
            .collect();
        for (id, waited_secs) in expired {
            let released = self.release_entry(book, &id).await;
            info!(
                target: AUDIT_TARGET,
                request = %id,
                waited_secs = waited_secs,
                released = released,
                "Workload timed out in queue"
            );
            book.finish(&id, EntryState::Rejected(RejectReason::Timeout { waited_secs }));
        }
    }
}

fn group_by_device(allocations: &[Allocation]) -> BTreeMap<DeviceId, Vec<UnitId>> {
    let mut by_device: BTreeMap<DeviceId, Vec<UnitId>> = BTreeMap::new();
    for allocation in allocations {
        by_device
            .entry(allocation.unit.device.clone())
            .or_default()
            .push(allocation.unit.clone());
    }
    by_device
}
