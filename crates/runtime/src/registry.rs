//! Process-group registry.
//!
//! Responsibilities:
//! - track, per continuous query, the desired and ready size of the process
//!   group (workers + combiners + optional gc) backing it;
//! - carry the active flag consulted before batches are routed to a query;
//! - let supervisors wait for a group to come up or drain, bounded by a
//!   caller-supplied liveness probe so a crashed member never hangs the wait.
//!
//! Entries live in a fixed table indexed by query id. Each entry has its own
//! lock; there is no table-wide lock, so unrelated queries never serialize.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use pcq_common::metrics::global_metrics;
use pcq_common::{ContQueryConfig, CqError, ProcessRole, ProcessSlot, QueryId, Result, Shutdown};
use pcq_ipc::GenerationSource;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Opaque handle of one managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub role: ProcessRole,
    pub slot: ProcessSlot,
    /// OS pid when the member runs as a separate process.
    pub pid: Option<u32>,
}

/// Answers whether a managed process has exited.
pub trait LivenessProbe: Send + Sync {
    fn has_exited(&self, handle: &ProcessHandle) -> bool;
}

/// Probe for in-process groups whose members never exit on their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

impl LivenessProbe for AlwaysAlive {
    fn has_exited(&self, _handle: &ProcessHandle) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub desired: u32,
    pub ready: u32,
    pub active: bool,
    pub members: Vec<ProcessHandle>,
    /// Slots that have reported ready at least once.
    pub ready_slots: Vec<ProcessSlot>,
}

impl GroupSnapshot {
    /// Ready reports not attributed to a slot.
    fn anonymous_ready(&self) -> u32 {
        self.ready.saturating_sub(self.ready_slots.len() as u32)
    }
}

#[derive(Debug)]
struct GroupEntry {
    desired: u32,
    ready: u32,
    active: bool,
    members: Vec<ProcessHandle>,
    ready_slots: Vec<ProcessSlot>,
}

#[derive(Debug)]
pub struct ProcessGroupRegistry {
    entries: Box<[Mutex<Option<GroupEntry>>]>,
    generation: AtomicU64,
    poll_min: Duration,
    poll_max: Duration,
}

impl ProcessGroupRegistry {
    /// Create a registry able to hold ids `0..capacity`.
    pub fn init(capacity: usize, poll_min: Duration, poll_max: Duration) -> Self {
        let entries = (0..capacity).map(|_| Mutex::new(None)).collect();
        Self {
            entries,
            generation: AtomicU64::new(1),
            poll_min: poll_min.max(Duration::from_millis(1)),
            poll_max: poll_max.max(poll_min),
        }
    }

    pub fn from_config(cfg: &ContQueryConfig) -> Self {
        Self::init(
            cfg.registry_capacity,
            Duration::from_millis(cfg.registry_poll_min_ms),
            Duration::from_millis(cfg.registry_poll_max_ms),
        )
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn entry(&self, id: QueryId) -> Result<MutexGuard<'_, Option<GroupEntry>>> {
        let cell = self.entries.get(id.0 as usize).ok_or_else(|| {
            CqError::Registry(format!(
                "query id {id} outside registry capacity {}",
                self.entries.len()
            ))
        })?;
        cell.lock()
            .map_err(|_| CqError::Registry(format!("registry entry {id} poisoned")))
    }

    fn missing(id: QueryId) -> CqError {
        CqError::Registry(format!("no process group registered for query {id}"))
    }

    /// Create an entry. Never overwrites an existing one.
    pub fn allocate(&self, id: QueryId, desired: u32) -> Result<()> {
        if desired == 0 {
            return Err(CqError::InvalidConfig(format!(
                "process group for query {id} must have at least one member"
            )));
        }
        let mut entry = self.entry(id)?;
        if entry.is_some() {
            return Err(CqError::Registry(format!(
                "process group for query {id} already exists"
            )));
        }
        *entry = Some(GroupEntry {
            desired,
            ready: 0,
            active: true,
            members: Vec::new(),
            ready_slots: Vec::new(),
        });
        debug!(query_id = %id, desired, "process group allocated");
        Ok(())
    }

    /// Remove an entry; no-op when absent.
    pub fn remove(&self, id: QueryId) -> Result<()> {
        if self.entry(id)?.take().is_some() {
            global_metrics().set_registry_ready_processes(&id.to_string(), 0);
            debug!(query_id = %id, "process group removed");
        }
        Ok(())
    }

    pub fn register_member(&self, id: QueryId, handle: ProcessHandle) -> Result<()> {
        let mut guard = self.entry(id)?;
        let entry = guard.as_mut().ok_or_else(|| Self::missing(id))?;
        if entry.members.len() >= entry.desired as usize {
            return Err(CqError::Registry(format!(
                "process group for query {id} already has {} members",
                entry.desired
            )));
        }
        entry.members.push(handle);
        Ok(())
    }

    pub fn increment_ready(&self, id: QueryId) -> Result<u32> {
        self.bump_ready(id, None)
    }

    /// Like [`increment_ready`](Self::increment_ready), and remembers that
    /// `slot` came up so its later exit is not read as a startup failure.
    pub fn mark_ready(&self, id: QueryId, slot: ProcessSlot) -> Result<u32> {
        self.bump_ready(id, Some(slot))
    }

    fn bump_ready(&self, id: QueryId, slot: Option<ProcessSlot>) -> Result<u32> {
        let mut guard = self.entry(id)?;
        let entry = guard.as_mut().ok_or_else(|| Self::missing(id))?;
        if entry.ready >= entry.desired {
            return Err(CqError::Registry(format!(
                "ready count for query {id} would exceed group size {}",
                entry.desired
            )));
        }
        if let Some(slot) = slot {
            if entry.ready_slots.contains(&slot) {
                return Err(CqError::Registry(format!(
                    "{slot} already reported ready for query {id}"
                )));
            }
            entry.ready_slots.push(slot);
        }
        entry.ready += 1;
        global_metrics().set_registry_ready_processes(&id.to_string(), u64::from(entry.ready));
        Ok(entry.ready)
    }

    pub fn decrement_ready(&self, id: QueryId) -> Result<u32> {
        let mut guard = self.entry(id)?;
        let entry = guard.as_mut().ok_or_else(|| Self::missing(id))?;
        entry.ready = entry.ready.saturating_sub(1);
        global_metrics().set_registry_ready_processes(&id.to_string(), u64::from(entry.ready));
        Ok(entry.ready)
    }

    pub fn set_active(&self, id: QueryId, active: bool) -> Result<()> {
        let mut guard = self.entry(id)?;
        let entry = guard.as_mut().ok_or_else(|| Self::missing(id))?;
        entry.active = active;
        Ok(())
    }

    /// False for unknown ids.
    pub fn is_active(&self, id: QueryId) -> bool {
        self.entry(id)
            .map(|e| e.as_ref().is_some_and(|e| e.active))
            .unwrap_or(false)
    }

    pub fn snapshot(&self, id: QueryId) -> Result<Option<GroupSnapshot>> {
        Ok(self.entry(id)?.as_ref().map(|e| GroupSnapshot {
            desired: e.desired,
            ready: e.ready,
            active: e.active,
            members: e.members.clone(),
            ready_slots: e.ready_slots.clone(),
        }))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new epoch; acknowledgements stamped earlier become stale.
    pub fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Wait until every member reported ready.
    ///
    /// Returns `Ok(false)` when a member exited without becoming ready, on
    /// deadline, or on shutdown. A member that reported ready through
    /// [`mark_ready`](Self::mark_ready) and then exited does not fail the
    /// wait. Exits of members whose readiness was reported anonymously only
    /// fail it once they outnumber the anonymous ready reports.
    pub async fn wait_until_ready(
        &self,
        id: QueryId,
        deadline: Instant,
        probe: &dyn LivenessProbe,
        shutdown: &Shutdown,
    ) -> Result<bool> {
        let mut backoff = self.poll_min;
        loop {
            let snap = self.snapshot(id)?.ok_or_else(|| Self::missing(id))?;
            if snap.ready >= snap.desired {
                return Ok(true);
            }
            let exited = snap
                .members
                .iter()
                .filter(|m| !snap.ready_slots.contains(&m.slot) && probe.has_exited(m))
                .count() as u32;
            if exited > snap.anonymous_ready() {
                warn!(
                    query_id = %id,
                    ready = snap.ready,
                    exited,
                    desired = snap.desired,
                    "process group member exited before becoming ready"
                );
                return Ok(false);
            }
            if !self.pause(&mut backoff, deadline, shutdown).await {
                return Ok(false);
            }
        }
    }

    /// Wait until no member is ready or every member has exited.
    /// An absent entry counts as drained.
    pub async fn wait_until_drained(
        &self,
        id: QueryId,
        deadline: Instant,
        probe: &dyn LivenessProbe,
        shutdown: &Shutdown,
    ) -> Result<bool> {
        let mut backoff = self.poll_min;
        loop {
            let Some(snap) = self.snapshot(id)? else {
                return Ok(true);
            };
            if snap.ready == 0 {
                return Ok(true);
            }
            if !snap.members.is_empty() && snap.members.iter().all(|m| probe.has_exited(m)) {
                return Ok(true);
            }
            if !self.pause(&mut backoff, deadline, shutdown).await {
                return Ok(false);
            }
        }
    }

    /// Sleep one backoff step. False when the wait must end.
    async fn pause(&self, backoff: &mut Duration, deadline: Instant, shutdown: &Shutdown) -> bool {
        if shutdown.is_triggered() || Instant::now() >= deadline {
            return false;
        }
        let wake = (Instant::now() + *backoff).min(deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            _ = shutdown.wait() => return false,
        }
        *backoff = (*backoff * 2).min(self.poll_max);
        true
    }
}

impl GenerationSource for ProcessGroupRegistry {
    fn current_generation(&self) -> u64 {
        self.generation()
    }
}
