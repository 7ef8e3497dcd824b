//! Ingestion acknowledgements.
//!
//! An [`AckRef`] is a small copyable descriptor carried on the wire. It resolves
//! through an [`AckTable`] shared by every process of a database; a slot whose
//! id changed (released and reclaimed) makes older refs inert.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use pcq_common::{CqError, Result, Shutdown};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

const FREE: u64 = 0;

/// How far downstream an ingestion request waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AckLevel {
    /// Fire and forget.
    Async,
    /// Every tuple has been received and committed by a worker.
    Receive,
    /// Additionally every tuple written to combiners has been merged.
    Commit,
}

impl AckLevel {
    fn to_u8(self) -> u8 {
        match self {
            Self::Async => 0,
            Self::Receive => 1,
            Self::Commit => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Receive,
            2 => Self::Commit,
            _ => Self::Async,
        }
    }
}

/// Wire descriptor of one acknowledgement handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckRef {
    pub slot: u32,
    pub id: u64,
}

/// Source of the database-wide generation used for stale-epoch detection.
pub trait GenerationSource: Send + Sync {
    fn current_generation(&self) -> u64;
}

impl GenerationSource for AtomicU64 {
    fn current_generation(&self) -> u64 {
        self.load(Ordering::Acquire)
    }
}

/// Point-in-time view of one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckSnapshot {
    pub level: AckLevel,
    pub generation: u64,
    pub target: u64,
    pub received: u64,
    pub written: u64,
    pub combined: u64,
    pub abandoned: bool,
}

impl AckSnapshot {
    pub fn is_satisfied(&self) -> bool {
        match self.level {
            AckLevel::Async => true,
            AckLevel::Receive => self.received >= self.target,
            AckLevel::Commit => self.received >= self.target && self.combined >= self.written,
        }
    }
}

#[derive(Debug, Default)]
struct AckSlot {
    id: AtomicU64,
    level: AtomicU8,
    generation: AtomicU64,
    target: AtomicU64,
    received: AtomicU64,
    written: AtomicU64,
    combined: AtomicU64,
    abandoned: AtomicBool,
}

/// Fixed-capacity acknowledgement table.
#[derive(Debug)]
pub struct AckTable {
    slots: Box<[AckSlot]>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
}

impl AckTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| AckSlot::default()).collect();
        Self {
            slots,
            next_id: AtomicU64::new(1),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot.
    pub fn create(&self, level: AckLevel, target: u64, generation: u64) -> Result<AckRef> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let n = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for i in 0..n {
            let slot_idx = (start + i) % n;
            let slot = &self.slots[slot_idx];
            if slot
                .id
                .compare_exchange(FREE, id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.level.store(level.to_u8(), Ordering::Relaxed);
                slot.generation.store(generation, Ordering::Relaxed);
                slot.target.store(target, Ordering::Relaxed);
                slot.received.store(0, Ordering::Relaxed);
                slot.written.store(0, Ordering::Relaxed);
                slot.combined.store(0, Ordering::Relaxed);
                slot.abandoned.store(false, Ordering::Release);
                return Ok(AckRef {
                    slot: slot_idx as u32,
                    id,
                });
            }
        }
        Err(CqError::Execution(format!(
            "no free acknowledgement slots (capacity {n})"
        )))
    }

    fn resolve(&self, ack: AckRef) -> Option<&AckSlot> {
        let slot = self.slots.get(ack.slot as usize)?;
        (slot.id.load(Ordering::Acquire) == ack.id).then_some(slot)
    }

    /// Worker-side receipt of `n` ingested tuples. Returns false for an inert ref.
    pub fn mark_received(&self, ack: AckRef, n: u64) -> bool {
        self.resolve(ack)
            .map(|s| s.received.fetch_add(n, Ordering::AcqRel))
            .is_some()
    }

    /// Tuples handed to combiners for this handle.
    pub fn mark_written(&self, ack: AckRef, n: u64) -> bool {
        self.resolve(ack)
            .map(|s| s.written.fetch_add(n, Ordering::AcqRel))
            .is_some()
    }

    /// Combiner-side merge of `n` tuples.
    pub fn mark_combined(&self, ack: AckRef, n: u64) -> bool {
        self.resolve(ack)
            .map(|s| s.combined.fetch_add(n, Ordering::AcqRel))
            .is_some()
    }

    pub fn abandon(&self, ack: AckRef) {
        if let Some(slot) = self.resolve(ack) {
            slot.abandoned.store(true, Ordering::Release);
        }
    }

    pub fn snapshot(&self, ack: AckRef) -> Option<AckSnapshot> {
        let s = self.resolve(ack)?;
        Some(AckSnapshot {
            level: AckLevel::from_u8(s.level.load(Ordering::Relaxed)),
            generation: s.generation.load(Ordering::Relaxed),
            target: s.target.load(Ordering::Acquire),
            received: s.received.load(Ordering::Acquire),
            written: s.written.load(Ordering::Acquire),
            combined: s.combined.load(Ordering::Acquire),
            abandoned: s.abandoned.load(Ordering::Acquire),
        })
    }

    pub fn level(&self, ack: AckRef) -> Option<AckLevel> {
        self.snapshot(ack).map(|s| s.level)
    }

    /// Free the slot. No-op for an inert ref.
    pub fn release(&self, ack: AckRef) {
        if let Some(slot) = self.slots.get(ack.slot as usize) {
            let _ = slot
                .id
                .compare_exchange(ack.id, FREE, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    /// Wait until the handle is satisfied.
    ///
    /// Returns `Ok(false)` on deadline or shutdown, `Err(StaleEpoch)` once the
    /// generation moves past the handle's stamp, and a transport error when a
    /// sender abandoned the handle.
    pub async fn wait(
        &self,
        ack: AckRef,
        generation: &dyn GenerationSource,
        deadline: Instant,
        shutdown: &Shutdown,
    ) -> Result<bool> {
        let mut backoff = Duration::from_millis(1);
        loop {
            let Some(snap) = self.snapshot(ack) else {
                return Ok(false);
            };
            if snap.abandoned {
                return Err(CqError::Transport(format!(
                    "acknowledgement {}:{} abandoned after a failed send",
                    ack.slot, ack.id
                )));
            }
            if snap.is_satisfied() {
                return Ok(true);
            }
            let current = generation.current_generation();
            if snap.generation != 0 && current > snap.generation {
                warn!(
                    slot = ack.slot,
                    created = snap.generation,
                    current,
                    "acknowledgement outlived its process group generation"
                );
                return Err(CqError::StaleEpoch {
                    created: snap.generation,
                    current,
                });
            }
            if shutdown.is_triggered() || Instant::now() >= deadline {
                return Ok(false);
            }
            let wake = (Instant::now() + backoff).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = shutdown.wait() => return Ok(false),
            }
            backoff = (backoff * 2).min(Duration::from_millis(50));
        }
    }
}
