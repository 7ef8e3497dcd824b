use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pcq_common::Result;

/// One open database transaction.
pub trait Transaction: Send {
    fn commit(self: Box<Self>) -> Result<()>;
    fn abort(self: Box<Self>);
}

pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction>>;
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

/// Transaction manager that only counts lifecycle transitions.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransactions {
    counters: Arc<Counters>,
}

impl MemoryTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begun(&self) -> u64 {
        self.counters.begun.load(Ordering::Relaxed)
    }

    pub fn committed(&self) -> u64 {
        self.counters.committed.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.counters.aborted.load(Ordering::Relaxed)
    }

    pub fn open(&self) -> u64 {
        self.begun() - self.committed() - self.aborted()
    }
}

impl TransactionManager for MemoryTransactions {
    fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MemoryTransaction {
    counters: Arc<Counters>,
}

impl Transaction for MemoryTransaction {
    fn commit(self: Box<Self>) -> Result<()> {
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
    }
}
