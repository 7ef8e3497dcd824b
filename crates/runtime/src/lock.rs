//! Database-level continuous execution lock.
//!
//! Executors hold the shared form for the duration of a batch; dropping a
//! continuous query takes the exclusive form, so it waits for in-flight batches
//! and no batch observes a half-applied drop.

use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

pub type SharedExecutionGuard = OwnedRwLockReadGuard<()>;
pub type ExclusiveExecutionGuard = OwnedRwLockWriteGuard<()>;

#[derive(Debug, Clone, Default)]
pub struct ExecutionLock {
    inner: Arc<RwLock<()>>,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire_shared(&self) -> SharedExecutionGuard {
        Arc::clone(&self.inner).read_owned().await
    }

    pub async fn acquire_exclusive(&self) -> ExclusiveExecutionGuard {
        Arc::clone(&self.inner).write_owned().await
    }
}
