use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CqError, Result};

/// Runtime knobs shared by every continuous-query process role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContQueryConfig {
    pub num_workers: usize,
    pub num_combiners: usize,
    /// Max tuples a single microbatch may hold before it is sealed.
    pub microbatch_max_tuples: usize,
    /// Max packed size of a single microbatch.
    pub microbatch_max_bytes: usize,
    /// Max tuples accumulated by one `pull()`.
    pub max_batch_tuples: usize,
    /// Max bytes accumulated by one `pull()`.
    pub max_batch_bytes: usize,
    /// Wall-clock budget of one `pull()`.
    pub max_wait_ms: u64,
    /// Poll ceiling while a transaction is already open.
    pub in_xact_max_wait_ms: u64,
    /// Poll ceiling while idle.
    pub idle_max_wait_ms: u64,
    pub ipc_send_timeout_ms: u64,
    /// Per-slot inbound queue high-water mark.
    pub ipc_queue_capacity: usize,
    /// Upper bound on continuous-query ids (ids index fixed tables).
    pub registry_capacity: usize,
    pub registry_poll_min_ms: u64,
    pub registry_poll_max_ms: u64,
    /// Number of acknowledgement slots in the shared ack table.
    pub ack_table_capacity: usize,
    pub transform_buffer_initial_rows: usize,
    /// Reinsert buffer ceiling; a full buffer is flushed early.
    pub transform_buffer_max_rows: usize,
    pub socket_dir: PathBuf,
}

impl Default for ContQueryConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            num_combiners: 1,
            microbatch_max_tuples: 10_000,
            microbatch_max_bytes: 256 * 1024,
            max_batch_tuples: 10_000,
            max_batch_bytes: 64 * 1024 * 1024,
            max_wait_ms: 10,
            in_xact_max_wait_ms: 5,
            idle_max_wait_ms: 3_000,
            ipc_send_timeout_ms: 1_000,
            ipc_queue_capacity: 64,
            registry_capacity: 1_024,
            registry_poll_min_ms: 1,
            registry_poll_max_ms: 100,
            ack_table_capacity: 4_096,
            transform_buffer_initial_rows: 64,
            transform_buffer_max_rows: 65_536,
            socket_dir: env::temp_dir().join("pcq"),
        }
    }
}

impl ContQueryConfig {
    /// Build a config from `PCQ_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            num_workers: env_or_default("PCQ_NUM_WORKERS", d.num_workers)?,
            num_combiners: env_or_default("PCQ_NUM_COMBINERS", d.num_combiners)?,
            microbatch_max_tuples: env_or_default(
                "PCQ_MICROBATCH_MAX_TUPLES",
                d.microbatch_max_tuples,
            )?,
            microbatch_max_bytes: env_or_default("PCQ_MICROBATCH_MAX_BYTES", d.microbatch_max_bytes)?,
            max_batch_tuples: env_or_default("PCQ_MAX_BATCH_TUPLES", d.max_batch_tuples)?,
            max_batch_bytes: env_or_default("PCQ_MAX_BATCH_BYTES", d.max_batch_bytes)?,
            max_wait_ms: env_or_default("PCQ_MAX_WAIT_MS", d.max_wait_ms)?,
            in_xact_max_wait_ms: env_or_default("PCQ_IN_XACT_MAX_WAIT_MS", d.in_xact_max_wait_ms)?,
            idle_max_wait_ms: env_or_default("PCQ_IDLE_MAX_WAIT_MS", d.idle_max_wait_ms)?,
            ipc_send_timeout_ms: env_or_default("PCQ_IPC_SEND_TIMEOUT_MS", d.ipc_send_timeout_ms)?,
            ipc_queue_capacity: env_or_default("PCQ_IPC_QUEUE_CAPACITY", d.ipc_queue_capacity)?,
            registry_capacity: env_or_default("PCQ_REGISTRY_CAPACITY", d.registry_capacity)?,
            registry_poll_min_ms: env_or_default("PCQ_REGISTRY_POLL_MIN_MS", d.registry_poll_min_ms)?,
            registry_poll_max_ms: env_or_default("PCQ_REGISTRY_POLL_MAX_MS", d.registry_poll_max_ms)?,
            ack_table_capacity: env_or_default("PCQ_ACK_TABLE_CAPACITY", d.ack_table_capacity)?,
            transform_buffer_initial_rows: env_or_default(
                "PCQ_TRANSFORM_BUFFER_INITIAL_ROWS",
                d.transform_buffer_initial_rows,
            )?,
            transform_buffer_max_rows: env_or_default(
                "PCQ_TRANSFORM_BUFFER_MAX_ROWS",
                d.transform_buffer_max_rows,
            )?,
            socket_dir: env::var("PCQ_SOCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.socket_dir),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 || self.num_combiners == 0 {
            return Err(CqError::InvalidConfig(
                "at least one worker and one combiner are required".to_string(),
            ));
        }
        if self.microbatch_max_tuples == 0 || self.microbatch_max_bytes == 0 {
            return Err(CqError::InvalidConfig(
                "microbatch capacity must be non-zero".to_string(),
            ));
        }
        if self.max_batch_tuples == 0 || self.max_batch_bytes == 0 {
            return Err(CqError::InvalidConfig(
                "batch limits must be non-zero".to_string(),
            ));
        }
        if self.microbatch_max_tuples > self.max_batch_tuples
            || self.microbatch_max_bytes > self.max_batch_bytes
        {
            return Err(CqError::InvalidConfig(format!(
                "microbatch capacity ({} tuples, {} bytes) exceeds batch limits ({} tuples, {} bytes)",
                self.microbatch_max_tuples,
                self.microbatch_max_bytes,
                self.max_batch_tuples,
                self.max_batch_bytes
            )));
        }
        if self.transform_buffer_max_rows == 0 {
            return Err(CqError::InvalidConfig(
                "transform buffer ceiling must be non-zero".to_string(),
            ));
        }
        if self.registry_capacity == 0 || self.ack_table_capacity == 0 {
            return Err(CqError::InvalidConfig(
                "registry and ack table capacity must be non-zero".to_string(),
            ));
        }
        if self.registry_poll_min_ms > self.registry_poll_max_ms {
            return Err(CqError::InvalidConfig(format!(
                "registry poll backoff inverted: min {} > max {}",
                self.registry_poll_min_ms, self.registry_poll_max_ms
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> ProcessLayout {
        ProcessLayout {
            num_workers: self.num_workers,
            num_combiners: self.num_combiners,
        }
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn ipc_send_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_send_timeout_ms)
    }
}

/// Slot arithmetic for the per-database process table.
///
/// Workers occupy slots `0..num_workers`, combiners follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLayout {
    pub num_workers: usize,
    pub num_combiners: usize,
}

impl ProcessLayout {
    pub fn total_slots(&self) -> usize {
        self.num_workers + self.num_combiners
    }

    pub fn worker_slot(&self, worker: usize) -> crate::ids::ProcessSlot {
        crate::ids::ProcessSlot((worker % self.num_workers.max(1)) as u32)
    }

    pub fn combiner_slot(&self, combiner: usize) -> crate::ids::ProcessSlot {
        crate::ids::ProcessSlot((self.num_workers + combiner % self.num_combiners.max(1)) as u32)
    }
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| CqError::InvalidConfig(format!("{key} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}
