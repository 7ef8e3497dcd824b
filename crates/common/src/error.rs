use thiserror::Error;

/// Canonical error taxonomy shared by every continuous-query crate.
///
/// Classification guidance:
/// - [`CqError::Execution`]: one query failed this cycle; the executor aborts the
///   batch transaction, purges the cached state and retries on the next cycle
/// - [`CqError::Transport`] / [`CqError::Timeout`]: IPC send failures, returned to
///   the sender which decides whether to retry or abandon acknowledgements
/// - [`CqError::Codec`]: a malformed frame; receivers drop it and keep running
/// - [`CqError::Registry`]: process-group table misuse (allocate-on-existing,
///   unknown id, ready-count overflow)
/// - [`CqError::StaleEpoch`]: an acknowledgement outlived a process-group restart
/// - [`CqError::InvalidConfig`]: configuration or construction-time invariant
///   violations
#[derive(Debug, Error)]
pub enum CqError {
    /// Invalid or inconsistent configuration, or a value rejected at construction.
    ///
    /// Examples:
    /// - zero workers/combiners
    /// - sealing a tuple microbatch with an empty destination set
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Per-query runtime failure. Retryable on the next scheduling cycle.
    #[error("execution error: {0}")]
    Execution(String),

    /// Catalog collaborator failures (lookup, listing, relation open).
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Peer gone, channel closed, or socket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A bounded operation ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Wire frame could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Process-group registry misuse.
    #[error("registry error: {0}")]
    Registry(String),

    /// Acknowledgement created under an older generation.
    #[error("stale acknowledgement epoch: created at {created}, current {current}")]
    StaleEpoch {
        /// Generation stamped on the handle.
        created: u64,
        /// Generation observed while waiting.
        current: u64,
    },

    /// Shutdown was requested while waiting.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a shape that is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl CqError {
    /// Whether the failure is scoped to one query and one cycle.
    ///
    /// Retryable errors are logged and the query is retried next cycle; anything
    /// else is structural and propagates to the process loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Execution(_) | Self::Catalog(_) | Self::Transport(_) | Self::Timeout(_)
        )
    }
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, CqError>;
