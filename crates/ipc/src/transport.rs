use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pcq_common::{CqError, ProcessSlot, Result, Shutdown};
use tracing::{debug, warn};

use crate::codec::pack;
use crate::microbatch::Microbatch;

/// Point-to-point frame transport addressed by process slot.
#[async_trait]
pub trait MicrobatchTransport: Send + Sync {
    /// Slot this endpoint is bound to.
    fn slot(&self) -> ProcessSlot;

    async fn send_frame(&self, dest: ProcessSlot, frame: Bytes) -> Result<()>;

    /// Wait up to `timeout` for one whole frame. `Ok(None)` on timeout.
    async fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Release the bound resources. Idempotent.
    async fn destroy(&self);
}

/// Microbatch-level façade over a bound transport.
#[derive(Clone)]
pub struct MicrobatchIpc {
    transport: Arc<dyn MicrobatchTransport>,
    send_timeout: Duration,
    shutdown: Shutdown,
}

impl MicrobatchIpc {
    pub fn new(
        transport: Arc<dyn MicrobatchTransport>,
        send_timeout: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            transport,
            send_timeout,
            shutdown,
        }
    }

    pub fn slot(&self) -> ProcessSlot {
        self.transport.slot()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Pack and send. Bounded by the send timeout; never retried here.
    pub async fn send(&self, dest: ProcessSlot, mb: Microbatch) -> Result<()> {
        let frame = pack(&mb)?;
        let bytes = frame.len();
        let res = match tokio::time::timeout(
            self.send_timeout,
            self.transport.send_frame(dest, frame),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(CqError::Timeout(format!(
                "send to {dest} exceeded {:?}",
                self.send_timeout
            ))),
        };
        match &res {
            Ok(()) => debug!(
                from = %self.slot(),
                to = %dest,
                kind = ?mb.kind(),
                tuples = mb.len(),
                bytes,
                "microbatch sent"
            ),
            Err(e) => warn!(
                from = %self.slot(),
                to = %dest,
                tuples = mb.len(),
                error = %e,
                "microbatch send failed"
            ),
        }
        res
    }

    /// Wait up to `timeout` for one raw frame; shutdown ends the wait early.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Bytes>> {
        if self.shutdown.is_triggered() {
            return Ok(None);
        }
        tokio::select! {
            res = self.transport.recv_frame(timeout) => res,
            _ = self.shutdown.wait() => Ok(None),
        }
    }

    pub async fn destroy(&self) {
        self.transport.destroy().await;
    }
}

impl std::fmt::Debug for MicrobatchIpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrobatchIpc")
            .field("slot", &self.slot())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}
