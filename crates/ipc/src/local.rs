//! In-memory transport: one bounded queue per process slot.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pcq_common::{CqError, ProcessSlot, Result};
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct LocalHub {
    senders: Vec<mpsc::Sender<Bytes>>,
    receivers: Vec<Mutex<Option<mpsc::Receiver<Bytes>>>>,
}

impl LocalHub {
    /// `capacity` is the per-slot high-water mark; senders wait once it is reached.
    pub fn new(slots: usize, capacity: usize) -> Arc<Self> {
        let (senders, receivers) = (0..slots)
            .map(|_| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (tx, Mutex::new(Some(rx)))
            })
            .unzip();
        Arc::new(Self { senders, receivers })
    }

    pub fn slots(&self) -> usize {
        self.senders.len()
    }

    /// Take ownership of a slot's inbound queue.
    pub fn bind(self: &Arc<Self>, slot: ProcessSlot) -> Result<LocalEndpoint> {
        let cell = self
            .receivers
            .get(slot.0 as usize)
            .ok_or_else(|| CqError::InvalidConfig(format!("{slot} outside hub of {}", self.slots())))?;
        let rx = cell
            .lock()
            .map_err(|_| CqError::Transport("hub lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| CqError::Transport(format!("{slot} is already bound")))?;
        Ok(LocalEndpoint {
            hub: Arc::clone(self),
            slot,
            rx: tokio::sync::Mutex::new(Some(rx)),
        })
    }

    fn give_back(&self, slot: ProcessSlot, rx: mpsc::Receiver<Bytes>) {
        if let Some(cell) = self.receivers.get(slot.0 as usize) {
            if let Ok(mut guard) = cell.lock() {
                *guard = Some(rx);
            }
        }
    }
}

/// A bound slot on a [`LocalHub`]. Unbinds on drop.
#[derive(Debug)]
pub struct LocalEndpoint {
    hub: Arc<LocalHub>,
    slot: ProcessSlot,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
}

#[async_trait]
impl crate::transport::MicrobatchTransport for LocalEndpoint {
    fn slot(&self) -> ProcessSlot {
        self.slot
    }

    async fn send_frame(&self, dest: ProcessSlot, frame: Bytes) -> Result<()> {
        let tx = self
            .hub
            .senders
            .get(dest.0 as usize)
            .ok_or_else(|| CqError::Transport(format!("unknown destination {dest}")))?;
        tx.send(frame)
            .await
            .map_err(|_| CqError::Transport(format!("{dest} is gone")))
    }

    async fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut guard = self.rx.lock().await;
        let rx = guard
            .as_mut()
            .ok_or_else(|| CqError::Transport(format!("{} endpoint destroyed", self.slot)))?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(CqError::Transport("hub closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn destroy(&self) {
        if let Some(rx) = self.rx.lock().await.take() {
            self.hub.give_back(self.slot, rx);
        }
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.get_mut().take() {
            self.hub.give_back(self.slot, rx);
        }
    }
}
