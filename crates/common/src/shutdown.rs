//! Process-level shutdown signal.
//!
//! Every bounded wait in the runtime (`poll`, IPC receive, registry and ack
//! waits) selects against [`Shutdown::wait`] so a stop request cuts the wait
//! short instead of letting it run out its timeout.

use tokio::sync::watch;

/// Cloneable shutdown trigger/observer pair.
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Trigger on SIGINT (Ctrl+C).
    pub fn install_ctrl_c(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, shutting down");
                this.trigger();
            }
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Shutdown;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_trigger_from_clone() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        let other = shutdown.clone();
        let waiter = tokio::spawn(async move { other.wait().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish")
            .expect("join");
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn wait_is_immediate_once_triggered() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .expect("already triggered");
    }
}
