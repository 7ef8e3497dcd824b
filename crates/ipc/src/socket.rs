//! Unix-domain-socket transport.
//!
//! Each slot listens on `socket_path(group_dir, slot)`. Inbound connections are
//! decoded with [`FrameCodec`] into a bounded queue; outbound connections are
//! opened lazily and cached per destination.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pcq_common::{CqError, ProcessSlot, Result};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::FrameCodec;
use crate::layout::socket_path;
use crate::transport::MicrobatchTransport;

type FrameSink = FramedWrite<OwnedWriteHalf, FrameCodec>;

pub struct UnixSocketTransport {
    slot: ProcessSlot,
    group_dir: PathBuf,
    path: PathBuf,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: Mutex<HashMap<ProcessSlot, FrameSink>>,
    accept_task: JoinHandle<()>,
    destroyed: AtomicBool,
}

impl UnixSocketTransport {
    /// Bind `slot` under `group_dir`, replacing a stale socket file if present.
    pub async fn bind(group_dir: impl Into<PathBuf>, slot: ProcessSlot, capacity: usize) -> Result<Self> {
        let group_dir = group_dir.into();
        std::fs::create_dir_all(&group_dir)?;
        let path = socket_path(&group_dir, slot);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let accept_task = tokio::spawn(accept_loop(listener, tx, slot));
        debug!(slot = %slot, path = %path.display(), "socket transport bound");
        Ok(Self {
            slot,
            group_dir,
            path,
            inbound: Mutex::new(rx),
            outbound: Mutex::new(HashMap::new()),
            accept_task,
            destroyed: AtomicBool::new(false),
        })
    }

    fn teardown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<Bytes>, slot: ProcessSlot) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(slot = %slot, error = %e, "socket accept failed");
                return;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(stream, FrameCodec::new());
            while let Some(next) = frames.next().await {
                match next {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(slot = %slot, error = %e, "dropping connection with bad framing");
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl MicrobatchTransport for UnixSocketTransport {
    fn slot(&self) -> ProcessSlot {
        self.slot
    }

    async fn send_frame(&self, dest: ProcessSlot, frame: Bytes) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        if !outbound.contains_key(&dest) {
            let stream = UnixStream::connect(socket_path(&self.group_dir, dest))
                .await
                .map_err(|e| CqError::Transport(format!("connect to {dest} failed: {e}")))?;
            let (_, write) = stream.into_split();
            outbound.insert(dest, FramedWrite::new(write, FrameCodec::new()));
        }
        let sink = outbound
            .get_mut(&dest)
            .ok_or_else(|| CqError::Transport(format!("no connection to {dest}")))?;
        if let Err(e) = sink.send(frame).await {
            outbound.remove(&dest);
            return Err(CqError::Transport(format!("send to {dest} failed: {e}")));
        }
        Ok(())
    }

    async fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(CqError::Transport(format!("{} endpoint destroyed", self.slot)));
        }
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(CqError::Transport("listener closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn destroy(&self) {
        self.outbound.lock().await.clear();
        self.teardown();
    }
}

impl Drop for UnixSocketTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::layout::group_dir;

    fn temp_socket_root() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("pcq_sock_test_{nanos}"))
    }

    #[tokio::test]
    async fn frames_cross_sockets_and_destroy_removes_file() {
        let root = temp_socket_root();
        let dir = group_dir(&root, 1);
        let a = UnixSocketTransport::bind(&dir, ProcessSlot(0), 8)
            .await
            .expect("bind a");
        let b = UnixSocketTransport::bind(&dir, ProcessSlot(1), 8)
            .await
            .expect("bind b");

        a.send_frame(ProcessSlot(1), Bytes::from_static(b"one"))
            .await
            .expect("send");
        a.send_frame(ProcessSlot(1), Bytes::from_static(b"two"))
            .await
            .expect("send");
        let first = b.recv_frame(Duration::from_secs(2)).await.expect("recv");
        let second = b.recv_frame(Duration::from_secs(2)).await.expect("recv");
        assert_eq!(first.as_deref(), Some(&b"one"[..]));
        assert_eq!(second.as_deref(), Some(&b"two"[..]));
        assert!(b
            .recv_frame(Duration::from_millis(10))
            .await
            .expect("recv")
            .is_none());

        assert!(a
            .send_frame(ProcessSlot(7), Bytes::from_static(b"nobody"))
            .await
            .is_err());

        let path = socket_path(&dir, ProcessSlot(1));
        assert!(path.exists());
        b.destroy().await;
        b.destroy().await;
        assert!(!path.exists());

        let _ = std::fs::remove_dir_all(root);
    }
}
