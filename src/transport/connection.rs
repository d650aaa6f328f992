//! Coordinator-side view of a peer connection
//!
//! The host that owns the socket keeps the receiving end of the outbound
//! queue; the coordinator only ever holds a [`ConnectionHandle`].

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::error::TransportError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work queued for the socket owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One encoded FlatKV frame
    Frame(String),
    /// Low-level liveness probe carrying a nonce
    Ping(u64),
}

/// A handle for sending to a connection and tracking its liveness
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    label: Arc<str>,
    sender: mpsc::Sender<Outbound>,
    connected: Arc<AtomicBool>,
    last_seen: Arc<Mutex<Instant>>,
    terminate: Arc<Notify>,
    close_reason: Arc<Mutex<Option<String>>>,
}

impl ConnectionHandle {
    pub fn new(label: impl Into<String>, sender: mpsc::Sender<Outbound>) -> Self {
        let label: String = label.into();
        Self {
            id: ConnectionId::next(),
            label: label.into(),
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            last_seen: Arc::new(Mutex::new(Instant::now())),
            terminate: Arc::new(Notify::new()),
            close_reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a handle together with the receiving end of its queue
    pub fn channel(label: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(label, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Human-readable peer description (usually the remote address)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue work for the socket owner
    pub async fn send(&self, outbound: Outbound) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::SendFailed(self.id));
        }

        self.sender
            .send(outbound)
            .await
            .map_err(|_| TransportError::SendFailed(self.id))
    }

    /// Queue work without waiting for room
    pub fn try_send(&self, outbound: Outbound) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::SendFailed(self.id));
        }

        self.sender
            .try_send(outbound)
            .map_err(|_| TransportError::SendFailed(self.id))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Ask the socket owner to drop the connection
    pub fn terminate(&self, reason: &str) {
        {
            let mut close_reason = self.close_reason.lock();
            if close_reason.is_none() {
                *close_reason = Some(reason.to_string());
            }
        }
        self.mark_disconnected();
        self.terminate.notify_one();
    }

    /// Resolves once [`terminate`](Self::terminate) has been called
    pub async fn terminated(&self) -> String {
        self.terminate.notified().await;
        self.close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "terminated".to_string())
    }

    /// Record that the peer showed signs of life
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last liveness stamp
    pub fn idle_time(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let (handle, mut rx) = ConnectionHandle::channel("test", 4);
        handle.send(Outbound::Frame("abc".to_string())).await.unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Frame("abc".to_string())));
    }

    #[tokio::test]
    async fn test_terminate_blocks_sends_and_wakes_owner() {
        let (handle, _rx) = ConnectionHandle::channel("test", 4);
        handle.terminate("liveness timeout");
        handle.terminate("second reason is ignored");

        assert!(!handle.is_connected());
        assert!(handle.send(Outbound::Ping(1)).await.is_err());
        assert_eq!(handle.terminated().await, "liveness timeout");
    }

    #[tokio::test]
    async fn test_dropped_receiver_means_disconnected() {
        let (handle, rx) = ConnectionHandle::channel("test", 4);
        drop(rx);
        assert!(!handle.is_connected());
        assert!(handle.try_send(Outbound::Ping(1)).is_err());
    }

    #[tokio::test]
    async fn test_ids_are_distinct() {
        let (a, _rx_a) = ConnectionHandle::channel("a", 1);
        let (b, _rx_b) = ConnectionHandle::channel("b", 1);
        assert_ne!(a.id(), b.id());
    }
}
