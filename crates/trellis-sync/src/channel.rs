//! Local broadcast between clients of the same document on one device.

use crate::error::{Result, SyncError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Pub/sub primitive shared by every client of one document.
///
/// Messages are delivered to every other endpoint, never back to the sender.
pub trait EventChannel<M>: Send + Sync + 'static {
    /// Take the receiving half. Can only be called once.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<M>>;

    /// Deliver `message` to every other endpoint.
    fn send_event(&self, message: M) -> Result<()>;

    /// Leave the channel; later sends fail.
    fn shutdown(&self);
}

struct Endpoint<M> {
    tx: mpsc::UnboundedSender<M>,
    connected: Arc<AtomicBool>,
}

type SharedEndpoints<M> = Arc<RwLock<HashMap<u64, Endpoint<M>>>>;

/// In-memory hub standing in for a browser broadcast channel.
pub struct MemoryBroadcast<M> {
    endpoints: SharedEndpoints<M>,
    next_id: AtomicU64,
}

impl<M: Clone + Send + 'static> MemoryBroadcast<M> {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the hub with a new endpoint.
    pub fn endpoint(&self) -> MemoryChannel<M> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        self.endpoints.write().insert(
            id,
            Endpoint {
                tx,
                connected: connected.clone(),
            },
        );
        MemoryChannel {
            id,
            endpoints: self.endpoints.clone(),
            rx: Mutex::new(Some(rx)),
            connected,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of endpoints that have not shut down.
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: Clone + Send + 'static> Default for MemoryBroadcast<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's endpoint on a [`MemoryBroadcast`].
pub struct MemoryChannel<M> {
    id: u64,
    endpoints: SharedEndpoints<M>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<M>>>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl<M> MemoryChannel<M> {
    /// Simulate a partition: a disconnected endpoint silently drops what it
    /// sends and receives nothing.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl<M: Clone + Send + 'static> EventChannel<M> for MemoryChannel<M> {
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<M>> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| SyncError::Internal("channel already subscribed".into()))
    }

    fn send_event(&self, message: M) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelClosed("local channel".into()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let endpoints = self.endpoints.read();
        for (id, endpoint) in endpoints.iter() {
            if *id == self.id || !endpoint.connected.load(Ordering::SeqCst) {
                continue;
            }
            // A dropped receiver only means that client is gone.
            let _ = endpoint.tx.send(message.clone());
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.endpoints.write().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = MemoryBroadcast::<u32>::new();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let c = hub.endpoint();
        let mut rx_a = a.subscribe().unwrap();
        let mut rx_b = b.subscribe().unwrap();
        let mut rx_c = c.subscribe().unwrap();

        a.send_event(7).unwrap();

        assert_eq!(rx_b.recv().await, Some(7));
        assert_eq!(rx_c.recv().await, Some(7));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_subscribe_once() {
        let hub = MemoryBroadcast::<u32>::new();
        let a = hub.endpoint();
        assert!(a.subscribe().is_ok());
        assert!(a.subscribe().is_err());
    }

    #[test]
    fn test_shutdown_leaves_hub() {
        let hub = MemoryBroadcast::<u32>::new();
        let a = hub.endpoint();
        let _b = hub.endpoint();
        assert_eq!(hub.len(), 2);

        a.shutdown();
        assert_eq!(hub.len(), 1);
        assert!(matches!(a.send_event(1), Err(SyncError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_partition() {
        let hub = MemoryBroadcast::<u32>::new();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let mut rx_b = b.subscribe().unwrap();

        b.set_connected(false);
        a.send_event(1).unwrap();
        assert!(rx_b.try_recv().is_err());

        b.set_connected(true);
        a.send_event(2).unwrap();
        assert_eq!(rx_b.recv().await, Some(2));
    }
}
