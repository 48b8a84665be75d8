//! Live connection tracking.
//!
//! One [`PeerHandle`] per registered device. The handle owns the bounded
//! outbound queue (drained by a single writer task, so frames to a peer
//! never interleave) and a cancellation token that force-closes the
//! transport. Registering over an existing device id closes the old
//! connection — last writer wins, the replaced socket is shut, not
//! leaked. Unregistering is guarded by connection id so a stale
//! connection's teardown cannot evict its replacement.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::ids::{ConnectionId, DeviceId};

/// Items travelling over a connection's outbound queue.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// A serialized envelope to deliver as a text frame.
    Frame(Arc<String>),
    /// A liveness ping.
    Ping,
}

/// Handle to one live duplex connection.
pub struct PeerHandle {
    device_id: DeviceId,
    conn_id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    /// Epoch millis of the last inbound traffic.
    last_seen_ms: AtomicI64,
    awaiting_pong: AtomicBool,
}

impl PeerHandle {
    /// Create a handle around the outbound queue sender.
    pub fn new(device_id: DeviceId, conn_id: ConnectionId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            device_id,
            conn_id,
            outbound,
            cancel: CancellationToken::new(),
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            awaiting_pong: AtomicBool::new(false),
        }
    }

    /// Device this connection is bound to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Unique id of this registration.
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// Token cancelled when the connection must close.
    pub fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Force-close the connection. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Queue a frame. A full or closed queue means the peer is dead:
    /// the connection is closed and `false` returned.
    pub fn send_frame(&self, frame: Arc<String>) -> bool {
        self.send(Outbound::Frame(frame))
    }

    /// Queue a liveness ping and start expecting a pong.
    pub fn send_ping(&self) -> bool {
        self.awaiting_pong.store(true, Ordering::Relaxed);
        self.send(Outbound::Ping)
    }

    fn send(&self, item: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(item) {
            Ok(()) => true,
            Err(e) => {
                counter!("ws_send_drops_total").increment(1);
                warn!(device_id = %self.device_id, error = %e, "outbound queue rejected frame, closing connection");
                self.close();
                false
            }
        }
    }

    /// Record inbound traffic: refresh the idle clock, clear any pending
    /// pong expectation.
    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.awaiting_pong.store(false, Ordering::Relaxed);
    }

    /// Whether a ping is outstanding.
    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong.load(Ordering::Relaxed)
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_seen_ms.load(Ordering::Relaxed);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_seen(&self, by: Duration) {
        let _ = self.last_seen_ms.fetch_sub(by.as_millis() as i64, Ordering::Relaxed);
    }
}

/// Callback fired after a connection is actually removed from the
/// registry, so dependent sessions can be ended.
pub type DisconnectHook = Arc<dyn Fn(&DeviceId, ConnectionId) + Send + Sync>;

/// Shared table of live connections, keyed by device id.
///
/// Constructed once at process start; all synchronization is internal
/// (sharded map plus per-handle atomics).
pub struct ConnectionRegistry {
    peers: DashMap<DeviceId, Arc<PeerHandle>>,
    active_count: AtomicUsize,
    on_disconnect: RwLock<Option<DisconnectHook>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            active_count: AtomicUsize::new(0),
            on_disconnect: RwLock::new(None),
        }
    }

    /// Install the disconnect callback. Replaces any previous hook.
    pub fn set_disconnect_hook(&self, hook: DisconnectHook) {
        *self.on_disconnect.write() = Some(hook);
    }

    /// Bind a connection to its device id.
    ///
    /// An existing connection for the same device is closed and replaced;
    /// its later teardown is a no-op thanks to the connection id guard.
    pub fn register(&self, handle: Arc<PeerHandle>) {
        let device_id = handle.device_id().clone();
        match self.peers.insert(device_id.clone(), handle) {
            Some(old) => {
                debug!(device_id = %device_id, old_conn = %old.conn_id(), "replacing existing connection");
                old.close();
            }
            None => {
                let _ = self.active_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Connection currently bound to a device, if any.
    pub fn lookup(&self, device_id: &DeviceId) -> Option<Arc<PeerHandle>> {
        self.peers.get(device_id).map(|entry| Arc::clone(&entry))
    }

    /// Remove a binding, but only when the registered connection is the
    /// one being torn down. Closes the handle and fires the disconnect
    /// hook. Returns the removed handle.
    pub fn unregister(&self, device_id: &DeviceId, conn_id: ConnectionId) -> Option<Arc<PeerHandle>> {
        let removed = self
            .peers
            .remove_if(device_id, |_, handle| handle.conn_id() == conn_id)
            .map(|(_, handle)| handle)?;
        let _ = self.active_count.fetch_sub(1, Ordering::Relaxed);
        removed.close();
        debug!(device_id = %device_id, conn_id = %conn_id, "connection unregistered");

        let hook = self.on_disconnect.read().clone();
        if let Some(hook) = hook {
            hook(device_id, conn_id);
        }
        Some(removed)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Snapshot of every live connection, for the liveness sweep.
    pub fn snapshot(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.iter().map(|entry| Arc::clone(&entry)).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn make_handle(device: &str) -> (Arc<PeerHandle>, mpsc::Receiver<Outbound>) {
        make_handle_with_depth(device, 8)
    }

    fn make_handle_with_depth(
        device: &str,
        depth: usize,
    ) -> (Arc<PeerHandle>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth);
        let handle = Arc::new(PeerHandle::new(
            DeviceId::from(device),
            ConnectionId::generate(),
            tx,
        ));
        (handle, rx)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = make_handle("dev_a");
        registry.register(Arc::clone(&handle));
        assert_eq!(registry.connection_count(), 1);

        let found = registry.lookup(&DeviceId::from("dev_a")).unwrap();
        assert_eq!(found.conn_id(), handle.conn_id());
    }

    #[tokio::test]
    async fn lookup_unknown_device_is_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup(&DeviceId::from("ghost")).is_none());
    }

    #[tokio::test]
    async fn register_replaces_and_closes_old_connection() {
        let registry = ConnectionRegistry::new();
        let (old, _rx_old) = make_handle("dev_a");
        let (new, _rx_new) = make_handle("dev_a");
        registry.register(Arc::clone(&old));
        registry.register(Arc::clone(&new));

        // Old connection actively closed, not merely dereferenced.
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(registry.connection_count(), 1);
        let current = registry.lookup(&DeviceId::from("dev_a")).unwrap();
        assert_eq!(current.conn_id(), new.conn_id());
    }

    #[tokio::test]
    async fn unregister_removes_and_closes() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = make_handle("dev_a");
        registry.register(Arc::clone(&handle));

        let removed = registry.unregister(&DeviceId::from("dev_a"), handle.conn_id());
        assert!(removed.is_some());
        assert!(handle.is_closed());
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.lookup(&DeviceId::from("dev_a")).is_none());
    }

    #[tokio::test]
    async fn stale_unregister_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let (old, _rx_old) = make_handle("dev_a");
        let (new, _rx_new) = make_handle("dev_a");
        registry.register(Arc::clone(&old));
        registry.register(Arc::clone(&new));

        // The replaced connection's teardown must not evict the new one.
        assert!(registry.unregister(&DeviceId::from("dev_a"), old.conn_id()).is_none());
        assert_eq!(registry.connection_count(), 1);
        assert!(registry.lookup(&DeviceId::from("dev_a")).is_some());
    }

    #[tokio::test]
    async fn disconnect_hook_fires_on_unregister() {
        let registry = ConnectionRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        registry.set_disconnect_hook(Arc::new(move |_, _| {
            let _ = counter.fetch_add(1, Ordering::Relaxed);
        }));

        let (handle, _rx) = make_handle("dev_a");
        registry.register(Arc::clone(&handle));
        let _ = registry.unregister(&DeviceId::from("dev_a"), handle.conn_id());
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // Stale unregister fires nothing.
        let _ = registry.unregister(&DeviceId::from("dev_a"), handle.conn_id());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn send_frame_delivers_in_order() {
        let (handle, mut rx) = make_handle("dev_a");
        assert!(handle.send_frame(Arc::new("one".to_string())));
        assert!(handle.send_frame(Arc::new("two".to_string())));

        match rx.recv().await.unwrap() {
            Outbound::Frame(f) => assert_eq!(*f, "one"),
            Outbound::Ping => panic!("expected frame"),
        }
        match rx.recv().await.unwrap() {
            Outbound::Frame(f) => assert_eq!(*f, "two"),
            Outbound::Ping => panic!("expected frame"),
        }
    }

    #[tokio::test]
    async fn queue_overflow_closes_connection() {
        let (handle, _rx) = make_handle_with_depth("dev_slow", 1);
        assert!(handle.send_frame(Arc::new("fits".to_string())));
        // Queue is full now; the overflow marks the connection dead.
        assert!(!handle.send_frame(Arc::new("dropped".to_string())));
        assert!(handle.is_closed());
        // Everything after the close is rejected outright.
        assert!(!handle.send_frame(Arc::new("late".to_string())));
    }

    #[tokio::test]
    async fn ping_sets_pong_expectation_and_touch_clears_it() {
        let (handle, mut rx) = make_handle("dev_a");
        assert!(!handle.awaiting_pong());
        assert!(handle.send_ping());
        assert!(handle.awaiting_pong());
        assert!(matches!(rx.recv().await.unwrap(), Outbound::Ping));

        handle.touch();
        assert!(!handle.awaiting_pong());
    }

    #[tokio::test]
    async fn idle_clock_resets_on_touch() {
        let (handle, _rx) = make_handle("dev_a");
        handle.backdate_last_seen(Duration::from_secs(60));
        assert!(handle.idle_for() >= Duration::from_secs(60));
        handle.touch();
        assert!(handle.idle_for() < Duration::from_secs(1));
    }
}
