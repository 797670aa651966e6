use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::subscriptions::{ChannelKey, ChannelKind, SubscriptionRegistry};
use crate::errors::{FleetError, FleetResult};

/// Identifies one real-time connection, independent of transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope for everything sent to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelKey>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Callback run on a channel's 0 -> 1 or 1 -> 0 subscriber transition.
pub type ChannelHook = Arc<dyn Fn(&ChannelKey) + Send + Sync>;

/// Fans events out to the connections subscribed to a channel.
///
/// Emitting never fails: before [`EventBroadcaster::mark_ready`] is called,
/// or when a channel has no subscribers, events are dropped silently.
/// Each connection has a bounded outbound buffer; a frame that does not fit
/// is dropped for that connection only.
pub struct EventBroadcaster {
    registry: SubscriptionRegistry,
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<String>>>,
    on_active: RwLock<HashMap<ChannelKind, ChannelHook>>,
    on_empty: RwLock<HashMap<ChannelKind, ChannelHook>>,
    ready: AtomicBool,
    dropped_frames: AtomicU64,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            connections: RwLock::new(HashMap::new()),
            on_active: RwLock::new(HashMap::new()),
            on_empty: RwLock::new(HashMap::new()),
            ready: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Called once the transport is accepting connections.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Register the hook run when a channel of `kind` gains its first subscriber.
    pub fn on_channel_active(&self, kind: ChannelKind, hook: ChannelHook) {
        self.on_active.write().insert(kind, hook);
    }

    /// Register the hook run when a channel of `kind` loses its last subscriber.
    pub fn on_channel_empty(&self, kind: ChannelKind, hook: ChannelHook) {
        self.on_empty.write().insert(kind, hook);
    }

    /// Register a new connection with an outbound buffer of `buffer` frames.
    pub fn connect(&self, buffer: usize) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let conn = ConnectionId::new();
        self.connections.write().insert(conn, tx);
        tracing::debug!(conn_id = %conn, "connection registered");
        (conn, rx)
    }

    /// Drop a connection and all of its subscriptions, running teardown hooks
    /// for channels it was the last member of.
    pub fn disconnect(&self, conn: ConnectionId) {
        self.connections.write().remove(&conn);
        let emptied = self.registry.disconnect(conn);
        tracing::debug!(conn_id = %conn, emptied = emptied.len(), "connection removed");
        for key in emptied {
            self.fire(&self.on_empty, &key);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Subscribe `conn` to `key`. Returns the channel's subscriber count.
    pub fn subscribe(&self, conn: ConnectionId, key: ChannelKey) -> usize {
        let outcome = self.registry.subscribe(conn, key.clone());
        if outcome.first_subscriber {
            tracing::debug!(channel = %key, "channel active");
            self.fire(&self.on_active, &key);
        }
        outcome.subscribers
    }

    /// Unsubscribe `conn` from `key`. Returns the remaining subscriber count.
    pub fn unsubscribe(&self, conn: ConnectionId, key: &ChannelKey) -> usize {
        let outcome = self.registry.unsubscribe(conn, key);
        if outcome.channel_emptied {
            tracing::debug!(channel = %key, "channel empty");
            self.fire(&self.on_empty, key);
        }
        outcome.subscribers
    }

    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.registry.subscriber_count(key)
    }

    /// Emit to every subscriber of `key`. Returns how many connections the
    /// frame was queued for.
    pub fn emit<P: Serialize>(&self, key: &ChannelKey, event: &str, payload: P) -> usize {
        self.try_emit(key, event, payload).unwrap_or(0)
    }

    /// Like [`emit`](Self::emit) but reports an unready broadcaster.
    pub fn try_emit<P: Serialize>(
        &self,
        key: &ChannelKey,
        event: &str,
        payload: P,
    ) -> FleetResult<usize> {
        if !self.is_ready() {
            tracing::trace!(channel = %key, event, "broadcaster not ready, dropping event");
            return Err(FleetError::ChannelUnavailable);
        }
        let targets = self.registry.subscribers(key);
        if targets.is_empty() {
            return Ok(0);
        }
        Ok(self.deliver(&targets, Some(key), event, payload))
    }

    /// Emit to a subset of a channel's subscribers.
    pub fn emit_to<P: Serialize>(
        &self,
        targets: &[ConnectionId],
        key: &ChannelKey,
        event: &str,
        payload: P,
    ) -> usize {
        if !self.is_ready() || targets.is_empty() {
            return 0;
        }
        self.deliver(targets, Some(key), event, payload)
    }

    /// Send a frame to a single connection outside any channel (replies,
    /// acknowledgements, errors).
    pub fn send_to<P: Serialize>(&self, conn: ConnectionId, event: &str, payload: P) -> bool {
        self.deliver(&[conn], None, event, payload) == 1
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn deliver<P: Serialize>(
        &self,
        targets: &[ConnectionId],
        key: Option<&ChannelKey>,
        event: &str,
        payload: P,
    ) -> usize {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(event, error = %e, "failed to serialize event payload");
                return 0;
            }
        };
        let frame = OutboundFrame {
            event: event.to_string(),
            channel: key.cloned(),
            payload,
            timestamp: Utc::now(),
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(event, error = %e, "failed to serialize frame");
                return 0;
            }
        };

        let connections = self.connections.read();
        let mut delivered = 0;
        for conn in targets {
            let Some(tx) = connections.get(conn) else {
                continue;
            };
            match tx.try_send(json.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(conn_id = %conn, event, "outbound buffer full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    fn fire(&self, hooks: &RwLock<HashMap<ChannelKind, ChannelHook>>, key: &ChannelKey) {
        let hook = hooks.read().get(&key.kind).cloned();
        if let Some(hook) = hook {
            hook(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ready() -> EventBroadcaster {
        let b = EventBroadcaster::new();
        b.mark_ready();
        b
    }

    fn parse(frame: &str) -> serde_json::Value {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn test_emit_before_ready_is_noop() {
        let b = EventBroadcaster::new();
        let (conn, mut rx) = b.connect(8);
        b.subscribe(conn, ChannelKey::instructions("c1"));

        assert_eq!(b.emit(&ChannelKey::instructions("c1"), "instruction:pending", 1), 0);
        assert!(matches!(
            b.try_emit(&ChannelKey::instructions("c1"), "x", 1),
            Err(FleetError::ChannelUnavailable)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let b = ready();
        assert_eq!(b.emit(&ChannelKey::logs("nobody"), "logs:new", "x"), 0);
    }

    #[test]
    fn test_emit_reaches_only_channel_subscribers() {
        let b = ready();
        let (c1, mut rx1) = b.connect(8);
        let (c2, mut rx2) = b.connect(8);
        b.subscribe(c1, ChannelKey::instructions("c1"));
        b.subscribe(c2, ChannelKey::instructions("c2"));

        let sent = b.emit(
            &ChannelKey::instructions("c1"),
            "instruction:started",
            serde_json::json!({"jobId": "j1"}),
        );
        assert_eq!(sent, 1);

        let frame = parse(&rx1.try_recv().unwrap());
        assert_eq!(frame["event"], "instruction:started");
        assert_eq!(frame["payload"]["jobId"], "j1");
        assert_eq!(frame["channel"]["kind"], "instructions");
        assert_eq!(frame["channel"]["id"], "c1");
        assert!(frame["timestamp"].is_string());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_full_buffer_drops_for_slow_connection_only() {
        let b = ready();
        let (slow, _slow_rx) = b.connect(1);
        let (fast, mut fast_rx) = b.connect(16);
        let key = ChannelKey::logs("c1");
        b.subscribe(slow, key.clone());
        b.subscribe(fast, key.clone());

        assert_eq!(b.emit(&key, "logs:new", 1), 2);
        assert_eq!(b.emit(&key, "logs:new", 2), 1);
        assert_eq!(b.dropped_frames(), 1);
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn test_hooks_fire_on_transitions_exactly_once() {
        let b = ready();
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        {
            let started = started.clone();
            b.on_channel_active(
                ChannelKind::Logs,
                Arc::new(move |_| {
                    started.fetch_add(1, Ordering::SeqCst);
                }),
            );
            let stopped = stopped.clone();
            b.on_channel_empty(
                ChannelKind::Logs,
                Arc::new(move |_| {
                    stopped.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let key = ChannelKey::logs("c2");
        let (s1, _rx1) = b.connect(4);
        let (s2, _rx2) = b.connect(4);
        b.subscribe(s1, key.clone());
        b.subscribe(s2, key.clone());
        assert_eq!(started.load(Ordering::SeqCst), 1);

        b.disconnect(s1);
        assert_eq!(b.subscriber_count(&key), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 0);

        b.disconnect(s2);
        assert_eq!(b.subscriber_count(&key), 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        b.disconnect(s2);
        b.unsubscribe(s2, &key);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hooks_are_scoped_by_kind() {
        let b = ready();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        b.on_channel_active(
            ChannelKind::Metrics,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let (conn, _rx) = b.connect(4);
        b.subscribe(conn, ChannelKey::logs("c1"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        b.subscribe(conn, ChannelKey::metrics("c1"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_to_direct_reply() {
        let b = EventBroadcaster::new();
        let (conn, mut rx) = b.connect(4);
        assert!(b.send_to(conn, "pong", serde_json::json!({})));
        let frame = parse(&rx.try_recv().unwrap());
        assert_eq!(frame["event"], "pong");
        assert!(frame.get("channel").is_none());
    }

    #[test]
    fn test_emit_to_subset() {
        let b = ready();
        let (a, mut rx_a) = b.connect(4);
        let (c, mut rx_c) = b.connect(4);
        let key = ChannelKey::logs("c1");
        b.subscribe(a, key.clone());
        b.subscribe(c, key.clone());
        assert_eq!(b.emit_to(&[a], &key, "logs:batch", 1), 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }
}
