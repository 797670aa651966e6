//! Which connections care about which logical channel.
//!
//! A channel is a `(kind, id)` pair: the id is a container id for metrics,
//! instructions and logs, or a task id for container creation progress.
//! Both directions of the mapping live behind one lock so subscribe,
//! unsubscribe and disconnect are each applied atomically. A channel's set is
//! removed in the same operation that removes its last member, and only
//! that operation reports the channel as emptied.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::broadcaster::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Metrics,
    Instructions,
    Logs,
    Creation,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Instructions => "instructions",
            Self::Logs => "logs",
            Self::Creation => "creation",
        }
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metrics" => Ok(Self::Metrics),
            "instructions" => Ok(Self::Instructions),
            "logs" => Ok(Self::Logs),
            "creation" => Ok(Self::Creation),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub kind: ChannelKind,
    pub id: String,
}

impl ChannelKey {
    pub fn new(kind: ChannelKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn instructions(container_id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Instructions, container_id)
    }

    pub fn logs(container_id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Logs, container_id)
    }

    pub fn metrics(container_id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Metrics, container_id)
    }

    pub fn creation(task_id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Creation, task_id)
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// False when the connection was already subscribed.
    pub added: bool,
    /// True only for the 0 -> 1 transition.
    pub first_subscriber: bool,
    pub subscribers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    /// False when the connection was not subscribed.
    pub removed: bool,
    /// True only for the 1 -> 0 transition.
    pub channel_emptied: bool,
    pub subscribers: usize,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelKey, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<ChannelKey>>,
}

impl Inner {
    fn remove(&mut self, conn: ConnectionId, key: &ChannelKey) -> UnsubscribeOutcome {
        let Some(members) = self.channels.get_mut(key) else {
            return UnsubscribeOutcome {
                removed: false,
                channel_emptied: false,
                subscribers: 0,
            };
        };
        let removed = members.remove(&conn);
        let subscribers = members.len();
        let channel_emptied = removed && subscribers == 0;
        if channel_emptied {
            self.channels.remove(key);
        }
        if removed && let Some(keys) = self.by_connection.get_mut(&conn) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_connection.remove(&conn);
            }
        }
        UnsubscribeOutcome {
            removed,
            channel_emptied,
            subscribers,
        }
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conn: ConnectionId, key: ChannelKey) -> SubscribeOutcome {
        let mut inner = self.inner.lock();
        let members = inner.channels.entry(key.clone()).or_default();
        let was_empty = members.is_empty();
        let added = members.insert(conn);
        let subscribers = members.len();
        if added {
            inner.by_connection.entry(conn).or_default().insert(key);
        }
        SubscribeOutcome {
            added,
            first_subscriber: added && was_empty,
            subscribers,
        }
    }

    pub fn unsubscribe(&self, conn: ConnectionId, key: &ChannelKey) -> UnsubscribeOutcome {
        self.inner.lock().remove(conn, key)
    }

    /// Remove a connection from every channel. Returns the channels that
    /// became empty as a result.
    pub fn disconnect(&self, conn: ConnectionId) -> Vec<ChannelKey> {
        let mut inner = self.inner.lock();
        let Some(keys) = inner.by_connection.remove(&conn) else {
            return Vec::new();
        };
        let mut emptied = Vec::new();
        for key in keys {
            if let Some(members) = inner.channels.get_mut(&key) {
                members.remove(&conn);
                if members.is_empty() {
                    inner.channels.remove(&key);
                    emptied.push(key);
                }
            }
        }
        emptied
    }

    pub fn subscribers(&self, key: &ChannelKey) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .channels
            .get(key)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.inner
            .lock()
            .channels
            .get(key)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, conn: ConnectionId, key: &ChannelKey) -> bool {
        self.inner
            .lock()
            .channels
            .get(key)
            .is_some_and(|members| members.contains(&conn))
    }

    pub fn channels_of(&self, conn: ConnectionId) -> Vec<ChannelKey> {
        self.inner
            .lock()
            .by_connection
            .get(&conn)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_subscriber_transition() {
        let reg = SubscriptionRegistry::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let key = ChannelKey::logs("c2");

        let first = reg.subscribe(a, key.clone());
        assert!(first.added && first.first_subscriber);
        assert_eq!(first.subscribers, 1);

        let second = reg.subscribe(b, key.clone());
        assert!(second.added && !second.first_subscriber);
        assert_eq!(second.subscribers, 2);

        let dup = reg.subscribe(a, key.clone());
        assert!(!dup.added && !dup.first_subscriber);
        assert_eq!(dup.subscribers, 2);
    }

    #[test]
    fn test_last_unsubscribe_empties_once() {
        let reg = SubscriptionRegistry::new();
        let a = ConnectionId::new();
        let key = ChannelKey::instructions("c1");
        reg.subscribe(a, key.clone());

        let out = reg.unsubscribe(a, &key);
        assert!(out.removed && out.channel_emptied);
        assert_eq!(reg.channel_count(), 0);

        let again = reg.unsubscribe(a, &key);
        assert!(!again.removed && !again.channel_emptied);
    }

    #[test]
    fn test_disconnect_reports_emptied_channels_only() {
        let reg = SubscriptionRegistry::new();
        let s1 = ConnectionId::new();
        let s2 = ConnectionId::new();
        let shared = ChannelKey::logs("c2");
        let solo = ChannelKey::metrics("c2");

        reg.subscribe(s1, shared.clone());
        reg.subscribe(s2, shared.clone());
        reg.subscribe(s1, solo.clone());

        let emptied = reg.disconnect(s1);
        assert_eq!(emptied, vec![solo]);
        assert_eq!(reg.subscriber_count(&shared), 1);

        let emptied = reg.disconnect(s2);
        assert_eq!(emptied, vec![shared.clone()]);
        assert_eq!(reg.subscriber_count(&shared), 0);

        assert!(reg.disconnect(s2).is_empty());
    }

    #[test]
    fn test_channels_are_scoped_by_kind() {
        let reg = SubscriptionRegistry::new();
        let a = ConnectionId::new();
        reg.subscribe(a, ChannelKey::logs("c1"));
        assert_eq!(reg.subscriber_count(&ChannelKey::instructions("c1")), 0);
        assert!(reg.is_subscribed(a, &ChannelKey::logs("c1")));
        assert!(!reg.is_subscribed(a, &ChannelKey::metrics("c1")));
    }

    #[test]
    fn test_reverse_index_tracks_connection() {
        let reg = SubscriptionRegistry::new();
        let a = ConnectionId::new();
        reg.subscribe(a, ChannelKey::logs("c1"));
        reg.subscribe(a, ChannelKey::logs("c2"));
        assert_eq!(reg.channels_of(a).len(), 2);
        reg.unsubscribe(a, &ChannelKey::logs("c1"));
        assert_eq!(reg.channels_of(a), vec![ChannelKey::logs("c2")]);
    }

    #[test]
    fn test_channel_kind_parse() {
        assert_eq!(ChannelKind::from_str("creation").unwrap(), ChannelKind::Creation);
        assert!(ChannelKind::from_str("chat").is_err());
        assert_eq!(ChannelKey::metrics("c9").to_string(), "metrics:c9");
    }
}
