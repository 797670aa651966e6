//! Tiered sliding-window rate limiting for inbound real-time events.
//!
//! Every inbound event is classified into a [`Tier`] through a static
//! event-name table; unknown events fall into the least privileged tier.
//! State is kept per `(connection, tier)`. Exceeding a tier's limit blocks
//! that tier for the connection for `block_duration`, regardless of how the
//! window drains in the meantime.

use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::broadcaster::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Read,
    Write,
    Critical,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Critical => "critical",
        }
    }

    /// Resolve the tier for an inbound event name.
    pub fn for_event(event: &str) -> Tier {
        EVENT_TIERS.get(event).copied().unwrap_or(Tier::Read)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static EVENT_TIERS: LazyLock<HashMap<&'static str, Tier>> = LazyLock::new(|| {
    HashMap::from([
        ("ping", Tier::Read),
        ("subscribe", Tier::Read),
        ("unsubscribe", Tier::Read),
        ("subscribeBatch", Tier::Read),
        ("logs:subscribe", Tier::Read),
        ("logs:unsubscribe", Tier::Read),
        ("instruction:enqueue", Tier::Write),
        ("instruction:cancel", Tier::Write),
        ("queue:pause", Tier::Critical),
        ("queue:resume", Tier::Critical),
    ])
});

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub block_duration: Duration,
    pub read_limit: u32,
    pub write_limit: u32,
    pub critical_limit: u32,
    /// How often idle entries are swept.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(60_000),
            block_duration: Duration::from_millis(60_000),
            read_limit: 60,
            write_limit: 10,
            critical_limit: 3,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Read => self.read_limit,
            Tier::Write => self.write_limit,
            Tier::Critical => self.critical_limit,
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { tier: Tier, remaining: u32 },
    Limited { tier: Tier, retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct RateLimitEntry {
    timestamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl RateLimitEntry {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.timestamps.is_empty() && self.blocked_until.is_none_or(|until| until <= now)
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    entries: DashMap<(ConnectionId, Tier), RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Classify `event` and check it against the connection's tier budget.
    pub fn check(&self, conn: ConnectionId, event: &str) -> RateDecision {
        self.check_tier_at(conn, Tier::for_event(event), Instant::now())
    }

    /// Check and record one request in `tier` at the given instant.
    ///
    /// The entry is updated under the map shard's write lock, so concurrent
    /// checks for the same key never observe a half-applied update.
    pub fn check_tier_at(&self, conn: ConnectionId, tier: Tier, now: Instant) -> RateDecision {
        let limit = self.config.limit_for(tier);
        let mut entry = self.entries.entry((conn, tier)).or_default();

        if let Some(until) = entry.blocked_until {
            if until > now {
                return RateDecision::Limited {
                    tier,
                    retry_after: until - now,
                };
            }
            entry.blocked_until = None;
        }

        entry.prune(now, self.config.window);

        if entry.timestamps.len() as u32 >= limit {
            let until = now + self.config.block_duration;
            entry.blocked_until = Some(until);
            tracing::warn!(conn_id = %conn, tier = %tier, limit, "connection rate limited");
            return RateDecision::Limited {
                tier,
                retry_after: self.config.block_duration,
            };
        }

        entry.timestamps.push_back(now);
        RateDecision::Allowed {
            tier,
            remaining: limit - entry.timestamps.len() as u32,
        }
    }

    /// Forget everything about a connection.
    pub fn purge(&self, conn: ConnectionId) {
        self.entries.retain(|(c, _), _| *c != conn);
    }

    /// Drop entries with no requests in the window and no active block.
    /// Returns how many entries were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        let window = self.config.window;
        self.entries.retain(|_, entry| {
            entry.prune(now, window);
            !entry.is_idle(now)
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn tracked_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn blocked_until(&self, conn: ConnectionId, tier: Tier) -> Option<Instant> {
        self.entries.get(&(conn, tier)).and_then(|e| e.blocked_until)
    }
}
