//! Resource sampling for containers whose metrics channel is being watched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::broadcaster::EventBroadcaster;
use super::subscriptions::{ChannelKey, ChannelKind};

/// One resource sample for a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

impl ContainerMetrics {
    pub fn new(cpu_percent: f64, memory_usage: u64, memory_limit: u64) -> Self {
        let memory_percent = if memory_limit > 0 {
            memory_usage as f64 / memory_limit as f64 * 100.0
        } else {
            0.0
        };
        Self {
            cpu_percent,
            memory_usage,
            memory_limit,
            memory_percent,
            sampled_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self, container_id: &str) -> anyhow::Result<ContainerMetrics>;
}

struct SamplerHandle {
    token: CancellationToken,
    generation: u64,
}

/// Polls a [`MetricsSource`] for each container with at least one metrics
/// subscriber and emits `metrics:update` on its channel.
pub struct MetricsSampler {
    interval: Duration,
    broadcaster: Arc<EventBroadcaster>,
    source: Option<Arc<dyn MetricsSource>>,
    samplers: parking_lot::Mutex<HashMap<String, SamplerHandle>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl MetricsSampler {
    pub fn new(
        interval: Duration,
        broadcaster: Arc<EventBroadcaster>,
        source: Option<Arc<dyn MetricsSource>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            interval,
            broadcaster,
            source,
            samplers: parking_lot::Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn install_hooks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.broadcaster.on_channel_active(
            ChannelKind::Metrics,
            Arc::new(move |key: &ChannelKey| {
                if let Some(sampler) = weak.upgrade() {
                    sampler.start(&key.id);
                }
            }),
        );
        let weak = Arc::downgrade(self);
        self.broadcaster.on_channel_empty(
            ChannelKind::Metrics,
            Arc::new(move |key: &ChannelKey| {
                if let Some(sampler) = weak.upgrade() {
                    sampler.stop(&key.id);
                }
            }),
        );
    }

    /// Start polling a container. Like [`stop`](Self::stop), this checks the
    /// live subscriber count under the samplers lock, so a late hook never
    /// leaves a watched container unsampled or an unwatched one polled.
    pub fn start(self: &Arc<Self>, container_id: &str) {
        let Some(source) = self.source.clone() else {
            return;
        };
        let token = self.shutdown.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut samplers = self.samplers.lock();
            if samplers.contains_key(container_id) || !self.has_subscribers(container_id) {
                return;
            }
            samplers.insert(
                container_id.to_string(),
                SamplerHandle {
                    token: token.clone(),
                    generation,
                },
            );
        }
        tracing::debug!(container_id, "metrics sampler started");

        let weak = Arc::downgrade(self);
        let container_id = container_id.to_string();
        let every = self.interval;
        tokio::spawn(async move {
            run_sampler(weak.clone(), source, container_id.clone(), every, token).await;
            if let Some(sampler) = weak.upgrade() {
                let mut samplers = sampler.samplers.lock();
                if samplers
                    .get(&container_id)
                    .is_some_and(|s| s.generation == generation)
                {
                    samplers.remove(&container_id);
                }
            }
        });
    }

    pub fn stop(&self, container_id: &str) -> bool {
        let handle = {
            let mut samplers = self.samplers.lock();
            if self.has_subscribers(container_id) {
                return false;
            }
            samplers.remove(container_id)
        };
        let Some(handle) = handle else {
            return false;
        };
        handle.token.cancel();
        tracing::debug!(container_id, "metrics sampler stopped");
        true
    }

    fn has_subscribers(&self, container_id: &str) -> bool {
        self.broadcaster
            .subscriber_count(&ChannelKey::metrics(container_id))
            > 0
    }

    pub fn is_sampling(&self, container_id: &str) -> bool {
        self.samplers.lock().contains_key(container_id)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.samplers.lock().clear();
    }
}

async fn run_sampler(
    sampler: Weak<MetricsSampler>,
    source: Arc<dyn MetricsSource>,
    container_id: String,
    every: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let key = ChannelKey::metrics(&container_id);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let sample = tokio::select! {
            _ = token.cancelled() => break,
            sample = source.sample(&container_id) => sample,
        };
        let Some(sampler) = sampler.upgrade() else {
            break;
        };
        match sample {
            Ok(metrics) => {
                sampler.broadcaster.emit(
                    &key,
                    "metrics:update",
                    serde_json::json!({ "containerId": container_id, "metrics": metrics }),
                );
            }
            Err(e) => {
                tracing::debug!(container_id = %container_id, error = %e, "metrics sample failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        samples: AtomicUsize,
    }

    #[async_trait]
    impl MetricsSource for CountingSource {
        async fn sample(&self, _container_id: &str) -> anyhow::Result<ContainerMetrics> {
            let n = self.samples.fetch_add(1, Ordering::SeqCst);
            Ok(ContainerMetrics::new(n as f64, 512, 2048))
        }
    }

    fn sampler_with(source: Arc<CountingSource>) -> (Arc<MetricsSampler>, Arc<EventBroadcaster>) {
        let broadcaster = Arc::new(EventBroadcaster::new());
        broadcaster.mark_ready();
        let sampler = MetricsSampler::new(
            Duration::from_millis(20),
            broadcaster.clone(),
            Some(source as Arc<dyn MetricsSource>),
        );
        sampler.install_hooks();
        (sampler, broadcaster)
    }

    #[test]
    fn test_memory_percent() {
        let m = ContainerMetrics::new(1.5, 256, 1024);
        assert!((m.memory_percent - 25.0).abs() < 1e-9);
        assert_eq!(ContainerMetrics::new(0.0, 10, 0).memory_percent, 0.0);
    }

    #[tokio::test]
    async fn test_sampler_follows_channel_subscribers() {
        let source = Arc::new(CountingSource {
            samples: AtomicUsize::new(0),
        });
        let (sampler, broadcaster) = sampler_with(source.clone());
        let (conn, mut rx) = broadcaster.connect(64);

        broadcaster.subscribe(conn, ChannelKey::metrics("c1"));
        assert!(sampler.is_sampling("c1"));

        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["event"], "metrics:update");
        assert_eq!(frame["payload"]["containerId"], "c1");
        assert_eq!(frame["payload"]["metrics"]["memoryLimit"], 2048);

        broadcaster.unsubscribe(conn, &ChannelKey::metrics("c1"));
        assert!(!sampler.is_sampling("c1"));
        assert!(!sampler.stop("c1"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = source.samples.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.samples.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn test_late_teardown_keeps_sampler_for_new_subscriber() {
        let source = Arc::new(CountingSource {
            samples: AtomicUsize::new(0),
        });
        let (sampler, broadcaster) = sampler_with(source);
        let key = ChannelKey::metrics("c1");
        let (a, _rx_a) = broadcaster.connect(64);
        let (b, _rx_b) = broadcaster.connect(64);

        broadcaster.subscribe(a, key.clone());
        assert!(sampler.is_sampling("c1"));

        // `a` leaves, `b` joins, and only then does the teardown for `a` run.
        assert!(broadcaster.registry().unsubscribe(a, &key).channel_emptied);
        broadcaster.subscribe(b, key.clone());
        assert!(!sampler.stop("c1"));
        assert!(sampler.is_sampling("c1"));

        // A start that arrives after its subscriber already left does nothing.
        broadcaster.unsubscribe(b, &key);
        assert!(!sampler.is_sampling("c1"));
        sampler.start("c1");
        assert!(!sampler.is_sampling("c1"));
    }

    #[tokio::test]
    async fn test_no_source_never_samples() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let sampler = MetricsSampler::new(Duration::from_millis(10), broadcaster.clone(), None);
        sampler.install_hooks();
        let (conn, _rx) = broadcaster.connect(4);
        broadcaster.subscribe(conn, ChannelKey::metrics("c1"));
        assert!(!sampler.is_sampling("c1"));
    }
}
