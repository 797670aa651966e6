//! Container output pipeline.
//!
//! Lines enter through [`LogStreamPipeline::add_log`] / [`add_logs`](LogStreamPipeline::add_logs)
//! (or from a tail that follows a container while anyone watches its logs
//! channel). Each container has a fixed one-second ingestion window; lines
//! beyond the cap are dropped and counted, never queued. Accepted lines are
//! persisted, kept in a small ring cache for fast replay, and pushed to
//! subscribers either one by one or, for batch-mode connections, on a flush
//! timer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_common::{LogEntry, LogStream, OutputLine, validate_container_id};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::broadcaster::{ConnectionId, EventBroadcaster};
use super::db::DbHandle;
use super::models::{LogPage, LogQuery, NewLogEntry};
use super::subscriptions::{ChannelKey, ChannelKind};
use crate::errors::{FleetError, FleetResult};

const INGEST_WINDOW: Duration = Duration::from_secs(1);
const TAIL_CHUNK: usize = 64;
const TAIL_RETRY_BASE: Duration = Duration::from_secs(1);
const TAIL_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Lines accepted per container per second.
    pub ingest_per_second: u32,
    pub ring_capacity: usize,
    pub batch_interval: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
    /// Lines replayed on subscribe when no `since` is given.
    pub recent_default: usize,
    pub history_page_max: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            ingest_per_second: 100,
            ring_capacity: 200,
            batch_interval: Duration::from_millis(500),
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(30 * 60),
            recent_default: 100,
            history_page_max: 1000,
        }
    }
}

/// Follows a container's output from a point in time.
#[async_trait]
pub trait OutputSource: Send + Sync {
    async fn follow(
        &self,
        container_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<OutputLine>>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub accepted_total: u64,
    pub dropped_total: u64,
    pub cached_containers: usize,
    pub active_tails: usize,
    pub batch_subscribers: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted_rows: usize,
    pub evicted_caches: usize,
    pub evicted_trackers: usize,
}

struct IngestWindow {
    started: Instant,
    accepted: u32,
    dropped: u32,
    warned: bool,
}

struct RingCache {
    entries: VecDeque<LogEntry>,
    last_write: Instant,
}

#[derive(Default)]
struct BatchBuffer {
    entries: Vec<LogEntry>,
    scheduled: bool,
}

struct TailHandle {
    token: CancellationToken,
    generation: u64,
}

pub struct LogStreamPipeline {
    config: LogConfig,
    db: DbHandle,
    broadcaster: Arc<EventBroadcaster>,
    source: Option<Arc<dyn OutputSource>>,
    windows: DashMap<String, IngestWindow>,
    /// Lifetime drop counts; unlike the windows these survive the sweep.
    dropped_by_container: DashMap<String, u64>,
    caches: DashMap<String, RingCache>,
    batch_conns: DashMap<String, HashSet<ConnectionId>>,
    buffers: parking_lot::Mutex<HashMap<String, BatchBuffer>>,
    tails: parking_lot::Mutex<HashMap<String, TailHandle>>,
    tail_generation: AtomicU64,
    accepted_total: AtomicU64,
    dropped_total: AtomicU64,
    shutdown: CancellationToken,
}

impl LogStreamPipeline {
    pub fn new(
        config: LogConfig,
        db: DbHandle,
        broadcaster: Arc<EventBroadcaster>,
        source: Option<Arc<dyn OutputSource>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            broadcaster,
            source,
            windows: DashMap::new(),
            dropped_by_container: DashMap::new(),
            caches: DashMap::new(),
            batch_conns: DashMap::new(),
            buffers: parking_lot::Mutex::new(HashMap::new()),
            tails: parking_lot::Mutex::new(HashMap::new()),
            tail_generation: AtomicU64::new(0),
            accepted_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start and stop tails as logs channels gain their first and lose their
    /// last subscriber.
    pub fn install_hooks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.broadcaster.on_channel_active(
            ChannelKind::Logs,
            Arc::new(move |key: &ChannelKey| {
                if let Some(pipeline) = weak.upgrade() {
                    pipeline.start_tail(&key.id);
                }
            }),
        );
        let weak = Arc::downgrade(self);
        self.broadcaster.on_channel_empty(
            ChannelKind::Logs,
            Arc::new(move |key: &ChannelKey| {
                if let Some(pipeline) = weak.upgrade() {
                    pipeline.stop_tail(&key.id);
                    pipeline
                        .batch_conns
                        .remove_if(&key.id, |id, _| !pipeline.has_subscribers(id));
                }
            }),
        );
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Admit one line. Returns `None` when the line was empty or dropped by
    /// the ingestion cap.
    pub async fn add_log(
        self: &Arc<Self>,
        container_id: &str,
        stream: LogStream,
        content: &str,
        recorded_at: Option<DateTime<Utc>>,
    ) -> FleetResult<Option<LogEntry>> {
        validate_container_id(container_id)?;
        if content.is_empty() || !self.admit(container_id, Instant::now()) {
            return Ok(None);
        }
        let entry = NewLogEntry {
            container_id: container_id.to_string(),
            stream,
            content: content.to_string(),
            recorded_at: recorded_at.unwrap_or_else(Utc::now),
        };
        let mut stored = self.persist(vec![entry]).await?;
        let Some(entry) = stored.pop() else {
            return Ok(None);
        };
        self.remember(container_id, std::slice::from_ref(&entry));
        self.fan_out(container_id, std::slice::from_ref(&entry), false);
        Ok(Some(entry))
    }

    /// Admit many lines for one container with a single insert and a single
    /// event. Returns the lines that were accepted.
    pub async fn add_logs(
        self: &Arc<Self>,
        container_id: &str,
        lines: Vec<OutputLine>,
    ) -> FleetResult<Vec<LogEntry>> {
        validate_container_id(container_id)?;
        let now = Instant::now();
        let batch: Vec<NewLogEntry> = lines
            .into_iter()
            .filter(|line| !line.content.is_empty())
            .filter(|_| self.admit(container_id, now))
            .map(|line| NewLogEntry {
                container_id: container_id.to_string(),
                stream: line.stream,
                content: line.content,
                recorded_at: line.timestamp.unwrap_or_else(Utc::now),
            })
            .collect();
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let stored = self.persist(batch).await?;
        self.remember(container_id, &stored);
        self.fan_out(container_id, &stored, true);
        Ok(stored)
    }

    /// Subscribe a connection to a container's logs and return the replay
    /// page. The subscription is registered before history is read, so a
    /// line may appear both live and in the page; clients dedupe by `id`.
    pub async fn subscribe(
        &self,
        conn: ConnectionId,
        container_id: &str,
        since: Option<DateTime<Utc>>,
        batch_mode: bool,
    ) -> FleetResult<LogPage> {
        validate_container_id(container_id)?;
        if batch_mode {
            self.batch_conns
                .entry(container_id.to_string())
                .or_default()
                .insert(conn);
        } else if let Some(mut conns) = self.batch_conns.get_mut(container_id) {
            conns.remove(&conn);
        }
        self.broadcaster.subscribe(conn, ChannelKey::logs(container_id));

        match since {
            Some(since) => {
                self.history(
                    container_id,
                    LogQuery {
                        since: Some(since),
                        limit: self.config.history_page_max,
                        ..LogQuery::default()
                    },
                )
                .await
            }
            None => {
                let logs = self.recent(container_id, self.config.recent_default).await?;
                let owned = container_id.to_string();
                let total = self
                    .db
                    .call(move |db| db.count_logs(&owned))
                    .await
                    .map_err(FleetError::Database)?;
                Ok(LogPage {
                    has_more: total > logs.len(),
                    total,
                    logs,
                })
            }
        }
    }

    pub fn unsubscribe(&self, conn: ConnectionId, container_id: &str) -> usize {
        if let Some(mut conns) = self.batch_conns.get_mut(container_id) {
            conns.remove(&conn);
        }
        self.broadcaster
            .unsubscribe(conn, &ChannelKey::logs(container_id))
    }

    /// Forget a closed connection's batch-mode preferences.
    pub fn forget_connection(&self, conn: ConnectionId) {
        for mut conns in self.batch_conns.iter_mut() {
            conns.remove(&conn);
        }
        self.batch_conns.retain(|_, conns| !conns.is_empty());
    }

    /// Page through persisted history, oldest first.
    pub async fn history(&self, container_id: &str, mut query: LogQuery) -> FleetResult<LogPage> {
        validate_container_id(container_id)?;
        query.limit = query.limit.clamp(1, self.config.history_page_max);
        let owned = container_id.to_string();
        let offset = query.offset;
        let (logs, total) = self
            .db
            .call(move |db| db.query_logs(&owned, &query))
            .await
            .map_err(FleetError::Database)?;
        Ok(LogPage {
            has_more: offset + logs.len() < total,
            total,
            logs,
        })
    }

    /// The last `limit` lines in chronological order, from the ring cache
    /// when it holds enough of them.
    pub async fn recent(&self, container_id: &str, limit: usize) -> FleetResult<Vec<LogEntry>> {
        validate_container_id(container_id)?;
        if let Some(cache) = self.caches.get(container_id)
            && cache.entries.len() >= limit
        {
            let skip = cache.entries.len() - limit;
            return Ok(cache.entries.iter().skip(skip).cloned().collect());
        }
        let owned = container_id.to_string();
        self.db
            .call(move |db| db.recent_logs(&owned, limit))
            .await
            .map_err(FleetError::Database)
    }

    /// Lines dropped by the ingestion cap for one container.
    pub fn dropped(&self, container_id: &str) -> u64 {
        self.dropped_by_container
            .get(container_id)
            .map(|n| *n)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            cached_containers: self.caches.len(),
            active_tails: self.tails.lock().len(),
            batch_subscribers: self.batch_conns.iter().map(|c| c.len()).sum(),
        }
    }

    pub fn is_tailing(&self, container_id: &str) -> bool {
        self.tails.lock().contains_key(container_id)
    }

    // ── Tails ─────────────────────────────────────────────────────────

    /// Begin following a container's output. No-op when already tailing,
    /// when the logs channel has no subscribers, or when no output source is
    /// configured.
    ///
    /// Both this and [`stop_tail`](Self::stop_tail) decide against the live
    /// subscriber count while holding the tails lock, so a hook that runs
    /// late cannot undo a newer subscribe or unsubscribe.
    pub fn start_tail(self: &Arc<Self>, container_id: &str) {
        let Some(source) = self.source.clone() else {
            return;
        };
        let token = self.shutdown.child_token();
        let generation = self.tail_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut tails = self.tails.lock();
            if tails.contains_key(container_id) || !self.has_subscribers(container_id) {
                return;
            }
            tails.insert(
                container_id.to_string(),
                TailHandle {
                    token: token.clone(),
                    generation,
                },
            );
        }
        tracing::info!(container_id, "log tail started");

        tokio::spawn(supervise_tail(
            Arc::downgrade(self),
            source,
            container_id.to_string(),
            generation,
            token,
        ));
    }

    /// Stop following a container. Returns `false` if no tail was running or
    /// the logs channel still has subscribers.
    pub fn stop_tail(&self, container_id: &str) -> bool {
        let tail = {
            let mut tails = self.tails.lock();
            if self.has_subscribers(container_id) {
                return false;
            }
            tails.remove(container_id)
        };
        let Some(tail) = tail else {
            return false;
        };
        tail.token.cancel();
        tracing::info!(container_id, "log tail stopped");
        true
    }

    fn has_subscribers(&self, container_id: &str) -> bool {
        self.broadcaster.subscriber_count(&ChannelKey::logs(container_id)) > 0
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Run the retention sweep on `sweep_interval` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let every = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pipeline) = weak.upgrade() else { break };
                        match pipeline.sweep().await {
                            Ok(report) => tracing::info!(
                                deleted_rows = report.deleted_rows,
                                evicted_caches = report.evicted_caches,
                                evicted_trackers = report.evicted_trackers,
                                "log retention sweep"
                            ),
                            Err(e) => tracing::warn!(error = %e, "log retention sweep failed"),
                        }
                    }
                }
            }
        })
    }

    pub async fn sweep(&self) -> FleetResult<SweepReport> {
        self.sweep_at(Utc::now(), Instant::now()).await
    }

    /// Delete rows older than the retention window and evict in-memory
    /// state idle for more than two sweep intervals.
    pub async fn sweep_at(&self, now: DateTime<Utc>, instant: Instant) -> FleetResult<SweepReport> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| FleetError::Other(anyhow::anyhow!(e)))?;
        let cutoff = now - retention;
        let deleted_rows = self
            .db
            .call(move |db| db.delete_logs_before(cutoff))
            .await
            .map_err(FleetError::Database)?;

        let idle = self.config.sweep_interval * 2;
        let caches_before = self.caches.len();
        self.caches
            .retain(|_, cache| instant.saturating_duration_since(cache.last_write) < idle);
        let trackers_before = self.windows.len();
        self.windows
            .retain(|_, w| instant.saturating_duration_since(w.started) < idle);

        Ok(SweepReport {
            deleted_rows,
            evicted_caches: caches_before.saturating_sub(self.caches.len()),
            evicted_trackers: trackers_before.saturating_sub(self.windows.len()),
        })
    }

    /// Stop tails, flush timers and the sweeper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tails.lock().clear();
        self.buffers.lock().clear();
    }

    // ── Internals ─────────────────────────────────────────────────────

    /// Fixed one-second window per container.
    fn admit(&self, container_id: &str, now: Instant) -> bool {
        let limit = self.config.ingest_per_second;
        let mut window = self
            .windows
            .entry(container_id.to_string())
            .or_insert_with(|| IngestWindow {
                started: now,
                accepted: 0,
                dropped: 0,
                warned: false,
            });
        if now.saturating_duration_since(window.started) >= INGEST_WINDOW {
            if window.dropped > 0 {
                tracing::debug!(container_id, dropped = window.dropped, "ingest window closed with drops");
            }
            window.started = now;
            window.accepted = 0;
            window.dropped = 0;
            window.warned = false;
        }
        if window.accepted < limit {
            window.accepted += 1;
            self.accepted_total.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        window.dropped += 1;
        *self
            .dropped_by_container
            .entry(container_id.to_string())
            .or_insert(0) += 1;
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
        if !window.warned {
            window.warned = true;
            tracing::warn!(container_id, limit, "log ingestion cap reached, dropping lines");
        }
        false
    }

    async fn persist(&self, batch: Vec<NewLogEntry>) -> FleetResult<Vec<LogEntry>> {
        self.db
            .call(move |db| db.insert_logs(&batch))
            .await
            .map_err(FleetError::Database)
    }

    fn remember(&self, container_id: &str, entries: &[LogEntry]) {
        let capacity = self.config.ring_capacity;
        let mut cache = self
            .caches
            .entry(container_id.to_string())
            .or_insert_with(|| RingCache {
                entries: VecDeque::with_capacity(capacity),
                last_write: Instant::now(),
            });
        for entry in entries {
            // Callers may supply their own timestamps, so keep the ring in
            // (recorded_at, id) order rather than arrival order.
            let key = (entry.recorded_at, entry.id);
            let at = cache
                .entries
                .partition_point(|e| (e.recorded_at, e.id) <= key);
            cache.entries.insert(at, entry.clone());
            if cache.entries.len() > capacity {
                cache.entries.pop_front();
            }
        }
        cache.last_write = Instant::now();
    }

    /// Push entries live to per-line subscribers and into the batch buffer
    /// for batch-mode subscribers. `as_batch` selects a single `logs:batch`
    /// frame over one `logs:new` frame per entry.
    fn fan_out(self: &Arc<Self>, container_id: &str, entries: &[LogEntry], as_batch: bool) {
        let key = ChannelKey::logs(container_id);
        let subscribers = self.broadcaster.registry().subscribers(&key);
        if subscribers.is_empty() {
            return;
        }
        let batch_mode: HashSet<ConnectionId> = self
            .batch_conns
            .get(container_id)
            .map(|c| c.clone())
            .unwrap_or_default();
        let live: Vec<ConnectionId> = subscribers
            .into_iter()
            .filter(|c| !batch_mode.contains(c))
            .collect();

        if !live.is_empty() {
            if as_batch {
                self.broadcaster.emit_to(
                    &live,
                    &key,
                    "logs:batch",
                    serde_json::json!({ "containerId": container_id, "logs": entries }),
                );
            } else {
                for entry in entries {
                    self.broadcaster.emit_to(&live, &key, "logs:new", entry);
                }
            }
        }
        if !batch_mode.is_empty() {
            self.buffer(container_id, entries);
        }
    }

    fn buffer(self: &Arc<Self>, container_id: &str, entries: &[LogEntry]) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(container_id.to_string()).or_default();
        buffer.entries.extend_from_slice(entries);
        if buffer.scheduled {
            return;
        }
        buffer.scheduled = true;

        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let delay = self.config.batch_interval;
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(pipeline) = weak.upgrade() {
                        pipeline.flush(&container_id);
                    }
                }
            }
        });
    }

    /// Emit a container's buffered lines to its batch-mode subscribers.
    /// Returns the number of lines flushed.
    pub fn flush(&self, container_id: &str) -> usize {
        let Some(buffer) = self.buffers.lock().remove(container_id) else {
            return 0;
        };
        if buffer.entries.is_empty() {
            return 0;
        }
        let key = ChannelKey::logs(container_id);
        let targets: Vec<ConnectionId> = self
            .batch_conns
            .get(container_id)
            .map(|c| {
                c.iter()
                    .copied()
                    .filter(|conn| self.broadcaster.registry().is_subscribed(*conn, &key))
                    .collect()
            })
            .unwrap_or_default();
        self.broadcaster.emit_to(
            &targets,
            &key,
            "logs:batch",
            serde_json::json!({ "containerId": container_id, "logs": buffer.entries }),
        );
        buffer.entries.len()
    }
}

/// Keep a tail running for as long as its handle is current. A follow that
/// ends on its own (error or end of stream) is restarted with backoff while
/// the channel still has subscribers.
async fn supervise_tail(
    pipeline: Weak<LogStreamPipeline>,
    source: Arc<dyn OutputSource>,
    container_id: String,
    generation: u64,
    token: CancellationToken,
) {
    let mut retry = TAIL_RETRY_BASE;
    loop {
        run_tail(pipeline.clone(), source.clone(), container_id.clone(), token.clone()).await;
        if token.is_cancelled() {
            break;
        }
        let Some(owner) = pipeline.upgrade() else {
            break;
        };
        {
            let mut tails = owner.tails.lock();
            if !tails
                .get(&container_id)
                .is_some_and(|t| t.generation == generation)
            {
                break;
            }
            if !owner.has_subscribers(&container_id) {
                tails.remove(&container_id);
                break;
            }
        }
        drop(owner);
        tracing::info!(
            container_id = %container_id,
            retry_in_ms = retry.as_millis() as u64,
            "log tail ended while subscribed, restarting"
        );
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(retry) => {}
        }
        retry = (retry * 2).min(TAIL_RETRY_MAX);
    }
}

async fn run_tail(
    pipeline: Weak<LogStreamPipeline>,
    source: Arc<dyn OutputSource>,
    container_id: String,
    token: CancellationToken,
) {
    let stream = tokio::select! {
        _ = token.cancelled() => return,
        res = source.follow(&container_id, Utc::now()) => res,
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(container_id = %container_id, error = %e, "failed to follow container output");
            return;
        }
    };
    let mut chunks = stream.ready_chunks(TAIL_CHUNK);
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => break,
            chunk = chunks.next() => chunk,
        };
        let Some(chunk) = chunk else {
            tracing::debug!(container_id = %container_id, "container output ended");
            break;
        };
        let mut lines = Vec::with_capacity(chunk.len());
        for item in chunk {
            match item {
                Ok(line) => lines.push(line),
                Err(e) => {
                    tracing::warn!(container_id = %container_id, error = %e, "container output error");
                }
            }
        }
        let Some(pipeline) = pipeline.upgrade() else {
            break;
        };
        let result = if lines.len() == 1 {
            let line = lines.remove(0);
            pipeline
                .add_log(&container_id, line.stream, &line.content, line.timestamp)
                .await
                .map(|_| ())
        } else {
            pipeline.add_logs(&container_id, lines).await.map(|_| ())
        };
        if let Err(e) = result {
            tracing::warn!(container_id = %container_id, error = %e, "failed to store tailed output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct ChannelSource {
        follows: AtomicUsize,
        rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<anyhow::Result<OutputLine>>>>,
    }

    #[async_trait]
    impl OutputSource for ChannelSource {
        async fn follow(
            &self,
            _container_id: &str,
            _since: DateTime<Utc>,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<OutputLine>>> {
            self.follows.fetch_add(1, Ordering::SeqCst);
            let rx = self.rx.lock().take();
            match rx {
                Some(rx) => Ok(unbounded_stream(rx)),
                None => Ok(futures::stream::pending::<anyhow::Result<OutputLine>>().boxed()),
            }
        }
    }

    fn unbounded_stream(
        rx: mpsc::UnboundedReceiver<anyhow::Result<OutputLine>>,
    ) -> BoxStream<'static, anyhow::Result<OutputLine>> {
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
            .boxed()
    }

    fn pipeline_with(
        config: LogConfig,
        source: Option<Arc<dyn OutputSource>>,
    ) -> (Arc<LogStreamPipeline>, Arc<EventBroadcaster>) {
        let broadcaster = Arc::new(EventBroadcaster::new());
        broadcaster.mark_ready();
        let pipeline = LogStreamPipeline::new(
            config,
            DbHandle::in_memory().unwrap(),
            broadcaster.clone(),
            source,
        );
        pipeline.install_hooks();
        (pipeline, broadcaster)
    }

    fn frame(raw: &str) -> serde_json::Value {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn test_empty_lines_are_ignored() {
        let (pipeline, _) = pipeline_with(LogConfig::default(), None);
        let out = pipeline.add_log("c1", LogStream::Stdout, "", None).await.unwrap();
        assert!(out.is_none());
        assert_eq!(pipeline.stats().accepted_total, 0);
    }

    #[tokio::test]
    async fn test_ingestion_cap_drops_excess_silently() {
        let (pipeline, _) = pipeline_with(LogConfig::default(), None);
        let mut stored = 0;
        for i in 0..150 {
            if pipeline
                .add_log("c1", LogStream::Stdout, &format!("line {}", i), None)
                .await
                .unwrap()
                .is_some()
            {
                stored += 1;
            }
        }
        assert_eq!(stored, 100);
        assert_eq!(pipeline.dropped("c1"), 50);
        assert_eq!(pipeline.stats().dropped_total, 50);
        let page = pipeline.history("c1", LogQuery::default()).await.unwrap();
        assert_eq!(page.total, 100);
    }

    #[tokio::test]
    async fn test_ingestion_window_resets_each_second() {
        let config = LogConfig {
            ingest_per_second: 2,
            ..LogConfig::default()
        };
        let (pipeline, _) = pipeline_with(config, None);
        let t0 = Instant::now();
        assert!(pipeline.admit("c1", t0));
        assert!(pipeline.admit("c1", t0));
        assert!(!pipeline.admit("c1", t0 + Duration::from_millis(900)));
        assert!(pipeline.admit("c1", t0 + Duration::from_millis(1000)));
        assert!(pipeline.admit("c2", t0));
    }

    #[tokio::test]
    async fn test_add_logs_single_insert_and_batch_event() {
        let (pipeline, broadcaster) = pipeline_with(LogConfig::default(), None);
        let (conn, mut rx) = broadcaster.connect(16);
        pipeline.subscribe(conn, "c1", None, false).await.unwrap();

        let stored = pipeline
            .add_logs(
                "c1",
                vec![OutputLine::stdout("a"), OutputLine::stdout(""), OutputLine::stderr("b")],
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);

        let ev = frame(&rx.try_recv().unwrap());
        assert_eq!(ev["event"], "logs:batch");
        assert_eq!(ev["payload"]["containerId"], "c1");
        assert_eq!(ev["payload"]["logs"].as_array().unwrap().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_live_subscriber_gets_each_line() {
        let (pipeline, broadcaster) = pipeline_with(LogConfig::default(), None);
        let (conn, mut rx) = broadcaster.connect(16);
        let page = pipeline.subscribe(conn, "c1", None, false).await.unwrap();
        assert!(page.logs.is_empty());

        pipeline.add_log("c1", LogStream::Stderr, "oops", None).await.unwrap();
        let ev = frame(&rx.try_recv().unwrap());
        assert_eq!(ev["event"], "logs:new");
        assert_eq!(ev["payload"]["content"], "oops");
        assert_eq!(ev["payload"]["stream"], "stderr");
    }

    #[tokio::test]
    async fn test_batch_mode_flushes_on_interval() {
        let config = LogConfig {
            batch_interval: Duration::from_millis(50),
            ..LogConfig::default()
        };
        let (pipeline, broadcaster) = pipeline_with(config, None);
        let (batch, mut batch_rx) = broadcaster.connect(16);
        let (live, mut live_rx) = broadcaster.connect(16);
        pipeline.subscribe(batch, "c1", None, true).await.unwrap();
        pipeline.subscribe(live, "c1", None, false).await.unwrap();

        let lines = (0..3).map(|i| OutputLine::stdout(format!("{}", i))).collect();
        pipeline.add_logs("c1", lines).await.unwrap();
        pipeline.add_log("c1", LogStream::Stdout, "3", None).await.unwrap();

        assert_eq!(frame(&live_rx.try_recv().unwrap())["event"], "logs:batch");
        assert_eq!(frame(&live_rx.try_recv().unwrap())["event"], "logs:new");
        assert!(batch_rx.try_recv().is_err());

        let raw = tokio::time::timeout(Duration::from_secs(5), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ev = frame(&raw);
        assert_eq!(ev["event"], "logs:batch");
        assert_eq!(ev["payload"]["containerId"], "c1");
        assert_eq!(ev["payload"]["logs"].as_array().unwrap().len(), 4);
        assert!(live_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recent_and_since_replay() {
        let (pipeline, broadcaster) = pipeline_with(LogConfig::default(), None);
        let start = Utc::now();
        for i in 0..5 {
            pipeline
                .add_log(
                    "c1",
                    LogStream::Stdout,
                    &format!("{}", i),
                    Some(start + chrono::Duration::milliseconds(i)),
                )
                .await
                .unwrap();
        }
        let recent = pipeline.recent("c1", 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["3", "4"]);

        let (conn, _rx) = broadcaster.connect(16);
        let page = pipeline
            .subscribe(conn, "c1", Some(start + chrono::Duration::milliseconds(3)), false)
            .await
            .unwrap();
        assert_eq!(page.logs.len(), 2);
        assert_eq!(page.total, 2);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_recent_is_chronological_with_backdated_lines() {
        let (pipeline, _) = pipeline_with(LogConfig::default(), None);
        let base = Utc::now();
        for (content, offset) in [("second", 2), ("third", 3), ("first", 1)] {
            pipeline
                .add_log(
                    "c1",
                    LogStream::Stdout,
                    content,
                    Some(base + chrono::Duration::milliseconds(offset)),
                )
                .await
                .unwrap();
        }
        let cached: Vec<String> = pipeline
            .recent("c1", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(cached, vec!["first", "second", "third"]);

        let stored: Vec<String> = pipeline
            .db
            .call(|db| db.recent_logs("c1", 3))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(cached, stored);
        assert_eq!(pipeline.recent("c1", 2).await.unwrap()[0].content, "second");
    }

    #[tokio::test]
    async fn test_history_pagination() {
        let (pipeline, _) = pipeline_with(LogConfig::default(), None);
        let lines = (0..10).map(|i| OutputLine::stdout(format!("{}", i))).collect();
        pipeline.add_logs("c1", lines).await.unwrap();

        let page = pipeline
            .history(
                "c1",
                LogQuery {
                    limit: 4,
                    offset: 4,
                    ..LogQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.logs.len(), 4);
        assert_eq!(page.total, 10);
        assert!(page.has_more);
        assert_eq!(page.logs[0].content, "4");
    }

    #[tokio::test]
    async fn test_tail_follows_last_subscriber() {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(ChannelSource {
            follows: AtomicUsize::new(0),
            rx: parking_lot::Mutex::new(Some(rx)),
        });
        let (pipeline, broadcaster) = pipeline_with(LogConfig::default(), Some(source.clone()));
        let (s1, _rx1) = broadcaster.connect(16);
        let (s2, mut rx2) = broadcaster.connect(16);

        pipeline.subscribe(s1, "c2", None, false).await.unwrap();
        pipeline.subscribe(s2, "c2", None, false).await.unwrap();
        assert!(pipeline.is_tailing("c2"));

        tx.send(Ok(OutputLine::stdout("hello from c2"))).unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(5), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame(&ev)["payload"]["content"], "hello from c2");

        broadcaster.disconnect(s1);
        assert_eq!(broadcaster.subscriber_count(&ChannelKey::logs("c2")), 1);
        assert!(pipeline.is_tailing("c2"));

        broadcaster.disconnect(s2);
        assert_eq!(broadcaster.subscriber_count(&ChannelKey::logs("c2")), 0);
        assert!(!pipeline.is_tailing("c2"));
        assert!(!pipeline.stop_tail("c2"));
        assert_eq!(source.follows.load(Ordering::SeqCst), 1);
    }

    /// First follow ends immediately; later follows stay open.
    struct EndsOnceSource {
        follows: AtomicUsize,
    }

    #[async_trait]
    impl OutputSource for EndsOnceSource {
        async fn follow(
            &self,
            _container_id: &str,
            _since: DateTime<Utc>,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<OutputLine>>> {
            if self.follows.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(futures::stream::empty::<anyhow::Result<OutputLine>>().boxed())
            } else {
                Ok(futures::stream::pending::<anyhow::Result<OutputLine>>().boxed())
            }
        }
    }

    #[tokio::test]
    async fn test_late_hooks_do_not_undo_newer_transitions() {
        let source = Arc::new(ChannelSource {
            follows: AtomicUsize::new(0),
            rx: parking_lot::Mutex::new(None),
        });
        let (pipeline, broadcaster) = pipeline_with(LogConfig::default(), Some(source));
        let key = ChannelKey::logs("c3");
        let (a, _rx_a) = broadcaster.connect(16);
        let (b, _rx_b) = broadcaster.connect(16);

        broadcaster.subscribe(a, key.clone());
        assert!(pipeline.is_tailing("c3"));

        // `a` leaves, `b` joins, and only then does the teardown for `a` run.
        assert!(broadcaster.registry().unsubscribe(a, &key).channel_emptied);
        broadcaster.subscribe(b, key.clone());
        assert!(!pipeline.stop_tail("c3"));
        assert_eq!(broadcaster.subscriber_count(&key), 1);
        assert!(pipeline.is_tailing("c3"));

        // A start that arrives after its subscriber already left does nothing.
        broadcaster.unsubscribe(b, &key);
        assert!(!pipeline.is_tailing("c3"));
        pipeline.start_tail("c3");
        assert!(!pipeline.is_tailing("c3"));
    }

    #[tokio::test]
    async fn test_tail_restarts_when_output_ends_while_subscribed() {
        let source = Arc::new(EndsOnceSource {
            follows: AtomicUsize::new(0),
        });
        let (pipeline, broadcaster) = pipeline_with(LogConfig::default(), Some(source.clone()));
        let (conn, _rx) = broadcaster.connect(16);
        broadcaster.subscribe(conn, ChannelKey::logs("c4"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while source.follows.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("tail was not restarted");
        assert!(pipeline.is_tailing("c4"));

        broadcaster.unsubscribe(conn, &ChannelKey::logs("c4"));
        assert!(!pipeline.is_tailing("c4"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.follows.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweep_deletes_expired_rows_and_idle_state() {
        let (pipeline, _) = pipeline_with(LogConfig::default(), None);
        let old = Utc::now() - chrono::Duration::hours(25);
        pipeline
            .add_log("c1", LogStream::Stdout, "ancient", Some(old))
            .await
            .unwrap();
        pipeline.add_log("c1", LogStream::Stdout, "fresh", None).await.unwrap();

        let report = pipeline.sweep().await.unwrap();
        assert_eq!(report.deleted_rows, 1);
        assert_eq!(report.evicted_caches, 0);

        let later = Instant::now() + Duration::from_secs(2 * 30 * 60 + 1);
        let report = pipeline.sweep_at(Utc::now(), later).await.unwrap();
        assert_eq!(report.evicted_caches, 1);
        assert_eq!(report.evicted_trackers, 1);
        assert_eq!(pipeline.stats().cached_containers, 0);
    }

    #[tokio::test]
    async fn test_drop_count_survives_tracker_eviction() {
        let config = LogConfig {
            ingest_per_second: 1,
            ..LogConfig::default()
        };
        let (pipeline, _) = pipeline_with(config, None);
        let lines = (0..4).map(|i| OutputLine::stdout(format!("{}", i))).collect();
        assert_eq!(pipeline.add_logs("c1", lines).await.unwrap().len(), 1);
        assert_eq!(pipeline.dropped("c1"), 3);

        let later = Instant::now() + Duration::from_secs(2 * 30 * 60 + 1);
        let report = pipeline.sweep_at(Utc::now(), later).await.unwrap();
        assert_eq!(report.evicted_trackers, 1);
        assert_eq!(pipeline.dropped("c1"), 3);
        assert_eq!(pipeline.stats().dropped_total, 3);
    }

    #[tokio::test]
    async fn test_invalid_container_rejected() {
        let (pipeline, _) = pipeline_with(LogConfig::default(), None);
        assert!(matches!(
            pipeline.add_log("bad id!", LogStream::Stdout, "x", None).await,
            Err(FleetError::Validation(_))
        ));
    }
}
