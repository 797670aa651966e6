//! Per-container durable priority queues.
//!
//! Each container gets its own [`InstructionQueue`] with a dedicated worker
//! task, created lazily on first use and owned by the [`QueueManager`].
//! Jobs are dispatched by priority (interactive before autonomous) and then
//! in enqueue order; at most one job per container is active at a time.
//! Every mutation is written through to the `jobs` table before it becomes
//! visible, so a restarted process picks up where the last one stopped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_common::{
    ExecutorError, InstructionExecutor, InstructionMode, Job, JobOutput, JobProgress, JobResult,
    JobStatus, ValidationError, validate_container_id, validate_instruction,
};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::broadcaster::EventBroadcaster;
use super::db::DbHandle;
use super::models::{EnqueueOptions, EnqueueReceipt, JobDetail, QueueEvent, QueueStatus};
use super::subscriptions::ChannelKey;
use super::worker;
use crate::errors::{FleetError, FleetResult};

/// Prefix on the error text of jobs that exhausted their attempts.
pub const DEAD_LETTER_TAG: &str = "[DLQ]";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Cap on waiting + delayed jobs per container.
    pub max_waiting: usize,
    pub max_attempts: u32,
    /// First retry delay; doubles with every further failed attempt.
    pub backoff_base: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_waiting: 100,
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

impl QueueConfig {
    /// Delay before the next attempt once `attempts_made` attempts have failed.
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

/// What the worker should do next.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Run(Job),
    /// Nothing runnable; sleep until notified or the given delay elapses.
    Idle(Option<Duration>),
    Closed,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    waiting: BTreeSet<(u8, u64, String)>,
    delayed: BTreeSet<(DateTime<Utc>, u64, String)>,
    active: Option<String>,
    paused: bool,
    closed: bool,
    next_seq: u64,
}

impl QueueState {
    /// Index a job under its current status.
    fn admit(&mut self, job: Job) {
        match job.status {
            JobStatus::Waiting => {
                self.waiting.insert((job.priority, job.seq, job.id.clone()));
            }
            JobStatus::Delayed => {
                let due = job.delay_until.unwrap_or(job.created_at);
                self.delayed.insert((due, job.seq, job.id.clone()));
            }
            JobStatus::Active => self.active = Some(job.id.clone()),
            JobStatus::Completed | JobStatus::Failed => {}
        }
        self.jobs.insert(job.id.clone(), job);
    }

    fn unlink(&mut self, job: &Job) {
        match job.status {
            JobStatus::Waiting => {
                self.waiting.remove(&(job.priority, job.seq, job.id.clone()));
            }
            JobStatus::Delayed => {
                let due = job.delay_until.unwrap_or(job.created_at);
                self.delayed.remove(&(due, job.seq, job.id.clone()));
            }
            JobStatus::Active => {
                if self.active.as_deref() == Some(job.id.as_str()) {
                    self.active = None;
                }
            }
            JobStatus::Completed | JobStatus::Failed => {}
        }
    }

    /// Clear the active slot if it still belongs to `id`.
    fn release(&mut self, id: &str) {
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
    }

    fn remove(&mut self, id: &str) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.unlink(&job);
        Some(job)
    }

    fn pending_count(&self) -> usize {
        self.waiting.len() + self.delayed.len()
    }

    /// 1-based position among waiting jobs in dispatch order.
    fn position(&self, id: &str) -> Option<usize> {
        self.waiting
            .iter()
            .position(|(_, _, job_id)| job_id == id)
            .map(|p| p + 1)
    }

    /// Move delayed jobs whose time has come into the waiting set.
    fn promote_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut promoted = Vec::new();
        while let Some(first) = self.delayed.first() {
            if first.0 > now {
                break;
            }
            let Some((_, _, id)) = self.delayed.pop_first() else {
                break;
            };
            if let Some(job) = self.jobs.get_mut(&id) {
                job.status = JobStatus::Waiting;
                job.delay_until = None;
                self.waiting.insert((job.priority, job.seq, id.clone()));
                promoted.push(id);
            }
        }
        promoted
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.delayed.first().map(|(due, _, _)| *due)
    }

    fn pop_next(&mut self) -> Option<String> {
        self.waiting.pop_first().map(|(_, _, id)| id)
    }

    fn status(&self) -> QueueStatus {
        let mut status = QueueStatus {
            waiting: self.waiting.len(),
            delayed: self.delayed.len(),
            active: usize::from(self.active.is_some()),
            is_paused: self.paused,
            ..QueueStatus::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Completed => status.completed += 1,
                JobStatus::Failed => status.failed += 1,
                _ => {}
            }
        }
        status
    }

    /// Drop the oldest terminal jobs of `status` beyond `keep`.
    fn prune_terminal(&mut self, status: JobStatus, keep: usize) -> Vec<String> {
        let mut terminal: Vec<(DateTime<Utc>, u64, String)> = self
            .jobs
            .values()
            .filter(|j| j.status == status)
            .map(|j| (j.last_touched(), j.seq, j.id.clone()))
            .collect();
        if terminal.len() <= keep {
            return Vec::new();
        }
        terminal.sort();
        let excess = terminal.len() - keep;
        let ids: Vec<String> = terminal.into_iter().take(excess).map(|(_, _, id)| id).collect();
        for id in &ids {
            self.jobs.remove(id);
        }
        ids
    }

    fn sorted_recent<'a>(&'a self, filter: impl Fn(&Job) -> bool) -> Vec<&'a Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|&j| filter(j)).collect();
        jobs.sort_by(|a, b| {
            b.last_touched()
                .cmp(&a.last_touched())
                .then(b.seq.cmp(&a.seq))
        });
        jobs
    }
}

/// A container's queue, its event stream and its bound worker.
pub struct InstructionQueue {
    container_id: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    events: parking_lot::Mutex<Option<broadcast::Sender<QueueEvent>>>,
    broadcaster: Arc<EventBroadcaster>,
    db: DbHandle,
    cancel: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl InstructionQueue {
    /// Load a container's persisted jobs and build its queue. Jobs that were
    /// active when the previous process stopped go back to waiting without
    /// consuming an attempt.
    pub async fn open(
        container_id: &str,
        config: QueueConfig,
        db: DbHandle,
        broadcaster: Arc<EventBroadcaster>,
    ) -> FleetResult<Arc<Self>> {
        validate_container_id(container_id)?;
        let owned_id = container_id.to_string();
        let jobs = db
            .call(move |db| db.load_jobs(&owned_id))
            .await
            .map_err(FleetError::Database)?;

        let mut state = QueueState::default();
        let mut recovered = Vec::new();
        for mut job in jobs {
            state.next_seq = state.next_seq.max(job.seq + 1);
            if job.status == JobStatus::Active {
                job.status = JobStatus::Waiting;
                job.processed_at = None;
                job.progress = None;
                recovered.push(job.clone());
            }
            state.admit(job);
        }
        if !recovered.is_empty() {
            tracing::warn!(
                container_id,
                count = recovered.len(),
                "returning interrupted jobs to waiting"
            );
            db.call(move |db| {
                for job in &recovered {
                    db.upsert_job(job)?;
                }
                Ok(())
            })
            .await
            .map_err(FleetError::Database)?;
        }

        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Arc::new(Self {
            container_id: container_id.to_string(),
            config,
            state: Mutex::new(state),
            notify: Notify::new(),
            events: parking_lot::Mutex::new(Some(tx)),
            broadcaster,
            db,
            cancel: CancellationToken::new(),
            worker: parking_lot::Mutex::new(None),
        }))
    }

    /// Spawn the worker bound to this queue.
    pub fn start(self: &Arc<Self>, executor: Arc<dyn InstructionExecutor>) {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return;
        }
        let queue = Arc::clone(self);
        *slot = Some(tokio::spawn(worker::run(queue, executor)));
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to this queue's lifecycle events. Returns `None` once the
    /// queue has been destroyed.
    pub fn events(&self) -> Option<broadcast::Receiver<QueueEvent>> {
        self.events.lock().as_ref().map(|tx| tx.subscribe())
    }

    pub async fn enqueue(
        &self,
        text: &str,
        mode: InstructionMode,
        opts: EnqueueOptions,
    ) -> FleetResult<EnqueueReceipt> {
        validate_instruction(text)?;
        let max_attempts = opts.max_attempts.unwrap_or(self.config.max_attempts);
        if max_attempts == 0 {
            return Err(ValidationError::InvalidMaxAttempts.into());
        }

        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        if state.pending_count() >= self.config.max_waiting {
            tracing::warn!(
                container_id = %self.container_id,
                limit = self.config.max_waiting,
                "queue full, rejecting instruction"
            );
            return Err(FleetError::QueueFull {
                container_id: self.container_id.clone(),
                limit: self.config.max_waiting,
            });
        }

        let job = Job::new(&self.container_id, text, mode, max_attempts, state.next_seq);
        self.persist(&job).await?;
        state.next_seq += 1;
        let id = job.id.clone();
        state.admit(job);
        let position = state.position(&id).unwrap_or(state.pending_count());

        tracing::info!(
            container_id = %self.container_id,
            job_id = %id,
            mode = mode.as_str(),
            position,
            "instruction enqueued"
        );
        self.publish(QueueEvent::Pending {
            job_id: id.clone(),
            position,
        });
        drop(state);
        self.notify.notify_one();

        Ok(EnqueueReceipt {
            id,
            position,
            status: JobStatus::Waiting,
        })
    }

    pub async fn status(&self) -> QueueStatus {
        self.state.lock().await.status()
    }

    /// Waiting jobs in dispatch order, followed by delayed jobs by due time.
    pub async fn pending(&self, limit: usize) -> Vec<Job> {
        let state = self.state.lock().await;
        let waiting = state.waiting.iter().map(|(_, _, id)| id);
        let delayed = state.delayed.iter().map(|(_, _, id)| id);
        waiting
            .chain(delayed)
            .filter_map(|id| state.jobs.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Cancel a waiting or delayed job. Returns `false` if the job exists but
    /// has already been dispatched.
    pub async fn cancel(&self, job_id: &str) -> FleetResult<bool> {
        let mut state = self.state.lock().await;
        let status = self.lookup(&state, job_id)?.status;
        if !status.is_pending() {
            return Ok(false);
        }
        let owned = job_id.to_string();
        self.db
            .call(move |db| db.delete_job(&owned))
            .await
            .map_err(FleetError::Database)?;
        state.remove(job_id);
        tracing::info!(container_id = %self.container_id, job_id, "instruction cancelled");
        self.publish(QueueEvent::Cancelled {
            job_id: job_id.to_string(),
        });
        Ok(true)
    }

    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        if !state.paused {
            state.paused = true;
            tracing::info!(container_id = %self.container_id, "queue paused");
            self.publish(QueueEvent::Paused);
        }
    }

    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        if state.paused {
            state.paused = false;
            tracing::info!(container_id = %self.container_id, "queue resumed");
            self.publish(QueueEvent::Resumed);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Remove every waiting and delayed job. Returns how many were removed.
    pub async fn clear(&self) -> FleetResult<usize> {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state
            .waiting
            .iter()
            .map(|(_, _, id)| id.clone())
            .chain(state.delayed.iter().map(|(_, _, id)| id.clone()))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let to_delete = ids.clone();
        self.db
            .call(move |db| db.delete_jobs(&to_delete))
            .await
            .map_err(FleetError::Database)?;
        for id in &ids {
            state.remove(id);
        }
        tracing::info!(container_id = %self.container_id, removed = ids.len(), "queue cleared");
        self.publish(QueueEvent::Cleared { removed: ids.len() });
        Ok(ids.len())
    }

    /// Jobs in every state, most recently touched first.
    pub async fn history(&self, limit: usize) -> Vec<Job> {
        let state = self.state.lock().await;
        state
            .sorted_recent(|_| true)
            .into_iter()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn job(&self, job_id: &str) -> FleetResult<JobDetail> {
        let state = self.state.lock().await;
        let job = self.lookup(&state, job_id)?.clone();
        Ok(JobDetail {
            position: state.position(job_id),
            job,
        })
    }

    /// Put a failed job back in line with a fresh attempt budget.
    /// Dead-lettered jobs are accepted too; this is an operator action.
    pub async fn retry(&self, job_id: &str) -> FleetResult<EnqueueReceipt> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        let job = self.lookup(&state, job_id)?;
        if job.status != JobStatus::Failed {
            return Err(FleetError::InvalidStateTransition {
                job_id: job_id.to_string(),
                status: job.status,
                action: "retry",
            });
        }
        if state.pending_count() >= self.config.max_waiting {
            return Err(FleetError::QueueFull {
                container_id: self.container_id.clone(),
                limit: self.config.max_waiting,
            });
        }

        let mut job = job.clone();
        let was_dead_letter = job.dead_letter;
        job.status = JobStatus::Waiting;
        job.attempts_made = 0;
        job.dead_letter = false;
        job.processed_at = None;
        job.finished_at = None;
        job.delay_until = None;
        job.progress = None;
        job.result = None;
        self.persist(&job).await?;
        state.remove(job_id);
        state.admit(job);
        let position = state.position(job_id).unwrap_or(state.pending_count());

        tracing::info!(
            container_id = %self.container_id,
            job_id,
            was_dead_letter,
            "failed instruction requeued"
        );
        self.publish(QueueEvent::Pending {
            job_id: job_id.to_string(),
            position,
        });
        drop(state);
        self.notify.notify_one();

        Ok(EnqueueReceipt {
            id: job_id.to_string(),
            position,
            status: JobStatus::Waiting,
        })
    }

    /// Delete a completed or failed job.
    pub async fn delete(&self, job_id: &str) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        let status = self.lookup(&state, job_id)?.status;
        if !status.is_terminal() {
            return Err(FleetError::InvalidStateTransition {
                job_id: job_id.to_string(),
                status,
                action: "delete",
            });
        }
        let owned = job_id.to_string();
        self.db
            .call(move |db| db.delete_job(&owned))
            .await
            .map_err(FleetError::Database)?;
        state.remove(job_id);
        Ok(())
    }

    /// Dead-lettered jobs, most recent first.
    pub async fn dead_letter(&self, limit: usize) -> Vec<Job> {
        let state = self.state.lock().await;
        state
            .sorted_recent(|j| j.status == JobStatus::Failed && j.dead_letter)
            .into_iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Stop the worker and close the event stream. The active job, if any,
    /// is given `grace` to finish before the worker is aborted; an aborted
    /// job stays `active` in the store and is recovered on the next open.
    pub async fn close(&self, grace: Duration) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
        }
        self.cancel.cancel();
        self.notify.notify_one();

        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(container_id = %self.container_id, error = %e, "queue worker panicked");
                }
                Err(_) => {
                    tracing::warn!(
                        container_id = %self.container_id,
                        grace_secs = grace.as_secs(),
                        "active instruction did not finish within grace period, aborting worker"
                    );
                    handle.abort();
                }
            }
        }
        self.events.lock().take();
        tracing::info!(container_id = %self.container_id, "queue closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    // ── Worker-facing transitions ─────────────────────────────────────

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }

    /// Pick the next job to run, marking it active.
    pub(crate) async fn next_dispatch(&self) -> FleetResult<Dispatch> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(Dispatch::Closed);
        }
        let now = Utc::now();
        let promoted = state.promote_due(now);
        for id in &promoted {
            if let Some(job) = state.jobs.get(id).cloned()
                && let Err(e) = self.persist(&job).await
            {
                // A stale delayed row is promoted again on the next open.
                tracing::warn!(container_id = %self.container_id, job_id = %id, error = %e, "failed to persist promoted job");
            }
        }
        if state.paused || state.active.is_some() {
            return Ok(Dispatch::Idle(None));
        }

        let Some(id) = state.waiting.first().map(|(_, _, id)| id.clone()) else {
            let wait = state
                .next_due()
                .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO));
            return Ok(Dispatch::Idle(wait));
        };
        let Some(mut job) = state.jobs.get(&id).cloned() else {
            state.pop_next();
            return Ok(Dispatch::Idle(Some(Duration::ZERO)));
        };
        job.status = JobStatus::Active;
        job.processed_at = Some(now);
        job.progress = None;
        // The job keeps its place in line until the store accepts the change.
        self.persist(&job).await?;
        state.pop_next();
        state.jobs.insert(id.clone(), job.clone());
        state.active = Some(id.clone());

        tracing::info!(
            container_id = %self.container_id,
            job_id = %id,
            attempt = job.attempts_made + 1,
            max_attempts = job.max_attempts,
            "dispatching instruction"
        );
        self.publish(QueueEvent::Started {
            job_id: id,
            attempt: job.attempts_made + 1,
        });
        Ok(Dispatch::Run(job))
    }

    pub(crate) async fn record_progress(&self, job_id: &str, progress: JobProgress) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(());
        };
        job.progress = Some(progress.clone());
        let job = job.clone();
        self.persist(&job).await?;
        self.publish(QueueEvent::Progress {
            job_id: job_id.to_string(),
            progress,
        });
        Ok(())
    }

    /// Record a successful run. The in-memory transition always happens so
    /// the queue keeps dispatching; a store error is still returned, and the
    /// stale `active` row reruns after a restart.
    pub(crate) async fn complete(&self, job_id: &str, output: JobOutput) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        let Some(mut job) = state.jobs.get(job_id).cloned() else {
            state.release(job_id);
            return Ok(());
        };
        job.status = JobStatus::Completed;
        job.finished_at = Some(Utc::now());
        job.result = Some(JobResult::from_output(output));
        let persisted = self.persist(&job).await;
        state.remove(job_id);
        state.admit(job.clone());
        state.release(job_id);

        tracing::info!(
            container_id = %self.container_id,
            job_id,
            attempts_made = job.attempts_made,
            "instruction completed"
        );
        self.publish(QueueEvent::Completed {
            job_id: job_id.to_string(),
            attempts_made: job.attempts_made,
            result: job.result.clone().unwrap_or_default(),
        });
        self.prune(&mut state).await;
        persisted
    }

    /// Record a failed attempt: retry with backoff while attempts remain,
    /// otherwise dead-letter. Terminal executor errors fail immediately.
    /// Like [`complete`](Self::complete), the run always ends in memory even
    /// when the store write fails.
    pub(crate) async fn fail(&self, job_id: &str, err: ExecutorError) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        let Some(mut job) = state.jobs.get(job_id).cloned() else {
            state.release(job_id);
            return Ok(());
        };

        job.attempts_made += 1;
        let now = Utc::now();
        let retryable = err.is_retryable();
        let will_retry = retryable && job.attempts_made < job.max_attempts;
        let mut retry_in = None;

        if will_retry {
            let delay = self.config.backoff_for(job.attempts_made);
            job.status = JobStatus::Delayed;
            job.delay_until = Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
            job.result = Some(JobResult::from_error(err.message(), err.output().cloned()));
            retry_in = Some(delay);
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            job.dead_letter = retryable;
            let message = if retryable {
                format!("{} {}", DEAD_LETTER_TAG, err.message())
            } else {
                err.message().to_string()
            };
            job.result = Some(JobResult::from_error(message, err.output().cloned()));
        }

        let persisted = self.persist(&job).await;
        state.remove(job_id);
        state.admit(job.clone());
        state.release(job_id);

        let error = job.error().unwrap_or_default().to_string();
        if will_retry {
            tracing::warn!(
                container_id = %self.container_id,
                job_id,
                attempts_made = job.attempts_made,
                max_attempts = job.max_attempts,
                retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
                error = %error,
                "instruction failed, retrying"
            );
        } else {
            tracing::error!(
                container_id = %self.container_id,
                job_id,
                attempts_made = job.attempts_made,
                dead_letter = job.dead_letter,
                error = %error,
                "instruction failed"
            );
        }
        self.publish(QueueEvent::Failed {
            job_id: job_id.to_string(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            error,
            will_retry,
            retry_in_ms: retry_in.map(|d| d.as_millis() as u64),
            dead_letter: job.dead_letter,
        });
        if !will_retry {
            self.prune(&mut state).await;
        }
        persisted
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn ensure_open(&self, state: &QueueState) -> FleetResult<()> {
        if state.closed {
            return Err(FleetError::QueueClosed {
                container_id: self.container_id.clone(),
            });
        }
        Ok(())
    }

    fn lookup<'a>(&self, state: &'a QueueState, job_id: &str) -> FleetResult<&'a Job> {
        state.jobs.get(job_id).ok_or_else(|| FleetError::JobNotFound {
            job_id: job_id.to_string(),
        })
    }

    async fn persist(&self, job: &Job) -> FleetResult<()> {
        let job = job.clone();
        self.db
            .call(move |db| db.upsert_job(&job))
            .await
            .map_err(FleetError::Database)
    }

    async fn prune(&self, state: &mut QueueState) {
        let mut ids = state.prune_terminal(JobStatus::Completed, self.config.keep_completed);
        ids.extend(state.prune_terminal(JobStatus::Failed, self.config.keep_failed));
        if ids.is_empty() {
            return;
        }
        let count = ids.len();
        if let Err(e) = self.db.call(move |db| db.delete_jobs(&ids)).await {
            tracing::warn!(container_id = %self.container_id, error = %e, "failed to prune finished jobs");
        } else {
            tracing::debug!(container_id = %self.container_id, count, "pruned finished jobs");
        }
    }

    /// Send an event to local listeners and to the container's instruction
    /// channel.
    fn publish(&self, event: QueueEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event.clone());
        }
        let mut payload = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize queue event");
                return;
            }
        };
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                "containerId".to_string(),
                serde_json::Value::String(self.container_id.clone()),
            );
        }
        self.broadcaster.emit(
            &ChannelKey::instructions(&self.container_id),
            event.event_name(),
            payload,
        );
    }
}

/// Owns every container's queue.
pub struct QueueManager {
    handles: Mutex<HashMap<String, Arc<InstructionQueue>>>,
    db: DbHandle,
    broadcaster: Arc<EventBroadcaster>,
    executor: Arc<dyn InstructionExecutor>,
    config: QueueConfig,
}

impl QueueManager {
    pub fn new(
        db: DbHandle,
        broadcaster: Arc<EventBroadcaster>,
        executor: Arc<dyn InstructionExecutor>,
        config: QueueConfig,
    ) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            db,
            broadcaster,
            executor,
            config,
        }
    }

    /// Get a container's queue, creating it (and its worker) on first use.
    /// Only enqueueing paths should call this; lookups go through
    /// [`get`](Self::get).
    pub async fn queue(&self, container_id: &str) -> FleetResult<Arc<InstructionQueue>> {
        validate_container_id(container_id)?;
        let mut handles = self.handles.lock().await;
        if let Some(queue) = handles.get(container_id) {
            return Ok(Arc::clone(queue));
        }
        self.open_into(&mut handles, container_id).await
    }

    /// Look up a container's queue without creating one. A container whose
    /// jobs were persisted by an earlier run is reopened; one that never had
    /// an instruction yields `None`.
    pub async fn get(&self, container_id: &str) -> FleetResult<Option<Arc<InstructionQueue>>> {
        validate_container_id(container_id)?;
        let mut handles = self.handles.lock().await;
        if let Some(queue) = handles.get(container_id) {
            return Ok(Some(Arc::clone(queue)));
        }
        let owned = container_id.to_string();
        let known = self
            .db
            .call(move |db| db.has_jobs(&owned))
            .await
            .map_err(FleetError::Database)?;
        if !known {
            return Ok(None);
        }
        self.open_into(&mut handles, container_id).await.map(Some)
    }

    /// Like [`get`](Self::get) but an unknown container is an error.
    pub async fn require(&self, container_id: &str) -> FleetResult<Arc<InstructionQueue>> {
        self.get(container_id)
            .await?
            .ok_or_else(|| FleetError::QueueNotFound {
                container_id: container_id.to_string(),
            })
    }

    /// Reopen every container that still has waiting, delayed or interrupted
    /// jobs so their workers resume after a restart. Returns how many queues
    /// were opened.
    pub async fn recover(&self) -> FleetResult<usize> {
        let ids = self
            .db
            .call(|db| db.containers_with_unfinished_jobs())
            .await
            .map_err(FleetError::Database)?;
        let mut opened = 0;
        for id in ids {
            match self.queue(&id).await {
                Ok(_) => opened += 1,
                Err(e) => {
                    tracing::warn!(container_id = %id, error = %e, "failed to recover queue");
                }
            }
        }
        if opened > 0 {
            tracing::info!(count = opened, "recovered queues with unfinished jobs");
        }
        Ok(opened)
    }

    async fn open_into(
        &self,
        handles: &mut HashMap<String, Arc<InstructionQueue>>,
        container_id: &str,
    ) -> FleetResult<Arc<InstructionQueue>> {
        let queue = InstructionQueue::open(
            container_id,
            self.config.clone(),
            self.db.clone(),
            Arc::clone(&self.broadcaster),
        )
        .await?;
        queue.start(Arc::clone(&self.executor));
        handles.insert(container_id.to_string(), Arc::clone(&queue));
        tracing::info!(container_id, "queue created");
        Ok(queue)
    }

    pub async fn enqueue(
        &self,
        container_id: &str,
        text: &str,
        mode: InstructionMode,
        opts: EnqueueOptions,
    ) -> FleetResult<EnqueueReceipt> {
        validate_container_id(container_id)?;
        validate_instruction(text)?;
        self.queue(container_id).await?.enqueue(text, mode, opts).await
    }

    pub async fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn active_queues(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Tear down a container's queue. Returns `false` if it had none.
    pub async fn destroy(&self, container_id: &str, grace: Duration) -> bool {
        let queue = self.handles.lock().await.remove(container_id);
        match queue {
            Some(queue) => {
                queue.close(grace).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every queue concurrently, waiting up to `grace` for active
    /// jobs to finish.
    pub async fn destroy_all(&self, grace: Duration) {
        let queues: Vec<Arc<InstructionQueue>> =
            self.handles.lock().await.drain().map(|(_, q)| q).collect();
        if queues.is_empty() {
            return;
        }
        tracing::info!(count = queues.len(), "closing all queues");
        futures::future::join_all(queues.iter().map(|q| q.close(grace))).await;
    }
}
