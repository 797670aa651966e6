use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use fleet_common::{InstructionMode, Job, JobProgress, JobResult, JobStatus, LogEntry, LogStream};
use rusqlite::{Connection, params};

use super::models::{LogQuery, NewLogEntry};

/// Async-safe handle to the fleet database.
///
/// Wraps `FleetDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FleetDb>>,
}

impl DbHandle {
    pub fn new(db: FleetDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open an in-memory database (for tests and ephemeral runs).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(FleetDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FleetDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct FleetDb {
    conn: Connection,
}

impl FleetDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("Failed to execute SQL")
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    container_id TEXT NOT NULL,
                    text TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    attempts_made INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    seq INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    processed_at TEXT,
                    finished_at TEXT,
                    delay_until TEXT,
                    progress TEXT,
                    result TEXT,
                    dead_letter INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS container_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    container_id TEXT NOT NULL,
                    stream TEXT NOT NULL,
                    content TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_container ON jobs(container_id, status);
                CREATE INDEX IF NOT EXISTS idx_container_logs_container
                    ON container_logs(container_id, recorded_at);
                CREATE INDEX IF NOT EXISTS idx_container_logs_recorded
                    ON container_logs(recorded_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn upsert_job(&self, job: &Job) -> Result<()> {
        let progress = job
            .progress
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize job progress")?;
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize job result")?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, container_id, text, mode, priority, status, attempts_made,
                    max_attempts, seq, created_at, processed_at, finished_at, delay_until,
                    progress, result, dead_letter)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    priority = excluded.priority,
                    attempts_made = excluded.attempts_made,
                    max_attempts = excluded.max_attempts,
                    processed_at = excluded.processed_at,
                    finished_at = excluded.finished_at,
                    delay_until = excluded.delay_until,
                    progress = excluded.progress,
                    result = excluded.result,
                    dead_letter = excluded.dead_letter",
                params![
                    job.id,
                    job.container_id,
                    job.text,
                    job.mode.as_str(),
                    job.priority,
                    job.status.as_str(),
                    job.attempts_made,
                    job.max_attempts,
                    job.seq as i64,
                    job.created_at.to_rfc3339(),
                    job.processed_at.map(|t| t.to_rfc3339()),
                    job.finished_at.map(|t| t.to_rfc3339()),
                    job.delay_until.map(|t| t.to_rfc3339()),
                    progress,
                    result,
                    job.dead_letter,
                ],
            )
            .context("Failed to upsert job")?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))
            .context("Failed to prepare get_job")?;
        let mut rows = stmt
            .query_map(params![id], JobRow::from_row)
            .context("Failed to query job")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read job row")?;
                Ok(Some(r.into_job()?))
            }
            None => Ok(None),
        }
    }

    /// All jobs for a container in enqueue order.
    pub fn load_jobs(&self, container_id: &str) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE container_id = ?1 ORDER BY seq ASC",
                JOB_COLUMNS
            ))
            .context("Failed to prepare load_jobs")?;
        let rows = stmt
            .query_map(params![container_id], JobRow::from_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn has_jobs(&self, container_id: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM jobs WHERE container_id = ?1)",
                params![container_id],
                |row| row.get(0),
            )
            .context("Failed to check for jobs")
    }

    /// Containers with jobs that still need to run.
    pub fn containers_with_unfinished_jobs(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT container_id FROM jobs
                 WHERE status IN ('waiting', 'delayed', 'active')
                 ORDER BY container_id",
            )
            .context("Failed to prepare unfinished job query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query unfinished jobs")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read container id")
    }

    pub fn delete_job(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .context("Failed to delete job")?;
        Ok(affected > 0)
    }

    pub fn delete_jobs(&self, ids: &[String]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut removed = 0;
        {
            let mut stmt = tx
                .prepare("DELETE FROM jobs WHERE id = ?1")
                .context("Failed to prepare delete_jobs")?;
            for id in ids {
                removed += stmt.execute(params![id]).context("Failed to delete job")?;
            }
        }
        tx.commit().context("Failed to commit job deletion")?;
        Ok(removed)
    }

    // ── Container logs ────────────────────────────────────────────────

    /// Insert a batch of log lines in one transaction.
    pub fn insert_logs(&self, entries: &[NewLogEntry]) -> Result<Vec<LogEntry>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut stored = Vec::with_capacity(entries.len());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO container_logs (container_id, stream, content, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .context("Failed to prepare insert_logs")?;
            for entry in entries {
                stmt.execute(params![
                    entry.container_id,
                    entry.stream.as_str(),
                    entry.content,
                    entry.recorded_at.timestamp_millis(),
                ])
                .context("Failed to insert log line")?;
                stored.push(LogEntry {
                    id: tx.last_insert_rowid(),
                    container_id: entry.container_id.clone(),
                    stream: entry.stream,
                    content: entry.content.clone(),
                    recorded_at: entry.recorded_at,
                });
            }
        }
        tx.commit().context("Failed to commit log batch")?;
        Ok(stored)
    }

    /// Page through a container's logs in chronological order.
    /// Returns the page and the total number of matching rows.
    pub fn query_logs(&self, container_id: &str, query: &LogQuery) -> Result<(Vec<LogEntry>, usize)> {
        let since = query.since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let until = query.until.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);
        let stream = query.stream.map(|s| s.as_str());

        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM container_logs
                 WHERE container_id = ?1 AND recorded_at >= ?2 AND recorded_at <= ?3
                   AND (?4 IS NULL OR stream = ?4)",
                params![container_id, since, until, stream],
                |row| row.get(0),
            )
            .context("Failed to count logs")?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, container_id, stream, content, recorded_at FROM container_logs
                 WHERE container_id = ?1 AND recorded_at >= ?2 AND recorded_at <= ?3
                   AND (?4 IS NULL OR stream = ?4)
                 ORDER BY recorded_at ASC, id ASC LIMIT ?5 OFFSET ?6",
            )
            .context("Failed to prepare query_logs")?;
        let rows = stmt
            .query_map(
                params![
                    container_id,
                    since,
                    until,
                    stream,
                    query.limit as i64,
                    query.offset as i64
                ],
                LogRow::from_row,
            )
            .context("Failed to query logs")?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("Failed to read log row")?.into_entry()?);
        }
        Ok((logs, total as usize))
    }

    /// The last `limit` lines of a container, oldest first.
    pub fn recent_logs(&self, container_id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, container_id, stream, content, recorded_at FROM container_logs
                 WHERE container_id = ?1 ORDER BY recorded_at DESC, id DESC LIMIT ?2",
            )
            .context("Failed to prepare recent_logs")?;
        let rows = stmt
            .query_map(params![container_id, limit as i64], LogRow::from_row)
            .context("Failed to query recent logs")?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("Failed to read log row")?.into_entry()?);
        }
        logs.reverse();
        Ok(logs)
    }

    pub fn count_logs(&self, container_id: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM container_logs WHERE container_id = ?1",
                params![container_id],
                |row| row.get(0),
            )
            .context("Failed to count logs")?;
        Ok(n as usize)
    }

    /// Delete every log line recorded before `cutoff`.
    pub fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM container_logs WHERE recorded_at < ?1",
                params![cutoff.timestamp_millis()],
            )
            .context("Failed to delete expired logs")
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, container_id, text, mode, priority, status, attempts_made, \
    max_attempts, seq, created_at, processed_at, finished_at, delay_until, progress, result, \
    dead_letter";

/// Intermediate row struct for reading jobs before converting the string
/// columns into typed values.
struct JobRow {
    id: String,
    container_id: String,
    text: String,
    mode: String,
    priority: u8,
    status: String,
    attempts_made: u32,
    max_attempts: u32,
    seq: i64,
    created_at: String,
    processed_at: Option<String>,
    finished_at: Option<String>,
    delay_until: Option<String>,
    progress: Option<String>,
    result: Option<String>,
    dead_letter: bool,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            container_id: row.get(1)?,
            text: row.get(2)?,
            mode: row.get(3)?,
            priority: row.get(4)?,
            status: row.get(5)?,
            attempts_made: row.get(6)?,
            max_attempts: row.get(7)?,
            seq: row.get(8)?,
            created_at: row.get(9)?,
            processed_at: row.get(10)?,
            finished_at: row.get(11)?,
            delay_until: row.get(12)?,
            progress: row.get(13)?,
            result: row.get(14)?,
            dead_letter: row.get(15)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let mode = InstructionMode::from_str(&self.mode)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job mode")?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let progress: Option<JobProgress> = self
            .progress
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse job progress JSON")?;
        let result: Option<JobResult> = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse job result JSON")?;

        Ok(Job {
            id: self.id,
            container_id: self.container_id,
            text: self.text,
            mode,
            priority: self.priority,
            status,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            seq: self.seq as u64,
            created_at: parse_ts(&self.created_at)?,
            processed_at: self.processed_at.as_deref().map(parse_ts).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            delay_until: self.delay_until.as_deref().map(parse_ts).transpose()?,
            progress,
            result,
            dead_letter: self.dead_letter,
        })
    }
}

struct LogRow {
    id: i64,
    container_id: String,
    stream: String,
    content: String,
    recorded_at: i64,
}

impl LogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            container_id: row.get(1)?,
            stream: row.get(2)?,
            content: row.get(3)?,
            recorded_at: row.get(4)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry> {
        let stream = LogStream::from_str(&self.stream)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse log stream")?;
        let recorded_at = Utc
            .timestamp_millis_opt(self.recorded_at)
            .single()
            .with_context(|| format!("Invalid log timestamp {}", self.recorded_at))?;
        Ok(LogEntry {
            id: self.id,
            container_id: self.container_id,
            stream,
            content: self.content,
            recorded_at,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn log(container: &str, stream: LogStream, content: &str, at: DateTime<Utc>) -> NewLogEntry {
        NewLogEntry {
            container_id: container.to_string(),
            stream,
            content: content.to_string(),
            recorded_at: at,
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('jobs', 'container_logs')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 2);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_job_upsert_and_reload() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let mut job = Job::new("c1", "run the tests", InstructionMode::Interactive, 3, 4);
        db.upsert_job(&job)?;

        job.status = JobStatus::Failed;
        job.attempts_made = 3;
        job.dead_letter = true;
        job.finished_at = Some(Utc::now());
        job.progress = Some(JobProgress {
            percentage: 40,
            message: Some("halfway".into()),
        });
        job.result = Some(JobResult::from_error("[DLQ] boom", None));
        db.upsert_job(&job)?;

        let loaded = db.get_job(&job.id)?.expect("job exists");
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.attempts_made, 3);
        assert!(loaded.dead_letter);
        assert_eq!(loaded.seq, 4);
        assert_eq!(loaded.progress.unwrap().percentage, 40);
        assert_eq!(loaded.result.unwrap().error.as_deref(), Some("[DLQ] boom"));
        Ok(())
    }

    #[test]
    fn test_load_jobs_in_seq_order_per_container() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        for seq in [3u64, 1, 2] {
            db.upsert_job(&Job::new("c1", format!("j{}", seq), InstructionMode::Autonomous, 3, seq))?;
        }
        db.upsert_job(&Job::new("c2", "other", InstructionMode::Autonomous, 3, 0))?;

        let jobs = db.load_jobs("c1")?;
        let seqs: Vec<u64> = jobs.iter().map(|j| j.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_delete_jobs() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let a = Job::new("c1", "a", InstructionMode::Autonomous, 3, 0);
        let b = Job::new("c1", "b", InstructionMode::Autonomous, 3, 1);
        db.upsert_job(&a)?;
        db.upsert_job(&b)?;

        assert!(db.delete_job(&a.id)?);
        assert!(!db.delete_job(&a.id)?);
        assert_eq!(db.delete_jobs(&[b.id.clone(), "missing".into()])?, 1);
        assert!(db.load_jobs("c1")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_insert_and_query_logs() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let base = Utc::now();
        let batch: Vec<NewLogEntry> = (0..5)
            .map(|i| {
                let stream = if i % 2 == 0 { LogStream::Stdout } else { LogStream::Stderr };
                log("c1", stream, &format!("line {}", i), base + Duration::milliseconds(i))
            })
            .collect();
        let stored = db.insert_logs(&batch)?;
        assert_eq!(stored.len(), 5);
        assert!(stored.windows(2).all(|w| w[0].id < w[1].id));

        let (page, total) = db.query_logs(
            "c1",
            &LogQuery {
                limit: 2,
                offset: 1,
                ..LogQuery::default()
            },
        )?;
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "line 1");

        let (stderr, total) = db.query_logs(
            "c1",
            &LogQuery {
                stream: Some(LogStream::Stderr),
                ..LogQuery::default()
            },
        )?;
        assert_eq!(total, 2);
        assert!(stderr.iter().all(|e| e.stream == LogStream::Stderr));

        let (ranged, _) = db.query_logs(
            "c1",
            &LogQuery {
                since: Some(base + Duration::milliseconds(3)),
                ..LogQuery::default()
            },
        )?;
        assert_eq!(ranged.len(), 2);
        Ok(())
    }

    #[test]
    fn test_recent_logs_chronological() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let base = Utc::now();
        let batch: Vec<NewLogEntry> = (0..10)
            .map(|i| log("c1", LogStream::Stdout, &format!("{}", i), base + Duration::milliseconds(i)))
            .collect();
        db.insert_logs(&batch)?;

        let recent = db.recent_logs("c1", 3)?;
        let contents: Vec<&str> = recent.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["7", "8", "9"]);
        Ok(())
    }

    #[test]
    fn test_delete_logs_before_cutoff() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let now = Utc::now();
        db.insert_logs(&[
            log("c1", LogStream::Stdout, "old", now - Duration::hours(25)),
            log("c1", LogStream::Stdout, "new", now),
        ])?;
        assert_eq!(db.delete_logs_before(now - Duration::hours(24))?, 1);
        assert_eq!(db.count_logs("c1")?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::in_memory()?;
        let job = Job::new("c1", "x", InstructionMode::Interactive, 1, 0);
        let id = job.id.clone();
        handle.call(move |db| db.upsert_job(&job)).await?;
        let loaded = handle.call(move |db| db.get_job(&id)).await?;
        assert!(loaded.is_some());
        Ok(())
    }
}
