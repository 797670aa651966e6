use chrono::{DateTime, Utc};
use fleet_common::{Job, JobProgress, JobResult, JobStatus, LogEntry, LogStream};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    /// Overrides the queue's default attempt budget.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub id: String,
    /// 1-based place in dispatch order at admission time.
    pub position: usize,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub is_paused: bool,
}

/// Lifecycle events published by a container's queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    Pending {
        job_id: String,
        position: usize,
    },
    Started {
        job_id: String,
        attempt: u32,
    },
    Progress {
        job_id: String,
        progress: JobProgress,
    },
    Completed {
        job_id: String,
        attempts_made: u32,
        result: JobResult,
    },
    Failed {
        job_id: String,
        attempts_made: u32,
        max_attempts: u32,
        error: String,
        will_retry: bool,
        retry_in_ms: Option<u64>,
        dead_letter: bool,
    },
    Cancelled {
        job_id: String,
    },
    Paused,
    Resumed,
    Cleared {
        removed: usize,
    },
}

impl QueueEvent {
    /// Name used on the instructions channel.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "instruction:pending",
            Self::Started { .. } => "instruction:started",
            Self::Progress { .. } => "instruction:progress",
            Self::Completed { .. } => "instruction:completed",
            Self::Failed { .. } => "instruction:failed",
            Self::Cancelled { .. } => "instruction:cancelled",
            Self::Paused => "queue:paused",
            Self::Resumed => "queue:resumed",
            Self::Cleared { .. } => "queue:cleared",
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Pending { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => Some(job_id),
            Self::Paused | Self::Resumed | Self::Cleared { .. } => None,
        }
    }
}

/// A job as returned by detail/history queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    /// 1-based dispatch position for waiting jobs.
    pub position: Option<usize>,
}

/// A log line on its way into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub container_id: String,
    pub stream: LogStream,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub stream: Option<LogStream>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            stream: None,
            limit: 100,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    pub total: usize,
    pub has_more: bool,
}
