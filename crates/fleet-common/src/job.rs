use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest instruction text accepted by a queue, in characters.
pub const MAX_INSTRUCTION_CHARS: usize = 10_000;

/// Longest container identifier accepted by a queue.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("container id must not be empty")]
    EmptyContainerId,

    #[error("container id exceeds {max} characters")]
    ContainerIdTooLong { max: usize },

    #[error("container id '{0}' contains characters outside [A-Za-z0-9_.-]")]
    InvalidContainerId(String),

    #[error("instruction must not be empty")]
    EmptyInstruction,

    #[error("instruction is {len} characters, limit is {max}")]
    InstructionTooLong { len: usize, max: usize },

    #[error("instruction contains control characters")]
    InstructionControlChars,

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,
}

/// Validate a container identifier (Docker id or name syntax).
pub fn validate_container_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyContainerId);
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err(ValidationError::ContainerIdTooLong {
            max: MAX_CONTAINER_ID_LEN,
        });
    }
    let mut chars = id.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok {
        return Err(ValidationError::InvalidContainerId(id.to_string()));
    }
    Ok(())
}

/// Validate instruction text. Newlines and tabs are allowed, other control
/// characters are not.
pub fn validate_instruction(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyInstruction);
    }
    let len = text.chars().count();
    if len > MAX_INSTRUCTION_CHARS {
        return Err(ValidationError::InstructionTooLong {
            len,
            max: MAX_INSTRUCTION_CHARS,
        });
    }
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(ValidationError::InstructionControlChars);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstructionMode {
    Interactive,
    Autonomous,
}

impl InstructionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Autonomous => "autonomous",
        }
    }

    /// Dispatch priority; lower values are dispatched first.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Interactive => 1,
            Self::Autonomous => 10,
        }
    }
}

impl FromStr for InstructionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(Self::Interactive),
            "autonomous" => Ok(Self::Autonomous),
            _ => Err(format!("Invalid instruction mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Waiting or delayed: admitted but not yet dispatched.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub percentage: u8,
    pub message: Option<String>,
}

/// What the executor hands back for a finished run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn from_output(output: JobOutput) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            error: None,
        }
    }

    pub fn from_error(error: impl Into<String>, output: Option<JobOutput>) -> Self {
        let output = output.unwrap_or_default();
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            error: Some(error.into()),
        }
    }
}

/// One instruction submitted for a container's agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub container_id: String,
    pub text: String,
    pub mode: InstructionMode,
    pub priority: u8,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Enqueue order within the container; breaks priority ties.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub delay_until: Option<DateTime<Utc>>,
    pub progress: Option<JobProgress>,
    pub result: Option<JobResult>,
    pub dead_letter: bool,
}

impl Job {
    pub fn new(
        container_id: impl Into<String>,
        text: impl Into<String>,
        mode: InstructionMode,
        max_attempts: u32,
        seq: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: container_id.into(),
            text: text.into(),
            mode,
            priority: mode.priority(),
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts,
            seq,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            delay_until: None,
            progress: None,
            result: None,
            dead_letter: false,
        }
    }

    /// Sort key used for dispatch: priority ascending, then enqueue order.
    pub fn dispatch_key(&self) -> (u8, u64) {
        (self.priority, self.seq)
    }

    /// Most recent timestamp touching this job, for history ordering.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.finished_at
            .or(self.processed_at)
            .unwrap_or(self.created_at)
    }

    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.error.as_deref())
    }
}
