//! Contract between a container's queue worker and whatever actually runs
//! an instruction inside the container.
//!
//! The worker never interrupts a running execution; timeouts and kill
//! escalation belong to the executor implementation.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::job::{Job, JobOutput, JobProgress};

/// Failure reported by an executor.
///
/// `Retryable` failures go through the queue's attempt/backoff policy;
/// `Terminal` failures finalize the job immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("{message}")]
    Retryable {
        message: String,
        output: Option<JobOutput>,
    },

    #[error("{message}")]
    Terminal {
        message: String,
        output: Option<JobOutput>,
    },
}

impl ExecutorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            output: None,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal {
            message: message.into(),
            output: None,
        }
    }

    pub fn with_output(self, output: JobOutput) -> Self {
        match self {
            Self::Retryable { message, .. } => Self::Retryable {
                message,
                output: Some(output),
            },
            Self::Terminal { message, .. } => Self::Terminal {
                message,
                output: Some(output),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message, .. } | Self::Terminal { message, .. } => message,
        }
    }

    pub fn output(&self) -> Option<&JobOutput> {
        match self {
            Self::Retryable { output, .. } | Self::Terminal { output, .. } => output.as_ref(),
        }
    }
}

/// Handle an executor uses to publish progress for the job it is running.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<JobProgress>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that discards everything.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, percentage: u8, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(JobProgress {
                percentage: percentage.min(100),
                message: Some(message.into()),
            });
        }
    }
}

/// Runs one instruction inside its container.
#[async_trait]
pub trait InstructionExecutor: Send + Sync {
    async fn execute(&self, job: &Job, progress: ProgressReporter)
    -> Result<JobOutput, ExecutorError>;
}
