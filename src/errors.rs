//! Typed error hierarchy for the fleet service.
//!
//! `FleetError` is what every public queue, channel and log operation
//! returns. Capacity and validation failures surface synchronously;
//! executor failures are carried in job events and only appear here when a
//! caller inspects them explicitly.

use std::time::Duration;

use fleet_common::{ExecutorError, JobStatus, ValidationError};
use thiserror::Error;

use crate::fleet::rate_limit::Tier;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Queue for container {container_id} is full ({limit} pending jobs)")]
    QueueFull { container_id: String, limit: usize },

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Container {container_id} has no instruction queue")]
    QueueNotFound { container_id: String },

    #[error("Cannot {action} job {job_id} while it is {status}")]
    InvalidStateTransition {
        job_id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Executor failed: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Rate limited on {tier} tier, retry after {}ms", retry_after.as_millis())]
    RateLimited { tier: Tier, retry_after: Duration },

    #[error("Real-time channel is not available")]
    ChannelUnavailable,

    #[error("Queue for container {container_id} has been destroyed")]
    QueueClosed { container_id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FleetError {
    /// Machine-readable reason code shared by the HTTP and WebSocket surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::QueueNotFound { .. } => "QUEUE_NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_STATE",
            Self::Executor(_) => "EXECUTOR_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::ChannelUnavailable => "CHANNEL_UNAVAILABLE",
            Self::QueueClosed { .. } => "QUEUE_CLOSED",
            Self::Database(_) | Self::Other(_) => "INTERNAL",
        }
    }
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;
