use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(format!("Invalid log stream: {}", s)),
        }
    }
}

/// A persisted line of container output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: i64,
    pub container_id: String,
    pub stream: LogStream,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

/// A raw line read from a container before it is admitted to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: LogStream,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl OutputLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            content: content.into(),
            timestamp: None,
        }
    }
}
