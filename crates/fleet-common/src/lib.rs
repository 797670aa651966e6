//! Shared domain types for the agent fleet.
//!
//! The service crate owns queues, channels and transports; this crate only
//! holds the vocabulary they exchange: instruction jobs, container log
//! entries, and the contract an external instruction executor fulfils.

pub mod executor;
pub mod job;
pub mod log;

pub use executor::{ExecutorError, InstructionExecutor, ProgressReporter};
pub use job::{
    InstructionMode, Job, JobOutput, JobProgress, JobResult, JobStatus, ValidationError,
    validate_container_id, validate_instruction,
};
pub use log::{LogEntry, LogStream, OutputLine};
