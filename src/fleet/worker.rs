//! The dispatch loop bound to one container's queue.
//!
//! Runs as its own tokio task, so a long instruction in one container never
//! holds up dispatch in another. The loop never interrupts a running
//! execution: cancellation is only observed between jobs.

use std::sync::Arc;
use std::time::Duration;

use fleet_common::{ExecutorError, InstructionExecutor, Job, JobOutput, ProgressReporter};

use super::queue::{Dispatch, InstructionQueue};

/// Back-off after a storage error before asking the queue again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) async fn run(queue: Arc<InstructionQueue>, executor: Arc<dyn InstructionExecutor>) {
    let container_id = queue.container_id().to_string();
    let cancel = queue.cancel_token().clone();
    tracing::debug!(container_id = %container_id, "queue worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = match queue.next_dispatch().await {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(container_id = %container_id, error = %e, "failed to dispatch next instruction");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                }
            }
        };

        match next {
            Dispatch::Closed => break,
            Dispatch::Idle(wait) => {
                let due = async {
                    match wait {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.notified() => {}
                    _ = due => {}
                }
            }
            Dispatch::Run(job) => execute(&queue, executor.as_ref(), job).await,
        }
    }

    tracing::debug!(container_id = %container_id, "queue worker stopped");
}

/// Run one job to completion, forwarding progress reports as they arrive.
async fn execute(queue: &InstructionQueue, executor: &dyn InstructionExecutor, job: Job) {
    let (reporter, mut progress_rx) = ProgressReporter::channel();
    let outcome: Result<JobOutput, ExecutorError> = {
        let run = executor.execute(&job, reporter);
        tokio::pin!(run);
        loop {
            tokio::select! {
                res = &mut run => break res,
                Some(progress) = progress_rx.recv() => {
                    if let Err(e) = queue.record_progress(&job.id, progress).await {
                        tracing::warn!(job_id = %job.id, error = %e, "failed to record progress");
                    }
                }
            }
        }
    };
    while let Ok(progress) = progress_rx.try_recv() {
        if let Err(e) = queue.record_progress(&job.id, progress).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to record progress");
        }
    }

    let recorded = match outcome {
        Ok(output) => queue.complete(&job.id, output).await,
        Err(err) => queue.fail(&job.id, err).await,
    };
    if let Err(e) = recorded {
        tracing::error!(
            container_id = %job.container_id,
            job_id = %job.id,
            error = %e,
            "failed to record instruction outcome"
        );
    }
}
