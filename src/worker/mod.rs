//! Worker execution engine.
//!
//! A worker is a separate OS process running a single-threaded loop:
//!
//! 1. Write a liveness record (PID + worker id + start time)
//! 2. Poll the queue; claim at most one job at a time
//! 3. Execute the job's command through [`CommandRunner`]
//! 4. Report the outcome back to the queue
//! 5. On SIGTERM/SIGINT: finish and report the running job, then exit
//!
//! Workers share no mutable state; all coordination goes through store
//! transactions. Execution and transient store errors are recovered here and
//! never reach the operator.

pub mod executor;
pub mod liveness;

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use executor::CommandRunner;

use crate::error::Result;
use crate::queue::Queue;

pub struct Worker {
    queue: Queue,
    worker_id: String,
    liveness_dir: PathBuf,
    poll_interval: Duration,
    runner: CommandRunner,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        queue: Queue,
        worker_id: String,
        liveness_dir: PathBuf,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            worker_id,
            liveness_dir,
            poll_interval,
            runner: CommandRunner::new(),
            shutdown,
        }
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Cancellation is only honoured between jobs: a child that is already
    /// running is allowed to finish and its outcome is reported before the
    /// loop exits.
    pub async fn run(&self) -> Result<()> {
        liveness::write_record(&self.liveness_dir, &self.worker_id)?;
        tracing::info!(worker_id = %self.worker_id, pid = std::process::id(), "Worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.queue.claim(&self.worker_id) {
                Ok(Some(job)) => {
                    let outcome = self.runner.run(&job.id, &job.command).await;
                    if let Err(e) = self.queue.report(&job, outcome) {
                        tracing::error!(
                            worker_id = %self.worker_id,
                            job_id = %job.id,
                            error = %e,
                            "Failed to report job outcome"
                        );
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, error = %e, "Claim failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Worker stopped");
        liveness::remove_record(&self.liveness_dir, &self.worker_id);
        Ok(())
    }
}
