//! Domain operations over the store: enqueue, claim, report, DLQ.
//!
//! All lifecycle transitions go through here so the state machine is enforced
//! in one place. Store transactions re-check preconditions, so a stale job
//! snapshot can never smuggle in an illegal transition.

use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

use crate::config;
use crate::error::Result;
use crate::job::{Job, JobOutcome, JobState};
use crate::store::{backoff_delay, Store};

#[derive(Clone)]
pub struct Queue {
    store: Store,
}

impl Queue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a job. The id defaults to a fresh UUID and the retry budget to
    /// the configured `max-retries`; a per-job override wins over the config.
    pub fn enqueue(
        &self,
        command: &str,
        id: Option<String>,
        max_retries: Option<u32>,
    ) -> Result<Job> {
        let max_retries = match max_retries {
            Some(n) => n,
            None => config::max_retries(&self.store)?,
        };
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let job = Job::new(id, command.to_string(), max_retries, Utc::now());
        self.store.insert_job(&job)?;
        tracing::info!(job_id = %job.id, command = %job.command, max_retries, "Job enqueued");
        Ok(job)
    }

    pub fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        self.store.atomic_claim(worker_id, Utc::now())
    }

    /// Route an execution outcome: success completes the job; failure retries
    /// with exponential backoff (`backoff-base ^ attempts` seconds after the
    /// failed run) while budget remains, and dead-letters otherwise.
    pub fn report(&self, job: &Job, outcome: JobOutcome) -> Result<()> {
        let now = Utc::now();
        match outcome {
            JobOutcome::Success => {
                self.store.complete(&job.id, now)?;
                tracing::info!(job_id = %job.id, "Job completed");
            }
            JobOutcome::Failure(error) => {
                let failed_attempts = job.attempts + 1;
                if failed_attempts <= job.max_retries {
                    let base = config::backoff_base(&self.store)?;
                    let delay = backoff_delay(base, failed_attempts);
                    self.store.fail_retry(&job.id, now + delay, &error, now)?;
                    tracing::warn!(
                        job_id = %job.id,
                        attempts = failed_attempts,
                        retry_in_secs = delay.num_seconds(),
                        error = %error,
                        "Job failed, retry scheduled"
                    );
                } else {
                    self.store.fail_dead(&job.id, &error, now)?;
                    tracing::warn!(
                        job_id = %job.id,
                        attempts = failed_attempts,
                        error = %error,
                        "Job failed, moved to dead-letter queue"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        self.store.get(id)
    }

    pub fn list(&self, state: Option<JobState>, limit: Option<usize>) -> Result<Vec<Job>> {
        self.store.list(state, limit)
    }

    pub fn dlq_list(&self) -> Result<Vec<Job>> {
        self.store.list(Some(JobState::Dead), None)
    }

    /// Move a dead job back to `pending` with `attempts = 0`. The command is
    /// immutable, so a revived job replays the same input.
    pub fn dlq_retry(&self, id: &str) -> Result<Job> {
        let job = self.store.revive(id, Utc::now())?;
        tracing::info!(job_id = %job.id, "Dead-letter job re-admitted");
        Ok(job)
    }

    /// Recover `processing` rows untouched for longer than `timeout`.
    pub fn reset_stuck(&self, timeout: Duration) -> Result<usize> {
        let now = Utc::now();
        let older_than = now
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.store.reset_stuck(older_than, now)
    }
}
