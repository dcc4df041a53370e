//! Worker process supervision: spawn, stop, observe.
//!
//! The supervisor never talks to workers directly; it spawns them as detached
//! OS processes (re-invoking this binary's hidden `worker run` subcommand)
//! and observes them through their liveness records and the OS process table.
//! Records are authoritative: a record whose PID is gone is stale and gets
//! garbage-collected, and the job it owned is left to the stuck sweep.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::worker::liveness::{self, WorkerRecord};

/// Bounded wait for spawned workers to register their liveness record.
pub const START_WAIT: Duration = Duration::from_secs(10);

/// Grace window between SIGTERM and SIGKILL on `stop`.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

const POLL_STEP: Duration = Duration::from_millis(100);

/// Directory holding liveness records for the given store file.
pub fn liveness_dir(db_path: &Path) -> PathBuf {
    match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub struct Supervisor {
    db_path: PathBuf,
}

impl Supervisor {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    fn dir(&self) -> PathBuf {
        liveness_dir(&self.db_path)
    }

    /// Spawn `count` detached worker processes and wait until each has
    /// written its liveness record.
    pub async fn start(&self, count: u32, poll_interval: Option<f64>) -> Result<Vec<WorkerRecord>> {
        let exe = std::env::current_exe()?;
        let dir = self.dir();
        let mut worker_ids = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let worker_id = Uuid::new_v4().to_string();
            let mut cmd = std::process::Command::new(&exe);
            cmd.arg("--db-path")
                .arg(&self.db_path)
                .arg("worker")
                .arg("run")
                .arg("--worker-id")
                .arg(&worker_id)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if let Some(secs) = poll_interval {
                cmd.arg("--poll-interval").arg(secs.to_string());
            }
            let child = cmd.spawn()?;
            tracing::info!(worker_id = %worker_id, pid = child.id(), "Spawned worker process");
            worker_ids.push(worker_id);
        }

        let deadline = Instant::now() + START_WAIT;
        loop {
            let mut registered = Vec::with_capacity(worker_ids.len());
            let mut missing = 0;
            for id in &worker_ids {
                // A half-written record counts as not yet registered.
                match liveness::read_record(&liveness::record_path(&dir, id)) {
                    Ok(record) => registered.push(record),
                    Err(_) => missing += 1,
                }
            }
            if missing == 0 {
                return Ok(registered);
            }
            if Instant::now() >= deadline {
                return Err(QueueError::WorkerStartTimeout {
                    count: missing,
                    timeout_secs: START_WAIT.as_secs(),
                });
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    /// SIGTERM every live worker, wait up to `grace`, SIGKILL the rest.
    /// Returns the number of workers that were signalled.
    pub async fn stop(&self, grace: Duration) -> Result<usize> {
        let dir = self.dir();
        let mut live = Vec::new();
        for (path, record) in liveness::list_records(&dir)? {
            if liveness::pid_alive(record.pid) {
                if liveness::send_signal(record.pid, libc::SIGTERM) {
                    tracing::info!(worker_id = %record.worker_id, pid = record.pid, "Sent SIGTERM");
                }
                live.push((path, record));
            } else {
                tracing::info!(worker_id = %record.worker_id, pid = record.pid, "Removing stale liveness record");
                let _ = std::fs::remove_file(&path);
            }
        }
        if live.is_empty() {
            return Ok(0);
        }

        let signalled = live.len();
        let deadline = Instant::now() + grace;
        loop {
            live.retain(|(_, record)| liveness::pid_alive(record.pid));
            if live.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for (_, record) in &live {
                    tracing::warn!(worker_id = %record.worker_id, pid = record.pid, "Grace period expired, sending SIGKILL");
                    liveness::send_signal(record.pid, libc::SIGKILL);
                }
                break;
            }
            tokio::time::sleep(POLL_STEP).await;
        }

        // Workers remove their own record on clean exit; killed ones can't.
        for (path, _) in liveness::list_records(&dir)? {
            let _ = std::fs::remove_file(&path);
        }
        Ok(signalled)
    }

    /// Records whose PID is still resident. Stale records are removed.
    pub fn live_workers(&self) -> Result<Vec<WorkerRecord>> {
        let mut alive = Vec::new();
        for (path, record) in liveness::list_records(&self.dir())? {
            if liveness::pid_alive(record.pid) {
                alive.push(record);
            } else {
                tracing::info!(worker_id = %record.worker_id, pid = record.pid, "Removing stale liveness record");
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(alive)
    }
}
