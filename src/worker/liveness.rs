//! Filesystem liveness records: one PID file per live worker.
//!
//! Records live beside the store file so supervision keeps working even while
//! the database is locked. A record whose PID is no longer resident is stale;
//! readers garbage-collect it and leave the job it owned to the stuck sweep.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const PID_FILE_PREFIX: &str = "queuectl_worker_";
pub const PID_FILE_SUFFIX: &str = ".pid";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

pub fn record_path(dir: &Path, worker_id: &str) -> PathBuf {
    dir.join(format!("{PID_FILE_PREFIX}{worker_id}{PID_FILE_SUFFIX}"))
}

/// Write this process's record. Called once per worker at startup.
pub fn write_record(dir: &Path, worker_id: &str) -> Result<PathBuf> {
    let record = WorkerRecord {
        worker_id: worker_id.to_string(),
        pid: std::process::id(),
        started_at: Utc::now(),
    };
    let path = record_path(dir, worker_id);
    std::fs::write(&path, serde_json::to_string(&record)?)?;
    Ok(path)
}

pub fn read_record(path: &Path) -> Result<WorkerRecord> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn remove_record(dir: &Path, worker_id: &str) {
    let path = record_path(dir, worker_id);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove liveness record");
        }
    }
}

/// All records in `dir`, unreadable ones skipped with a warning.
pub fn list_records(dir: &Path) -> Result<Vec<(PathBuf, WorkerRecord)>> {
    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(PID_FILE_PREFIX) || !name.ends_with(PID_FILE_SUFFIX) {
            continue;
        }
        match read_record(&path) {
            Ok(record) => records.push((path, record)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable liveness record");
            }
        }
    }
    records.sort_by(|a, b| a.1.started_at.cmp(&b.1.started_at));
    Ok(records)
}

/// Whether `pid` is resident. EPERM still means resident.
pub fn pid_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = write_record(dir.path(), "w1").unwrap();
        let record = read_record(&path).unwrap();
        assert_eq!(record.worker_id, "w1");
        assert_eq!(record.pid, std::process::id());
    }

    #[test]
    fn list_finds_only_worker_records() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), "w1").unwrap();
        write_record(dir.path(), "w2").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        let records = list_records(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), "w1").unwrap();
        remove_record(dir.path(), "w1");
        remove_record(dir.path(), "w1");
        assert!(list_records(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_not_alive() {
        // PID values above the kernel default pid_max
        assert!(!pid_alive(4_999_999));
    }
}
