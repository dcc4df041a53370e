//! SQLite persistence for jobs and config.
//!
//! Every state-mutating operation runs inside an IMMEDIATE transaction and
//! re-checks the job's current state before writing, so concurrent worker
//! processes coordinate through the database alone. The connection is opened
//! with WAL journaling and a busy timeout so write contention shows up as
//! latency rather than errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};

use crate::config;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobState};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, \
     created_at, updated_at, next_retry_at, error_message, claimed_by";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    command       TEXT NOT NULL,
    state         TEXT NOT NULL DEFAULT 'pending',
    attempts      INTEGER NOT NULL DEFAULT 0,
    max_retries   INTEGER NOT NULL DEFAULT 3,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    next_retry_at TEXT,
    error_message TEXT,
    claimed_by    TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_next_retry_at ON jobs(next_retry_at);
CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Timestamps are persisted as fixed-width RFC 3339 text: lexicographic
/// order in SQL must match chronological order.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> chrono::ParseResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn invalid_column(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let state_raw: String = row.get(2)?;
    let state = JobState::from_str(&state_raw).map_err(|e| invalid_column(2, e))?;
    let created_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;
    let next_retry_raw: Option<String> = row.get(7)?;
    let next_retry_at = match next_retry_raw {
        Some(s) => Some(parse_ts(&s).map_err(|e| invalid_column(7, e))?),
        None => None,
    };
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state,
        attempts: row.get::<_, i64>(3)? as u32,
        max_retries: row.get::<_, i64>(4)? as u32,
        created_at: parse_ts(&created_raw).map_err(|e| invalid_column(5, e))?,
        updated_at: parse_ts(&updated_raw).map_err(|e| invalid_column(6, e))?,
        next_retry_at,
        error_message: row.get(8)?,
        claimed_by: row.get(9)?,
    })
}

fn job_state(tx: &Transaction<'_>, id: &str) -> Result<JobState> {
    let raw: Option<String> = tx
        .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        None => Err(QueueError::JobNotFound(id.to_string())),
        Some(s) => JobState::from_str(&s),
    }
}

#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        let store = Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Path of the database file; liveness records live beside it.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Internal("store mutex poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        for (key, value) in config::DEFAULTS {
            conn.execute(
                "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        Ok(())
    }

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        let res = conn.execute(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, \
             created_at, updated_at, next_retry_at, error_message, claimed_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id,
                job.command,
                job.state.as_str(),
                job.attempts,
                job.max_retries,
                fmt_ts(job.created_at),
                fmt_ts(job.updated_at),
                job.next_retry_at.map(fmt_ts),
                job.error_message,
                job.claimed_by,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(QueueError::Conflict(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Select-one-and-mark-processing, atomically.
    ///
    /// Picks the claim-eligible row with the earliest `created_at` (rowid
    /// breaks ties) and flips it to `processing` in the same transaction.
    /// The update is guarded on `state = 'pending'`; zero affected rows means
    /// another claimer won the race and the selection is retried.
    pub fn atomic_claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut conn = self.lock()?;
        let now_s = fmt_ts(now);
        loop {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let candidate: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs \
                     WHERE state = 'pending' \
                       AND (next_retry_at IS NULL OR next_retry_at <= ?1) \
                     ORDER BY created_at ASC, rowid ASC \
                     LIMIT 1",
                    params![now_s],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = candidate else {
                return Ok(None);
            };
            let updated = tx.execute(
                "UPDATE jobs SET state = 'processing', claimed_by = ?1, \
                 next_retry_at = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND state = 'pending'",
                params![worker_id, now_s, id],
            )?;
            if updated == 0 {
                tx.rollback()?;
                continue;
            }
            let job = tx.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )?;
            tx.commit()?;
            return Ok(Some(job));
        }
    }

    pub fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_state(&tx, id, JobState::Processing)?;
        tx.execute(
            "UPDATE jobs SET state = 'completed', claimed_by = NULL, \
             attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
            params![fmt_ts(now), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn fail_retry(
        &self,
        id: &str,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_state(&tx, id, JobState::Processing)?;
        tx.execute(
            "UPDATE jobs SET state = 'pending', claimed_by = NULL, \
             attempts = attempts + 1, next_retry_at = ?1, error_message = ?2, \
             updated_at = ?3 WHERE id = ?4",
            params![fmt_ts(next_retry_at), error, fmt_ts(now), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn fail_dead(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_state(&tx, id, JobState::Processing)?;
        tx.execute(
            "UPDATE jobs SET state = 'dead', claimed_by = NULL, \
             attempts = attempts + 1, next_retry_at = NULL, error_message = ?1, \
             updated_at = ?2 WHERE id = ?3",
            params![error, fmt_ts(now), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Re-admit a dead job: back to `pending` with a fresh retry budget.
    pub fn revive(&self, id: &str, now: DateTime<Utc>) -> Result<Job> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let state = job_state(&tx, id)?;
        if state != JobState::Dead {
            return Err(QueueError::NotInDlq {
                id: id.to_string(),
                state,
            });
        }
        tx.execute(
            "UPDATE jobs SET state = 'pending', attempts = 0, next_retry_at = NULL, \
             error_message = NULL, claimed_by = NULL, updated_at = ?1 WHERE id = ?2",
            params![fmt_ts(now), id],
        )?;
        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            row_to_job,
        )?;
        tx.commit()?;
        Ok(job)
    }

    /// Recover jobs whose worker died or hung: every `processing` row not
    /// touched since `older_than` takes the same branch as a reported
    /// failure, so crashed-worker recovery costs the job one attempt.
    pub fn reset_stuck(&self, older_than: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let backoff_base = config_backoff_base(&tx)?;
        let stuck: Vec<(String, u32, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, attempts, max_retries FROM jobs \
                 WHERE state = 'processing' AND updated_at < ?1",
            )?;
            let rows = stmt.query_map(params![fmt_ts(older_than)], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)? as u32,
                    r.get::<_, i64>(2)? as u32,
                ))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (id, attempts, max_retries) in &stuck {
            let failed_attempts = attempts + 1;
            if failed_attempts <= *max_retries {
                let delay = backoff_delay(backoff_base, failed_attempts);
                tx.execute(
                    "UPDATE jobs SET state = 'pending', claimed_by = NULL, \
                     attempts = ?1, next_retry_at = ?2, error_message = ?3, \
                     updated_at = ?4 WHERE id = ?5",
                    params![
                        failed_attempts,
                        fmt_ts(now + delay),
                        STUCK_ERROR,
                        fmt_ts(now),
                        id
                    ],
                )?;
            } else {
                tx.execute(
                    "UPDATE jobs SET state = 'dead', claimed_by = NULL, \
                     attempts = ?1, next_retry_at = NULL, error_message = ?2, \
                     updated_at = ?3 WHERE id = ?4",
                    params![failed_attempts, STUCK_ERROR, fmt_ts(now), id],
                )?;
            }
        }
        tx.commit()?;
        Ok(stuck.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs, newest first, optionally filtered by state.
    pub fn list(&self, state: Option<JobState>, limit: Option<usize>) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let jobs = match state {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![s.as_str(), limit], row_to_job)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], row_to_job)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(jobs)
    }

    pub fn counts_by_state(&self) -> Result<BTreeMap<JobState, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (state_raw, n) = row?;
            counts.insert(JobState::from_str(&state_raw)?, n as u64);
        }
        Ok(counts)
    }

    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn config_all(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

const STUCK_ERROR: &str = "stuck beyond threshold";

fn require_state(tx: &Transaction<'_>, id: &str, expected: JobState) -> Result<()> {
    let actual = job_state(tx, id)?;
    if actual != expected {
        return Err(QueueError::IllegalTransition {
            id: id.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn config_backoff_base(tx: &Transaction<'_>) -> Result<u32> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![config::KEY_BACKOFF_BASE],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(config::DEFAULT_BACKOFF_BASE),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| QueueError::InvalidConfigValue {
                key: config::KEY_BACKOFF_BASE.to_string(),
                reason: format!("not an integer: {v}"),
            }),
    }
}

/// `base ^ attempts` seconds, saturating instead of overflowing.
pub(crate) fn backoff_delay(base: u32, attempts: u32) -> chrono::Duration {
    let secs = (base as i64)
        .checked_pow(attempts)
        .unwrap_or(i64::MAX / 2_000);
    chrono::Duration::seconds(secs.min(i64::MAX / 2_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_roundtrip_and_sort_lexicographically() {
        let early = parse_ts("2026-01-02T03:04:05.123456Z").unwrap();
        let late = early + chrono::Duration::microseconds(1500);
        let (a, b) = (fmt_ts(early), fmt_ts(late));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_ts(&a).unwrap(), early);
    }

    #[test]
    fn backoff_delay_is_exponential() {
        assert_eq!(backoff_delay(2, 1), chrono::Duration::seconds(2));
        assert_eq!(backoff_delay(2, 2), chrono::Duration::seconds(4));
        assert_eq!(backoff_delay(2, 3), chrono::Duration::seconds(8));
        assert_eq!(backoff_delay(3, 2), chrono::Duration::seconds(9));
    }

    #[test]
    fn backoff_delay_saturates() {
        let big = backoff_delay(10, 64);
        assert!(big > chrono::Duration::days(365));
    }
}
