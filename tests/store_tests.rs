
use chrono::{Duration as ChronoDuration, Utc};

use queuectl::error::QueueError;
use queuectl::job::{Job, JobState};
use queuectl::store::Store;
use test_harness::{job_created_at, open_store};

#[test]
fn insert_and_get_roundtrip() {
    let (_dir, store) = open_store();
    let job = Job::new("j1".to_string(), "echo hello".to_string(), 3, Utc::now());
    store.insert_job(&job).unwrap();

    let loaded = store.get("j1").unwrap().unwrap();
    assert_eq!(loaded.id, "j1");
    assert_eq!(loaded.command, "echo hello");
    assert_eq!(loaded.state, JobState::Pending);
    assert_eq!(loaded.attempts, 0);
    assert_eq!(loaded.max_retries, 3);
    assert!(loaded.next_retry_at.is_none());
    assert!(loaded.claimed_by.is_none());

    assert!(store.get("nope").unwrap().is_none());
}

#[test]
fn duplicate_id_is_a_conflict() {
    let (_dir, store) = open_store();
    let job = Job::new("j1".to_string(), "true".to_string(), 3, Utc::now());
    store.insert_job(&job).unwrap();

    let err = store.insert_job(&job).unwrap_err();
    assert!(matches!(err, QueueError::Conflict(id) if id == "j1"));
}

#[test]
fn claim_marks_processing_and_assigns_owner() {
    let (_dir, store) = open_store();
    let job = Job::new("j1".to_string(), "true".to_string(), 3, Utc::now());
    store.insert_job(&job).unwrap();

    let claimed = store.atomic_claim("worker-a", Utc::now()).unwrap().unwrap();
    assert_eq!(claimed.id, "j1");
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.claimed_by.as_deref(), Some("worker-a"));
    assert!(claimed.next_retry_at.is_none());

    // Nothing left to claim
    assert!(store.atomic_claim("worker-b", Utc::now()).unwrap().is_none());
}

#[test]
fn claim_on_empty_store_returns_none() {
    let (_dir, store) = open_store();
    assert!(store.atomic_claim("worker-a", Utc::now()).unwrap().is_none());
}

#[test]
fn claim_is_fifo_by_created_at() {
    let (_dir, store) = open_store();
    let base = Utc::now();
    // Inserted out of creation order on purpose
    for (id, offset) in [("third", 2), ("first", 0), ("second", 1)] {
        store
            .insert_job(&job_created_at(
                id,
                "true",
                base + ChronoDuration::seconds(offset),
            ))
            .unwrap();
    }

    let order: Vec<String> = (0..3)
        .map(|_| store.atomic_claim("w", Utc::now()).unwrap().unwrap().id)
        .collect();
    assert_eq!(order, ["first", "second", "third"]);
}

#[test]
fn future_retry_deadline_hides_job_from_claim() {
    let (_dir, store) = open_store();
    let now = Utc::now();
    let mut job = Job::new("j1".to_string(), "true".to_string(), 3, now);
    job.next_retry_at = Some(now + ChronoDuration::seconds(30));
    store.insert_job(&job).unwrap();

    assert!(store.atomic_claim("w", now).unwrap().is_none());

    // Visible once the wall clock reaches the deadline
    let later = now + ChronoDuration::seconds(31);
    let claimed = store.atomic_claim("w", later).unwrap().unwrap();
    assert_eq!(claimed.id, "j1");
    assert!(claimed.next_retry_at.is_none());
}

#[test]
fn eligibility_and_order_combine() {
    let (_dir, store) = open_store();
    let now = Utc::now();
    // Older job is backing off; younger job must win despite FIFO.
    let mut backing_off = job_created_at("older", "true", now - ChronoDuration::seconds(60));
    backing_off.next_retry_at = Some(now + ChronoDuration::seconds(60));
    store.insert_job(&backing_off).unwrap();
    store.insert_job(&job_created_at("younger", "true", now)).unwrap();

    let claimed = store.atomic_claim("w", now).unwrap().unwrap();
    assert_eq!(claimed.id, "younger");
}

#[test]
fn complete_requires_processing() {
    let (_dir, store) = open_store();
    store
        .insert_job(&Job::new("j1".to_string(), "true".to_string(), 3, Utc::now()))
        .unwrap();

    let err = store.complete("j1", Utc::now()).unwrap_err();
    assert!(matches!(
        err,
        QueueError::IllegalTransition {
            actual: JobState::Pending,
            ..
        }
    ));

    store.atomic_claim("w", Utc::now()).unwrap().unwrap();
    store.complete("j1", Utc::now()).unwrap();
    let job = store.get("j1").unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.claimed_by.is_none());
}

#[test]
fn transitions_on_missing_jobs_are_not_found() {
    let (_dir, store) = open_store();
    assert!(matches!(
        store.complete("ghost", Utc::now()),
        Err(QueueError::JobNotFound(_))
    ));
    assert!(matches!(
        store.fail_dead("ghost", "boom", Utc::now()),
        Err(QueueError::JobNotFound(_))
    ));
}

#[test]
fn fail_retry_returns_job_to_pending_with_deadline() {
    let (_dir, store) = open_store();
    store
        .insert_job(&Job::new("j1".to_string(), "false".to_string(), 3, Utc::now()))
        .unwrap();
    store.atomic_claim("w", Utc::now()).unwrap().unwrap();

    let now = Utc::now();
    let deadline = now + ChronoDuration::seconds(2);
    store.fail_retry("j1", deadline, "exit code 1", now).unwrap();

    let job = store.get("j1").unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.claimed_by.is_none());
    assert_eq!(job.error_message.as_deref(), Some("exit code 1"));
    assert!(job.next_retry_at.is_some());
}

#[test]
fn fail_dead_is_terminal() {
    let (_dir, store) = open_store();
    store
        .insert_job(&Job::new("j1".to_string(), "false".to_string(), 0, Utc::now()))
        .unwrap();
    store.atomic_claim("w", Utc::now()).unwrap().unwrap();
    store.fail_dead("j1", "boom", Utc::now()).unwrap();

    let job = store.get("j1").unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 1);
    assert!(job.claimed_by.is_none());

    // Dead jobs are invisible to claim and refuse further transitions
    assert!(store.atomic_claim("w", Utc::now()).unwrap().is_none());
    assert!(matches!(
        store.complete("j1", Utc::now()),
        Err(QueueError::IllegalTransition { .. })
    ));
}

#[test]
fn revive_distinguishes_not_found_from_not_in_dlq() {
    let (_dir, store) = open_store();
    assert!(matches!(
        store.revive("ghost", Utc::now()),
        Err(QueueError::JobNotFound(_))
    ));

    store
        .insert_job(&Job::new("j1".to_string(), "true".to_string(), 3, Utc::now()))
        .unwrap();
    assert!(matches!(
        store.revive("j1", Utc::now()),
        Err(QueueError::NotInDlq {
            state: JobState::Pending,
            ..
        })
    ));
}

#[test]
fn revive_resets_retry_bookkeeping() {
    let (_dir, store) = open_store();
    store
        .insert_job(&Job::new("j1".to_string(), "false".to_string(), 0, Utc::now()))
        .unwrap();
    store.atomic_claim("w", Utc::now()).unwrap().unwrap();
    store.fail_dead("j1", "boom", Utc::now()).unwrap();

    let revived = store.revive("j1", Utc::now()).unwrap();
    assert_eq!(revived.state, JobState::Pending);
    assert_eq!(revived.attempts, 0);
    assert!(revived.next_retry_at.is_none());
    assert!(revived.error_message.is_none());
    assert!(revived.claimed_by.is_none());
    // The command is immutable across revival
    assert_eq!(revived.command, "false");
}

#[test]
fn reset_stuck_retries_or_buries_per_budget() {
    let (_dir, store) = open_store();
    let long_ago = Utc::now() - ChronoDuration::hours(2);

    store
        .insert_job(&Job::new("has-budget".to_string(), "true".to_string(), 3, long_ago))
        .unwrap();
    store
        .insert_job(&Job::new("spent".to_string(), "true".to_string(), 0, long_ago))
        .unwrap();
    store.atomic_claim("w1", long_ago).unwrap().unwrap();
    store.atomic_claim("w2", long_ago).unwrap().unwrap();

    // A fresh claim must survive the sweep untouched
    store
        .insert_job(&Job::new("fresh".to_string(), "true".to_string(), 3, Utc::now()))
        .unwrap();
    store.atomic_claim("w3", Utc::now()).unwrap().unwrap();

    let now = Utc::now();
    let swept = store.reset_stuck(now - ChronoDuration::hours(1), now).unwrap();
    assert_eq!(swept, 2);

    let retried = store.get("has-budget").unwrap().unwrap();
    assert_eq!(retried.state, JobState::Pending);
    assert_eq!(retried.attempts, 1);
    assert!(retried.next_retry_at.is_some());
    assert_eq!(retried.error_message.as_deref(), Some("stuck beyond threshold"));

    let buried = store.get("spent").unwrap().unwrap();
    assert_eq!(buried.state, JobState::Dead);
    assert_eq!(buried.attempts, 1);

    let fresh = store.get("fresh").unwrap().unwrap();
    assert_eq!(fresh.state, JobState::Processing);
    assert_eq!(fresh.claimed_by.as_deref(), Some("w3"));
}

#[test]
fn list_filters_by_state() {
    let (_dir, store) = open_store();
    let base = Utc::now();
    for i in 0..3 {
        store
            .insert_job(&job_created_at(
                &format!("j{i}"),
                "true",
                base + ChronoDuration::seconds(i),
            ))
            .unwrap();
    }
    store.atomic_claim("w", Utc::now()).unwrap().unwrap();

    assert_eq!(store.list(None, None).unwrap().len(), 3);
    assert_eq!(store.list(Some(JobState::Pending), None).unwrap().len(), 2);
    assert_eq!(store.list(Some(JobState::Processing), None).unwrap().len(), 1);
    assert_eq!(store.list(Some(JobState::Dead), None).unwrap().len(), 0);
    assert_eq!(store.list(None, Some(2)).unwrap().len(), 2);
}

#[test]
fn counts_group_by_state() {
    let (_dir, store) = open_store();
    let base = Utc::now();
    for i in 0..4 {
        store
            .insert_job(&job_created_at(
                &format!("j{i}"),
                "true",
                base + ChronoDuration::seconds(i),
            ))
            .unwrap();
    }
    store.atomic_claim("w", Utc::now()).unwrap().unwrap();

    let counts = store.counts_by_state().unwrap();
    assert_eq!(counts.get(&JobState::Pending), Some(&3));
    assert_eq!(counts.get(&JobState::Processing), Some(&1));
    assert_eq!(counts.get(&JobState::Completed), None);
}

#[test]
fn config_defaults_are_seeded_and_settable() {
    let (_dir, store) = open_store();
    assert_eq!(store.config_get("max-retries").unwrap().as_deref(), Some("3"));
    assert_eq!(store.config_get("backoff-base").unwrap().as_deref(), Some("2"));

    store.config_set("max-retries", "5").unwrap();
    assert_eq!(store.config_get("max-retries").unwrap().as_deref(), Some("5"));

    let all = store.config_all().unwrap();
    assert_eq!(all.len(), 4);
}

#[test]
fn store_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("queuectl.db");
    {
        let store = Store::open(&path).unwrap();
        store
            .insert_job(&Job::new("j5".to_string(), "true".to_string(), 3, Utc::now()))
            .unwrap();
        store.config_set("backoff-base", "4").unwrap();
    }

    let store = Store::open(&path).unwrap();
    let job = store.get("j5").unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(store.config_get("backoff-base").unwrap().as_deref(), Some("4"));
}

#[test]
fn concurrent_claimers_receive_disjoint_jobs() {
    let (dir, store) = open_store();
    let base = Utc::now();
    for i in 0..20 {
        store
            .insert_job(&job_created_at(
                &format!("job-{i:02}"),
                "true",
                base + ChronoDuration::microseconds(i),
            ))
            .unwrap();
    }

    let path = dir.path().join("queuectl.db");
    let handles: Vec<_> = (0..4)
        .map(|w| {
            let path = path.clone();
            std::thread::spawn(move || {
                // Each claimer gets its own connection, like a real worker process
                let store = Store::open(&path).unwrap();
                let worker = format!("worker-{w}");
                let mut claimed = Vec::new();
                while let Some(job) = store.atomic_claim(&worker, Utc::now()).unwrap() {
                    claimed.push(job.id);
                }
                claimed
            })
        })
        .collect();

    let mut all: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(all.len(), 20);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 20, "no job may be claimed twice");
}
