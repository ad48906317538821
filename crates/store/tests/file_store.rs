use std::collections::HashSet;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use jobq_core::{Job, JobId, JobState, WorkerId};
use jobq_store::{FileJobStore, JobStore, LockOptions, StoreError, StoreOptions};

fn fast_options() -> StoreOptions {
    StoreOptions {
        lock: LockOptions {
            timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(2),
        },
        lease_ttl: Duration::from_secs(300),
    }
}

fn open(dir: &tempfile::TempDir) -> FileJobStore {
    FileJobStore::open_with(dir.path(), fast_options()).unwrap()
}

#[test]
fn add_then_get_returns_identical_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let mut job = Job::new("echo hello")
        .with_id(JobId::parse("job-1").unwrap())
        .with_max_retries(5)
        .with_timeout(30)
        .with_priority(-2);
    job.output = Some("previous".into());

    assert!(store.add_job(&job).unwrap());
    assert_eq!(store.get_job(&job.id).unwrap(), Some(job.clone()));

    // Visible to a second handle (another process would see the same file).
    let other = open(&dir);
    assert_eq!(other.get_job(&job.id).unwrap(), Some(job));
}

#[test]
fn duplicate_add_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = Job::new("true");

    assert!(store.add_job(&job).unwrap());
    assert!(!store.add_job(&job.clone().with_priority(9)).unwrap());
    assert_eq!(store.get_job(&job.id).unwrap().unwrap().priority, 0);
}

#[test]
fn update_is_full_replace_and_delete_is_permanent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let mut job = Job::new("true");
    job.error = Some("old".into());
    store.add_job(&job).unwrap();

    job.error = None;
    job.priority = 4;
    assert!(store.update_job(&job).unwrap());
    let stored = store.get_job(&job.id).unwrap().unwrap();
    assert!(stored.error.is_none());
    assert_eq!(stored.priority, 4);

    assert!(store.delete_job(&job.id).unwrap());
    assert!(!store.delete_job(&job.id).unwrap());
    assert!(!store.update_job(&job).unwrap());
    assert!(store.get_job(&job.id).unwrap().is_none());
}

#[test]
fn counts_on_empty_store_list_all_states() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let counts = store.job_counts().unwrap();
    assert_eq!(counts.len(), 5);
    for state in JobState::ALL {
        assert_eq!(counts[&state], 0);
    }
}

#[test]
fn higher_priority_dispatches_first_then_oldest() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let a = Job::new("a").with_priority(0);
    let mut b = Job::new("b").with_priority(10);
    b.created_at = a.created_at + ChronoDuration::seconds(1);
    b.updated_at = b.created_at;
    store.add_job(&a).unwrap();
    store.add_job(&b).unwrap();

    let worker = WorkerId::new("w");
    assert_eq!(store.acquire_next_job(&worker).unwrap().unwrap().id, b.id);
    assert_eq!(store.acquire_next_job(&worker).unwrap().unwrap().id, a.id);
    assert!(store.acquire_next_job(&worker).unwrap().is_none());
}

#[test]
fn list_filters_sorts_and_limits() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let base = Utc::now();

    for (i, priority) in [1, 5, 1, 3].into_iter().enumerate() {
        let mut job = Job::new(format!("job {i}")).with_priority(priority);
        job.created_at = base + ChronoDuration::seconds(i as i64);
        store.add_job(&job).unwrap();
    }
    let mut done = Job::new("done");
    done.state = JobState::Completed;
    store.add_job(&done).unwrap();

    let pending = store.list_jobs(Some(JobState::Pending), None).unwrap();
    let commands: Vec<_> = pending.iter().map(|j| j.command.as_str()).collect();
    assert_eq!(commands, vec!["job 1", "job 3", "job 0", "job 2"]);

    assert_eq!(store.list_jobs(None, Some(2)).unwrap().len(), 2);
    assert_eq!(
        store.list_jobs(Some(JobState::Completed), None).unwrap()[0].id,
        done.id
    );
}

#[test]
fn acquisition_leases_and_release_requires_owner() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = Job::new("true");
    store.add_job(&job).unwrap();

    let owner = WorkerId::new("owner");
    let claimed = store.acquire_next_job(&owner).unwrap().unwrap();
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(
        store.get_job(&job.id).unwrap().unwrap().state,
        JobState::Processing
    );
    assert_eq!(store.lease(&job.id).unwrap().owner, owner);

    assert!(!store.release_lock(&job.id, &WorkerId::new("intruder")).unwrap());
    assert!(store.lease(&job.id).is_some());
    assert!(store.release_lock(&job.id, &owner).unwrap());
    assert!(store.lease(&job.id).is_none());
}

#[test]
fn expiring_leases_leaves_job_state_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = Job::new("true");
    store.add_job(&job).unwrap();
    store.acquire_next_job(&WorkerId::new("w")).unwrap();

    assert_eq!(store.expire_stale_locks(Duration::from_secs(60)).unwrap(), 0);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(store.expire_stale_locks(Duration::from_millis(5)).unwrap(), 1);

    assert!(store.lease(&job.id).is_none());
    assert_eq!(
        store.get_job(&job.id).unwrap().unwrap().state,
        JobState::Processing
    );
}

#[test]
fn orphaned_processing_job_can_be_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = Job::new("true");
    store.add_job(&job).unwrap();
    store.acquire_next_job(&WorkerId::new("crashed")).unwrap();

    // Still leased: nothing to recover.
    assert!(store.requeue_orphaned(Duration::ZERO).unwrap().is_empty());

    thread::sleep(Duration::from_millis(20));
    store.expire_stale_locks(Duration::from_millis(5)).unwrap();
    assert_eq!(
        store.requeue_orphaned(Duration::from_millis(5)).unwrap(),
        vec![job.id.clone()]
    );
    let recovered = store.get_job(&job.id).unwrap().unwrap();
    assert_eq!(recovered.state, JobState::Pending);
}

#[test]
fn purge_removes_only_old_completed_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let mut old = Job::new("old");
    old.state = JobState::Completed;
    old.updated_at = Utc::now() - ChronoDuration::hours(48);
    let mut recent = Job::new("recent");
    recent.state = JobState::Completed;
    let pending = Job::new("pending");
    for job in [&old, &recent, &pending] {
        store.add_job(job).unwrap();
    }

    assert_eq!(store.purge_completed(Duration::from_secs(24 * 3600)).unwrap(), 1);
    assert!(store.get_job(&old.id).unwrap().is_none());
    assert!(store.get_job(&recent.id).unwrap().is_some());
    assert!(store.get_job(&pending.id).unwrap().is_some());
}

#[test]
fn concurrent_acquirers_never_share_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let seed = open(&dir);
    let total = 60;
    for i in 0..total {
        seed.add_job(&Job::new(format!("job {i}")).with_priority(i % 3))
            .unwrap();
    }

    let path = Arc::new(dir.path().to_path_buf());
    let handles: Vec<_> = (0..6)
        .map(|n| {
            let path = path.clone();
            thread::spawn(move || {
                // Each thread has its own handle, like a separate worker process.
                let store = FileJobStore::open_with(path.as_path(), fast_options()).unwrap();
                let worker = WorkerId::new(format!("w{n}"));
                let mut got = Vec::new();
                while let Some(job) = store.acquire_next_job(&worker).unwrap() {
                    got.push(job.id);
                }
                got
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "job dispatched twice");
        }
    }
    assert_eq!(seen.len(), total as usize);
    assert_eq!(seed.job_counts().unwrap()[&JobState::Processing], total as usize);
}

#[test]
fn writes_leave_no_partial_or_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    for i in 0..10 {
        store.add_job(&Job::new(format!("job {i}"))).unwrap();
    }

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["jobs.json", "locks.json"]);

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("jobs.json")).unwrap()).unwrap();
    assert_eq!(raw.as_object().unwrap().len(), 10);
}

#[test]
fn corrupt_jobs_file_reads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    std::fs::write(dir.path().join("jobs.json"), b"not json").unwrap();

    assert!(store.list_jobs(None, None).unwrap().is_empty());
    assert!(store.add_job(&Job::new("fresh")).unwrap());
    assert!(dir.path().join("jobs.json.corrupt").exists());
}

#[test]
fn unknown_state_tag_is_reported_on_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = Job::new("true");
    store.add_job(&job).unwrap();

    let path = dir.path().join("jobs.json");
    let mut raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    raw[job.id.as_str()]["state"] = serde_json::json!("zombie");
    std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

    assert!(matches!(store.get_job(&job.id), Err(StoreError::Job(_))));
    assert!(store.list_jobs(None, None).unwrap().is_empty());
}

#[test]
fn held_table_lock_times_out_writers() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileJobStore::open_with(
        dir.path(),
        StoreOptions {
            lock: LockOptions {
                timeout: Duration::from_millis(50),
                poll_interval: Duration::from_millis(5),
            },
            ..StoreOptions::default()
        },
    )
    .unwrap();

    // Another running process holds the jobs table.
    let mut holder = Command::new("sleep").arg("30").spawn().unwrap();
    std::fs::write(
        dir.path().join("jobs.json.lock"),
        format!("{}\n", holder.id()),
    )
    .unwrap();
    let result = store.add_job(&Job::new("true"));
    holder.kill().unwrap();
    holder.wait().unwrap();
    assert!(matches!(result, Err(StoreError::LockTimeout { .. })));

    std::fs::remove_file(dir.path().join("jobs.json.lock")).unwrap();
    assert!(store.add_job(&Job::new("true")).unwrap());
}

#[test]
fn table_lock_of_killed_process_does_not_wedge_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    store.add_job(&Job::new("echo queued")).unwrap();

    // A worker killed while holding both tables.
    let mut crashed = Command::new("true").spawn().unwrap();
    let pid = crashed.id();
    crashed.wait().unwrap();
    for table in ["jobs.json.lock", "locks.json.lock"] {
        std::fs::write(dir.path().join(table), format!("{pid}\n")).unwrap();
    }

    let claimed = store
        .acquire_next_job(&WorkerId::new("w1"))
        .unwrap()
        .expect("queued job is dispatchable");
    assert_eq!(claimed.command, "echo queued");
    assert!(!dir.path().join("jobs.json.lock").exists());
    assert!(!dir.path().join("locks.json.lock").exists());
}
