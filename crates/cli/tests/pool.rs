//! End-to-end: the real `jobq` binary starting and stopping worker processes.

use std::path::Path;
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use jobq_core::{JobId, JobState};
use jobq_store::{FileJobStore, JobStore};
use jobq_worker::WorkerPool;

fn jobq(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jobq"))
        .arg("--storage-dir")
        .arg(dir)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn ok(output: Output) -> String {
    assert!(
        output.status.success(),
        "jobq failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

fn wait_for(store: &FileJobStore, state: JobState, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while store.job_counts().unwrap()[&state] < count {
        assert!(Instant::now() < deadline, "timed out waiting for {count} {state} job(s)");
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn workers_drain_the_queue_and_stop_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path();

    ok(jobq(path, &["enqueue", r#"{"id": "ok-1", "command": "echo one"}"#]));
    ok(jobq(path, &["enqueue", r#"{"id": "ok-2", "command": "echo two", "priority": 5}"#]));
    ok(jobq(
        path,
        &["enqueue", r#"{"id": "bad", "command": "echo nope >&2; exit 1", "max_retries": 1}"#],
    ));

    let started = ok(jobq(path, &["worker", "start", "--count", "2"]));
    assert_eq!(started.matches("Started worker-").count(), 2);
    assert_eq!(WorkerPool::running_workers(path).len(), 2);

    let store = FileJobStore::open(path).unwrap();
    wait_for(&store, JobState::Completed, 2);
    wait_for(&store, JobState::Dead, 1);

    let two = store.get_job(&JobId::parse("ok-2").unwrap()).unwrap().unwrap();
    assert_eq!(two.output.as_deref(), Some("two"));
    let bad = store.get_job(&JobId::parse("bad").unwrap()).unwrap().unwrap();
    assert_eq!(bad.error.as_deref(), Some("nope"));
    assert_eq!(bad.attempts, 1);

    let stopped = ok(jobq(path, &["worker", "stop", "--timeout", "10"]));
    assert!(stopped.contains("2 graceful"), "{stopped}");
    assert!(WorkerPool::running_workers(path).is_empty());
    assert!(!path.join("workers.pid").exists());

    let logs: Vec<_> = std::fs::read_dir(path.join("logs")).unwrap().collect();
    assert_eq!(logs.len(), 2);
}

#[test]
fn dlq_commands_round_trip_through_the_binary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path();
    ok(jobq(
        path,
        &["enqueue", r#"{"id": "perm", "command": "echo 'Permission denied' >&2; exit 1", "max_retries": 0}"#],
    ));

    ok(jobq(path, &["worker", "start"]));
    let store = FileJobStore::open(path).unwrap();
    wait_for(&store, JobState::Dead, 1);
    ok(jobq(path, &["worker", "stop", "--force"]));

    let analysis = ok(jobq(path, &["dlq", "analyze", "perm"]));
    assert!(analysis.contains("permission_denied"));

    ok(jobq(path, &["dlq", "retry", "perm"]));
    let revived = store.get_job(&JobId::parse("perm").unwrap()).unwrap().unwrap();
    assert_eq!(revived.state, JobState::Pending);
    assert!(revived.error.is_none());
}

#[test]
fn stop_without_workers_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let out = ok(jobq(dir.path(), &["worker", "stop"]));
    assert!(out.contains("0 graceful"));
}

#[test]
fn invalid_job_is_rejected_with_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let output = jobq(dir.path(), &["enqueue", r#"{"command": "   "}"#]);
    assert!(!output.status.success());
}
