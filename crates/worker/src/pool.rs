//! Worker processes as a unit: start, find again, stop.
//!
//! Every worker is its own OS process with its own store handle. The pids of
//! a started set go to `<storage>/workers.pid` (one per line) so that any
//! later process can probe or stop them.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use jobq_core::WorkerId;
use jobq_store::{ConfigStore, FileJobStore, LockOptions, StoreOptions, pid_alive};

use crate::error::PoolError;
use crate::executor::ShellExecutor;
use crate::signals::{ShutdownSignal, install_process_handlers};
use crate::worker::{Worker, WorkerSettings, WorkerStats};

pub const PID_FILE: &str = "workers.pid";
pub const LOG_DIR: &str = "logs";

/// Grace period after forced termination before the unconditional kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// Gap between two stop signals so the kernel does not merge them.
const SIGNAL_GAP: Duration = Duration::from_millis(100);
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: kill(2) only sends a signal.
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

/// One worker process as seen by this pool.
#[derive(Debug)]
struct Tracked {
    id: Option<WorkerId>,
    pid: u32,
    /// Present when this process started the worker, so it can be reaped
    child: Option<Child>,
    signalled: bool,
}

impl Tracked {
    fn is_alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => pid_alive(self.pid),
        }
    }

    fn signal(&mut self, signal: libc::c_int) {
        if self.is_alive() && !send_signal(self.pid, signal) {
            debug!(pid = self.pid, signal, "signal not delivered");
        }
        self.signalled = true;
    }

    /// Poll until the process is gone or `deadline` passes.
    fn wait_until(&mut self, deadline: Instant) -> bool {
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(PROBE_INTERVAL);
        }
    }

    fn label(&self) -> String {
        match &self.id {
            Some(id) => id.to_string(),
            None => format!("pid {}", self.pid),
        }
    }
}

/// Point-in-time view of one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    /// Known only to the process that started the worker
    pub worker_id: Option<WorkerId>,
    pub pid: u32,
    pub alive: bool,
}

/// How a stop went, per worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Exited on the first stop signal within the timeout
    pub graceful: usize,
    /// Needed forced termination
    pub terminated: usize,
    /// Needed SIGKILL
    pub killed: usize,
}

type Launcher = Box<dyn Fn(&WorkerId, &Path) -> Command + Send + Sync>;

/// Starts, tracks and stops worker processes for one storage directory.
pub struct WorkerPool {
    dir: PathBuf,
    launcher: Launcher,
    workers: Vec<Tracked>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("dir", &self.dir)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Pool whose workers run `program [args..] --storage-dir <dir> worker run --worker-id <id>`.
    pub fn new(dir: impl Into<PathBuf>, program: impl Into<OsString>) -> Self {
        let program = program.into();
        Self::with_launcher(dir, move |id, dir| {
            let mut cmd = Command::new(&program);
            cmd.arg("--storage-dir")
                .arg(dir)
                .args(["worker", "run", "--worker-id", id.as_str()]);
            cmd
        })
    }

    /// Pool that re-executes the current binary as its workers.
    pub fn for_current_exe(dir: impl Into<PathBuf>) -> Result<Self, PoolError> {
        let exe = std::env::current_exe().map_err(|e| PoolError::io("current executable", e))?;
        Ok(Self::new(dir, exe))
    }

    /// Pool with a custom command builder for each worker.
    pub fn with_launcher<F>(dir: impl Into<PathBuf>, launcher: F) -> Self
    where
        F: Fn(&WorkerId, &Path) -> Command + Send + Sync + 'static,
    {
        Self {
            dir: dir.into(),
            launcher: Box::new(launcher),
            workers: Vec::new(),
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    /// Live worker pids recorded in `dir`'s discovery file.
    pub fn running_workers(dir: &Path) -> Vec<u32> {
        read_pids(&dir.join(PID_FILE))
            .into_iter()
            .filter(|pid| pid_alive(*pid))
            .collect()
    }

    /// Spawn `count` worker processes; returns their ids.
    ///
    /// Each worker logs to `<dir>/logs/<worker-id>.log` and runs in its own
    /// process group, so terminal signals aimed at the caller do not reach it.
    pub fn start_workers(&mut self, count: usize) -> Result<Vec<WorkerId>, PoolError> {
        let log_dir = self.dir.join(LOG_DIR);
        fs::create_dir_all(&log_dir).map_err(|e| PoolError::io(&log_dir, e))?;

        let started_at = Utc::now().timestamp();
        let offset = self.workers.len();
        let mut started = Vec::with_capacity(count);

        for index in 0..count {
            let id = WorkerId::for_batch(started_at, offset + index);
            let log_path = log_dir.join(format!("{id}.log"));
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .map_err(|e| PoolError::io(&log_path, e))?;
            let log_err = log.try_clone().map_err(|e| PoolError::io(&log_path, e))?;

            let child = (self.launcher)(&id, &self.dir)
                .stdin(Stdio::null())
                .stdout(log)
                .stderr(log_err)
                .process_group(0)
                .spawn()
                .map_err(|source| PoolError::Spawn {
                    worker: id.clone(),
                    source,
                })?;

            info!(worker = %id, pid = child.id(), "started worker");
            self.workers.push(Tracked {
                id: Some(id.clone()),
                pid: child.id(),
                child: Some(child),
                signalled: false,
            });
            started.push(id);
        }

        self.write_pid_file()?;
        Ok(started)
    }

    /// Track workers listed in the discovery file that this pool did not start.
    fn adopt(&mut self) {
        let known: Vec<u32> = self.workers.iter().map(|w| w.pid).collect();
        for pid in Self::running_workers(&self.dir) {
            if !known.contains(&pid) {
                self.workers.push(Tracked {
                    id: None,
                    pid,
                    child: None,
                    signalled: false,
                });
            }
        }
    }

    /// Stop every worker, escalating as needed, and clear the discovery file.
    ///
    /// Graceful: one SIGTERM each (finish the current job), wait up to
    /// `timeout` overall, then force the stragglers. Forced termination is a
    /// second SIGTERM, which makes a worker exit at once; anything still
    /// alive after a short grace period gets SIGKILL.
    pub fn stop_workers(&mut self, graceful: bool, timeout: Duration) -> Result<StopReport, PoolError> {
        self.adopt();
        let mut report = StopReport::default();

        if self.workers.is_empty() {
            info!("no workers to stop");
            self.remove_pid_file()?;
            return Ok(report);
        }
        info!(count = self.workers.len(), graceful, "stopping workers");

        if graceful {
            for worker in &mut self.workers {
                worker.signal(libc::SIGTERM);
            }
            let deadline = Instant::now() + timeout;
            for worker in &mut self.workers {
                if worker.wait_until(deadline) {
                    report.graceful += 1;
                }
            }
        }

        let mut stragglers: Vec<&mut Tracked> = self
            .workers
            .iter_mut()
            .filter_map(|w| if w.is_alive() { Some(w) } else { None })
            .collect();

        for worker in &mut stragglers {
            warn!(worker = %worker.label(), pid = worker.pid, "worker did not stop gracefully, terminating");
            if !worker.signalled {
                worker.signal(libc::SIGTERM);
                thread::sleep(SIGNAL_GAP);
            }
            worker.signal(libc::SIGTERM);
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        for worker in &mut stragglers {
            if worker.wait_until(deadline) {
                report.terminated += 1;
                continue;
            }
            error!(worker = %worker.label(), pid = worker.pid, "worker ignored termination, killing");
            worker.signal(libc::SIGKILL);
            if let Some(child) = &mut worker.child {
                let _ = child.wait();
            } else {
                worker.wait_until(Instant::now() + TERMINATE_GRACE);
            }
            report.killed += 1;
        }

        // Reap anything that exited on its own along the way.
        for worker in &mut self.workers {
            if let Some(child) = &mut worker.child {
                let _ = child.try_wait();
            }
        }

        self.workers.clear();
        self.remove_pid_file()?;
        info!(
            graceful = report.graceful,
            terminated = report.terminated,
            killed = report.killed,
            "all workers stopped"
        );
        Ok(report)
    }

    /// Status of every known worker, including ones found via the discovery file.
    pub fn status(&mut self) -> Vec<WorkerStatus> {
        self.adopt();
        self.workers
            .iter_mut()
            .map(|w| WorkerStatus {
                worker_id: w.id.clone(),
                pid: w.pid,
                alive: w.is_alive(),
            })
            .collect()
    }

    /// Forget workers that have exited and rewrite the discovery file.
    pub fn cleanup_dead_workers(&mut self) -> Result<usize, PoolError> {
        let before = self.workers.len();
        self.workers.retain_mut(|w| w.is_alive());
        let removed = before - self.workers.len();
        if removed > 0 {
            info!(removed, "removed dead workers");
            self.write_pid_file()?;
        }
        Ok(removed)
    }

    /// Record live pids, keeping any from other pools on the same directory.
    fn write_pid_file(&mut self) -> Result<(), PoolError> {
        let mut pids = Self::running_workers(&self.dir);
        for worker in &mut self.workers {
            if worker.is_alive() && !pids.contains(&worker.pid) {
                pids.push(worker.pid);
            }
        }

        let path = self.pid_file();
        let body: String = pids.iter().map(|pid| format!("{pid}\n")).collect();
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| PoolError::io(&self.dir, e))?;
        tmp.write_all(body.as_bytes())
            .map_err(|e| PoolError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| PoolError::io(&path, e.error))?;
        debug!(path = %path.display(), count = pids.len(), "discovery file updated");
        Ok(())
    }

    fn remove_pid_file(&self) -> Result<(), PoolError> {
        let path = self.pid_file();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PoolError::io(&path, e)),
        }
    }
}

fn read_pids(path: &Path) -> Vec<u32> {
    match fs::read_to_string(path) {
        Ok(raw) => raw
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                let parsed = line.parse().ok();
                if parsed.is_none() {
                    warn!(path = %path.display(), line, "ignoring malformed pid");
                }
                parsed
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read discovery file");
            Vec::new()
        }
    }
}

/// Body of a worker process: open the store, wire signals, run until stopped.
///
/// Fails only when the storage directory or signal handlers cannot be set up.
pub fn run_worker_process(dir: &Path, worker_id: WorkerId) -> Result<WorkerStats, PoolError> {
    let config = ConfigStore::open(dir, LockOptions::default())?.load();
    let store = FileJobStore::open_with(
        dir,
        StoreOptions {
            lease_ttl: config.lease_ttl(),
            ..StoreOptions::default()
        },
    )?;

    let shutdown = ShutdownSignal::new();
    install_process_handlers(&shutdown)?;

    let worker = Worker::new(
        worker_id,
        store,
        ShellExecutor::default(),
        WorkerSettings::from(&config),
    )
    .with_shutdown(shutdown);
    Ok(worker.run())
}
