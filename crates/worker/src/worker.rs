//! The per-process execution loop.

use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use jobq_core::{Job, JobId, WorkerId};
use jobq_store::{JobStore, QueueConfig, StoreResult};

use crate::executor::{CommandExecutor, ShellExecutor};
use crate::signals::ShutdownSignal;

/// Worker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Idle sleep when no job is available
    pub poll_interval: Duration,
    /// Command bound for jobs without their own timeout
    pub default_timeout: Duration,
    pub backoff_base: f64,
    /// Upper bound on a single backoff wait
    pub max_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            default_timeout: config.worker_timeout(),
            backoff_base: config.backoff_base,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl WorkerSettings {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = cap;
        self
    }

    /// Wait before `job` (just failed) goes back to Pending.
    pub fn backoff_for(&self, job: &Job) -> Duration {
        let secs = job.retry_delay(self.backoff_base);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// What happened to one acquired job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Failed and returned to Pending
    Retried,
    /// Failed with retries exhausted
    Dead,
}

/// Counters for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Completed => self.succeeded += 1,
            Outcome::Retried => {
                self.failed += 1;
                self.retried += 1;
            }
            Outcome::Dead => {
                self.failed += 1;
                self.dead_lettered += 1;
            }
        }
    }
}

/// Releases the lease when dropped, on every exit path including panics.
struct LeaseGuard<'a, S: JobStore> {
    store: &'a S,
    job_id: JobId,
    worker: &'a WorkerId,
}

impl<S: JobStore> Drop for LeaseGuard<'_, S> {
    fn drop(&mut self) {
        match self.store.release_lock(&self.job_id, self.worker) {
            Ok(true) => debug!(job_id = %self.job_id, worker = %self.worker, "lease released"),
            Ok(false) => {
                warn!(job_id = %self.job_id, worker = %self.worker, "lease already gone at release")
            }
            Err(e) => {
                error!(job_id = %self.job_id, worker = %self.worker, error = %e, "failed to release lease")
            }
        }
    }
}

/// Drives jobs from one store handle, one at a time.
pub struct Worker<S, E = ShellExecutor> {
    id: WorkerId,
    store: S,
    executor: E,
    settings: WorkerSettings,
    shutdown: ShutdownSignal,
}

impl<S: JobStore, E: CommandExecutor> Worker<S, E> {
    pub fn new(id: WorkerId, store: S, executor: E, settings: WorkerSettings) -> Self {
        Self {
            id,
            store,
            executor,
            settings,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Use an externally owned shutdown flag (e.g. one wired to signals).
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested.
    ///
    /// The flag is checked between jobs only; a running command is never
    /// interrupted by it. Store errors are logged and the loop carries on.
    pub fn run(&self) -> WorkerStats {
        info!(worker = %self.id, "worker started");
        let mut stats = WorkerStats::default();

        while !self.shutdown.is_requested() {
            match self.process_next() {
                Ok(Some(outcome)) => stats.record(outcome),
                Ok(None) => {
                    self.shutdown.sleep(self.settings.poll_interval);
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "job processing failed");
                    self.shutdown.sleep(self.settings.poll_interval);
                }
            }
        }

        info!(
            worker = %self.id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            "worker stopped"
        );
        stats
    }

    /// Acquire and drive one job. `None` when the queue has nothing pending.
    pub fn process_next(&self) -> StoreResult<Option<Outcome>> {
        let Some(mut job) = self.store.acquire_next_job(&self.id)? else {
            return Ok(None);
        };
        let _lease = LeaseGuard {
            store: &self.store,
            job_id: job.id.clone(),
            worker: &self.id,
        };

        job.begin_attempt();
        self.persist(&job)?;
        info!(worker = %self.id, job_id = %job.id, attempt = job.attempts, "processing job");

        let timeout = job
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_timeout);

        let outcome = match self.executor.execute(&job.command, timeout) {
            Ok(out) if out.success() => {
                job.complete(out.stdout.trim())?;
                self.persist(&job)?;
                info!(worker = %self.id, job_id = %job.id, "job completed");
                Outcome::Completed
            }
            Ok(out) => self.handle_failure(&mut job, out.failure_message())?,
            Err(e) => self.handle_failure(&mut job, e.to_string())?,
        };
        Ok(Some(outcome))
    }

    fn handle_failure(&self, job: &mut Job, error: String) -> StoreResult<Outcome> {
        job.fail(error)?;
        self.persist(job)?;

        if !job.should_retry() {
            job.bury()?;
            self.persist(job)?;
            warn!(
                worker = %self.id,
                job_id = %job.id,
                attempts = job.attempts,
                error = job.error.as_deref().unwrap_or_default(),
                "retries exhausted, job moved to dead-letter queue"
            );
            return Ok(Outcome::Dead);
        }

        let delay = self.settings.backoff_for(job);
        info!(
            worker = %self.id,
            job_id = %job.id,
            attempt = job.attempts,
            delay = ?delay,
            "job failed, retrying after backoff"
        );
        if self.shutdown.sleep(delay) {
            debug!(job_id = %job.id, "backoff cut short by shutdown");
        }
        job.requeue()?;
        self.persist(job)?;
        Ok(Outcome::Retried)
    }

    fn persist(&self, job: &Job) -> StoreResult<()> {
        if !self.store.update_job(job)? {
            warn!(worker = %self.id, job_id = %job.id, "job vanished from the store while running");
        }
        Ok(())
    }
}

impl<S, E> Worker<S, E>
where
    S: JobStore + 'static,
    E: CommandExecutor + 'static,
{
    /// Run on a background thread.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let shutdown = self.shutdown.clone();
        let join = thread::Builder::new()
            .name(self.id.to_string())
            .spawn(move || self.run())?;
        Ok(WorkerHandle {
            shutdown,
            join: Some(join),
        })
    }
}

/// Handle to a worker running on a thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: ShutdownSignal,
    join: Option<thread::JoinHandle<WorkerStats>>,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request a stop and wait for the current job to finish.
    pub fn shutdown(mut self) -> WorkerStats {
        self.shutdown.request();
        self.join
            .take()
            .and_then(|j| j.join().ok())
            .unwrap_or_default()
    }
}
