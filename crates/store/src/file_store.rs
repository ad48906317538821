//! File-backed job store shared by worker processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use jobq_core::{Job, JobId, JobState, WorkerId};

use crate::atomic::{read_table, write_table};
use crate::error::{StoreError, StoreResult};
use crate::file_lock::{FileLock, LockOptions};
use crate::store::{JobCounts, JobStore};
use crate::tables::{self, JobTable, LeaseTable};

pub const JOBS_FILE: &str = "jobs.json";
pub const LOCKS_FILE: &str = "locks.json";

/// Tuning for a [`FileJobStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Cross-process table lock wait bound and poll interval
    pub lock: LockOptions,
    /// Age after which a lease no longer blocks acquisition
    pub lease_ttl: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock: LockOptions::default(),
            lease_ttl: Duration::from_secs(300),
        }
    }
}

/// Crash-safe job store in a local directory.
///
/// Reads go straight to the current file (renames make every file a complete
/// snapshot). Mutations hold the in-process mutex and the table's file lock
/// for the whole read-modify-write. When both tables are involved the jobs
/// lock is always taken before the locks lock.
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
    jobs_path: PathBuf,
    locks_path: PathBuf,
    options: StoreOptions,
    local: Mutex<()>,
}

impl FileJobStore {
    /// Open (creating if needed) a store with default options.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open_with(dir, StoreOptions::default())
    }

    /// Open (creating if needed) a store.
    ///
    /// Fails only if the directory cannot be created or the tables cannot be
    /// initialised.
    pub fn open_with(dir: impl Into<PathBuf>, options: StoreOptions) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let store = Self {
            jobs_path: dir.join(JOBS_FILE),
            locks_path: dir.join(LOCKS_FILE),
            dir,
            options,
            local: Mutex::new(()),
        };

        for path in [&store.jobs_path, &store.locks_path] {
            if !path.exists() {
                let _guard = FileLock::acquire(path, &store.options.lock)?;
                if !path.exists() {
                    write_table(path, &JobTable::default())?;
                }
            }
        }

        debug!(dir = %store.dir.display(), "opened job store");
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Run `f` holding the process mutex and the file locks for `paths`, in order.
    fn exclusive<R>(&self, paths: &[&Path], f: impl FnOnce() -> StoreResult<R>) -> StoreResult<R> {
        let _local = self.local.lock().map_err(|_| StoreError::Poisoned)?;
        let _guards = paths
            .iter()
            .map(|path| FileLock::acquire(path, &self.options.lock))
            .collect::<StoreResult<Vec<_>>>()?;
        f()
    }

    fn read_jobs(&self) -> JobTable {
        read_table(&self.jobs_path)
    }

    fn read_leases(&self) -> LeaseTable {
        read_table(&self.locks_path)
    }

    /// Read-modify-write on the jobs table; written back only when `f` says so.
    fn mutate_jobs<R>(&self, f: impl FnOnce(&mut JobTable) -> StoreResult<(R, bool)>) -> StoreResult<R> {
        self.exclusive(&[&self.jobs_path], || {
            let mut jobs = self.read_jobs();
            let (result, dirty) = f(&mut jobs)?;
            if dirty {
                write_table(&self.jobs_path, &jobs)?;
            }
            Ok(result)
        })
    }

    fn mutate_leases<R>(
        &self,
        f: impl FnOnce(&mut LeaseTable) -> StoreResult<(R, bool)>,
    ) -> StoreResult<R> {
        self.exclusive(&[&self.locks_path], || {
            let mut leases = self.read_leases();
            let (result, dirty) = f(&mut leases)?;
            if dirty {
                write_table(&self.locks_path, &leases)?;
            }
            Ok(result)
        })
    }

    /// Current lease on a job, if any.
    pub fn lease(&self, job_id: &JobId) -> Option<tables::Lease> {
        self.read_leases().get(job_id).cloned()
    }
}

impl JobStore for FileJobStore {
    fn add_job(&self, job: &Job) -> StoreResult<bool> {
        let added = self.mutate_jobs(|jobs| {
            let added = jobs.insert(job)?;
            Ok((added, added))
        })?;
        if added {
            debug!(job_id = %job.id, "job added");
        }
        Ok(added)
    }

    fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.read_jobs().get(id).transpose()?)
    }

    fn update_job(&self, job: &Job) -> StoreResult<bool> {
        self.mutate_jobs(|jobs| {
            let replaced = jobs.replace(job)?;
            Ok((replaced, replaced))
        })
    }

    fn update_job_if(&self, job: &Job, expected: JobState) -> StoreResult<bool> {
        self.mutate_jobs(|jobs| {
            let replaced = jobs.replace_if(job, expected)?;
            Ok((replaced, replaced))
        })
    }

    fn delete_job(&self, id: &JobId) -> StoreResult<bool> {
        self.mutate_jobs(|jobs| {
            let removed = jobs.remove(id);
            Ok((removed, removed))
        })
    }

    fn delete_job_if(&self, id: &JobId, expected: JobState) -> StoreResult<bool> {
        self.mutate_jobs(|jobs| {
            let removed = jobs.remove_if(id, expected);
            Ok((removed, removed))
        })
    }

    fn list_jobs(&self, state: Option<JobState>, limit: Option<usize>) -> StoreResult<Vec<Job>> {
        Ok(self.read_jobs().list(state, limit))
    }

    fn job_counts(&self) -> StoreResult<JobCounts> {
        Ok(self.read_jobs().counts())
    }

    fn acquire_next_job(&self, worker: &WorkerId) -> StoreResult<Option<Job>> {
        let claimed = self.exclusive(&[&self.jobs_path, &self.locks_path], || {
            let mut jobs = self.read_jobs();
            let mut leases = self.read_leases();

            let claimed = tables::acquire_next(
                &mut jobs,
                &mut leases,
                worker,
                self.options.lease_ttl,
                Utc::now(),
            )?;

            if claimed.is_some() {
                // Lease first: a crash in between leaves a leased Pending job,
                // which becomes dispatchable again once the lease expires.
                write_table(&self.locks_path, &leases)?;
                write_table(&self.jobs_path, &jobs)?;
            }
            Ok(claimed)
        })?;

        if let Some(job) = &claimed {
            debug!(job_id = %job.id, worker = %worker, "job acquired");
        }
        Ok(claimed)
    }

    fn release_lock(&self, job_id: &JobId, worker: &WorkerId) -> StoreResult<bool> {
        self.mutate_leases(|leases| {
            let released = leases.release(job_id, worker);
            Ok((released, released))
        })
    }

    fn expire_stale_locks(&self, max_age: Duration) -> StoreResult<usize> {
        let expired = self.mutate_leases(|leases| {
            let expired = leases.expire(max_age, Utc::now());
            Ok((expired, expired > 0))
        })?;
        if expired > 0 {
            info!(expired, "expired stale job leases");
        }
        Ok(expired)
    }

    fn requeue_orphaned(&self, max_age: Duration) -> StoreResult<Vec<JobId>> {
        let requeued = self.exclusive(&[&self.jobs_path, &self.locks_path], || {
            let mut jobs = self.read_jobs();
            let leases = self.read_leases();
            let requeued = tables::requeue_orphaned(&mut jobs, &leases, max_age, Utc::now())?;
            if !requeued.is_empty() {
                write_table(&self.jobs_path, &jobs)?;
            }
            Ok(requeued)
        })?;
        for id in &requeued {
            info!(job_id = %id, "requeued orphaned job");
        }
        Ok(requeued)
    }

    fn purge_completed(&self, older_than: Duration) -> StoreResult<usize> {
        let purged = self.mutate_jobs(|jobs| {
            let purged = tables::purge_completed(jobs, older_than, Utc::now());
            Ok((purged, purged > 0))
        })?;
        if purged > 0 {
            info!(purged, "purged completed jobs");
        }
        Ok(purged)
    }
}
