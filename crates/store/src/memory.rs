//! In-memory job store for tests/dev.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use jobq_core::{Job, JobId, JobState, WorkerId};

use crate::error::{StoreError, StoreResult};
use crate::store::{JobCounts, JobStore};
use crate::tables::{self, JobTable, LeaseTable};

#[derive(Debug, Default)]
struct Tables {
    jobs: JobTable,
    leases: LeaseTable,
}

/// Same semantics as [`crate::FileJobStore`], without the filesystem.
///
/// Only shareable inside one process; workers in separate processes need the
/// file store.
#[derive(Debug)]
pub struct InMemoryJobStore {
    tables: Mutex<Tables>,
    lease_ttl: Duration,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_lease_ttl(Duration::from_secs(300))
    }

    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            lease_ttl,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn add_job(&self, job: &Job) -> StoreResult<bool> {
        Ok(self.tables()?.jobs.insert(job)?)
    }

    fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.tables()?.jobs.get(id).transpose()?)
    }

    fn update_job(&self, job: &Job) -> StoreResult<bool> {
        Ok(self.tables()?.jobs.replace(job)?)
    }

    fn update_job_if(&self, job: &Job, expected: JobState) -> StoreResult<bool> {
        Ok(self.tables()?.jobs.replace_if(job, expected)?)
    }

    fn delete_job(&self, id: &JobId) -> StoreResult<bool> {
        Ok(self.tables()?.jobs.remove(id))
    }

    fn delete_job_if(&self, id: &JobId, expected: JobState) -> StoreResult<bool> {
        Ok(self.tables()?.jobs.remove_if(id, expected))
    }

    fn list_jobs(&self, state: Option<JobState>, limit: Option<usize>) -> StoreResult<Vec<Job>> {
        Ok(self.tables()?.jobs.list(state, limit))
    }

    fn job_counts(&self) -> StoreResult<JobCounts> {
        Ok(self.tables()?.jobs.counts())
    }

    fn acquire_next_job(&self, worker: &WorkerId) -> StoreResult<Option<Job>> {
        let mut guard = self.tables()?;
        let Tables { jobs, leases } = &mut *guard;
        Ok(tables::acquire_next(
            jobs,
            leases,
            worker,
            self.lease_ttl,
            Utc::now(),
        )?)
    }

    fn release_lock(&self, job_id: &JobId, worker: &WorkerId) -> StoreResult<bool> {
        Ok(self.tables()?.leases.release(job_id, worker))
    }

    fn expire_stale_locks(&self, max_age: Duration) -> StoreResult<usize> {
        Ok(self.tables()?.leases.expire(max_age, Utc::now()))
    }

    fn requeue_orphaned(&self, max_age: Duration) -> StoreResult<Vec<JobId>> {
        let mut guard = self.tables()?;
        let Tables { jobs, leases } = &mut *guard;
        Ok(tables::requeue_orphaned(jobs, leases, max_age, Utc::now())?)
    }

    fn purge_completed(&self, older_than: Duration) -> StoreResult<usize> {
        Ok(tables::purge_completed(
            &mut self.tables()?.jobs,
            older_than,
            Utc::now(),
        ))
    }
}
