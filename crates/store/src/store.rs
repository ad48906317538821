//! Job store abstraction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jobq_core::{Job, JobId, JobState, WorkerId};

use crate::error::StoreResult;

/// Count per state. All five states are always present.
pub type JobCounts = BTreeMap<JobState, usize>;

/// Job store contract.
///
/// Every operation is synchronous and atomic with respect to every other
/// caller, in this process or another one sharing the same store.
pub trait JobStore: Send + Sync {
    /// Persist a new job. `Ok(false)` if the id already exists.
    fn add_job(&self, job: &Job) -> StoreResult<bool>;

    /// Fetch a copy of a job.
    fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>>;

    /// Replace the stored record wholesale. `Ok(false)` if the id is absent.
    fn update_job(&self, job: &Job) -> StoreResult<bool>;

    /// Replace the stored record only while it is still in `expected`,
    /// checked and written in one exclusive step. `Ok(false)` if the id is
    /// absent or the job has moved on.
    fn update_job_if(&self, job: &Job, expected: JobState) -> StoreResult<bool>;

    /// Permanently remove a job. `Ok(false)` if the id is absent.
    fn delete_job(&self, id: &JobId) -> StoreResult<bool>;

    /// Remove a job only while it is in `expected`.
    fn delete_job_if(&self, id: &JobId, expected: JobState) -> StoreResult<bool>;

    /// Jobs in `state` (all when `None`), priority descending then oldest
    /// first, truncated to `limit`.
    fn list_jobs(&self, state: Option<JobState>, limit: Option<usize>) -> StoreResult<Vec<Job>>;

    /// Count of jobs per state.
    fn job_counts(&self) -> StoreResult<JobCounts>;

    /// Claim the next Pending job for `worker`, moving it to Processing and
    /// leasing it. `None` if nothing is dispatchable. Two concurrent callers
    /// never receive the same job.
    fn acquire_next_job(&self, worker: &WorkerId) -> StoreResult<Option<Job>>;

    /// Release `worker`'s lease on a job. `Ok(false)` if it does not hold it.
    fn release_lock(&self, job_id: &JobId, worker: &WorkerId) -> StoreResult<bool>;

    /// Drop leases older than `max_age`, whoever owns them. Job records are
    /// not touched. Returns how many were dropped.
    fn expire_stale_locks(&self, max_age: Duration) -> StoreResult<usize>;

    /// Return Processing jobs that hold no lease and were last updated more
    /// than `max_age` ago to Pending.
    fn requeue_orphaned(&self, max_age: Duration) -> StoreResult<Vec<JobId>>;

    /// Delete Completed jobs last updated more than `older_than` ago.
    fn purge_completed(&self, older_than: Duration) -> StoreResult<usize>;
}

// Shared handles (`Arc<S>`, `&S`) are stores too.
macro_rules! forward_job_store {
    ($($ty:ty),+) => {$(
        impl<S: JobStore + ?Sized> JobStore for $ty {
            fn add_job(&self, job: &Job) -> StoreResult<bool> {
                (**self).add_job(job)
            }

            fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
                (**self).get_job(id)
            }

            fn update_job(&self, job: &Job) -> StoreResult<bool> {
                (**self).update_job(job)
            }

            fn update_job_if(&self, job: &Job, expected: JobState) -> StoreResult<bool> {
                (**self).update_job_if(job, expected)
            }

            fn delete_job(&self, id: &JobId) -> StoreResult<bool> {
                (**self).delete_job(id)
            }

            fn delete_job_if(&self, id: &JobId, expected: JobState) -> StoreResult<bool> {
                (**self).delete_job_if(id, expected)
            }

            fn list_jobs(&self, state: Option<JobState>, limit: Option<usize>) -> StoreResult<Vec<Job>> {
                (**self).list_jobs(state, limit)
            }

            fn job_counts(&self) -> StoreResult<JobCounts> {
                (**self).job_counts()
            }

            fn acquire_next_job(&self, worker: &WorkerId) -> StoreResult<Option<Job>> {
                (**self).acquire_next_job(worker)
            }

            fn release_lock(&self, job_id: &JobId, worker: &WorkerId) -> StoreResult<bool> {
                (**self).release_lock(job_id, worker)
            }

            fn expire_stale_locks(&self, max_age: Duration) -> StoreResult<usize> {
                (**self).expire_stale_locks(max_age)
            }

            fn requeue_orphaned(&self, max_age: Duration) -> StoreResult<Vec<JobId>> {
                (**self).requeue_orphaned(max_age)
            }

            fn purge_completed(&self, older_than: Duration) -> StoreResult<usize> {
                (**self).purge_completed(older_than)
            }
        }
    )+};
}

forward_job_store!(Arc<S>, &S);
