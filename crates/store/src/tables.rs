//! In-memory shape of the jobs and locks tables, and the operations on them.
//!
//! Both store implementations load these, mutate them with the functions
//! below, and (for the file store) write them back. Keeping the logic here
//! means the file and in-memory stores cannot drift apart.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use jobq_core::{Job, JobId, JobResult, JobState, WorkerId, decode_job, encode_job};

use crate::store::JobCounts;

/// Dispatch order: priority descending, then oldest first, then id.
pub(crate) fn dispatch_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Job id -> raw stored record.
///
/// Records stay as raw JSON until read so that one undecodable record is
/// reported and skipped, and survives rewrites untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct JobTable(BTreeMap<String, Value>);

impl JobTable {
    pub(crate) fn get(&self, id: &JobId) -> Option<JobResult<Job>> {
        self.0.get(id.as_str()).map(decode_job)
    }

    /// Insert a new record. `false` if the id is taken.
    pub(crate) fn insert(&mut self, job: &Job) -> JobResult<bool> {
        if self.0.contains_key(job.id.as_str()) {
            return Ok(false);
        }
        self.0.insert(job.id.to_string(), encode_job(job)?);
        Ok(true)
    }

    /// Overwrite an existing record. `false` if the id is absent.
    pub(crate) fn replace(&mut self, job: &Job) -> JobResult<bool> {
        match self.0.get_mut(job.id.as_str()) {
            Some(slot) => {
                *slot = encode_job(job)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Overwrite a record only while it is still in `expected`.
    pub(crate) fn replace_if(&mut self, job: &Job, expected: JobState) -> JobResult<bool> {
        if !self.is_in(&job.id, expected) {
            return Ok(false);
        }
        self.replace(job)
    }

    pub(crate) fn remove(&mut self, id: &JobId) -> bool {
        self.0.remove(id.as_str()).is_some()
    }

    /// Remove a record only while it is in `expected`.
    pub(crate) fn remove_if(&mut self, id: &JobId, expected: JobState) -> bool {
        self.is_in(id, expected) && self.remove(id)
    }

    fn is_in(&self, id: &JobId, expected: JobState) -> bool {
        matches!(self.get(id), Some(Ok(job)) if job.state == expected)
    }

    fn decoded(&self) -> impl Iterator<Item = Job> + '_ {
        self.0.iter().filter_map(|(key, value)| match decode_job(value) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(job_id = %key, error = %e, "skipping undecodable job record");
                None
            }
        })
    }

    /// Jobs matching `state` (all when `None`) in dispatch order.
    pub(crate) fn list(&self, state: Option<JobState>, limit: Option<usize>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .decoded()
            .filter(|job| state.is_none_or(|s| job.state == s))
            .collect();
        jobs.sort_by(dispatch_order);
        if let Some(limit) = limit {
            jobs.truncate(limit);
        }
        jobs
    }

    pub(crate) fn counts(&self) -> JobCounts {
        let mut counts: JobCounts = JobState::ALL.into_iter().map(|s| (s, 0)).collect();
        for job in self.decoded() {
            *counts.entry(job.state).or_default() += 1;
        }
        counts
    }
}

/// Time-bounded ownership of a job by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        age(self.acquired_at, now) > ttl
    }
}

/// Job id -> lease.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct LeaseTable(BTreeMap<String, Lease>);

impl LeaseTable {
    pub(crate) fn get(&self, id: &JobId) -> Option<&Lease> {
        self.0.get(id.as_str())
    }

    pub(crate) fn is_held(&self, id: &JobId, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.get(id).is_some_and(|lease| !lease.is_expired(ttl, now))
    }

    pub(crate) fn grant(&mut self, id: &JobId, owner: &WorkerId, now: DateTime<Utc>) {
        self.0.insert(
            id.to_string(),
            Lease {
                owner: owner.clone(),
                acquired_at: now,
            },
        );
    }

    /// Drop the lease only if `owner` holds it.
    pub(crate) fn release(&mut self, id: &JobId, owner: &WorkerId) -> bool {
        match self.0.get(id.as_str()) {
            Some(lease) if &lease.owner == owner => {
                self.0.remove(id.as_str());
                true
            }
            _ => false,
        }
    }

    /// Drop every lease older than `max_age`, whoever owns it.
    pub(crate) fn expire(&mut self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let before = self.0.len();
        self.0.retain(|_, lease| !lease.is_expired(max_age, now));
        before - self.0.len()
    }
}

/// Pick the next dispatchable Pending job, claim it and lease it to `worker`.
///
/// A Pending job whose lease is still live is skipped; an expired lease is
/// simply replaced.
pub(crate) fn acquire_next(
    jobs: &mut JobTable,
    leases: &mut LeaseTable,
    worker: &WorkerId,
    lease_ttl: Duration,
    now: DateTime<Utc>,
) -> JobResult<Option<Job>> {
    let candidate = jobs
        .list(Some(JobState::Pending), None)
        .into_iter()
        .find(|job| !leases.is_held(&job.id, lease_ttl, now));

    let Some(mut job) = candidate else {
        return Ok(None);
    };

    job.claim()?;
    leases.grant(&job.id, worker, now);
    jobs.replace(&job)?;
    Ok(Some(job))
}

/// Return Processing jobs without a lease, untouched for `max_age`, to Pending.
pub(crate) fn requeue_orphaned(
    jobs: &mut JobTable,
    leases: &LeaseTable,
    max_age: Duration,
    now: DateTime<Utc>,
) -> JobResult<Vec<JobId>> {
    let mut requeued = Vec::new();
    for mut job in jobs.list(Some(JobState::Processing), None) {
        if leases.get(&job.id).is_some() || age(job.updated_at, now) <= max_age {
            continue;
        }
        job.release_orphan()?;
        jobs.replace(&job)?;
        requeued.push(job.id);
    }
    Ok(requeued)
}

/// Delete Completed jobs last updated more than `older_than` ago.
pub(crate) fn purge_completed(
    jobs: &mut JobTable,
    older_than: Duration,
    now: DateTime<Utc>,
) -> usize {
    let stale: Vec<JobId> = jobs
        .list(Some(JobState::Completed), None)
        .into_iter()
        .filter(|job| age(job.updated_at, now) > older_than)
        .map(|job| job.id)
        .collect();
    for id in &stale {
        jobs.remove(id);
    }
    stale.len()
}
