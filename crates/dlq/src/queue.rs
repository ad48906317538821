//! The dead-letter queue: a view over the Dead jobs of a store.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use jobq_core::{Job, JobId, JobState};
use jobq_store::JobStore;

use crate::analysis::{ErrorAnalysis, analyze_error, failure_suggestions};
use crate::error::{DlqError, DlqResult};

const TOP_ERRORS: usize = 5;
const ERROR_KEY_LEN: usize = 100;

/// Identity of a job in statistics output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub command: String,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            created_at: job.created_at,
            command: job.command.clone(),
        }
    }
}

/// Aggregate view of the dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DlqStatistics {
    pub total_jobs: usize,
    pub oldest_job: Option<JobSummary>,
    pub newest_job: Option<JobSummary>,
    /// Rounded to two decimals
    pub average_attempts: f64,
    /// First error line (truncated) with its count, most frequent first
    pub common_errors: Vec<(String, usize)>,
}

/// Post-mortem of one dead job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAnalysis {
    pub job_id: JobId,
    pub command: String,
    pub total_attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub final_error: Option<String>,
    /// Absent when the job has no recorded error
    pub error_analysis: Option<ErrorAnalysis>,
    pub suggestions: Vec<String>,
}

/// Grouping key for an error: first line, at most 100 characters.
fn error_key(error: &str) -> String {
    error
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(ERROR_KEY_LEN)
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Operations restricted to jobs in the Dead state.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue<S> {
    store: S,
}

impl<S: JobStore> DeadLetterQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn list_dead_jobs(&self, limit: Option<usize>) -> DlqResult<Vec<Job>> {
        Ok(self.store.list_jobs(Some(JobState::Dead), limit)?)
    }

    /// The job, only if it exists and is Dead.
    pub fn get_dead_job(&self, id: &JobId) -> DlqResult<Option<Job>> {
        Ok(self
            .store
            .get_job(id)?
            .filter(|job| job.state == JobState::Dead))
    }

    fn require_dead(&self, id: &JobId) -> DlqResult<Job> {
        self.get_dead_job(id)?
            .ok_or_else(|| DlqError::NotFound(id.clone()))
    }

    /// Send a dead job back to Pending, clearing its error.
    ///
    /// Fails with `NotFound` if the job left the Dead state between the read
    /// and the write (another retry got there first).
    pub fn retry_job(&self, id: &JobId, reset_attempts: bool) -> DlqResult<Job> {
        let mut job = self.require_dead(id)?;
        job.revive(reset_attempts).map_err(jobq_store::StoreError::from)?;
        if !self.store.update_job_if(&job, JobState::Dead)? {
            return Err(DlqError::NotFound(id.clone()));
        }
        info!(job_id = %id, reset_attempts, "job moved from dead-letter queue back to pending");
        Ok(job)
    }

    pub fn retry_all_jobs(&self, reset_attempts: bool) -> DlqResult<BTreeMap<JobId, bool>> {
        let results = self.for_each_dead(|id| self.retry_job(id, reset_attempts).map(|_| ()))?;
        info!(
            retried = results.values().filter(|ok| **ok).count(),
            total = results.len(),
            "retried dead-letter queue"
        );
        Ok(results)
    }

    /// Permanently delete one dead job.
    pub fn remove_job(&self, id: &JobId) -> DlqResult<()> {
        self.require_dead(id)?;
        if !self.store.delete_job_if(id, JobState::Dead)? {
            return Err(DlqError::NotFound(id.clone()));
        }
        info!(job_id = %id, "job permanently removed from dead-letter queue");
        Ok(())
    }

    pub fn clear_all(&self) -> DlqResult<BTreeMap<JobId, bool>> {
        let results = self.for_each_dead(|id| self.remove_job(id))?;
        info!(
            removed = results.values().filter(|ok| **ok).count(),
            total = results.len(),
            "cleared dead-letter queue"
        );
        Ok(results)
    }

    /// Apply `op` to every dead job, recording per-id success.
    fn for_each_dead(
        &self,
        op: impl Fn(&JobId) -> DlqResult<()>,
    ) -> DlqResult<BTreeMap<JobId, bool>> {
        let mut results = BTreeMap::new();
        for job in self.list_dead_jobs(None)? {
            let ok = match op(&job.id) {
                Ok(()) => true,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "dead-letter operation failed");
                    false
                }
            };
            results.insert(job.id, ok);
        }
        Ok(results)
    }

    pub fn statistics(&self) -> DlqResult<DlqStatistics> {
        let jobs = self.list_dead_jobs(None)?;
        if jobs.is_empty() {
            return Ok(DlqStatistics::default());
        }

        let total_attempts: u64 = jobs.iter().map(|j| u64::from(j.attempts)).sum();
        let oldest = jobs.iter().min_by_key(|j| (j.created_at, j.id.clone()));
        let newest = jobs.iter().max_by_key(|j| (j.created_at, j.id.clone()));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for error in jobs.iter().filter_map(|j| j.error.as_deref()) {
            *counts.entry(error_key(error)).or_default() += 1;
        }
        let mut common_errors: Vec<(String, usize)> = counts.into_iter().collect();
        common_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        common_errors.truncate(TOP_ERRORS);

        Ok(DlqStatistics {
            total_jobs: jobs.len(),
            oldest_job: oldest.map(JobSummary::from),
            newest_job: newest.map(JobSummary::from),
            average_attempts: round2(total_attempts as f64 / jobs.len() as f64),
            common_errors,
        })
    }

    pub fn analyze_failure(&self, id: &JobId) -> DlqResult<FailureAnalysis> {
        let job = self.require_dead(id)?;
        Ok(FailureAnalysis {
            error_analysis: job.error.as_deref().map(analyze_error),
            suggestions: failure_suggestions(&job),
            job_id: job.id,
            command: job.command,
            total_attempts: job.attempts,
            max_retries: job.max_retries,
            created_at: job.created_at,
            updated_at: job.updated_at,
            final_error: job.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use jobq_core::WorkerId;
    use jobq_store::{InMemoryJobStore, JobCounts, StoreResult};

    use super::*;
    use crate::analysis::FailureCategory;

    fn dead(command: &str, attempts: u32, error: &str) -> Job {
        let mut job = Job::new(command).with_max_retries(3);
        job.state = JobState::Dead;
        job.attempts = attempts;
        job.error = Some(error.to_string());
        job
    }

    fn queue_with(jobs: &[Job]) -> DeadLetterQueue<Arc<InMemoryJobStore>> {
        let store = InMemoryJobStore::arc();
        for job in jobs {
            store.add_job(job).unwrap();
        }
        DeadLetterQueue::new(store)
    }

    #[test]
    fn only_dead_jobs_are_visible() {
        let alive = Job::new("echo ok");
        let gone = dead("false", 3, "boom");
        let dlq = queue_with(&[alive.clone(), gone.clone()]);

        let listed = dlq.list_dead_jobs(None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, gone.id);
        assert!(dlq.get_dead_job(&alive.id).unwrap().is_none());
        assert!(matches!(
            dlq.retry_job(&alive.id, true),
            Err(DlqError::NotFound(_))
        ));
        assert!(matches!(dlq.remove_job(&alive.id), Err(DlqError::NotFound(_))));
    }

    #[test]
    fn retry_with_reset_clears_attempts_and_error() {
        let job = dead("false", 3, "boom");
        let dlq = queue_with(&[job.clone()]);

        let revived = dlq.retry_job(&job.id, true).unwrap();
        assert_eq!(revived.state, JobState::Pending);
        assert_eq!(revived.attempts, 0);
        assert!(revived.error.is_none());
        assert_eq!(dlq.store().get_job(&job.id).unwrap(), Some(revived));
    }

    #[test]
    fn retry_without_reset_keeps_attempts() {
        let job = dead("false", 3, "boom");
        let dlq = queue_with(&[job.clone()]);
        assert_eq!(dlq.retry_job(&job.id, false).unwrap().attempts, 3);
    }

    /// Store in which a job moves on right after it is read, the way it
    /// does when a concurrent retry wins and a worker then claims it.
    struct ClaimedAfterRead(InMemoryJobStore);

    impl JobStore for ClaimedAfterRead {
        fn add_job(&self, job: &Job) -> StoreResult<bool> {
            self.0.add_job(job)
        }

        fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
            let snapshot = self.0.get_job(id)?;
            if let Some(job) = &snapshot {
                let mut claimed = job.clone();
                claimed.state = JobState::Processing;
                claimed.error = None;
                self.0.update_job(&claimed)?;
            }
            Ok(snapshot)
        }

        fn update_job(&self, job: &Job) -> StoreResult<bool> {
            self.0.update_job(job)
        }

        fn update_job_if(&self, job: &Job, expected: JobState) -> StoreResult<bool> {
            self.0.update_job_if(job, expected)
        }

        fn delete_job(&self, id: &JobId) -> StoreResult<bool> {
            self.0.delete_job(id)
        }

        fn delete_job_if(&self, id: &JobId, expected: JobState) -> StoreResult<bool> {
            self.0.delete_job_if(id, expected)
        }

        fn list_jobs(&self, state: Option<JobState>, limit: Option<usize>) -> StoreResult<Vec<Job>> {
            self.0.list_jobs(state, limit)
        }

        fn job_counts(&self) -> StoreResult<JobCounts> {
            self.0.job_counts()
        }

        fn acquire_next_job(&self, worker: &WorkerId) -> StoreResult<Option<Job>> {
            self.0.acquire_next_job(worker)
        }

        fn release_lock(&self, job_id: &JobId, worker: &WorkerId) -> StoreResult<bool> {
            self.0.release_lock(job_id, worker)
        }

        fn expire_stale_locks(&self, max_age: StdDuration) -> StoreResult<usize> {
            self.0.expire_stale_locks(max_age)
        }

        fn requeue_orphaned(&self, max_age: StdDuration) -> StoreResult<Vec<JobId>> {
            self.0.requeue_orphaned(max_age)
        }

        fn purge_completed(&self, older_than: StdDuration) -> StoreResult<usize> {
            self.0.purge_completed(older_than)
        }
    }

    #[test]
    fn job_claimed_after_read_is_not_overwritten() {
        let job = dead("false", 3, "boom");
        let store = ClaimedAfterRead(InMemoryJobStore::new());
        store.add_job(&job).unwrap();
        let dlq = DeadLetterQueue::new(store);

        assert!(matches!(
            dlq.retry_job(&job.id, true),
            Err(DlqError::NotFound(_))
        ));
        assert_eq!(
            dlq.store().0.get_job(&job.id).unwrap().unwrap().state,
            JobState::Processing
        );

        let mut gone = dead("false", 3, "boom");
        gone.id = JobId::parse("second").unwrap();
        dlq.store().add_job(&gone).unwrap();
        assert!(matches!(dlq.remove_job(&gone.id), Err(DlqError::NotFound(_))));
        assert!(dlq.store().0.get_job(&gone.id).unwrap().is_some());
    }

    #[test]
    fn bulk_operations_report_per_job() {
        let a = dead("a", 1, "x");
        let b = dead("b", 2, "y");
        let dlq = queue_with(&[a.clone(), b.clone()]);

        let results = dlq.retry_all_jobs(true).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|ok| *ok));
        assert!(dlq.list_dead_jobs(None).unwrap().is_empty());

        let c = dead("c", 1, "z");
        dlq.store().add_job(&c).unwrap();
        let cleared = dlq.clear_all().unwrap();
        assert_eq!(cleared, BTreeMap::from([(c.id.clone(), true)]));
        assert!(dlq.store().get_job(&c.id).unwrap().is_none());
        assert!(dlq.store().get_job(&a.id).unwrap().is_some());
    }

    #[test]
    fn statistics_on_empty_queue() {
        let stats = queue_with(&[]).statistics().unwrap();
        assert_eq!(stats, DlqStatistics::default());
    }

    #[test]
    fn statistics_summarise_dead_jobs() {
        let mut first = dead("first", 1, "Connection refused\nat line 2");
        first.created_at = Utc::now() - Duration::hours(2);
        let mut second = dead("second", 2, "Connection refused");
        second.created_at = Utc::now() - Duration::hours(1);
        let third = dead("third", 2, &"x".repeat(150));
        let dlq = queue_with(&[first.clone(), second, third.clone()]);

        let stats = dlq.statistics().unwrap();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.average_attempts, 1.67);
        assert_eq!(stats.oldest_job.unwrap().id, first.id);
        assert_eq!(stats.newest_job.unwrap().id, third.id);
        assert_eq!(
            stats.common_errors,
            vec![
                ("Connection refused".to_string(), 2),
                ("x".repeat(100), 1),
            ]
        );
    }

    #[test]
    fn top_errors_are_capped_at_five() {
        let jobs: Vec<Job> = (0..8).map(|i| dead("cmd", 1, &format!("error {i}"))).collect();
        let stats = queue_with(&jobs).statistics().unwrap();
        assert_eq!(stats.common_errors.len(), 5);
        assert_eq!(stats.common_errors[0], ("error 0".to_string(), 1));
    }

    #[test]
    fn analysis_of_permission_failure() {
        let job = dead("cat /etc/shadow", 3, "Permission denied");
        let dlq = queue_with(&[job.clone()]);

        let analysis = dlq.analyze_failure(&job.id).unwrap();
        let error = analysis.error_analysis.unwrap();
        assert_eq!(error.error_type, FailureCategory::PermissionDenied);
        assert!(!error.is_retryable);
        assert!(
            analysis
                .suggestions
                .iter()
                .any(|s| s.contains("permissions"))
        );
        assert_eq!(analysis.total_attempts, 3);
    }
}
