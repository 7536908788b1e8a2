//! Job queue abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use super::types::{DeadLetterEntry, Job, JobId, JobStatus, NewJob, QueueName};

/// Queue runtime boundary.
///
/// Implementations own visibility (`not_before`), leases and the dead-letter
/// set; retry decisions are made by the worker pool and written back through
/// [`JobQueue::reschedule`] / [`JobQueue::dead_letter`].
pub trait JobQueue: Send + Sync {
    /// Make a job visible to workers no earlier than its `not_before`.
    ///
    /// Fails with [`QueueError::AlreadyExists`] when a job with the same id is
    /// already queued.
    fn enqueue(&self, job: NewJob) -> Result<Job, QueueError>;

    /// Get a queued (not completed, not dead-lettered) job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Claim the next ready job, trying `queues` in order. The job is leased
    /// to the caller for `lease`.
    fn claim_next(&self, queues: &[QueueName], lease: Duration) -> Result<Option<Job>, QueueError>;

    /// Remove a successfully processed job.
    fn complete(&self, job: &Job) -> Result<(), QueueError>;

    /// Store a failed or requeued job so it is claimable again at `not_before`.
    fn reschedule(&self, job: &Job) -> Result<(), QueueError>;

    /// Move a job to the dead-letter set.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), QueueError>;

    /// List dead-lettered jobs, oldest first.
    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Replay a dead-lettered job (attempts reset, visible immediately).
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, QueueError>;

    /// Delete a dead-lettered job.
    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Return running jobs whose lease expired to their queue (or to the
    /// dead-letter set once out of attempts). Returns how many were recovered.
    fn reap_expired_leases(&self) -> Result<usize, QueueError>;

    fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// Backend unreachable (retryable at the caller's discretion).
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    /// Claimable now or later, never attempted
    pub pending: usize,
    pub running: usize,
    /// Failed at least once, waiting for the next attempt
    pub retrying: usize,
    pub dead_lettered: usize,
    pub completed: u64,
    /// Pending plus retrying jobs per queue
    pub by_queue: BTreeMap<String, usize>,
}

/// In-memory job queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
    completed: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every queued job visible immediately (tests only need this to
    /// skip retry delays).
    pub fn make_all_ready(&self) -> Result<(), QueueError> {
        let now = Utc::now();
        for job in self.write_jobs()?.values_mut() {
            if job.status.is_claimable() {
                job.not_before = now;
            }
        }
        Ok(())
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue offline".to_string()));
        }
        Ok(())
    }

    fn read_jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, QueueError> {
        self.check_available()?;
        self.jobs.read().map_err(|_| poisoned())
    }

    fn write_jobs(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, QueueError> {
        self.check_available()?;
        self.jobs.write().map_err(|_| poisoned())
    }

    fn write_dead(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<JobId, DeadLetterEntry>>, QueueError> {
        self.dead_letters.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> QueueError {
    QueueError::Storage("lock poisoned".to_string())
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let mut jobs = self.write_jobs()?;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        let job = Job::from(job);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.read_jobs()?.get(&job_id).cloned())
    }

    fn claim_next(&self, queues: &[QueueName], lease: Duration) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.write_jobs()?;
        let now = Utc::now();

        for queue in queues {
            // Oldest ready job in this queue (FIFO by creation, then id)
            let next = jobs
                .values()
                .filter(|j| &j.queue == queue && j.is_ready(now))
                .min_by_key(|j| (j.created_at, j.id))
                .map(|j| j.id);

            if let Some(job) = next.and_then(|id| jobs.get_mut(&id)) {
                job.mark_running(lease);
                return Ok(Some(job.clone()));
            }
        }

        Ok(None)
    }

    fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let mut jobs = self.write_jobs()?;
        if jobs.remove(&job.id).is_none() {
            return Err(QueueError::NotFound(job.id));
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reschedule(&self, job: &Job) -> Result<(), QueueError> {
        let mut jobs = self.write_jobs()?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(QueueError::NotFound(job.id)),
        }
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), QueueError> {
        let mut jobs = self.write_jobs()?;
        let mut dls = self.write_dead()?;

        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
                attempts: job.attempt,
            };
        }
        job.lease_until = None;
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        self.check_available()?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| (e.dead_lettered_at, e.job.id));
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, QueueError> {
        let mut jobs = self.write_jobs()?;
        let mut dls = self.write_dead()?;

        let entry = dls.remove(&job_id).ok_or(QueueError::NotFound(job_id))?;
        let mut job = entry.job;
        job.reset_for_replay();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), QueueError> {
        self.check_available()?;
        self.write_dead()?
            .remove(&job_id)
            .map(|_| ())
            .ok_or(QueueError::NotFound(job_id))
    }

    fn reap_expired_leases(&self) -> Result<usize, QueueError> {
        let mut jobs = self.write_jobs()?;
        let mut dls = self.write_dead()?;
        let now = Utc::now();

        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .map(|j| j.id)
            .collect();

        for id in &expired {
            let Some(mut job) = jobs.remove(id) else {
                continue;
            };
            let started = job.updated_at;
            job.mark_failed("lease expired".to_string(), started, true);
            if let JobStatus::DeadLettered { error, .. } = &job.status {
                let reason = error.clone();
                dls.insert(job.id, DeadLetterEntry::new(job, reason));
            } else {
                jobs.insert(job.id, job);
            }
        }

        Ok(expired.len())
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.read_jobs()?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;

        let mut stats = QueueStats {
            dead_lettered: dls.len(),
            completed: self.completed.load(Ordering::Relaxed),
            ..Default::default()
        };

        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Failed { .. } => stats.retrying += 1,
                JobStatus::Completed | JobStatus::DeadLettered { .. } => {}
            }
            if job.status.is_claimable() {
                *stats.by_queue.entry(job.queue.to_string()).or_default() += 1;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::TaskType;

    const LEASE: Duration = Duration::from_secs(30);

    fn new_job(queue: QueueName) -> NewJob {
        NewJob::new(
            TaskType::UpdateCourseProgress,
            serde_json::json!({"user_id": 1, "course_id": 1}),
            queue,
            3,
            Utc::now(),
        )
    }

    #[test]
    fn enqueue_and_claim() {
        let queue = InMemoryJobQueue::new();
        let job = queue.enqueue(new_job(QueueName::CRITICAL)).unwrap();

        let claimed = queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        // No more jobs
        assert!(queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap().is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let queue = InMemoryJobQueue::new();
        let job = new_job(QueueName::CRITICAL);
        queue.enqueue(job.clone()).unwrap();
        assert_eq!(queue.enqueue(job.clone()), Err(QueueError::AlreadyExists(job.id)));
    }

    #[test]
    fn not_before_hides_job() {
        let queue = InMemoryJobQueue::new();
        queue
            .enqueue(new_job(QueueName::CRITICAL).delayed(Duration::from_secs(10)))
            .unwrap();
        assert!(queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap().is_none());

        queue.make_all_ready().unwrap();
        assert!(queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap().is_some());
    }

    #[test]
    fn claim_respects_queue_order() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(new_job(QueueName::CRITICAL)).unwrap();
        let n = queue.enqueue(new_job(QueueName::NOTIFICATIONS)).unwrap();

        let order = [QueueName::NOTIFICATIONS, QueueName::CRITICAL];
        let claimed = queue.claim_next(&order, LEASE).unwrap().unwrap();
        assert_eq!(claimed.id, n.id);

        // queues not listed are never claimed
        assert!(queue.claim_next(&[QueueName::new("other")], LEASE).unwrap().is_none());
    }

    #[test]
    fn dead_letter_flow() {
        let queue = InMemoryJobQueue::new();
        let job = queue.enqueue(new_job(QueueName::CRITICAL)).unwrap();

        let claimed = queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap().unwrap();
        queue.dead_letter(claimed, "bad payload".to_string()).unwrap();

        assert!(queue.get(job.id).unwrap().is_none());
        let dls = queue.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].reason, "bad payload");

        let replayed = queue.retry_dead_letter(job.id).unwrap();
        assert!(matches!(replayed.status, JobStatus::Pending));
        assert_eq!(replayed.attempt, 0);
        assert!(queue.list_dead_letters(10).unwrap().is_empty());

        let claimed = queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap().unwrap();
        queue.dead_letter(claimed, "again".to_string()).unwrap();
        queue.delete_dead_letter(job.id).unwrap();
        assert_eq!(queue.delete_dead_letter(job.id), Err(QueueError::NotFound(job.id)));
    }

    #[test]
    fn expired_lease_is_redelivered() {
        let queue = InMemoryJobQueue::new();
        let job = queue.enqueue(new_job(QueueName::CRITICAL)).unwrap();

        queue.claim_next(&[QueueName::CRITICAL], Duration::ZERO).unwrap().unwrap();
        assert_eq!(queue.reap_expired_leases().unwrap(), 1);

        let recovered = queue.get(job.id).unwrap().unwrap();
        assert!(matches!(recovered.status, JobStatus::Failed { attempt: 1, .. }));

        queue.make_all_ready().unwrap();
        let again = queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn unavailable_queue_fails_enqueue() {
        let queue = InMemoryJobQueue::new();
        queue.set_unavailable(true);
        let err = queue.enqueue(new_job(QueueName::CRITICAL)).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn stats_tracking() {
        let queue = InMemoryJobQueue::new();
        for _ in 0..3 {
            queue.enqueue(new_job(QueueName::CRITICAL)).unwrap();
        }
        queue.enqueue(new_job(QueueName::NOTIFICATIONS)).unwrap();

        let claimed = queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap().unwrap();
        queue.complete(&claimed).unwrap();
        queue.claim_next(&[QueueName::CRITICAL], LEASE).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.by_queue.get("critical"), Some(&1));
        assert_eq!(stats.by_queue.get("notifications"), Some(&1));
    }
}
