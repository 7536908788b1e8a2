//! Job model: ids, task types, queue names, status, retry policy.

use std::borrow::Cow;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Time-ordered (v7) job id, fixed before the job is staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job type used to route a job to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    SendVerifyEmail,
    CreateSubscription,
    CreateLessonCompletion,
    CreateMaterialNotification,
    DeleteCourse,
    UpdateRequest,
    UpdateCourseProgress,
    ResetPassword,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::SendVerifyEmail,
        TaskType::CreateSubscription,
        TaskType::CreateLessonCompletion,
        TaskType::CreateMaterialNotification,
        TaskType::DeleteCourse,
        TaskType::UpdateRequest,
        TaskType::UpdateCourseProgress,
        TaskType::ResetPassword,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SendVerifyEmail => "send-verify-email",
            TaskType::CreateSubscription => "create-subscription",
            TaskType::CreateLessonCompletion => "create-lesson-completion",
            TaskType::CreateMaterialNotification => "create-material-notification",
            TaskType::DeleteCourse => "delete-course",
            TaskType::UpdateRequest => "update-request",
            TaskType::UpdateCourseProgress => "update-course-progress",
            TaskType::ResetPassword => "reset-password",
        }
    }

    /// Whether the task only sends a notification (no data mutation).
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            TaskType::SendVerifyEmail
                | TaskType::CreateMaterialNotification
                | TaskType::ResetPassword
        )
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task type: {0}")]
pub struct UnknownTaskType(pub String);

impl std::str::FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTaskType(s.to_string()))
    }
}

/// Name of a queue jobs are routed to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(Cow<'static, str>);

impl QueueName {
    pub const CRITICAL: QueueName = QueueName(Cow::Borrowed("critical"));
    pub const NOTIFICATIONS: QueueName = QueueName(Cow::Borrowed("notifications"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `not_before`
    Pending,
    /// Claimed by a worker (holds a lease)
    Running,
    /// Handler returned Ok
    Completed,
    /// Failed, will be retried at `not_before`
    Failed { error: String, attempt: u32 },
    /// Out of attempts or non-retryable; parked in the dead-letter set
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    /// Eligible to be claimed once `not_before` has passed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed { .. })
    }
}

/// How the retry delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base` every time
    #[default]
    Fixed,
    /// `base * 2^(attempt - 1)`, capped
    Exponential,
    /// `base * attempt`, capped
    Linear,
}

/// Default number of attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default delay before a job first becomes visible and between retries.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Per-task retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Fraction of the delay randomized either way, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY)
    }
}

impl RetryPolicy {
    /// Create a policy with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_default()
}

/// A job ready to be enqueued: `(type, payload, queue, max attempts, not before)`.
///
/// The id is assigned up front so a job staged in the outbox keeps the same
/// id however many times the relay tries to deliver it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub task: TaskType,
    pub payload: serde_json::Value,
    pub queue: QueueName,
    pub retry_policy: RetryPolicy,
    pub not_before: DateTime<Utc>,
}

impl NewJob {
    pub fn new(
        task: TaskType,
        payload: serde_json::Value,
        queue: QueueName,
        max_attempts: u32,
        not_before: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            task,
            payload,
            queue,
            retry_policy: RetryPolicy {
                max_attempts,
                ..Default::default()
            },
            not_before,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Delay visibility by `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.not_before = Utc::now() + chrono_delay(delay);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_policy.max_attempts
    }
}

/// A queued background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task: TaskType,
    /// JSON payload
    pub payload: serde_json::Value,
    pub queue: QueueName,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far (starts at 0)
    pub attempt: u32,
    /// The job is invisible to workers until this instant
    pub not_before: DateTime<Utc>,
    /// Set while running; an expired lease means the worker died
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// One record per finished attempt
    pub history: Vec<JobAttemptRecord>,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl From<NewJob> for Job {
    fn from(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: new.id,
            task: new.task,
            payload: new.payload,
            queue: new.queue,
            status: JobStatus::Pending,
            retry_policy: new.retry_policy,
            attempt: 0,
            not_before: new.not_before,
            lease_until: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }
}

impl Job {
    pub fn max_attempts(&self) -> u32 {
        self.retry_policy.max_attempts
    }

    /// Check if the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.not_before <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Running) && self.lease_until.is_some_and(|l| l <= now)
    }

    /// Mark job as claimed by a worker for at most `lease`.
    pub fn mark_running(&mut self, lease: Duration) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.lease_until = Some(now + chrono_delay(lease));
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.lease_until = None;
        self.updated_at = now;
        self.record(started_at, now, None);
    }

    /// Mark job as failed.
    ///
    /// A retryable failure with attempts left is rescheduled after the policy
    /// delay; anything else is dead-lettered.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>, retryable: bool) {
        let now = Utc::now();
        self.updated_at = now;
        self.lease_until = None;
        self.record(started_at, now, Some(error.clone()));

        if retryable && self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.not_before = now + chrono_delay(delay);
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Put a cancelled job back without consuming the attempt or backoff.
    pub fn mark_requeued(&mut self, reason: &str, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.record(started_at, now, Some(reason.to_string()));
        self.attempt = self.attempt.saturating_sub(1);
        self.status = JobStatus::Pending;
        self.not_before = now;
        self.lease_until = None;
        self.updated_at = now;
    }

    /// Reset a dead-lettered job for replay.
    pub fn reset_for_replay(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.not_before = now;
        self.lease_until = None;
        self.updated_at = now;
        self.history.clear();
    }

    fn record(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            task: self.task,
            queue: self.queue.clone(),
            not_before: self.not_before,
        }
    }
}

/// Returned by the dispatcher once a job is visible to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub task: TaskType,
    pub queue: QueueName,
    pub not_before: DateTime<Utc>,
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(policy: RetryPolicy) -> Job {
        Job::from(
            NewJob::new(
                TaskType::CreateSubscription,
                serde_json::json!({"user_id": 1, "course_id": 2}),
                QueueName::CRITICAL,
                policy.max_attempts,
                Utc::now(),
            )
            .with_retry_policy(policy),
        )
    }

    #[test]
    fn task_types_round_trip_through_their_names() {
        for t in TaskType::ALL {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
            assert_eq!(serde_json::to_value(t).unwrap(), t.as_str());
        }
        assert!("send-sms".parse::<TaskType>().is_err());
    }

    #[test]
    fn default_policy_is_ten_attempts_ten_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(10));
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::fixed(5, Duration::from_millis(100))
        };

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1_000), Duration::from_secs(10));
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1).as_millis();
            assert!((900..=1_100).contains(&d));
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = job(RetryPolicy::default());
        assert!(job.is_ready(Utc::now()));

        job.mark_running(Duration::from_secs(30));
        assert!(matches!(job.status, JobStatus::Running));
        assert_eq!(job.attempt, 1);
        assert!(job.lease_until.is_some());

        job.mark_completed(Utc::now());
        assert!(job.status.is_terminal());
        assert!(job.history[0].success);
    }

    #[test]
    fn retryable_failure_reschedules_then_dead_letters() {
        let mut job = job(RetryPolicy::fixed(2, Duration::from_secs(10)));

        job.mark_running(Duration::from_secs(30));
        let before = Utc::now();
        job.mark_failed("error 1".to_string(), before, true);
        assert!(matches!(job.status, JobStatus::Failed { attempt: 1, .. }));
        assert!(job.not_before >= before + chrono::Duration::seconds(10));

        job.mark_running(Duration::from_secs(30));
        job.mark_failed("error 2".to_string(), Utc::now(), true);
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
    }

    #[test]
    fn non_retryable_failure_dead_letters_immediately() {
        let mut job = job(RetryPolicy::default());
        job.mark_running(Duration::from_secs(30));
        job.mark_failed("bad payload".to_string(), Utc::now(), false);
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 1, .. }));
    }

    #[test]
    fn requeue_does_not_consume_attempt() {
        let mut job = job(RetryPolicy::default());
        job.mark_running(Duration::from_secs(30));
        job.mark_requeued("cancelled", Utc::now());
        assert_eq!(job.attempt, 0);
        assert!(job.is_ready(Utc::now()));
    }
}
