//! Handler-facing types: the per-job context and the error classification the
//! worker pool uses to decide between retry and dead-letter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eduapp_auth::CredentialError;
use eduapp_core::DomainError;

use super::types::{JobId, TaskType};
use crate::notifier::NotifyError;
use crate::store::StoreError;

/// Context passed to a handler for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub task: TaskType,
    /// 1-indexed attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        task: TaskType,
        attempt: u32,
        max_attempts: u32,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_id,
            task,
            attempt,
            max_attempts,
            cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Handlers call this before their first store write.
    pub fn ensure_active(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }
}

/// Handler failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Payload could not be decoded for the declared task type.
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    /// Something the job refers to is missing and will not come back.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// A dependency is not in the expected state yet (retry later).
    #[error("dependency not ready: {0}")]
    Dependency(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("notification failed: {0}")]
    Notify(NotifyError),
    /// The pool was aborted before the handler wrote anything.
    #[error("cancelled")]
    Cancelled,
    #[error("no handler registered for task {0}")]
    NoHandler(TaskType),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Store(err) => !err.is_unique_violation(),
            TaskError::Notify(_) | TaskError::Dependency(_) | TaskError::Cancelled => true,
            TaskError::Decode(_)
            | TaskError::Validation(_)
            | TaskError::Unauthorized(_)
            | TaskError::InvariantViolation(_)
            | TaskError::NotFound(_)
            | TaskError::Conflict(_)
            | TaskError::NoHandler(_) => false,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }
}

impl From<StoreError> for TaskError {
    fn from(value: StoreError) -> Self {
        TaskError::Store(value)
    }
}

impl From<NotifyError> for TaskError {
    fn from(value: NotifyError) -> Self {
        TaskError::Notify(value)
    }
}

impl From<CredentialError> for TaskError {
    fn from(value: CredentialError) -> Self {
        TaskError::Unauthorized(value.to_string())
    }
}

impl From<DomainError> for TaskError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => TaskError::Validation(msg),
            DomainError::InvariantViolation(msg) => TaskError::InvariantViolation(msg),
            DomainError::NotFound(msg) => TaskError::NotFound(msg),
            DomainError::Conflict(msg) => TaskError::Conflict(msg),
            DomainError::Unauthorized(msg) => TaskError::Unauthorized(msg),
        }
    }
}
