//! Enqueue side of the job system.
//!
//! The dispatcher turns a typed payload into a [`NewJob`] using the routing
//! table and hands it to the queue. It never retries; callers that stage jobs
//! through the outbox get redelivery from the relay instead.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use super::payload::TaskPayload;
use super::queue::{JobQueue, QueueError};
use super::routing::RoutingTable;
use super::types::{JobHandle, NewJob};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The payload could not be encoded (caller bug; never retry).
    #[error("failed to serialize payload: {0}")]
    Serialization(String),
    /// The queue backend is unreachable (retryable at the caller's discretion).
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error(transparent)]
    Queue(QueueError),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::QueueUnavailable(_))
    }
}

impl From<QueueError> for DispatchError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::Unavailable(msg) => DispatchError::QueueUnavailable(msg),
            QueueError::Serialization(msg) => DispatchError::Serialization(msg),
            other => DispatchError::Queue(other),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    routing: Arc<RoutingTable>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routing", &self.routing)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, routing: RoutingTable) -> Self {
        Self {
            queue,
            routing: Arc::new(routing),
        }
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Build the job for `payload` from its route without enqueueing it.
    pub fn prepare<P: TaskPayload>(&self, payload: &P) -> Result<NewJob, DispatchError> {
        let value = payload
            .encode()
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        let route = self.routing.route(P::TASK);

        Ok(NewJob::new(
            P::TASK,
            value,
            route.queue,
            route.retry_policy.max_attempts,
            Utc::now(),
        )
        .with_retry_policy(route.retry_policy)
        .delayed(route.initial_delay))
    }

    /// Enqueue a fully specified job.
    pub fn enqueue(&self, job: NewJob) -> Result<JobHandle, DispatchError> {
        let (id, task, queue) = (job.id, job.task, job.queue.clone());
        match self.queue.enqueue(job) {
            Ok(job) => {
                debug!(job_id = %id, task = %task, queue = %queue, not_before = %job.not_before, "job enqueued");
                Ok(job.handle())
            }
            Err(err) => {
                warn!(job_id = %id, task = %task, queue = %queue, error = %err, "enqueue failed");
                Err(err.into())
            }
        }
    }

    /// Route and enqueue a typed payload.
    pub fn dispatch<P: TaskPayload>(&self, payload: &P) -> Result<JobHandle, DispatchError> {
        let job = self.prepare(payload)?;
        self.enqueue(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::{ResetPassword, UpdateCourseProgress};
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::types::{QueueName, TaskType};
    use eduapp_core::{CourseId, Progress, UserId};

    fn dispatcher() -> (Arc<InMemoryJobQueue>, Dispatcher) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Dispatcher::new(queue.clone(), RoutingTable::default());
        (queue, dispatcher)
    }

    #[test]
    fn dispatch_uses_route() {
        let (queue, dispatcher) = dispatcher();
        let before = Utc::now();

        let handle = dispatcher
            .dispatch(&ResetPassword {
                email: "a@example.com".to_string(),
            })
            .unwrap();

        assert_eq!(handle.task, TaskType::ResetPassword);
        assert_eq!(handle.queue, QueueName::NOTIFICATIONS);
        assert!(handle.not_before >= before + chrono::Duration::seconds(10));

        let job = queue.get(handle.id).unwrap().unwrap();
        assert_eq!(job.max_attempts(), 10);
        assert_eq!(job.payload, serde_json::json!({"email": "a@example.com"}));
    }

    #[test]
    fn unavailable_queue_is_retryable() {
        let (queue, dispatcher) = dispatcher();
        queue.set_unavailable(true);

        let err = dispatcher
            .dispatch(&UpdateCourseProgress {
                user_id: UserId::new(1),
                course_id: CourseId::new(2),
                progress: Progress::ZERO,
            })
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn duplicate_job_is_not_retryable() {
        let (_queue, dispatcher) = dispatcher();
        let job = dispatcher
            .prepare(&ResetPassword {
                email: "a@example.com".to_string(),
            })
            .unwrap();
        dispatcher.enqueue(job.clone()).unwrap();

        let err = dispatcher.enqueue(job).unwrap_err();
        assert!(matches!(err, DispatchError::Queue(QueueError::AlreadyExists(_))));
        assert!(!err.is_retryable());
    }
}
