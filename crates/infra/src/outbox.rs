//! Transactional outbox.
//!
//! A job produced by a unit of work is written as an [`OutboxMessage`] in the
//! same transaction as the mutation that triggered it. Only committed rows
//! exist, so only committed work can ever reach the queue. The relay moves
//! rows to the queue after commit and deletes them once enqueued.
//!
//! Delivery is at-least-once: a crash between enqueue and delete re-sends the
//! row later. The job id is fixed when the row is staged, so a queue that
//! still holds the job reports `AlreadyExists` and the relay treats that as
//! delivered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use eduapp_core::OutboxId;

use crate::jobs::{DispatchError, Dispatcher, JobHandle, NewJob, QueueError};
use crate::store::{Store, StoreError, StoreExt};

/// A staged job waiting to be relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxId,
    pub job: NewJob,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Result of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct OutboxRelay {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay").finish_non_exhaustive()
    }
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn Store>, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// Enqueue one staged message and delete its row.
    pub fn deliver(&self, message: &OutboxMessage) -> Result<JobHandle, RelayError> {
        let handle = match self.dispatcher.enqueue(message.job.clone()) {
            Ok(handle) => handle,
            Err(DispatchError::Queue(QueueError::AlreadyExists(id))) => {
                debug!(outbox_id = %message.id, job_id = %id, "job already queued");
                JobHandle {
                    id,
                    task: message.job.task,
                    queue: message.job.queue.clone(),
                    not_before: message.job.not_before,
                }
            }
            Err(err) => return Err(err.into()),
        };

        self.store
            .execute_atomic(|q| q.delete_outbox(message.id))?;
        Ok(handle)
    }

    /// Relay every staged row, oldest first, up to `limit`.
    pub fn relay_pending(&self, limit: usize) -> Result<RelayReport, RelayError> {
        self.relay_older_than(Duration::ZERO, limit)
    }

    /// Relay rows staged at least `min_age` ago.
    ///
    /// Stops at the first retryable enqueue failure (queue down) and leaves
    /// the remaining rows for the next pass.
    pub fn relay_older_than(&self, min_age: Duration, limit: usize) -> Result<RelayReport, RelayError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(min_age).unwrap_or_default();
        let pending = self
            .store
            .execute_atomic(|q| q.pending_outbox(cutoff, limit))?;

        let mut report = RelayReport::default();
        for message in &pending {
            match self.deliver(message) {
                Ok(_) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        outbox_id = %message.id,
                        job_id = %message.job.id,
                        task = %message.job.task,
                        error = %err,
                        "outbox relay failed"
                    );
                    if matches!(&err, RelayError::Dispatch(d) if d.is_retryable())
                        || matches!(&err, RelayError::Store(s) if s.is_transient())
                    {
                        break;
                    }
                }
            }
        }
        Ok(report)
    }
}
