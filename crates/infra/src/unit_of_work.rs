//! Atomic unit of work with a post-commit job.
//!
//! ```text
//! begin ─▶ work(q) ─▶ on_commit(&value) ─▶ insert outbox row ─▶ commit ─▶ relay
//!            │              │                      │              │         │
//!            └──── any error: rollback, nothing staged ───────────┘         │
//!                                                   enqueue failed: row stays for the sweeper
//! ```
//!
//! The unit of work never retries. A commit failure means no job ever becomes
//! visible; an enqueue failure after commit still reports success, with the
//! job left as [`ScheduledJob::PendingRelay`].

use std::sync::Arc;

use tracing::{debug, warn};

use eduapp_core::OutboxId;

use crate::jobs::{DispatchError, Dispatcher, JobHandle, JobId, NewJob};
use crate::outbox::{OutboxRelay, RelayError};
use crate::store::{Queries, Store, StoreError, StoreExt};

/// What happened to the job a unit of work produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledJob {
    /// Visible to the queue.
    Enqueued(JobHandle),
    /// Committed in the outbox; the relay will enqueue it later.
    PendingRelay {
        outbox_id: OutboxId,
        job_id: JobId,
        error: RelayError,
    },
}

impl ScheduledJob {
    pub fn job_id(&self) -> JobId {
        match self {
            ScheduledJob::Enqueued(handle) => handle.id,
            ScheduledJob::PendingRelay { job_id, .. } => *job_id,
        }
    }
}

/// Committed value plus zero or one scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicOutcome<T> {
    pub value: T,
    pub job: Option<ScheduledJob>,
}

#[derive(Clone)]
pub struct UnitOfWork {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    relay: OutboxRelay,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    pub fn new(store: Arc<dyn Store>, dispatcher: Dispatcher) -> Self {
        let relay = OutboxRelay::new(store.clone(), dispatcher.clone());
        Self {
            store,
            dispatcher,
            relay,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn relay(&self) -> &OutboxRelay {
        &self.relay
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run `work` atomically with no follow-up job.
    pub fn execute<T, E, W>(&self, work: W) -> Result<AtomicOutcome<T>, E>
    where
        W: FnOnce(&mut dyn Queries) -> Result<T, E>,
        E: From<StoreError>,
    {
        let value = self.store.execute_atomic(work)?;
        Ok(AtomicOutcome { value, job: None })
    }

    /// Run `work` atomically and stage the job built by `on_commit` in the
    /// same transaction; enqueue it once the transaction has committed.
    pub fn execute_with_job<T, E, W, H>(&self, work: W, on_commit: H) -> Result<AtomicOutcome<T>, E>
    where
        W: FnOnce(&mut dyn Queries) -> Result<T, E>,
        H: FnOnce(&T) -> Result<NewJob, DispatchError>,
        E: From<StoreError> + From<DispatchError>,
    {
        let (value, staged) = self.store.execute_atomic(|q| {
            let value = work(q)?;
            let job = on_commit(&value)?;
            let staged = q.insert_outbox(job)?;
            Ok::<_, E>((value, staged))
        })?;

        debug!(outbox_id = %staged.id, job_id = %staged.job.id, task = %staged.job.task, "unit of work committed");

        let scheduled = match self.relay.deliver(&staged) {
            Ok(handle) => ScheduledJob::Enqueued(handle),
            Err(error) => {
                warn!(
                    outbox_id = %staged.id,
                    job_id = %staged.job.id,
                    error = %error,
                    "post-commit enqueue failed, left for the outbox relay"
                );
                ScheduledJob::PendingRelay {
                    outbox_id: staged.id,
                    job_id: staged.job.id,
                    error,
                }
            }
        };

        Ok(AtomicOutcome {
            value,
            job: Some(scheduled),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::SendVerifyEmail;
    use crate::jobs::{InMemoryJobQueue, JobQueue, RoutingTable};
    use crate::store::InMemoryStore;
    use chrono::Utc;
    use eduapp_core::{NewUser, User};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Store(#[from] StoreError),
        #[error(transparent)]
        Dispatch(#[from] DispatchError),
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<InMemoryJobQueue>, UnitOfWork) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Dispatcher::new(queue.clone(), RoutingTable::default());
        let uow = UnitOfWork::new(store.clone(), dispatcher);
        (store, queue, uow)
    }

    fn register(uow: &UnitOfWork) -> Result<AtomicOutcome<User>, TestError> {
        let dispatcher = uow.dispatcher().clone();
        uow.execute_with_job(
            |q| {
                Ok(q.create_user(NewUser {
                    user_name: "alice".to_string(),
                    first_name: "Alice".to_string(),
                    email: "alice@example.com".to_string(),
                    role: "student".to_string(),
                })?)
            },
            move |user: &User| {
                dispatcher.prepare(&SendVerifyEmail {
                    user_name: user.user_name.clone(),
                })
            },
        )
    }

    #[test]
    fn committed_work_enqueues_job() {
        let (_store, queue, uow) = setup();
        let outcome = register(&uow).unwrap();

        let Some(ScheduledJob::Enqueued(handle)) = outcome.job else {
            panic!("expected an enqueued job");
        };
        assert!(queue.get(handle.id).unwrap().is_some());
    }

    #[test]
    fn commit_failure_enqueues_nothing() {
        let (store, queue, uow) = setup();
        store.fail_next_commits(1);

        let err = register(&uow).unwrap_err();
        assert!(matches!(err, TestError::Store(StoreError::Unavailable(_))));
        assert_eq!(queue.stats().unwrap().pending, 0);
        assert!(uow.relay().relay_pending(10).unwrap().delivered == 0);
    }

    #[test]
    fn work_error_enqueues_nothing() {
        let (_store, queue, uow) = setup();
        register(&uow).unwrap();

        // duplicate user name: unique violation, rolled back
        let err = register(&uow).unwrap_err();
        assert!(matches!(err, TestError::Store(StoreError::UniqueViolation(_))));
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[test]
    fn enqueue_failure_after_commit_is_relayed_later() {
        let (store, queue, uow) = setup();
        queue.set_unavailable(true);

        let outcome = register(&uow).unwrap();
        let Some(ScheduledJob::PendingRelay { job_id, .. }) = outcome.job else {
            panic!("expected pending relay");
        };

        // mutation is durable regardless
        let user = store
            .execute_atomic(|q| q.get_user_by_name("alice"))
            .unwrap();
        assert!(user.is_some());
        let staged = store
            .execute_atomic(|q| q.pending_outbox(Utc::now(), 10))
            .unwrap();
        assert_eq!(staged.len(), 1);

        queue.set_unavailable(false);
        assert_eq!(uow.relay().relay_pending(10).unwrap().delivered, 1);
        assert!(queue.get(job_id).unwrap().is_some());
    }
}
