//! Background job system: typed tasks, routing, queues, and the worker pool.
//!
//! ## Flow
//!
//! ```text
//! payload ──Dispatcher::prepare──▶ NewJob ──(outbox row, committed)──▶ Dispatcher::enqueue
//!                                                                        │
//!                                              JobQueue (in-memory / Redis)
//!                                                                        │
//!                         WorkerPool::process_next ◀─────── claim (lease) ┘
//!                                   │
//!                      handler Ok ──▶ complete
//!                      retryable  ──▶ reschedule after policy delay
//!                      otherwise  ──▶ dead-letter
//! ```
//!
//! ## Components
//!
//! - `TaskType` / `TaskPayload`: the eight job types and their payloads
//! - `RoutingTable`: `{type -> queue, retry policy, initial delay}`
//! - `Dispatcher`: builds and enqueues jobs, never retries
//! - `JobQueue`: visibility, leases, dead letters (in-memory or Redis)
//! - `WorkerPool`: weighted polling, retry classification, graceful drain

pub mod dispatcher;
pub mod payload;
pub mod pool;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod routing;
pub mod task;
pub mod types;

pub use dispatcher::{DispatchError, Dispatcher};
pub use payload::TaskPayload;
pub use pool::{HandlerRegistry, JobOutcome, PoolConfig, PoolHandle, PoolStats, WorkerPool};
pub use queue::{InMemoryJobQueue, JobQueue, QueueError, QueueStats};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use routing::{Route, RouteOverride, RoutingOverrideError, RoutingTable};
pub use task::{JobContext, TaskError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobHandle, JobId, JobStatus, NewJob, QueueName,
    RetryPolicy, TaskType,
};
