//! Infrastructure layer: store boundary, unit of work and outbox, the job
//! system, task handlers, notifier and configuration.

pub mod commands;
pub mod config;
pub mod handlers;
pub mod jobs;
pub mod notifier;
pub mod outbox;
pub mod store;
pub mod unit_of_work;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use commands::{CommandError, Commands};
pub use config::{AppConfig, ConfigError, QueueBackend};
pub use handlers::{NotificationLinks, TaskHandlers};
pub use outbox::{OutboxMessage, OutboxRelay, RelayError, RelayReport};
pub use unit_of_work::{AtomicOutcome, ScheduledJob, UnitOfWork};
