//! Background workers other than the job pool.

pub mod outbox_sweeper;

pub use outbox_sweeper::{OutboxSweeper, SweeperConfig, WorkerHandle};
