//! Background worker process.
//!
//! Consumes jobs from the configured queue and runs the outbox sweeper.
//! Only `USE_REDIS_QUEUE=true` (with the `redis` feature) shares the queue
//! with the processes that enqueue jobs. The in-memory queue and store are
//! private to this process, so that setup only serves as a local demo
//! runtime: nothing else can enqueue into it.

use std::sync::Arc;

use anyhow::Context;

use eduapp_infra::config::{AppConfig, QueueBackend};
use eduapp_infra::handlers::TaskHandlers;
use eduapp_infra::jobs::{Dispatcher, HandlerRegistry, InMemoryJobQueue, JobQueue, WorkerPool};
use eduapp_infra::notifier::{Notifier, RecordingNotifier, SmtpNotifier};
use eduapp_infra::outbox::OutboxRelay;
use eduapp_infra::store::{InMemoryStore, Store};
use eduapp_infra::workers::{OutboxSweeper, SweeperConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err).context("failed to read .env");
        }
    }
    eduapp_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue = build_queue(&config.queue)?;
    let notifier: Arc<dyn Notifier> = match &config.email {
        Some(email) => Arc::new(SmtpNotifier::new(email).context("failed to build SMTP notifier")?),
        None => {
            tracing::warn!("SMTP_HOST not set; emails are only recorded in memory");
            Arc::new(RecordingNotifier::new())
        }
    };

    let dispatcher = Dispatcher::new(queue.clone(), config.routing.clone());

    let mut registry = HandlerRegistry::new();
    TaskHandlers::new(store.clone(), notifier, config.links.clone()).register_all(&mut registry);

    let pool = WorkerPool::new(queue, registry, config.pool.clone())
        .spawn()
        .context("failed to start worker pool")?;
    let sweeper = OutboxSweeper::spawn(
        OutboxRelay::new(store, dispatcher),
        SweeperConfig {
            interval: config.outbox_relay_interval,
            min_age: config.outbox_relay_interval,
            ..SweeperConfig::default()
        },
    )
    .context("failed to start outbox sweeper")?;

    tracing::info!(
        concurrency = config.pool.concurrency,
        queues = ?config.routing.queues(),
        "worker running; press ctrl-c to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutdown requested, draining in-flight jobs");
    tokio::task::spawn_blocking(move || {
        sweeper.shutdown();
        pool.shutdown();
    })
    .await
    .context("shutdown task panicked")?;

    Ok(())
}

fn build_queue(backend: &QueueBackend) -> anyhow::Result<Arc<dyn JobQueue>> {
    match backend {
        QueueBackend::InMemory => {
            tracing::warn!("in-memory job queue: only jobs enqueued by this process will run");
            Ok(Arc::new(InMemoryJobQueue::new()))
        }
        #[cfg(feature = "redis")]
        QueueBackend::Redis { url, key_prefix } => {
            let queue = eduapp_infra::jobs::RedisJobQueue::new(url, Some(key_prefix.clone()))
                .context("failed to open Redis job queue")?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "redis"))]
        QueueBackend::Redis { .. } => {
            tracing::warn!("USE_REDIS_QUEUE=true but redis feature not enabled, falling back to in-memory");
            Ok(Arc::new(InMemoryJobQueue::new()))
        }
    }
}
