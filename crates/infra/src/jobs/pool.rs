//! Worker pool: claims jobs, runs handlers, applies retry/dead-letter policy.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};

use super::payload::TaskPayload;
use super::queue::{JobQueue, QueueError};
use super::task::{JobContext, TaskError};
use super::types::{Job, JobId, JobStatus, QueueName, TaskType};

/// Type-erased handler: decodes the payload, then runs the typed handler.
pub type HandlerFn =
    Box<dyn Fn(&JobContext, &serde_json::Value) -> Result<(), TaskError> + Send + Sync>;

/// Task type to handler mapping.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, HandlerFn>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tasks", &self.tasks())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `P::TASK`.
    ///
    /// A payload that fails to decode becomes [`TaskError::Decode`], which is
    /// never retried.
    pub fn register<P, F>(&mut self, handler: F)
    where
        P: TaskPayload,
        F: Fn(&JobContext, P) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.register_raw(P::TASK, move |ctx, value| {
            let payload = P::decode(value).map_err(|e| TaskError::Decode(e.to_string()))?;
            handler(ctx, payload)
        });
    }

    pub fn register_raw<F>(&mut self, task: TaskType, handler: F)
    where
        F: Fn(&JobContext, &serde_json::Value) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.handlers.insert(task, Box::new(handler));
    }

    pub fn get(&self, task: TaskType) -> Option<&HandlerFn> {
        self.handlers.get(&task)
    }

    pub fn tasks(&self) -> Vec<TaskType> {
        let mut tasks: Vec<_> = self.handlers.keys().copied().collect();
        tasks.sort();
        tasks
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Number of worker threads
    pub concurrency: usize,
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Lease granted with each claim
    pub lease: Duration,
    /// How often expired leases are swept back into their queues
    pub reap_interval: Duration,
    /// Queue weights for the claim rotation
    pub queue_weights: Vec<(QueueName, u32)>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(100),
            lease: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            queue_weights: vec![(QueueName::CRITICAL, 6), (QueueName::NOTIFICATIONS, 3)],
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queue_weights(mut self, weights: Vec<(QueueName, u32)>) -> Self {
        self.queue_weights = weights;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Smooth weighted round-robin over queues.
///
/// Each claim starts with the queue whose turn it is and falls back to the
/// others (heaviest first), so an empty queue never stalls a worker and a
/// busy one cannot starve the rest.
#[derive(Debug)]
pub struct WeightedRotation {
    schedule: Vec<QueueName>,
    fallback: Vec<QueueName>,
    cursor: AtomicUsize,
}

impl WeightedRotation {
    pub fn new(weights: &[(QueueName, u32)]) -> Self {
        let mut fallback: Vec<(QueueName, u32)> = Vec::new();
        for (queue, weight) in weights {
            if !fallback.iter().any(|(q, _)| q == queue) {
                fallback.push((queue.clone(), *weight));
            }
        }
        fallback.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let weighted: Vec<(QueueName, i64)> = fallback
            .iter()
            .filter(|(_, w)| *w > 0)
            .map(|(q, w)| (q.clone(), i64::from(*w)))
            .collect();
        let total: i64 = weighted.iter().map(|(_, w)| w).sum();

        let mut current = vec![0_i64; weighted.len()];
        let mut schedule = Vec::with_capacity(total as usize);
        for _ in 0..total {
            for (c, (_, w)) in current.iter_mut().zip(&weighted) {
                *c += w;
            }
            let Some((idx, _)) = current
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(&a.0)))
            else {
                break;
            };
            current[idx] -= total;
            schedule.push(weighted[idx].0.clone());
        }

        Self {
            schedule,
            fallback: fallback.into_iter().map(|(q, _)| q).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Claim order for the next poll.
    pub fn next_order(&self) -> Vec<QueueName> {
        if self.schedule.is_empty() {
            return self.fallback.clone();
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed) % self.schedule.len();
        let first = &self.schedule[turn];

        let mut order = Vec::with_capacity(self.fallback.len());
        order.push(first.clone());
        order.extend(self.fallback.iter().filter(|q| *q != first).cloned());
        order
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(JobId),
    Retrying {
        id: JobId,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Cancelled by an abort and put back without consuming an attempt.
    Requeued(JobId),
    DeadLettered { id: JobId, reason: String },
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_requeued: u64,
    pub jobs_dead_lettered: u64,
    pub leases_recovered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Background worker pool.
///
/// Workers poll the queue, execute jobs with registered handlers, and write
/// back retries and dead letters. Handlers must tolerate at-least-once
/// delivery.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    registry: HandlerRegistry,
    rotation: WeightedRotation,
    config: PoolConfig,
    stats: Mutex<PoolStats>,
    cancelled: Arc<AtomicBool>,
    started: Instant,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, registry: HandlerRegistry, config: PoolConfig) -> Self {
        Self {
            queue,
            registry,
            rotation: WeightedRotation::new(&config.queue_weights),
            config,
            stats: Mutex::new(PoolStats::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    fn update_stats(&self, f: impl FnOnce(&mut PoolStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// Claim and execute one job. Returns `None` when every queue is empty.
    pub fn process_next(&self) -> Result<Option<JobOutcome>, QueueError> {
        let order = self.rotation.next_order();
        let Some(mut job) = self.queue.claim_next(&order, self.config.lease)? else {
            return Ok(None);
        };

        self.update_stats(|s| s.current_running += 1);
        let outcome = self.execute(&mut job);
        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &outcome {
                Ok(JobOutcome::Completed(_)) => s.jobs_succeeded += 1,
                Ok(JobOutcome::Retrying { .. }) => {
                    s.jobs_failed += 1;
                    s.jobs_retried += 1;
                }
                Ok(JobOutcome::Requeued(_)) => s.jobs_requeued += 1,
                Ok(JobOutcome::DeadLettered { .. }) => {
                    s.jobs_failed += 1;
                    s.jobs_dead_lettered += 1;
                }
                Err(_) => s.jobs_failed += 1,
            }
        });

        outcome.map(Some)
    }

    /// Process jobs until no job is ready. Returns how many were processed.
    pub fn run_until_idle(&self) -> Result<usize, QueueError> {
        let mut processed = 0;
        while self.process_next()?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Sweep expired leases back into their queues.
    pub fn recover_expired_leases(&self) -> Result<usize, QueueError> {
        let recovered = self.queue.reap_expired_leases()?;
        if recovered > 0 {
            warn!(pool = %self.config.name, recovered, "recovered jobs with expired leases");
            self.update_stats(|s| s.leases_recovered += recovered as u64);
        }
        Ok(recovered)
    }

    fn execute(&self, job: &mut Job) -> Result<JobOutcome, QueueError> {
        let span = info_span!(
            "job",
            job_id = %job.id,
            task = %job.task,
            queue = %job.queue,
            attempt = job.attempt
        );
        let _enter = span.enter();

        let started = Utc::now();
        let result = match self.registry.get(job.task) {
            Some(handler) => {
                let ctx = JobContext::new(
                    job.id,
                    job.task,
                    job.attempt,
                    job.max_attempts(),
                    self.cancelled.clone(),
                );
                handler(&ctx, &job.payload)
            }
            None => Err(TaskError::NoHandler(job.task)),
        };

        match result {
            Ok(()) => {
                job.mark_completed(started);
                self.queue.complete(job)?;
                debug!("job completed");
                Ok(JobOutcome::Completed(job.id))
            }
            Err(TaskError::Cancelled) => {
                job.mark_requeued("cancelled", started);
                self.queue.reschedule(job)?;
                info!("job cancelled, requeued");
                Ok(JobOutcome::Requeued(job.id))
            }
            Err(err) => {
                let reason = err.to_string();
                job.mark_failed(reason.clone(), started, err.is_retryable());

                if let JobStatus::Failed { attempt, .. } = job.status {
                    self.queue.reschedule(job)?;
                    warn!(error = %err, next_attempt_at = %job.not_before, "job failed, retry scheduled");
                    Ok(JobOutcome::Retrying {
                        id: job.id,
                        attempt,
                        next_attempt_at: job.not_before,
                    })
                } else {
                    error!(error = %err, retryable = err.is_retryable(), "job dead-lettered");
                    self.queue.dead_letter(job.clone(), reason.clone())?;
                    Ok(JobOutcome::DeadLettered { id: job.id, reason })
                }
            }
        }
    }

    /// Spawn `concurrency` worker threads.
    pub fn spawn(self) -> io::Result<PoolHandle> {
        let pool = Arc::new(self);
        let mut shutdowns = Vec::with_capacity(pool.config.concurrency);
        let mut joins = Vec::with_capacity(pool.config.concurrency);

        for index in 0..pool.config.concurrency.max(1) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let worker = pool.clone();
            let join = thread::Builder::new()
                .name(format!("{}-{index}", pool.config.name))
                .spawn(move || worker_loop(worker, index, shutdown_rx))?;
            shutdowns.push(shutdown_tx);
            joins.push(join);
        }

        info!(
            pool = %pool.config.name,
            concurrency = joins.len(),
            handlers = ?pool.registry.tasks(),
            "worker pool started"
        );

        Ok(PoolHandle {
            pool,
            shutdowns,
            joins,
        })
    }
}

/// Handle to control a running pool.
pub struct PoolHandle {
    pool: Arc<WorkerPool>,
    shutdowns: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl PoolHandle {
    /// Stop pulling new jobs and wait for in-flight handlers to finish.
    pub fn shutdown(mut self) {
        for tx in &self.shutdowns {
            let _ = tx.send(());
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        info!(pool = %self.pool.config.name, "worker pool stopped");
    }

    /// Like [`PoolHandle::shutdown`], but also signals cancellation to
    /// in-flight handlers so they can bail out before writing.
    pub fn abort(self) {
        self.pool.cancelled.store(true, Ordering::SeqCst);
        self.shutdown();
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

fn worker_loop(pool: Arc<WorkerPool>, index: usize, shutdown_rx: mpsc::Receiver<()>) {
    let name = &pool.config.name;
    debug!(pool = %name, worker = index, "worker started");
    let mut last_reap = Instant::now();

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        // one worker sweeps leases for the whole pool
        if index == 0 && last_reap.elapsed() >= pool.config.reap_interval {
            if let Err(e) = pool.recover_expired_leases() {
                error!(pool = %name, error = %e, "failed to recover expired leases");
            }
            last_reap = Instant::now();
        }

        let idle = match pool.process_next() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(pool = %name, worker = index, error = %e, "failed to process job");
                true
            }
        };

        if idle {
            match shutdown_rx.recv_timeout(pool.config.poll_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    }

    debug!(pool = %name, worker = index, "worker stopped");
}
