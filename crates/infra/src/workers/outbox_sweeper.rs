use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::outbox::OutboxRelay;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        info!(worker = %self.name, "worker stopped");
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between relay passes.
    pub interval: Duration,
    /// Rows younger than this are left to the post-commit path.
    pub min_age: Duration,
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_age: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

/// Periodically relays outbox rows whose post-commit enqueue did not happen
/// (queue down, process crashed between commit and enqueue).
#[derive(Debug)]
pub struct OutboxSweeper;

impl OutboxSweeper {
    pub fn spawn(relay: OutboxRelay, config: SweeperConfig) -> io::Result<WorkerHandle> {
        let name = "outbox-sweeper".to_string();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || sweep_loop(relay, config, shutdown_rx))?;

        info!(worker = %name, "worker started");
        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn sweep_loop(relay: OutboxRelay, config: SweeperConfig, shutdown_rx: mpsc::Receiver<()>) {
    loop {
        match relay.relay_older_than(config.min_age, config.batch_size) {
            Ok(report) if report.delivered > 0 || report.failed > 0 => {
                debug!(delivered = report.delivered, failed = report.failed, "outbox sweep");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "outbox sweep failed"),
        }

        match shutdown_rx.recv_timeout(config.interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }
}
