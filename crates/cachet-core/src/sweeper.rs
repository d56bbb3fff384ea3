//! Background expiration sweeper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::CacheRegistry;

/// Handle to a running sweep task.
///
/// The task stops when [`ExpirationSweeper::shutdown`] is called or the
/// handle is dropped.
#[derive(Debug)]
pub struct ExpirationSweeper {
    shutdown_tx: Option<watch::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ExpirationSweeper {
    /// Spawns a task that sweeps `registry` every `interval`.
    ///
    /// Must be called from within a tokio runtime. A zero interval is raised
    /// to one millisecond.
    #[must_use]
    pub fn start(registry: Arc<CacheRegistry>, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Expiration sweeper started");

            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Expiration sweeper shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = registry.sweep(Utc::now()).await;
                        if report.is_empty() {
                            continue;
                        }
                        if report.reclaim_failures > 0 {
                            warn!(failures = report.reclaim_failures, "Blob reclaims still pending after sweep");
                        }
                        debug!(
                            expired = report.expired.len(),
                            purged = report.purged.len(),
                            "Sweep pass complete"
                        );
                    }
                }
            }
        });

        Self { shutdown_tx: Some(shutdown_tx), task: Some(task) }
    }

    /// Whether the sweep task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the task and waits for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Expiration sweeper task failed");
            }
        }
    }
}

impl Drop for ExpirationSweeper {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
