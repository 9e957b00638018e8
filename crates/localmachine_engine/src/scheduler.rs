//! Periodic sync cycles.

use crate::state::{CycleOutcome, SyncService};
use crate::transport::OnlineWebClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Runs [`SyncService::sync_cycle`] on a fixed interval.
///
/// Cycles run on the blocking pool. A tick that arrives while a cycle is
/// still running is dropped.
pub struct SyncScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Starts the schedule. The first cycle runs immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<C>(service: Arc<SyncService<C>>, interval: Duration) -> Self
    where
        C: OnlineWebClient + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = interval.as_millis() as u64, "sync scheduler started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let service = Arc::clone(&service);
                        match tokio::task::spawn_blocking(move || service.sync_cycle()).await {
                            Ok(Ok(CycleOutcome::Completed(_))) => {}
                            Ok(Ok(CycleOutcome::Skipped)) => debug!("scheduled cycle skipped"),
                            // Already recorded and logged by the service.
                            Ok(Err(_)) => {}
                            Err(e) => error!(error = %e, "sync cycle task panicked"),
                        }
                    }
                }
            }

            info!("sync scheduler stopped");
        });

        Self { shutdown, handle }
    }

    /// Stops the schedule and waits for a running cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "sync scheduler task failed");
        }
    }
}
