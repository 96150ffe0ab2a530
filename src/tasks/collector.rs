use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::admin::AdminService;

/// Periodically records a stats snapshot into the admin history ring and
/// refreshes the Prometheus gauges.
pub struct StatsCollectorTask {
    interval_seconds: u64,
    admin: Arc<AdminService>,
    shutdown: broadcast::Receiver<()>,
}

impl StatsCollectorTask {
    pub fn new(
        interval_seconds: u64,
        admin: Arc<AdminService>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval_seconds,
            admin,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(Duration::from_secs(self.interval_seconds.max(1)));
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval_seconds,
            "Stats collector started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Stats collector received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.admin.record_snapshot();
                }
            }
        }

        tracing::info!("Stats collector stopped");
    }
}
