use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::admin::AdminService;
use crate::bus::MessageBus;
use crate::config::RealtimeConfig;
use crate::protocol::ServerMessage;
use crate::registry::ConnectionRegistry;

/// Per-connection send budget within a heartbeat round.
const HEARTBEAT_SEND_TIMEOUT_MS: u64 = 5000;

/// Cap on in-flight heartbeat sends per round.
const MAX_CONCURRENT_HEARTBEATS: usize = 1000;

/// Background task for heartbeats, room TTL refresh and stale reaping.
pub struct HeartbeatTask {
    config: RealtimeConfig,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn MessageBus>,
    admin: Arc<AdminService>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: RealtimeConfig,
        registry: Arc<ConnectionRegistry>,
        bus: Arc<dyn MessageBus>,
        admin: Arc<AdminService>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            bus,
            admin,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_seconds);
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval_seconds);

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Both timers fire immediately on the first tick; consume those.
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval_seconds,
            cleanup_interval_secs = self.config.cleanup_interval_seconds,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats().await;
                    self.refresh_room_ttls().await;
                }
                _ = cleanup_timer.tick() => {
                    let removed = self.admin.cleanup_stale_connections();
                    if removed > 0 {
                        tracing::info!(removed, "Cleaned up stale connections");
                    }
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Ping every connection with bounded parallelism and a per-send
    /// timeout so one slow socket cannot stall the round.
    async fn send_heartbeats(&self) {
        let connections = self.registry.all_connections();
        let total = connections.len();
        if total == 0 {
            return;
        }

        let start = Instant::now();
        let sent = AtomicUsize::new(0);
        let timed_out = AtomicUsize::new(0);

        stream::iter(connections)
            .for_each_concurrent(MAX_CONCURRENT_HEARTBEATS, |handle| {
                let sent = &sent;
                let timed_out = &timed_out;
                async move {
                    let budget = Duration::from_millis(HEARTBEAT_SEND_TIMEOUT_MS);
                    match timeout(budget, handle.send(ServerMessage::ping())).await {
                        Ok(Ok(())) => {
                            sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(_)) => {
                            tracing::debug!(
                                connection_id = %handle.id,
                                "Heartbeat send failed, connection may be dead"
                            );
                        }
                        Err(_) => {
                            timed_out.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                connection_id = %handle.id,
                                timeout_ms = HEARTBEAT_SEND_TIMEOUT_MS,
                                "Heartbeat send timed out"
                            );
                        }
                    }
                }
            })
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let timed_out = timed_out.into_inner();
        if timed_out > 0 {
            crate::metrics::HEARTBEAT_TIMEOUTS.inc_by(timed_out as u64);
        }

        tracing::debug!(
            total,
            sent = sent.into_inner(),
            timed_out,
            elapsed_ms,
            "Heartbeat round completed"
        );

        if elapsed_ms > self.config.heartbeat_interval_seconds * 500 {
            tracing::warn!(
                elapsed_ms,
                connections = total,
                "Heartbeat round used over half the interval"
            );
        }
    }

    /// Keep bus-held room membership alive for rooms with local members.
    async fn refresh_room_ttls(&self) {
        if !self.bus.is_distributed() {
            return;
        }

        let rooms = self.registry.local_rooms();
        if rooms.is_empty() {
            return;
        }

        match self.bus.refresh_room_ttls(&rooms).await {
            Ok(refreshed) => {
                if refreshed > 0 {
                    tracing::debug!(refreshed, "Refreshed room membership TTLs");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh room membership TTLs");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::channels::ChannelRoomService;
    use crate::protocol::OutboundMessage;
    use crate::ratelimit::RateLimiter;
    use crate::registry::ConnectionLimits;
    use tokio::sync::mpsc;

    fn admin_for(
        registry: Arc<ConnectionRegistry>,
        bus: Arc<dyn MessageBus>,
    ) -> Arc<AdminService> {
        let channels = Arc::new(ChannelRoomService::new(
            registry.clone(),
            bus,
            "test-proc".to_string(),
        ));
        let limiter = Arc::new(RateLimiter::new(vec![], 100).unwrap());
        Arc::new(AdminService::new(
            registry,
            channels,
            limiter,
            chrono::Duration::minutes(5),
            chrono::Duration::minutes(30),
            10,
        ))
    }

    #[tokio::test]
    async fn test_heartbeat_task_shutdown() {
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default()));
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let admin = admin_for(registry.clone(), bus.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = HeartbeatTask::new(
            RealtimeConfig::default(),
            registry,
            bus,
            admin,
            shutdown_rx,
        );

        let handle = tokio::spawn(async move {
            task.run().await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }

    #[tokio::test]
    async fn test_heartbeat_sends_ping() {
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default()));
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let admin = admin_for(registry.clone(), bus.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (tx, mut rx) = mpsc::channel::<OutboundMessage>(10);
        let _handle = registry
            .register(Some("u1".to_string()), None, None, tx)
            .unwrap();

        let config = RealtimeConfig {
            heartbeat_interval_seconds: 1,
            ..Default::default()
        };
        let task = HeartbeatTask::new(config, registry, bus, admin, shutdown_rx);
        let task_handle = tokio::spawn(async move {
            task.run().await;
        });

        let msg = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("Should receive heartbeat")
            .expect("Channel should not be closed");

        assert!(matches!(
            msg,
            OutboundMessage::Raw(ServerMessage::Ping { .. })
        ));

        shutdown_tx.send(()).unwrap();
        let _ = task_handle.await;
    }
}
