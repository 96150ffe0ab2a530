//! Coordinated graceful shutdown.
//!
//! Order matters: clients hear about the shutdown first so they can plan a
//! reconnect, background tasks stop second, and only then does the process
//! wait for sockets to drain.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::protocol::ServerMessage;
use crate::registry::ConnectionRegistry;

/// Parallelism cap for the client notification fan-out.
const NOTIFY_CONCURRENCY: usize = 256;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Budget for notifying all clients.
    pub client_notification_timeout: Duration,
    /// How long to wait for connections to close on their own.
    pub drain_timeout: Duration,
    /// Reconnect delay suggested to clients in the shutdown frame.
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            reconnect_after_seconds: 5,
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub clients_notified: usize,
    pub connections_closed: usize,
    pub duration: Duration,
}

pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(registry: Arc<ConnectionRegistry>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(registry, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        registry: Arc<ConnectionRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            config,
        }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(connections = self.registry.connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownReport {
        let start = std::time::Instant::now();

        tracing::info!(reason = %reason, "Graceful shutdown: notifying clients");
        let clients_notified = self.notify_clients(reason).await;

        tracing::info!("Graceful shutdown: stopping background tasks");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Graceful shutdown: draining connections");
        let connections_closed = self.drain_connections().await;

        let report = ShutdownReport {
            clients_notified,
            connections_closed,
            duration: start.elapsed(),
        };
        tracing::info!(
            clients_notified = report.clients_notified,
            connections_closed = report.connections_closed,
            duration_ms = report.duration.as_millis(),
            "Graceful shutdown complete"
        );
        report
    }

    /// Send a shutdown frame to every connection, bounded-parallel, within
    /// one overall budget.
    async fn notify_clients(&self, reason: &str) -> usize {
        let connections = self.registry.all_connections();
        if connections.is_empty() {
            return 0;
        }

        let frame = ServerMessage::shutdown(reason, Some(self.config.reconnect_after_seconds));
        let fan_out = stream::iter(connections)
            .map(|conn| {
                let frame = frame.clone();
                async move { conn.send(frame).await.is_ok() }
            })
            .buffer_unordered(NOTIFY_CONCURRENCY)
            .filter(|sent| futures::future::ready(*sent))
            .count();

        match timeout(self.config.client_notification_timeout, fan_out).await {
            Ok(notified) => notified,
            Err(_) => {
                tracing::warn!("Timed out notifying clients of shutdown");
                0
            }
        }
    }

    /// Wait for clients to close their sockets, up to the drain budget.
    async fn drain_connections(&self) -> usize {
        let initial = self.registry.connection_count();
        if initial == 0 {
            return 0;
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        poll.tick().await;

        loop {
            let remaining = self.registry.connection_count();
            if remaining == 0 {
                return initial;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(remaining, "Connections still open after drain timeout");
                return initial - remaining;
            }
            poll.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutboundMessage;
    use crate::registry::ConnectionLimits;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_shutdown_with_no_connections() {
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default()));
        let (tx, _) = broadcast::channel(1);

        let report = GracefulShutdown::new(registry, tx).execute("restart").await;

        assert_eq!(report.clients_notified, 0);
        assert_eq!(report.connections_closed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_counts_drained_clients() {
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default()));
        let (shutdown_tx, _) = broadcast::channel(1);

        let (tx, mut rx) = mpsc::channel::<OutboundMessage>(8);
        let handle = registry
            .register(Some("u1".to_string()), None, None, tx)
            .unwrap();

        let config = ShutdownConfig {
            drain_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let shutdown = GracefulShutdown::with_config(registry.clone(), shutdown_tx, config);

        // The client closes shortly after being notified.
        let reg = registry.clone();
        let conn_id = handle.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            reg.unregister(conn_id);
        });

        let report = shutdown.execute("maintenance").await;

        assert_eq!(report.clients_notified, 1);
        assert_eq!(report.connections_closed, 1);
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::Raw(ServerMessage::Shutdown { .. }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_signals_background_tasks() {
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default()));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        GracefulShutdown::new(registry, shutdown_tx)
            .execute("restart")
            .await;

        assert!(shutdown_rx.try_recv().is_ok());
    }
}
