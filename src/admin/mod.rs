//! Admin and observability operations.
//!
//! Everything here reads registry state or delegates to the channel/room
//! service; nothing blocks the message paths. Stats snapshots are pushed
//! into a bounded ring by the collector loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::Topic;
use crate::channels::{ChannelRoomService, PublishOutcome};
use crate::error::AppError;
use crate::protocol::{close_code, OutboundMessage, ServerMessage};
use crate::ratelimit::RateLimiter;
use crate::registry::{ChannelInfo, ConnectionInfo, ConnectionRegistry, RoomInfo};

/// Target of an admin broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target_type", content = "target_id", rename_all = "snake_case")]
pub enum BroadcastTarget {
    All,
    Channel(String),
    Room(String),
    User(String),
}

/// One point in the stats history.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub connections: crate::registry::ConnectionStats,
    pub bus_healthy: bool,
    pub violations_last_hour: usize,
}

pub struct AdminService {
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelRoomService>,
    limiter: Arc<RateLimiter>,
    idle_threshold: chrono::Duration,
    stale_threshold: chrono::Duration,
    history: Mutex<VecDeque<StatsSnapshot>>,
    max_history: usize,
}

impl AdminService {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelRoomService>,
        limiter: Arc<RateLimiter>,
        idle_threshold: chrono::Duration,
        stale_threshold: chrono::Duration,
        max_history: usize,
    ) -> Self {
        Self {
            registry,
            channels,
            limiter,
            idle_threshold,
            stale_threshold,
            history: Mutex::new(VecDeque::new()),
            max_history,
        }
    }

    /// Paginated connection listing with an optional identity filter.
    /// Returns the page and the total count matching the filter, so
    /// callers can paginate filtered listings.
    pub async fn list_connections(
        &self,
        identity: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> (Vec<ConnectionInfo>, usize) {
        let handles = match identity {
            Some(identity) => self.registry.connections_for_identity(identity),
            None => self.registry.all_connections(),
        };

        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(self.registry.connection_info(&handle, self.idle_threshold).await);
        }
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));

        let total = infos.len();
        (infos.into_iter().skip(offset).take(limit).collect(), total)
    }

    pub async fn get_connection(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        let handle = self.registry.get_connection(connection_id)?;
        Some(self.registry.connection_info(&handle, self.idle_threshold).await)
    }

    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let mut channels: Vec<ChannelInfo> = self
            .registry
            .channel_names()
            .into_iter()
            .map(|name| ChannelInfo {
                subscriber_count: self.registry.channel_subscriber_count(&name),
                name,
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        channels
    }

    pub async fn get_room(&self, room: &str) -> Result<RoomInfo, AppError> {
        let members = self.channels.get_members(room).await?;
        Ok(RoomInfo {
            local_connections: self.registry.local_room_connection_count(room),
            members,
            name: room.to_string(),
        })
    }

    /// Current stats snapshot, computed on demand.
    pub fn get_stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            timestamp: Utc::now(),
            connections: self.registry.stats(self.idle_threshold),
            bus_healthy: self.channels.bus().is_healthy(),
            violations_last_hour: self.limiter.violations_last_hour(),
        }
    }

    /// Called by the collector loop; also refreshes the gauges.
    pub fn record_snapshot(&self) {
        let snapshot = self.get_stats();
        crate::metrics::update_connection_gauges(&snapshot.connections);
        crate::metrics::BUS_CONNECTION_STATUS.set(if snapshot.bus_healthy { 1 } else { 0 });

        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push_back(snapshot);
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    /// Snapshots from the last `hours` hours, oldest first.
    pub fn get_stats_history(&self, hours: u64) -> Vec<StatsSnapshot> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);
        let history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Close one connection with the admin close code.
    pub async fn disconnect_connection(
        &self,
        connection_id: Uuid,
        reason: &str,
    ) -> Result<(), AppError> {
        let handle = self
            .registry
            .get_connection(connection_id)
            .ok_or_else(|| AppError::NotFound(format!("connection {}", connection_id)))?;

        let _ = handle
            .send_preserialized(OutboundMessage::Close {
                code: close_code::ADMIN_CLOSE,
                reason: reason.to_string(),
            })
            .await;
        self.registry.unregister(connection_id);

        tracing::info!(connection_id = %connection_id, reason = %reason, "Connection closed by admin");
        Ok(())
    }

    /// Close every connection of an identity. Returns the closed count.
    pub async fn disconnect_identity(&self, identity: &str, reason: &str) -> usize {
        let handles = self.registry.connections_for_identity(identity);
        let mut closed = 0;

        for handle in handles {
            if self.disconnect_connection(handle.id, reason).await.is_ok() {
                closed += 1;
            }
        }

        tracing::info!(identity = %identity, closed, reason = %reason, "Identity disconnected by admin");
        closed
    }

    /// Broadcast an `admin_message` frame to a target.
    pub async fn broadcast_admin_message(
        &self,
        message: &str,
        target: BroadcastTarget,
    ) -> Result<PublishOutcome, AppError> {
        let frame = ServerMessage::admin_message(message);

        let outcome = match target {
            BroadcastTarget::All => self.channels.broadcast_all(frame).await,
            BroadcastTarget::Channel(name) => {
                self.channels
                    .publish_message(Topic::Channel(name), frame)
                    .await
            }
            BroadcastTarget::Room(name) => {
                self.channels.publish_message(Topic::Room(name), frame).await
            }
            BroadcastTarget::User(identity) => self.channels.send_to_user(&identity, frame).await,
        };

        Ok(outcome)
    }

    /// Reap connections past the stale threshold. Returns the reaped count.
    pub fn cleanup_stale_connections(&self) -> usize {
        let removed = self.registry.cleanup_stale_connections(self.stale_threshold);
        let count = removed.len();
        if count > 0 {
            crate::metrics::STALE_CONNECTIONS_REAPED.inc_by(count as u64);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, MessageBus};
    use crate::ratelimit::RateLimiter;
    use crate::registry::ConnectionLimits;
    use tokio::sync::mpsc;

    fn admin() -> (Arc<ConnectionRegistry>, AdminService) {
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default()));
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let channels = Arc::new(ChannelRoomService::new(
            registry.clone(),
            bus,
            "test-proc".to_string(),
        ));
        let limiter = Arc::new(RateLimiter::new(vec![], 100).unwrap());
        let service = AdminService::new(
            registry.clone(),
            channels,
            limiter,
            chrono::Duration::minutes(5),
            chrono::Duration::minutes(30),
            10,
        );
        (registry, service)
    }

    fn connect(
        registry: &ConnectionRegistry,
        identity: Option<&str>,
    ) -> (Uuid, mpsc::Receiver<crate::protocol::OutboundMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = registry
            .register(identity.map(String::from), None, None, tx)
            .unwrap();
        (handle.id, rx)
    }

    #[tokio::test]
    async fn test_list_connections_filter_and_pagination() {
        let (registry, admin) = admin();
        let (_a, _rxa) = connect(&registry, Some("u1"));
        let (_b, _rxb) = connect(&registry, Some("u1"));
        let (_c, _rxc) = connect(&registry, Some("u2"));

        let (all, total) = admin.list_connections(None, 0, 10).await;
        assert_eq!(all.len(), 3);
        assert_eq!(total, 3);

        // The total follows the filter, so filtered pagination works.
        let (filtered, total) = admin.list_connections(Some("u1"), 0, 10).await;
        assert_eq!(filtered.len(), 2);
        assert_eq!(total, 2);

        let (page, total) = admin.list_connections(None, 2, 10).await;
        assert_eq!(page.len(), 1);
        assert_eq!(total, 3);

        let (page, total) = admin.list_connections(None, 0, 1).await;
        assert_eq!(page.len(), 1);
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_disconnect_connection_sends_close() {
        let (registry, admin) = admin();
        let (conn_id, mut rx) = connect(&registry, Some("u1"));

        admin.disconnect_connection(conn_id, "policy").await.unwrap();

        match rx.recv().await {
            Some(OutboundMessage::Close { code, reason }) => {
                assert_eq!(code, close_code::ADMIN_CLOSE);
                assert_eq!(reason, "policy");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        assert!(registry.get_connection(conn_id).is_none());

        // Second disconnect of the same connection is NotFound
        let err = admin.disconnect_connection(conn_id, "again").await;
        assert!(matches!(err, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnect_identity_closes_all() {
        let (registry, admin) = admin();
        let (_a, _rxa) = connect(&registry, Some("u1"));
        let (_b, _rxb) = connect(&registry, Some("u1"));
        let (_c, _rxc) = connect(&registry, Some("u2"));

        assert_eq!(admin.disconnect_identity("u1", "policy").await, 2);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_user_reaches_exactly_that_user() {
        let (registry, admin) = admin();
        let (_a, mut rx_a) = connect(&registry, Some("u42"));
        let (_b, mut rx_b) = connect(&registry, Some("u7"));

        let outcome = admin
            .broadcast_admin_message("hello", BroadcastTarget::User("u42".to_string()))
            .await
            .unwrap();

        assert_eq!(outcome.local_delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats_history_ring() {
        let (_registry, admin) = admin();

        for _ in 0..15 {
            admin.record_snapshot();
        }

        // Ring capacity is 10
        let history = admin.get_stats_history(24);
        assert_eq!(history.len(), 10);
    }

    #[tokio::test]
    async fn test_broadcast_target_deserialization() {
        let target: BroadcastTarget =
            serde_json::from_str(r#"{"target_type":"user","target_id":"u42"}"#).unwrap();
        assert_eq!(target, BroadcastTarget::User("u42".to_string()));

        let target: BroadcastTarget = serde_json::from_str(r#"{"target_type":"all"}"#).unwrap();
        assert_eq!(target, BroadcastTarget::All);
    }
}
