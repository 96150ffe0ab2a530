use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::Topic;
use crate::error::AppError;
use crate::protocol::{OutboundMessage, ServerMessage};

use super::{
    ConnectionHandle, ConnectionInfo, ConnectionLimits, ConnectionStats, ConnectionStatus,
};

/// Owns every live connection in this process.
///
/// Secondary indices (identity, channel, room) are kept in step with the
/// primary map; the room index is a local mirror of the bus-held member
/// sets, used for delivery when the bus cannot be reached.
pub struct ConnectionRegistry {
    /// connection_id -> ConnectionHandle
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    /// identity -> Set<connection_id> (supports multiple devices)
    identity_index: DashMap<String, HashSet<Uuid>>,
    /// channel name -> Set<connection_id>
    channel_index: DashMap<String, HashSet<Uuid>>,
    /// room name -> Set<connection_id>, local mirror of bus membership
    room_index: DashMap<String, HashSet<Uuid>>,
    limits: ConnectionLimits,
    peak_connections: AtomicUsize,
    peak_at_secs: AtomicI64,
    total_messages_sent: AtomicU64,
    total_messages_received: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            connections: DashMap::new(),
            identity_index: DashMap::new(),
            channel_index: DashMap::new(),
            room_index: DashMap::new(),
            limits,
            peak_connections: AtomicUsize::new(0),
            peak_at_secs: AtomicI64::new(0),
            total_messages_sent: AtomicU64::new(0),
            total_messages_received: AtomicU64::new(0),
        }
    }

    /// Register a new connection, enforcing the global and per-identity
    /// caps.
    pub fn register(
        &self,
        identity: Option<String>,
        remote_addr: Option<String>,
        client_info: Option<String>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, AppError> {
        let current = self.connections.len();
        if current >= self.limits.max_connections {
            return Err(AppError::CapacityExceeded {
                current,
                max: self.limits.max_connections,
            });
        }

        if let Some(ref identity) = identity {
            let per_identity = self
                .identity_index
                .get(identity)
                .map(|c| c.len())
                .unwrap_or(0);
            if per_identity >= self.limits.max_connections_per_identity {
                return Err(AppError::CapacityExceeded {
                    current: per_identity,
                    max: self.limits.max_connections_per_identity,
                });
            }
        }

        let handle = Arc::new(ConnectionHandle::new(
            identity,
            remote_addr,
            client_info,
            sender,
        ));
        let conn_id = handle.id;

        self.connections.insert(conn_id, handle.clone());

        if let Some(ref identity) = handle.identity {
            self.identity_index
                .entry(identity.clone())
                .or_default()
                .insert(conn_id);
        }

        let total = self.connections.len();
        if total > self.peak_connections.load(Ordering::Relaxed) {
            self.peak_connections.store(total, Ordering::Relaxed);
            self.peak_at_secs
                .store(Utc::now().timestamp(), Ordering::Relaxed);
        }

        tracing::info!(
            connection_id = %conn_id,
            identity = handle.identity.as_deref().unwrap_or("anonymous"),
            total_connections = total,
            "Connection registered"
        );

        Ok(handle)
    }

    /// Unregister a connection. Returns false when the connection was
    /// already gone, so repeated disconnects are no-ops.
    pub fn unregister(&self, connection_id: Uuid) -> bool {
        let Some((_, handle)) = self.connections.remove(&connection_id) else {
            return false;
        };

        if let Some(ref identity) = handle.identity {
            if let Some(mut conns) = self.identity_index.get_mut(identity) {
                conns.remove(&connection_id);
                if conns.is_empty() {
                    drop(conns);
                    self.identity_index.remove(identity);
                }
            }
        }

        for mut entry in self.channel_index.iter_mut() {
            entry.value_mut().remove(&connection_id);
        }
        self.channel_index.retain(|_, conns| !conns.is_empty());

        for mut entry in self.room_index.iter_mut() {
            entry.value_mut().remove(&connection_id);
        }
        self.room_index.retain(|_, conns| !conns.is_empty());

        self.total_messages_sent.fetch_add(
            handle.messages_sent.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.total_messages_received.fetch_add(
            handle.messages_received.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );

        tracing::info!(
            connection_id = %connection_id,
            identity = handle.identity.as_deref().unwrap_or("anonymous"),
            "Connection unregistered"
        );
        true
    }

    /// Send one message to one connection. A closed writer channel means
    /// the socket is gone; the connection is unregistered and the failure
    /// is absorbed, never raised.
    pub fn send_to_connection(&self, connection_id: Uuid, message: OutboundMessage) -> bool {
        let Some(handle) = self.connections.get(&connection_id).map(|h| h.clone()) else {
            return false;
        };

        match handle.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %connection_id, "Writer queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %connection_id, "Writer closed, unregistering");
                self.unregister(connection_id);
                false
            }
        }
    }

    /// Send to every connection of an identity. Returns delivered count.
    pub fn send_to_identity(&self, identity: &str, message: &OutboundMessage) -> usize {
        let conn_ids: Vec<Uuid> = self
            .identity_index
            .get(identity)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();

        conn_ids
            .into_iter()
            .filter(|id| self.send_to_connection(*id, message.clone()))
            .count()
    }

    /// Deliver a message to every local connection matching a topic.
    /// Serializes once and fans out; a dead socket only costs its own
    /// delivery. Returns delivered count.
    pub fn local_deliver(&self, topic: &Topic, message: &ServerMessage) -> usize {
        let outbound = match OutboundMessage::preserialized(message) {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(error = %e, topic = %topic, "Failed to serialize for delivery");
                return 0;
            }
        };

        let conn_ids: Vec<Uuid> = match topic {
            Topic::Channel(name) => self
                .channel_index
                .get(name)
                .map(|c| c.iter().copied().collect())
                .unwrap_or_default(),
            Topic::Room(name) => self
                .room_index
                .get(name)
                .map(|c| c.iter().copied().collect())
                .unwrap_or_default(),
            Topic::User(identity) => self
                .identity_index
                .get(identity)
                .map(|c| c.iter().copied().collect())
                .unwrap_or_default(),
            Topic::BroadcastAll => self.connections.iter().map(|r| *r.key()).collect(),
        };

        conn_ids
            .into_iter()
            .filter(|id| self.send_to_connection(*id, outbound.clone()))
            .count()
    }

    /// Subscribe a connection to a channel
    pub async fn subscribe_to_channel(&self, connection_id: Uuid, channel: &str) -> bool {
        let Some(handle) = self.connections.get(&connection_id).map(|h| h.clone()) else {
            return false;
        };

        handle.channels.write().await.insert(channel.to_string());
        self.channel_index
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id);

        tracing::debug!(connection_id = %connection_id, channel = %channel, "Subscribed to channel");
        true
    }

    /// Unsubscribe a connection from a channel
    pub async fn unsubscribe_from_channel(&self, connection_id: Uuid, channel: &str) -> bool {
        let Some(handle) = self.connections.get(&connection_id).map(|h| h.clone()) else {
            return false;
        };

        handle.channels.write().await.remove(channel);
        if let Some(mut conns) = self.channel_index.get_mut(channel) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                drop(conns);
                self.channel_index.remove(channel);
            }
        }

        tracing::debug!(connection_id = %connection_id, channel = %channel, "Unsubscribed from channel");
        true
    }

    /// Record room membership in the local mirror.
    pub async fn join_room_local(&self, connection_id: Uuid, room: &str) -> bool {
        let Some(handle) = self.connections.get(&connection_id).map(|h| h.clone()) else {
            return false;
        };

        handle.rooms.write().await.insert(room.to_string());
        self.room_index
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
        true
    }

    /// Remove room membership from the local mirror.
    pub async fn leave_room_local(&self, connection_id: Uuid, room: &str) -> bool {
        let Some(handle) = self.connections.get(&connection_id).map(|h| h.clone()) else {
            return false;
        };

        handle.rooms.write().await.remove(room);
        if let Some(mut conns) = self.room_index.get_mut(room) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                drop(conns);
                self.room_index.remove(room);
            }
        }
        true
    }

    pub fn get_connection(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn connections_for_identity(&self, identity: &str) -> Vec<Arc<ConnectionHandle>> {
        self.identity_index
            .get(identity)
            .map(|conn_ids| {
                conn_ids
                    .iter()
                    .filter_map(|id| self.connections.get(id).map(|h| h.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_subscriber_count(&self, channel: &str) -> usize {
        self.channel_index.get(channel).map(|c| c.len()).unwrap_or(0)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channel_index.iter().map(|e| e.key().clone()).collect()
    }

    /// Rooms with at least one local member (for bus TTL refresh).
    pub fn local_rooms(&self) -> Vec<String> {
        self.room_index.iter().map(|e| e.key().clone()).collect()
    }

    pub fn local_room_connection_count(&self, room: &str) -> usize {
        self.room_index.get(room).map(|c| c.len()).unwrap_or(0)
    }

    /// Build the admin view of one connection.
    pub async fn connection_info(
        &self,
        handle: &ConnectionHandle,
        idle_threshold: chrono::Duration,
    ) -> ConnectionInfo {
        let mut channels: Vec<String> = handle.channels.read().await.iter().cloned().collect();
        channels.sort();
        let mut rooms: Vec<String> = handle.rooms.read().await.iter().cloned().collect();
        rooms.sort();

        ConnectionInfo {
            id: handle.id,
            identity: handle.identity.clone(),
            remote_addr: handle.remote_addr.clone(),
            client_info: handle.client_info.clone(),
            status: handle.status(idle_threshold),
            connected_at: handle.connected_at,
            last_activity: handle.last_activity(),
            channels,
            rooms,
            messages_sent: handle.messages_sent.load(Ordering::Relaxed),
            messages_received: handle.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Compute statistics in a single pass so the active/idle split always
    /// sums to the total.
    pub fn stats(&self, idle_threshold: chrono::Duration) -> ConnectionStats {
        let mut active = 0usize;
        let mut idle = 0usize;
        let mut anonymous = 0usize;
        let mut messages_sent = self.total_messages_sent.load(Ordering::Relaxed);
        let mut messages_received = self.total_messages_received.load(Ordering::Relaxed);

        for entry in self.connections.iter() {
            let handle = entry.value();
            match handle.status(idle_threshold) {
                ConnectionStatus::Active => active += 1,
                ConnectionStatus::Idle => idle += 1,
            }
            if handle.identity.is_none() {
                anonymous += 1;
            }
            messages_sent += handle.messages_sent.load(Ordering::Relaxed);
            messages_received += handle.messages_received.load(Ordering::Relaxed);
        }

        let mut channels = std::collections::HashMap::new();
        for entry in self.channel_index.iter() {
            channels.insert(entry.key().clone(), entry.value().len());
        }
        let mut rooms = std::collections::HashMap::new();
        for entry in self.room_index.iter() {
            rooms.insert(entry.key().clone(), entry.value().len());
        }

        let peak_secs = self.peak_at_secs.load(Ordering::Relaxed);
        ConnectionStats {
            total_connections: active + idle,
            active_connections: active,
            idle_connections: idle,
            unique_identities: self.identity_index.len(),
            anonymous_connections: anonymous,
            channels,
            rooms,
            peak_connections: self.peak_connections.load(Ordering::Relaxed),
            peak_at: chrono::DateTime::from_timestamp(peak_secs, 0).filter(|_| peak_secs > 0),
            messages_sent,
            messages_received,
        }
    }

    /// Find connections inactive for longer than the stale threshold.
    pub fn find_stale_connections(&self, stale_threshold: chrono::Duration) -> Vec<Uuid> {
        let now = Utc::now();
        self.connections
            .iter()
            .filter(|entry| {
                now.signed_duration_since(entry.value().last_activity()) > stale_threshold
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Reap stale connections, returning the removed ids so callers can
    /// clean up bus-side room membership.
    pub fn cleanup_stale_connections(&self, stale_threshold: chrono::Duration) -> Vec<Uuid> {
        let stale = self.find_stale_connections(stale_threshold);
        let mut removed = Vec::with_capacity(stale.len());

        for conn_id in stale {
            tracing::info!(connection_id = %conn_id, "Removing stale connection due to inactivity");
            if self.unregister(conn_id) {
                removed.push(conn_id);
            }
        }

        removed
    }
}
