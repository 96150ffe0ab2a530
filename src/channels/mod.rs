//! Channel and room fan-out.
//!
//! Channels are ephemeral per-process subscriber lists; rooms carry an
//! authoritative member set in the shared bus keyed by identity, so
//! membership survives reconnects and process restarts. Every publish goes
//! out on the bus exactly once and is delivered locally right away, with a
//! fingerprint cache suppressing the bus echo.

mod dedup;

pub use dedup::DeliveryDedup;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::bus::{BusEnvelope, MessageBus, Topic};
use crate::error::AppError;
use crate::protocol::{is_valid_topic_name, OutboundMessage, ServerMessage};
use crate::registry::ConnectionRegistry;

/// How long a publish fingerprint is held against the bus echo.
const DEDUP_TTL: Duration = Duration::from_secs(10);

/// Result of a publish: local deliveries always happen; `distributed` is
/// false when the bus could not carry the message to other processes.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub local_delivered: usize,
    pub distributed: bool,
}

pub struct ChannelRoomService {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn MessageBus>,
    dedup: DeliveryDedup,
    /// Identifies this process as the origin of its bus envelopes.
    origin: String,
}

impl ChannelRoomService {
    pub fn new(registry: Arc<ConnectionRegistry>, bus: Arc<dyn MessageBus>, origin: String) -> Self {
        Self {
            registry,
            bus,
            dedup: DeliveryDedup::new(DEDUP_TTL),
            origin,
        }
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    fn validate_name(name: &str) -> Result<(), AppError> {
        if is_valid_topic_name(name) {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "invalid channel or room name: {:?}",
                name
            )))
        }
    }

    pub async fn subscribe_to_channel(
        &self,
        connection_id: uuid::Uuid,
        channel: &str,
    ) -> Result<(), AppError> {
        Self::validate_name(channel)?;
        if !self.registry.subscribe_to_channel(connection_id, channel).await {
            return Err(AppError::NotFound(format!("connection {}", connection_id)));
        }
        Ok(())
    }

    pub async fn unsubscribe_from_channel(
        &self,
        connection_id: uuid::Uuid,
        channel: &str,
    ) -> Result<(), AppError> {
        Self::validate_name(channel)?;
        if !self.registry.unsubscribe_from_channel(connection_id, channel).await {
            return Err(AppError::NotFound(format!("connection {}", connection_id)));
        }
        Ok(())
    }

    /// Join a room: the identity enters the authoritative bus set, the
    /// local mirror tracks the connection, and a `member_joined` event goes
    /// to the room.
    #[tracing::instrument(skip(self), fields(connection_id = %connection_id, room = %room))]
    pub async fn join_room(&self, connection_id: uuid::Uuid, room: &str) -> Result<(), AppError> {
        Self::validate_name(room)?;

        let handle = self
            .registry
            .get_connection(connection_id)
            .ok_or_else(|| AppError::NotFound(format!("connection {}", connection_id)))?;
        let identity = handle
            .identity
            .clone()
            .ok_or_else(|| AppError::Validation("room membership requires an authenticated identity".to_string()))?;

        if let Err(e) = self.bus.add_room_member(room, &identity).await {
            tracing::warn!(error = %e, room = %room, "Bus unavailable, room membership is local-only");
        }
        self.registry.join_room_local(connection_id, room).await;

        self.publish(
            Topic::Room(room.to_string()),
            ServerMessage::member_joined(room, identity.clone()),
        )
        .await;

        tracing::info!(identity = %identity, "Joined room");
        Ok(())
    }

    /// Leave a room and notify remaining members.
    #[tracing::instrument(skip(self), fields(connection_id = %connection_id, room = %room))]
    pub async fn leave_room(&self, connection_id: uuid::Uuid, room: &str) -> Result<(), AppError> {
        Self::validate_name(room)?;

        let handle = self
            .registry
            .get_connection(connection_id)
            .ok_or_else(|| AppError::NotFound(format!("connection {}", connection_id)))?;
        let identity = handle
            .identity
            .clone()
            .ok_or_else(|| AppError::Validation("room membership requires an authenticated identity".to_string()))?;

        self.registry.leave_room_local(connection_id, room).await;

        // Only drop the identity from the authoritative set once its last
        // local connection has left the room.
        let still_member = self.identity_in_room_locally(&identity, room).await;

        if !still_member {
            if let Err(e) = self.bus.remove_room_member(room, &identity).await {
                tracing::warn!(error = %e, room = %room, "Bus unavailable, room leave is local-only");
            }
        }

        self.publish(
            Topic::Room(room.to_string()),
            ServerMessage::member_left(room, identity.clone()),
        )
        .await;

        tracing::info!(identity = %identity, "Left room");
        Ok(())
    }

    async fn identity_in_room_locally(&self, identity: &str, room: &str) -> bool {
        for handle in self.registry.connections_for_identity(identity) {
            if handle.rooms.read().await.contains(room) {
                return true;
            }
        }
        false
    }

    /// Authoritative member list for a room. Falls back to the local
    /// mirror when the bus is unreachable.
    pub async fn get_members(&self, room: &str) -> Result<Vec<String>, AppError> {
        Self::validate_name(room)?;

        let mut members: Vec<String> = match self.bus.room_members(room).await {
            Ok(members) => members.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, room = %room, "Bus unavailable, using local room view");
                let mut local = std::collections::HashSet::new();
                for handle in self.registry.all_connections() {
                    if handle.rooms.read().await.contains(room) {
                        if let Some(ref identity) = handle.identity {
                            local.insert(identity.clone());
                        }
                    }
                }
                local.into_iter().collect()
            }
        };

        members.sort();
        Ok(members)
    }

    #[tracing::instrument(skip(self, payload), fields(channel = %channel))]
    pub async fn publish_to_channel(
        &self,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<PublishOutcome, AppError> {
        Self::validate_name(channel)?;
        crate::metrics::record_publish("channel");
        Ok(self
            .publish(
                Topic::Channel(channel.to_string()),
                ServerMessage::notification(payload),
            )
            .await)
    }

    #[tracing::instrument(skip(self, payload), fields(room = %room))]
    pub async fn publish_to_room(
        &self,
        room: &str,
        payload: serde_json::Value,
    ) -> Result<PublishOutcome, AppError> {
        Self::validate_name(room)?;
        crate::metrics::record_publish("room");
        Ok(self
            .publish(
                Topic::Room(room.to_string()),
                ServerMessage::notification(payload),
            )
            .await)
    }

    /// Send to every connection of one identity, across processes.
    pub async fn send_to_user(&self, identity: &str, message: ServerMessage) -> PublishOutcome {
        crate::metrics::record_publish("user");
        self.publish(Topic::User(identity.to_string()), message).await
    }

    /// Send to every connection in every process.
    pub async fn broadcast_all(&self, message: ServerMessage) -> PublishOutcome {
        crate::metrics::record_publish("broadcast");
        self.publish(Topic::BroadcastAll, message).await
    }

    /// Publish an arbitrary server message under a topic (admin
    /// broadcasts use this with `admin_message` frames).
    pub async fn publish_message(&self, topic: Topic, message: ServerMessage) -> PublishOutcome {
        self.publish(topic, message).await
    }

    /// Core publish path: one bus publish, immediate local delivery, and a
    /// marked fingerprint so the echo is not delivered twice.
    async fn publish(&self, topic: Topic, message: ServerMessage) -> PublishOutcome {
        let envelope = BusEnvelope::new(self.origin.clone(), message);
        self.dedup.mark(envelope.fingerprint);

        let local_delivered = self.deliver(&topic, &envelope.message).await;
        crate::metrics::record_delivered(local_delivered as u64);

        let distributed = if self.bus.is_distributed() {
            match self.bus.publish(&topic, &envelope).await {
                Ok(()) => true,
                Err(e) => {
                    crate::metrics::record_bus_publish_failure();
                    tracing::warn!(error = %e, topic = %topic, "Bus publish failed, delivery was local-only");
                    false
                }
            }
        } else {
            false
        };

        PublishOutcome {
            local_delivered,
            distributed,
        }
    }

    /// Deliver a message to local connections for a topic. Room delivery
    /// consults the authoritative bus set so identities that joined through
    /// another process (or before a restart) are still reached.
    async fn deliver(&self, topic: &Topic, message: &ServerMessage) -> usize {
        match topic {
            Topic::Room(room) => match self.bus.room_members(room).await {
                Ok(members) => {
                    let outbound = match OutboundMessage::preserialized(message) {
                        Ok(o) => o,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize room message");
                            return 0;
                        }
                    };
                    members
                        .iter()
                        .map(|identity| self.registry.send_to_identity(identity, &outbound))
                        .sum()
                }
                Err(e) => {
                    tracing::warn!(error = %e, room = %room, "Bus unavailable, delivering to local room view");
                    self.registry.local_deliver(topic, message)
                }
            },
            _ => self.registry.local_deliver(topic, message),
        }
    }

    /// Entry point for the bus subscriber. Envelopes this process already
    /// delivered locally are dropped by fingerprint.
    pub async fn handle_bus_message(&self, topic: &Topic, envelope: BusEnvelope) {
        if self.dedup.check_and_clear(envelope.fingerprint) {
            tracing::trace!(fingerprint = %envelope.fingerprint, "Skipping bus echo of local publish");
            return;
        }

        let delivered = self.deliver(topic, &envelope.message).await;
        crate::metrics::record_delivered(delivered as u64);
        tracing::debug!(
            topic = %topic,
            origin = %envelope.origin,
            delivered,
            "Delivered bus message"
        );
    }
}
