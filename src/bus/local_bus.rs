//! In-process bus for single-process deployments and tests.
//!
//! Room membership keeps the same survive-reconnect semantics as the Redis
//! bus: the member set outlives any individual connection. Publishes are
//! accepted but reach no other process.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BusEnvelope, BusError, MessageBus, Topic};

#[derive(Default)]
pub struct LocalBus {
    rooms: DashMap<String, HashSet<String>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    fn is_distributed(&self) -> bool {
        false
    }

    async fn publish(&self, topic: &Topic, envelope: &BusEnvelope) -> Result<(), BusError> {
        tracing::trace!(topic = %topic, fingerprint = %envelope.fingerprint, "Local bus publish (no-op)");
        Ok(())
    }

    async fn add_room_member(&self, room: &str, identity: &str) -> Result<(), BusError> {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(identity.to_string());
        Ok(())
    }

    async fn remove_room_member(&self, room: &str, identity: &str) -> Result<(), BusError> {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(identity);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
        Ok(())
    }

    async fn room_members(&self, room: &str) -> Result<HashSet<String>, BusError> {
        Ok(self
            .rooms
            .get(room)
            .map(|m| m.clone())
            .unwrap_or_default())
    }

    async fn refresh_room_ttls(&self, _rooms: &[String]) -> Result<usize, BusError> {
        // No TTLs to refresh in-process
        Ok(0)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
