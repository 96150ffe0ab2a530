//! Redis-backed implementation of the shared bus.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::config::BusConfig;

use super::{BusEnvelope, BusError, MessageBus, RedisPool, Topic};

pub struct RedisBus {
    pool: Arc<RedisPool>,
    config: BusConfig,
}

impl RedisBus {
    pub fn new(pool: Arc<RedisPool>, config: BusConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> Arc<RedisPool> {
        self.pool.clone()
    }

    /// Wire channel name for a logical topic.
    pub fn wire_topic(&self, topic: &Topic) -> String {
        format!("{}:{}", self.config.key_prefix, topic)
    }

    /// Redis key holding a room's member set.
    fn room_key(&self, room: &str) -> String {
        format!("{}:rooms:{}", self.config.key_prefix, room)
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    fn is_distributed(&self) -> bool {
        true
    }

    async fn publish(&self, topic: &Topic, envelope: &BusEnvelope) -> Result<(), BusError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.pool.get_connection().await?;

        let result: Result<(), redis::RedisError> =
            conn.publish(self.wire_topic(topic), payload).await;

        match result {
            Ok(()) => {
                self.pool.record_outcome(None).await;
                tracing::debug!(topic = %topic, fingerprint = %envelope.fingerprint, "Published to bus");
                Ok(())
            }
            Err(e) => {
                self.pool.record_outcome(Some(&e)).await;
                Err(BusError::Pool(e.into()))
            }
        }
    }

    async fn add_room_member(&self, room: &str, identity: &str) -> Result<(), BusError> {
        let mut conn = self.pool.get_connection().await?;
        let key = self.room_key(room);

        let result: Result<(), redis::RedisError> = redis::pipe()
            .cmd("SADD")
            .arg(&key)
            .arg(identity)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.room_ttl_seconds as i64)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                self.pool.record_outcome(None).await;
                Ok(())
            }
            Err(e) => {
                self.pool.record_outcome(Some(&e)).await;
                Err(BusError::Pool(e.into()))
            }
        }
    }

    async fn remove_room_member(&self, room: &str, identity: &str) -> Result<(), BusError> {
        let mut conn = self.pool.get_connection().await?;

        let result: Result<(), redis::RedisError> =
            conn.srem(self.room_key(room), identity).await;

        match result {
            Ok(()) => {
                self.pool.record_outcome(None).await;
                Ok(())
            }
            Err(e) => {
                self.pool.record_outcome(Some(&e)).await;
                Err(BusError::Pool(e.into()))
            }
        }
    }

    async fn room_members(&self, room: &str) -> Result<HashSet<String>, BusError> {
        let mut conn = self.pool.get_connection().await?;

        let result: Result<HashSet<String>, redis::RedisError> =
            conn.smembers(self.room_key(room)).await;

        match result {
            Ok(members) => {
                self.pool.record_outcome(None).await;
                Ok(members)
            }
            Err(e) => {
                self.pool.record_outcome(Some(&e)).await;
                Err(BusError::Pool(e.into()))
            }
        }
    }

    async fn refresh_room_ttls(&self, rooms: &[String]) -> Result<usize, BusError> {
        if rooms.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get_connection().await?;
        let mut refreshed = 0;

        for room in rooms {
            let result: Result<i32, redis::RedisError> = conn
                .expire(self.room_key(room), self.config.room_ttl_seconds as i64)
                .await;

            match result {
                Ok(1) => refreshed += 1,
                Ok(_) => {} // key already expired
                Err(e) => {
                    self.pool.record_outcome(Some(&e)).await;
                    return Err(BusError::Pool(e.into()));
                }
            }
        }

        self.pool.record_outcome(None).await;
        Ok(refreshed)
    }

    fn is_healthy(&self) -> bool {
        self.pool.is_healthy()
    }
}
