//! Shared pub/sub bus for cross-process fan-out.
//!
//! All processes reach one bus; a message published under a namespaced
//! topic arrives at every process's subscriber task, including the
//! publisher's own. Room membership lives in bus-held sets so it survives
//! reconnects and process restarts until an explicit leave or TTL expiry.

mod backoff;
mod circuit_breaker;
mod local_bus;
mod pool;
mod redis_bus;
mod subscriber;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use local_bus::LocalBus;
pub use pool::{PoolError, RedisPool};
pub use redis_bus::RedisBus;
pub use subscriber::BusSubscriber;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BusConfig;

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A logical bus topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Channel(String),
    Room(String),
    User(String),
    BroadcastAll,
}

impl Topic {
    /// Parse a logical topic string (`channel:<name>`, `room:<name>`,
    /// `user:<identity>`, `broadcast:all`).
    pub fn parse(topic: &str) -> Option<Self> {
        if topic == "broadcast:all" {
            return Some(Self::BroadcastAll);
        }
        let (kind, rest) = topic.split_once(':')?;
        if rest.is_empty() {
            return None;
        }
        match kind {
            "channel" => Some(Self::Channel(rest.to_string())),
            "room" => Some(Self::Room(rest.to_string())),
            "user" => Some(Self::User(rest.to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(name) => write!(f, "channel:{}", name),
            Self::Room(name) => write!(f, "room:{}", name),
            Self::User(identity) => write!(f, "user:{}", identity),
            Self::BroadcastAll => write!(f, "broadcast:all"),
        }
    }
}

/// Envelope carried on the bus.
///
/// The fingerprint identifies one logical message across the immediate
/// local-delivery path and the bus echo; `origin` names the publishing
/// process. Live socket handles are never serialized here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub fingerprint: Uuid,
    pub origin: String,
    pub message: crate::protocol::ServerMessage,
}

impl BusEnvelope {
    pub fn new(origin: impl Into<String>, message: crate::protocol::ServerMessage) -> Self {
        Self {
            fingerprint: Uuid::new_v4(),
            origin: origin.into(),
            message,
        }
    }
}

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cross-process pub/sub and room membership operations.
///
/// The Redis implementation backs multi-process deployments; the local
/// implementation keeps identical semantics for single-process mode and
/// tests. Callers treat every error as degradation, never as fatal.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Whether this bus reaches other processes.
    fn is_distributed(&self) -> bool;

    /// Publish an envelope under a logical topic.
    async fn publish(&self, topic: &Topic, envelope: &BusEnvelope) -> Result<(), BusError>;

    /// Add an identity to a room's authoritative member set.
    async fn add_room_member(&self, room: &str, identity: &str) -> Result<(), BusError>;

    /// Remove an identity from a room's authoritative member set.
    async fn remove_room_member(&self, room: &str, identity: &str) -> Result<(), BusError>;

    /// Read a room's authoritative member set.
    async fn room_members(&self, room: &str) -> Result<HashSet<String>, BusError>;

    /// Refresh the membership TTL for the given rooms. Returns the number
    /// of rooms refreshed.
    async fn refresh_room_ttls(&self, rooms: &[String]) -> Result<usize, BusError>;

    /// Whether the bus currently looks healthy.
    fn is_healthy(&self) -> bool;
}

/// Create a message bus from configuration.
pub fn create_bus(config: &BusConfig) -> Result<Arc<dyn MessageBus>, BusError> {
    if config.enabled {
        let cb = Arc::new(CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failure_threshold,
            success_threshold: config.circuit_breaker_success_threshold,
            reset_timeout_ms: config.circuit_breaker_reset_timeout_seconds * 1000,
        }));
        let pool = Arc::new(RedisPool::new(config.clone(), cb)?);
        tracing::info!(url = %config.url, prefix = %config.key_prefix, "Using Redis message bus");
        Ok(Arc::new(RedisBus::new(pool, config.clone())))
    } else {
        tracing::info!("Bus disabled, using in-process message bus");
        Ok(Arc::new(LocalBus::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;

    #[test]
    fn test_topic_parse_roundtrip() {
        for raw in ["channel:alerts", "room:ops", "user:u42", "broadcast:all"] {
            let topic = Topic::parse(raw).unwrap();
            assert_eq!(topic.to_string(), raw);
        }

        assert!(Topic::parse("nonsense").is_none());
        assert!(Topic::parse("channel:").is_none());
        assert!(Topic::parse("queue:jobs").is_none());
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = BusEnvelope::new("proc-1", ServerMessage::admin_message("hello"));
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: BusEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.fingerprint, envelope.fingerprint);
        assert_eq!(parsed.origin, "proc-1");
    }
}
