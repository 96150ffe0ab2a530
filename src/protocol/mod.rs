//! Wire protocol types for the WebSocket envelope.
//!
//! Every frame is a JSON object tagged by `type` and stamped with an
//! ISO-8601 `timestamp`. The reserved types are `ping`/`pong`,
//! `notification`, `admin_message`, `member_joined`/`member_left`,
//! `auth_error` and `error`; `shutdown` is sent once during graceful
//! shutdown.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// WebSocket close codes used by the service.
pub mod close_code {
    /// Handshake authentication failed.
    pub const AUTH_FAILURE: u16 = 4401;
    /// Connection terminated by a disconnect-action rate limit rule.
    pub const RATE_LIMITED: u16 = 4429;
    /// Connection terminated by an administrator.
    pub const ADMIN_CLOSE: u16 = 4000;
    /// Server is at capacity.
    pub const CAPACITY: u16 = 1013;
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    JoinRoom { room: String },
    LeaveRoom { room: String },
    PublishChannel { channel: String, payload: serde_json::Value },
    PublishRoom { room: String, payload: serde_json::Value },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Notification {
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    AdminMessage {
        message: String,
        timestamp: DateTime<Utc>,
    },
    MemberJoined {
        room: String,
        identity: String,
        timestamp: DateTime<Utc>,
    },
    MemberLeft {
        room: String,
        identity: String,
        timestamp: DateTime<Utc>,
    },
    AuthError {
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_seconds: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    Shutdown {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reconnect_after_seconds: Option<u64>,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn notification(payload: serde_json::Value) -> Self {
        Self::Notification {
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn admin_message(message: impl Into<String>) -> Self {
        Self::AdminMessage {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn member_joined(room: impl Into<String>, identity: impl Into<String>) -> Self {
        Self::MemberJoined {
            room: room.into(),
            identity: identity.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn member_left(room: impl Into<String>, identity: impl Into<String>) -> Self {
        Self::MemberLeft {
            room: room.into(),
            identity: identity.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn auth_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthError {
            code: code.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            retry_after_seconds: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error_with_retry(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_seconds: u64,
    ) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            retry_after_seconds: Some(retry_after_seconds),
            timestamp: Utc::now(),
        }
    }

    pub fn shutdown(reason: impl Into<String>, reconnect_after_seconds: Option<u64>) -> Self {
        Self::Shutdown {
            reason: reason.into(),
            reconnect_after_seconds,
            timestamp: Utc::now(),
        }
    }
}

/// Outbound message for the per-connection writer task.
///
/// `Serialized` carries JSON produced once and shared across a fan-out;
/// `Close` instructs the writer to emit a close frame and stop.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Raw(ServerMessage),
    Serialized(Arc<str>),
    Close { code: u16, reason: String },
}

impl OutboundMessage {
    /// Serialize a message once for sharing across many connections.
    pub fn preserialized(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(message)?;
        Ok(Self::Serialized(Arc::from(json.as_str())))
    }

    /// Produce the JSON text for this message, if it carries one.
    pub fn to_json(&self) -> Result<Option<String>, serde_json::Error> {
        match self {
            Self::Raw(msg) => serde_json::to_string(msg).map(Some),
            Self::Serialized(json) => Ok(Some(json.to_string())),
            Self::Close { .. } => Ok(None),
        }
    }
}

/// Validate a channel or room name.
pub fn is_valid_topic_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }

    name.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"alerts"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { channel } if channel == "alerts"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_room","room":"ops"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinRoom { room } if room == "ops"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_server_message_envelope() {
        let json = serde_json::to_string(&ServerMessage::error("INVALID_MESSAGE", "bad")).unwrap();
        assert!(json.contains(r#""type":"error"#));
        assert!(json.contains("timestamp"));
        assert!(!json.contains("retry_after_seconds"));

        let json =
            serde_json::to_string(&ServerMessage::error_with_retry("RATE_LIMITED", "slow down", 8))
                .unwrap();
        assert!(json.contains(r#""retry_after_seconds":8"#));
    }

    #[test]
    fn test_preserialized_roundtrip() {
        let msg = ServerMessage::admin_message("maintenance at noon");
        let outbound = OutboundMessage::preserialized(&msg).unwrap();
        let json = outbound.to_json().unwrap().unwrap();
        assert!(json.contains("admin_message"));

        let close = OutboundMessage::Close {
            code: close_code::ADMIN_CLOSE,
            reason: "bye".to_string(),
        };
        assert!(close.to_json().unwrap().is_none());
    }

    #[test]
    fn test_valid_topic_names() {
        assert!(is_valid_topic_name("alerts"));
        assert!(is_valid_topic_name("system-alerts"));
        assert!(is_valid_topic_name("v1.events"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("has spaces"));
        assert!(!is_valid_topic_name("path/segment"));
        assert!(!is_valid_topic_name(&"a".repeat(65)));
    }
}
