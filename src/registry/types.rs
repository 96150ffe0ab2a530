//! Connection handle and related types

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{OutboundMessage, ServerMessage};

/// Derived connection status. A connection is idle once its last activity
/// is older than the configured idle threshold; it never stores the status
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Idle,
}

/// Handle for a single WebSocket connection
pub struct ConnectionHandle {
    pub id: Uuid,
    /// Authenticated identity; None for anonymous connections.
    pub identity: Option<String>,
    pub remote_addr: Option<String>,
    pub client_info: Option<String>,
    pub sender: mpsc::Sender<OutboundMessage>,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix seconds) - using AtomicI64 for lock-free updates
    last_activity: AtomicI64,
    pub channels: RwLock<HashSet<String>>,
    pub rooms: RwLock<HashSet<String>>,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(
        identity: Option<String>,
        remote_addr: Option<String>,
        client_info: Option<String>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identity,
            remote_addr,
            client_info,
            sender,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            channels: RwLock::new(HashSet::new()),
            rooms: RwLock::new(HashSet::new()),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    /// Status derived against an idle threshold.
    pub fn status(&self, idle_threshold: chrono::Duration) -> ConnectionStatus {
        if Utc::now().signed_duration_since(self.last_activity()) > idle_threshold {
            ConnectionStatus::Idle
        } else {
            ConnectionStatus::Active
        }
    }

    pub fn record_inbound(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_outbound(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Send a ServerMessage (serialized by the writer task).
    pub async fn send(
        &self,
        message: ServerMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(OutboundMessage::Raw(message)).await
    }

    /// Send a pre-serialized message (for efficient multi-send scenarios)
    pub async fn send_preserialized(
        &self,
        message: OutboundMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(message).await
    }
}

/// Limits applied at registration time
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_identity: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_connections_per_identity: 8,
        }
    }
}
