//! Connection statistics and info structures

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::ConnectionStatus;

/// Point-in-time connection statistics, computed from a single pass over
/// the registry so `active_connections + idle_connections ==
/// total_connections` always holds.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub unique_identities: usize,
    pub anonymous_connections: usize,
    /// channel name -> local subscriber count
    pub channels: HashMap<String, usize>,
    /// room name -> local member connection count
    pub rooms: HashMap<String, usize>,
    pub peak_connections: usize,
    pub peak_at: Option<DateTime<Utc>>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Per-connection view for admin listing
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: uuid::Uuid,
    pub identity: Option<String>,
    pub remote_addr: Option<String>,
    pub client_info: Option<String>,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub channels: Vec<String>,
    pub rooms: Vec<String>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Channel information
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub subscriber_count: usize,
}

/// Room information (local view plus the authoritative member set)
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub name: String,
    pub local_connections: usize,
    pub members: Vec<String>,
}
