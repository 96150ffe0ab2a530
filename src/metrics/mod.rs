//! Prometheus metrics for the realtime service.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "relay";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of active WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of live WebSocket connections"
    ).unwrap();

    /// Number of unique connected identities
    pub static ref IDENTITIES_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_identities_connected", METRIC_PREFIX),
        "Number of unique connected identities"
    ).unwrap();

    /// Channels with at least one local subscriber
    pub static ref CHANNELS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_channels_active", METRIC_PREFIX),
        "Channels with at least one local subscriber"
    ).unwrap();

    /// Rooms with at least one local member connection
    pub static ref ROOMS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_rooms_active", METRIC_PREFIX),
        "Rooms with at least one local member connection"
    ).unwrap();

    /// WebSocket connections opened
    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections opened"
    ).unwrap();

    /// WebSocket connections closed
    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// WebSocket messages received from clients, by type
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Total WebSocket messages received from clients",
        &["type"]
    ).unwrap();

    /// Stale connections reaped by the cleanup loop
    pub static ref STALE_CONNECTIONS_REAPED: IntCounter = register_int_counter!(
        format!("{}_stale_connections_reaped_total", METRIC_PREFIX),
        "Total stale connections removed by cleanup"
    ).unwrap();

    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Publishes by target kind
    pub static ref MESSAGES_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_published_total", METRIC_PREFIX),
        "Total messages published",
        &["target"]
    ).unwrap();

    /// Local deliveries to connections
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total messages delivered to local connections"
    ).unwrap();

    // ============================================================================
    // Bus Metrics
    // ============================================================================

    /// Bus health (1 = healthy, 0 = unhealthy)
    pub static ref BUS_CONNECTION_STATUS: IntGauge = register_int_gauge!(
        format!("{}_bus_connection_status", METRIC_PREFIX),
        "Bus connection status (1=healthy, 0=unhealthy)"
    ).unwrap();

    /// Publishes that could not reach the bus
    pub static ref BUS_PUBLISH_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_bus_publish_failures_total", METRIC_PREFIX),
        "Total publishes that fell back to local-only delivery"
    ).unwrap();

    /// Messages received from the bus subscriber
    pub static ref BUS_MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        format!("{}_bus_messages_received_total", METRIC_PREFIX),
        "Total messages received from the shared bus"
    ).unwrap();

    // ============================================================================
    // Rate Limiting Metrics
    // ============================================================================

    /// Messages rejected by the rate limiter, by action
    pub static ref RATELIMIT_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_rejected_total", METRIC_PREFIX),
        "Total messages rejected by the rate limiter",
        &["action"]
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    /// Heartbeat send timeouts
    pub static ref HEARTBEAT_TIMEOUTS: IntCounter = register_int_counter!(
        format!("{}_heartbeat_timeouts_total", METRIC_PREFIX),
        "Total heartbeat send timeouts"
    ).unwrap();
}

pub fn record_publish(target: &str) {
    MESSAGES_PUBLISHED_TOTAL.with_label_values(&[target]).inc();
}

pub fn record_delivered(count: u64) {
    MESSAGES_DELIVERED_TOTAL.inc_by(count);
}

pub fn record_bus_publish_failure() {
    BUS_PUBLISH_FAILURES_TOTAL.inc();
}

pub fn record_rate_limit_rejection(action: &str) {
    RATELIMIT_REJECTED_TOTAL.with_label_values(&[action]).inc();
}

pub fn record_ws_message(message_type: &str) {
    WS_MESSAGES_RECEIVED.with_label_values(&[message_type]).inc();
}

/// Refresh the connection gauges from a registry snapshot.
pub fn update_connection_gauges(stats: &crate::registry::ConnectionStats) {
    CONNECTIONS_TOTAL.set(stats.total_connections as i64);
    IDENTITIES_CONNECTED.set(stats.unique_identities as i64);
    CHANNELS_ACTIVE.set(stats.channels.len() as i64);
    ROOMS_ACTIVE.set(stats.rooms.len() as i64);
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics encoding produced invalid UTF-8: {}", e)))
}
