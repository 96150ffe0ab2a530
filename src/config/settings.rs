use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::ratelimit::RateLimitRule;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub ratelimit: RateLimitSettings,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtConfig {
    /// HS256 secret; when unset, only anonymous connections are accepted.
    pub secret: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// Shared bus (Redis) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// When disabled the service runs single-process with an in-memory bus.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bus_url")]
    pub url: String,
    /// Prefix for every bus topic and room membership key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Room membership TTL; refreshed by the heartbeat task so crashed
    /// processes cannot leave phantom members behind.
    #[serde(default = "default_room_ttl")]
    pub room_ttl_seconds: u64,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
}

/// Connection lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Minutes of inactivity before a connection is reported idle.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_minutes: u64,
    /// Minutes of inactivity before a connection is reaped. Must exceed
    /// the idle threshold.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_minutes: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_collection_interval_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_identity")]
    pub max_connections_per_identity: usize,
    /// How many hourly stats snapshots the history ring retains.
    #[serde(default = "default_stats_history_hours")]
    pub stats_history_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_max_violations_history")]
    pub max_violations_history: usize,
    /// Initial rule set; empty means use the built-in defaults.
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otel_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_bus_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "relay".to_string()
}

fn default_room_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_idle_threshold() -> u64 {
    5
}

fn default_stale_threshold() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    120
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_connections_per_identity() -> usize {
    8
}

fn default_stats_history_hours() -> u64 {
    24
}

fn default_max_violations_history() -> usize {
    1000
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "relay-realtime-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("bus.url", "redis://localhost:6379")?
            .set_default("realtime.idle_threshold_minutes", 5)?
            .set_default("realtime.stale_threshold_minutes", 30)?
            .set_default("realtime.heartbeat_interval_seconds", 30)?
            .set_default("realtime.stats_collection_interval_seconds", 60)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, JWT_SECRET, BUS_URL, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.realtime.stale_threshold_minutes <= self.realtime.idle_threshold_minutes {
            return Err(ConfigError::Message(format!(
                "stale_threshold_minutes ({}) must exceed idle_threshold_minutes ({})",
                self.realtime.stale_threshold_minutes, self.realtime.idle_threshold_minutes
            )));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_bus_url(),
            key_prefix: default_key_prefix(),
            room_ttl_seconds: default_room_ttl(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            idle_threshold_minutes: default_idle_threshold(),
            stale_threshold_minutes: default_stale_threshold(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            stats_collection_interval_seconds: default_stats_interval(),
            cleanup_interval_seconds: default_cleanup_interval(),
            max_connections: default_max_connections(),
            max_connections_per_identity: default_max_connections_per_identity(),
            stats_history_hours: default_stats_history_hours(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_violations_history: default_max_violations_history(),
            rules: vec![],
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_otel_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
