use std::sync::Arc;

use crate::admin::AdminService;
use crate::auth::JwtValidator;
use crate::bus::MessageBus;
use crate::channels::ChannelRoomService;
use crate::config::Settings;
use crate::error::AppError;
use crate::ratelimit::{RateLimitRule, RateLimiter, RuleAction, RuleScope};
use crate::registry::{ConnectionLimits, ConnectionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt_validator: Option<Arc<JwtValidator>>,
    pub registry: Arc<ConnectionRegistry>,
    pub channels: Arc<ChannelRoomService>,
    pub limiter: Arc<RateLimiter>,
    pub admin: Arc<AdminService>,
    /// Identifies this process on the bus
    pub process_id: String,
}

impl AppState {
    pub fn new(settings: Settings, bus: Arc<dyn MessageBus>) -> Result<Self, AppError> {
        let process_id = uuid::Uuid::new_v4().to_string();

        let jwt_validator = JwtValidator::from_config(&settings.jwt).map(Arc::new);
        if jwt_validator.is_none() {
            tracing::warn!("No JWT secret configured, accepting anonymous connections only");
        }

        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits {
            max_connections: settings.realtime.max_connections,
            max_connections_per_identity: settings.realtime.max_connections_per_identity,
        }));

        let channels = Arc::new(ChannelRoomService::new(
            registry.clone(),
            bus,
            process_id.clone(),
        ));

        let rules = if settings.ratelimit.rules.is_empty() {
            default_rules()
        } else {
            settings.ratelimit.rules.clone()
        };
        let limiter = Arc::new(RateLimiter::new(
            rules,
            settings.ratelimit.max_violations_history,
        )?);

        let idle_threshold = chrono::Duration::minutes(settings.realtime.idle_threshold_minutes as i64);
        let stale_threshold =
            chrono::Duration::minutes(settings.realtime.stale_threshold_minutes as i64);
        let snapshots_per_hour =
            3600 / settings.realtime.stats_collection_interval_seconds.max(1);
        let max_history = (settings.realtime.stats_history_hours * snapshots_per_hour) as usize;

        let admin = Arc::new(AdminService::new(
            registry.clone(),
            channels.clone(),
            limiter.clone(),
            idle_threshold,
            stale_threshold,
            max_history.max(1),
        ));

        Ok(Self {
            settings: Arc::new(settings),
            jwt_validator,
            registry,
            channels,
            limiter,
            admin,
            process_id,
        })
    }
}

/// Built-in rule set used when the config provides none.
fn default_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule {
            id: "messages-per-user".to_string(),
            scope: RuleScope::User,
            target: None,
            limit: 60,
            window_seconds: 60,
            action: RuleAction::Throttle,
            enabled: true,
        },
        RateLimitRule {
            id: "messages-per-ip".to_string(),
            scope: RuleScope::Ip,
            target: None,
            limit: 120,
            window_seconds: 60,
            action: RuleAction::Block,
            enabled: true,
        },
    ]
}
