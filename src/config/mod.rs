mod settings;

pub use settings::{
    BusConfig, JwtConfig, OtelConfig, RateLimitSettings, RealtimeConfig, ServerConfig, Settings,
};
