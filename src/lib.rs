// Shared infrastructure
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Core domain
pub mod bus;
pub mod channels;
pub mod protocol;
pub mod ratelimit;
pub mod registry;

// Application layer
pub mod admin;
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
