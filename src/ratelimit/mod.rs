//! Per-rule sliding-window rate limiting.
//!
//! Rules are checked on every inbound frame, ordered, and hot-swappable
//! at runtime through the admin surface.

mod limiter;
mod rules;

pub use limiter::{RateLimitContext, RateLimiter};
pub use rules::{
    RateLimitDecision, RateLimitRule, RateLimitViolation, RuleAction, RuleScope, RuleView,
};
