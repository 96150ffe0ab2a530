//! Rate limit rule and violation types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a rule's sliding window counts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// One shared window for all traffic
    Global,
    /// One window per authenticated identity
    User,
    /// One window per remote address
    Ip,
    /// One window per channel name
    Channel,
}

/// What happens when a window is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Reject the message with a retry-after hint
    Throttle,
    /// Reject and signal the transport to close the connection
    Disconnect,
    /// Reject everything under the key until the window has fully passed
    Block,
}

fn default_enabled() -> bool {
    true
}

/// A single rate limit rule. Rules are evaluated in table order; the
/// first rejection wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub id: String,
    pub scope: RuleScope,
    /// Restricts the rule to one identity / address / channel. None
    /// applies the rule to every key in scope.
    #[serde(default)]
    pub target: Option<String>,
    pub limit: u32,
    pub window_seconds: u64,
    pub action: RuleAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RateLimitRule {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("rule id must not be empty".to_string());
        }
        if self.limit == 0 {
            return Err("rule limit must be positive".to_string());
        }
        if self.window_seconds == 0 {
            return Err("rule window must be positive".to_string());
        }
        Ok(())
    }
}

/// Admin view of a rule: the definition plus its monotonic violation
/// counter (which survives rule-table swaps).
#[derive(Debug, Clone, Serialize)]
pub struct RuleView {
    #[serde(flatten)]
    pub rule: RateLimitRule,
    pub violation_count: u64,
}

/// Immutable record of one rejection.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitViolation {
    pub id: Uuid,
    pub rule_id: String,
    pub scope: RuleScope,
    /// The tracker key that exceeded its window
    pub key: String,
    pub action: RuleAction,
    pub connection_id: Uuid,
    pub identity: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Rejected {
        rule_id: String,
        action: RuleAction,
        /// Present for throttle and block; absent for disconnect.
        retry_after_seconds: Option<u64>,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_validation() {
        let rule = RateLimitRule {
            id: "r1".to_string(),
            scope: RuleScope::User,
            target: None,
            limit: 10,
            window_seconds: 60,
            action: RuleAction::Throttle,
            enabled: true,
        };
        assert!(rule.validate().is_ok());

        let mut bad = rule.clone();
        bad.limit = 0;
        assert!(bad.validate().is_err());

        let mut bad = rule;
        bad.window_seconds = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: RateLimitRule = serde_json::from_str(
            r#"{"id":"msgs","scope":"user","limit":30,"window_seconds":60,"action":"throttle"}"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert!(rule.target.is_none());
        assert_eq!(rule.action, RuleAction::Throttle);
    }
}
