//! Sliding-window rate limiter.
//!
//! Each rule keeps per-key windows of accepted-event timestamps. The rule
//! table is swapped wholesale on every change; checks clone the current
//! table Arc and never observe a half-updated table. Monotonic violation
//! counters live outside the table so they survive swaps.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::AppError;

use super::{RateLimitDecision, RateLimitRule, RateLimitViolation, RuleAction, RuleScope, RuleView};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Inputs for one rate limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitContext<'a> {
    pub connection_id: Uuid,
    pub identity: Option<&'a str>,
    pub ip: Option<&'a str>,
    pub channel: Option<&'a str>,
}

/// One rule plus its trackers. Replaced, never mutated, on rule changes.
struct RuleState {
    rule: RateLimitRule,
    /// tracker key -> accepted-event timestamps (ms), oldest first
    windows: DashMap<String, VecDeque<i64>>,
    /// tracker key -> hard-block expiry (ms)
    blocked_until: DashMap<String, i64>,
}

impl RuleState {
    fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            windows: DashMap::new(),
            blocked_until: DashMap::new(),
        }
    }

    /// The tracker key this rule uses for the given context, or None when
    /// the rule does not apply.
    fn key_for(&self, ctx: &RateLimitContext<'_>) -> Option<String> {
        let candidate = match self.rule.scope {
            RuleScope::Global => Some("global"),
            RuleScope::User => ctx.identity,
            RuleScope::Ip => ctx.ip,
            RuleScope::Channel => ctx.channel,
        }?;

        if let Some(ref target) = self.rule.target {
            if candidate != target {
                return None;
            }
        }
        Some(candidate.to_string())
    }

    /// Evaluate this rule for one key. Returns None when allowed,
    /// otherwise the retry-after hint (None for disconnect).
    fn evaluate(&self, key: &str) -> Option<Option<u64>> {
        let now = now_ms();
        let window_ms = self.rule.window_seconds as i64 * 1000;

        if let Some(until) = self.blocked_until.get(key).map(|e| *e) {
            if now < until {
                return Some(Some(((until - now) as u64).div_ceil(1000)));
            }
            self.blocked_until.remove(key);
        }

        let mut window = self.windows.entry(key.to_string()).or_default();
        while window.front().is_some_and(|t| *t <= now - window_ms) {
            window.pop_front();
        }

        if (window.len() as u32) < self.rule.limit {
            window.push_back(now);
            return None;
        }

        match self.rule.action {
            RuleAction::Throttle => {
                // Rejected events do not enter the window, so the oldest
                // accepted event fixes the retry hint.
                let oldest = window.front().copied().unwrap_or(now);
                let retry_ms = (oldest + window_ms - now).max(1000);
                Some(Some((retry_ms as u64).div_ceil(1000)))
            }
            RuleAction::Block => {
                self.blocked_until.insert(key.to_string(), now + window_ms);
                Some(Some(self.rule.window_seconds))
            }
            RuleAction::Disconnect => Some(None),
        }
    }

    fn clear_key(&self, key: &str) -> bool {
        let had_window = self.windows.remove(key).is_some();
        let had_block = self.blocked_until.remove(key).is_some();
        had_window || had_block
    }
}

pub struct RateLimiter {
    /// Current rule table; replaced atomically on every rule change.
    table: RwLock<Arc<Vec<Arc<RuleState>>>>,
    /// rule id -> monotonic violation counter (survives table swaps)
    violation_counts: DashMap<String, u64>,
    /// Bounded ring of recent violations, newest at the back
    violations: Mutex<VecDeque<RateLimitViolation>>,
    /// Per-minute violation buckets for the rolling one-hour count. Kept
    /// outside the ring, which undercounts once it wraps within the hour.
    hourly: Mutex<VecDeque<(i64, usize)>>,
    max_violations_history: usize,
}

impl RateLimiter {
    pub fn new(rules: Vec<RateLimitRule>, max_violations_history: usize) -> Result<Self, AppError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            rule.validate().map_err(AppError::Validation)?;
            if !seen.insert(rule.id.clone()) {
                return Err(AppError::Validation(format!("duplicate rule id: {}", rule.id)));
            }
        }

        let table: Vec<Arc<RuleState>> = rules
            .into_iter()
            .map(|r| Arc::new(RuleState::new(r)))
            .collect();

        Ok(Self {
            table: RwLock::new(Arc::new(table)),
            violation_counts: DashMap::new(),
            violations: Mutex::new(VecDeque::new()),
            hourly: Mutex::new(VecDeque::new()),
            max_violations_history,
        })
    }

    fn current_table(&self) -> Arc<Vec<Arc<RuleState>>> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap_table(&self, rules: Vec<RateLimitRule>) {
        let table: Vec<Arc<RuleState>> = rules
            .into_iter()
            .map(|r| Arc::new(RuleState::new(r)))
            .collect();
        let mut guard = self
            .table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(table);
    }

    /// Evaluate every enabled rule in table order; the first rejection
    /// short-circuits.
    pub fn check(&self, ctx: &RateLimitContext<'_>) -> RateLimitDecision {
        let table = self.current_table();

        for state in table.iter() {
            if !state.rule.enabled {
                continue;
            }
            let Some(key) = state.key_for(ctx) else {
                continue;
            };

            if let Some(retry_after_seconds) = state.evaluate(&key) {
                self.record_violation(state, &key, ctx);
                crate::metrics::record_rate_limit_rejection(match state.rule.action {
                    RuleAction::Throttle => "throttle",
                    RuleAction::Disconnect => "disconnect",
                    RuleAction::Block => "block",
                });
                tracing::debug!(
                    rule_id = %state.rule.id,
                    key = %key,
                    connection_id = %ctx.connection_id,
                    action = ?state.rule.action,
                    "Rate limit exceeded"
                );
                return RateLimitDecision::Rejected {
                    rule_id: state.rule.id.clone(),
                    action: state.rule.action,
                    retry_after_seconds,
                };
            }
        }

        RateLimitDecision::Allowed
    }

    fn record_violation(&self, state: &RuleState, key: &str, ctx: &RateLimitContext<'_>) {
        *self.violation_counts.entry(state.rule.id.clone()).or_insert(0) += 1;

        let violation = RateLimitViolation {
            id: Uuid::new_v4(),
            rule_id: state.rule.id.clone(),
            scope: state.rule.scope,
            key: key.to_string(),
            action: state.rule.action,
            connection_id: ctx.connection_id,
            identity: ctx.identity.map(String::from),
            timestamp: Utc::now(),
        };

        let minute = violation.timestamp.timestamp() / 60;

        let mut ring = self
            .violations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.push_back(violation);
        while ring.len() > self.max_violations_history {
            ring.pop_front();
        }
        drop(ring);

        let mut buckets = self
            .hourly
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match buckets.back_mut() {
            Some((m, count)) if *m == minute => *count += 1,
            _ => buckets.push_back((minute, 1)),
        }
        while buckets.front().is_some_and(|(m, _)| *m < minute - 60) {
            buckets.pop_front();
        }
    }

    /// Rules with their monotonic violation counters.
    pub fn rules(&self) -> Vec<RuleView> {
        self.current_table()
            .iter()
            .map(|state| RuleView {
                rule: state.rule.clone(),
                violation_count: self
                    .violation_counts
                    .get(&state.rule.id)
                    .map(|c| *c)
                    .unwrap_or(0),
            })
            .collect()
    }

    pub fn get_rule(&self, id: &str) -> Option<RateLimitRule> {
        self.current_table()
            .iter()
            .find(|s| s.rule.id == id)
            .map(|s| s.rule.clone())
    }

    /// Add a rule. The whole table is rebuilt with fresh trackers.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<(), AppError> {
        rule.validate().map_err(AppError::Validation)?;

        let current = self.current_table();
        if current.iter().any(|s| s.rule.id == rule.id) {
            return Err(AppError::Validation(format!("rule {} already exists", rule.id)));
        }

        let mut rules: Vec<RateLimitRule> = current.iter().map(|s| s.rule.clone()).collect();
        rules.push(rule);
        self.swap_table(rules);
        Ok(())
    }

    /// Replace a rule in place (by id), rebuilding the table.
    pub fn update_rule(&self, id: &str, rule: RateLimitRule) -> Result<(), AppError> {
        rule.validate().map_err(AppError::Validation)?;
        if rule.id != id {
            return Err(AppError::Validation("rule id cannot be changed".to_string()));
        }

        let current = self.current_table();
        if !current.iter().any(|s| s.rule.id == id) {
            return Err(AppError::NotFound(format!("rule {}", id)));
        }

        let rules: Vec<RateLimitRule> = current
            .iter()
            .map(|s| {
                if s.rule.id == id {
                    rule.clone()
                } else {
                    s.rule.clone()
                }
            })
            .collect();
        self.swap_table(rules);
        Ok(())
    }

    /// Remove a rule. Returns false when no such rule exists.
    pub fn remove_rule(&self, id: &str) -> bool {
        let current = self.current_table();
        if !current.iter().any(|s| s.rule.id == id) {
            return false;
        }

        let rules: Vec<RateLimitRule> = current
            .iter()
            .filter(|s| s.rule.id != id)
            .map(|s| s.rule.clone())
            .collect();
        self.swap_table(rules);
        true
    }

    /// Clear the trackers keyed by an identity. Rule definitions and
    /// violation history are untouched.
    pub fn reset_user_limits(&self, identity: &str) -> usize {
        self.clear_scope_key(RuleScope::User, identity)
    }

    /// Clear the trackers keyed by a remote address.
    pub fn reset_ip_limits(&self, ip: &str) -> usize {
        self.clear_scope_key(RuleScope::Ip, ip)
    }

    /// Clear every tracker key a connection contributes to (its identity
    /// and its remote address).
    pub fn reset_connection_limits(&self, identity: Option<&str>, ip: Option<&str>) -> usize {
        let mut cleared = 0;
        if let Some(identity) = identity {
            cleared += self.reset_user_limits(identity);
        }
        if let Some(ip) = ip {
            cleared += self.reset_ip_limits(ip);
        }
        cleared
    }

    fn clear_scope_key(&self, scope: RuleScope, key: &str) -> usize {
        self.current_table()
            .iter()
            .filter(|state| state.rule.scope == scope && state.clear_key(key))
            .count()
    }

    /// Most recent violations, newest first.
    pub fn recent_violations(&self, limit: usize) -> Vec<RateLimitViolation> {
        let ring = self
            .violations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.iter().rev().take(limit).cloned().collect()
    }

    /// Rolling count of violations in the last hour.
    pub fn violations_last_hour(&self) -> usize {
        let cutoff = Utc::now().timestamp() / 60 - 60;
        let buckets = self
            .hourly
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buckets
            .iter()
            .filter(|(m, _)| *m >= cutoff)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn total_violations(&self) -> u64 {
        self.violation_counts.iter().map(|e| *e.value()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, scope: RuleScope, limit: u32, window: u64, action: RuleAction) -> RateLimitRule {
        RateLimitRule {
            id: id.to_string(),
            scope,
            target: None,
            limit,
            window_seconds: window,
            action,
            enabled: true,
        }
    }

    fn ctx(identity: Option<&'static str>) -> RateLimitContext<'static> {
        RateLimitContext {
            connection_id: Uuid::nil(),
            identity,
            ip: Some("10.0.0.1"),
            channel: None,
        }
    }

    #[test]
    fn test_allows_up_to_limit_then_throttles() {
        let limiter = RateLimiter::new(
            vec![rule("msgs", RuleScope::User, 3, 10, RuleAction::Throttle)],
            100,
        )
        .unwrap();
        let ctx = ctx(Some("u1"));

        for _ in 0..3 {
            assert!(limiter.check(&ctx).is_allowed());
        }

        match limiter.check(&ctx) {
            RateLimitDecision::Rejected {
                rule_id,
                action,
                retry_after_seconds,
            } => {
                assert_eq!(rule_id, "msgs");
                assert_eq!(action, RuleAction::Throttle);
                let retry = retry_after_seconds.unwrap();
                assert!(retry >= 1 && retry <= 10, "retry_after = {}", retry);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_throttle_retry_after_decreases() {
        let limiter = RateLimiter::new(
            vec![rule("msgs", RuleScope::User, 1, 3, RuleAction::Throttle)],
            100,
        )
        .unwrap();
        let ctx = ctx(Some("u1"));

        assert!(limiter.check(&ctx).is_allowed());

        let first = match limiter.check(&ctx) {
            RateLimitDecision::Rejected {
                retry_after_seconds, ..
            } => retry_after_seconds.unwrap(),
            other => panic!("expected rejection, got {:?}", other),
        };
        assert!(first > 0);

        std::thread::sleep(std::time::Duration::from_millis(1100));

        let second = match limiter.check(&ctx) {
            RateLimitDecision::Rejected {
                retry_after_seconds, ..
            } => retry_after_seconds.unwrap(),
            other => panic!("expected rejection, got {:?}", other),
        };
        assert!(second < first, "retry_after should decrease: {} -> {}", first, second);
    }

    #[test]
    fn test_block_persists_for_full_window() {
        let limiter = RateLimiter::new(
            vec![rule("flood", RuleScope::Ip, 1, 2, RuleAction::Block)],
            100,
        )
        .unwrap();
        let ctx = ctx(None);

        assert!(limiter.check(&ctx).is_allowed());
        assert!(!limiter.check(&ctx).is_allowed()); // triggers the block

        // The window itself has passed, but the block holds the key.
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(!limiter.check(&ctx).is_allowed());
    }

    #[test]
    fn test_disconnect_has_no_retry_hint() {
        let limiter = RateLimiter::new(
            vec![rule("hard", RuleScope::User, 1, 10, RuleAction::Disconnect)],
            100,
        )
        .unwrap();
        let ctx = ctx(Some("u1"));

        assert!(limiter.check(&ctx).is_allowed());
        match limiter.check(&ctx) {
            RateLimitDecision::Rejected {
                action,
                retry_after_seconds,
                ..
            } => {
                assert_eq!(action, RuleAction::Disconnect);
                assert!(retry_after_seconds.is_none());
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(
            vec![rule("msgs", RuleScope::User, 1, 10, RuleAction::Throttle)],
            100,
        )
        .unwrap();

        assert!(limiter.check(&ctx(Some("u1"))).is_allowed());
        assert!(!limiter.check(&ctx(Some("u1"))).is_allowed());
        // A different identity has its own window
        assert!(limiter.check(&ctx(Some("u2"))).is_allowed());
    }

    #[test]
    fn test_rule_without_matching_key_is_skipped() {
        let limiter = RateLimiter::new(
            vec![rule("msgs", RuleScope::User, 1, 10, RuleAction::Throttle)],
            100,
        )
        .unwrap();

        // Anonymous traffic never matches a user-scoped rule
        assert!(limiter.check(&ctx(None)).is_allowed());
        assert!(limiter.check(&ctx(None)).is_allowed());
    }

    #[test]
    fn test_targeted_rule_only_matches_target() {
        let mut targeted = rule("noisy", RuleScope::User, 1, 10, RuleAction::Throttle);
        targeted.target = Some("u1".to_string());
        let limiter = RateLimiter::new(vec![targeted], 100).unwrap();

        assert!(limiter.check(&ctx(Some("u1"))).is_allowed());
        assert!(!limiter.check(&ctx(Some("u1"))).is_allowed());

        assert!(limiter.check(&ctx(Some("u2"))).is_allowed());
        assert!(limiter.check(&ctx(Some("u2"))).is_allowed());
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let mut disabled = rule("off", RuleScope::User, 1, 10, RuleAction::Throttle);
        disabled.enabled = false;
        let limiter = RateLimiter::new(vec![disabled], 100).unwrap();

        let ctx = ctx(Some("u1"));
        assert!(limiter.check(&ctx).is_allowed());
        assert!(limiter.check(&ctx).is_allowed());
    }

    #[test]
    fn test_first_rejection_short_circuits() {
        let limiter = RateLimiter::new(
            vec![
                rule("first", RuleScope::User, 1, 10, RuleAction::Throttle),
                rule("second", RuleScope::User, 1, 10, RuleAction::Disconnect),
            ],
            100,
        )
        .unwrap();
        let ctx = ctx(Some("u1"));

        assert!(limiter.check(&ctx).is_allowed());
        match limiter.check(&ctx) {
            RateLimitDecision::Rejected { rule_id, .. } => assert_eq!(rule_id, "first"),
            other => panic!("expected rejection, got {:?}", other),
        }
        // Only the first rule saw a violation; the check never reached the
        // second (its single token was spent by the first allowed check).
        let views = limiter.rules();
        assert_eq!(views[0].violation_count, 1);
    }

    #[test]
    fn test_reset_clears_trackers_only() {
        let limiter = RateLimiter::new(
            vec![rule("msgs", RuleScope::User, 1, 60, RuleAction::Block)],
            100,
        )
        .unwrap();
        let ctx = ctx(Some("u1"));

        assert!(limiter.check(&ctx).is_allowed());
        assert!(!limiter.check(&ctx).is_allowed());

        assert_eq!(limiter.reset_user_limits("u1"), 1);
        assert!(limiter.check(&ctx).is_allowed());

        // History and counters survive the reset
        assert_eq!(limiter.total_violations(), 1);
        assert_eq!(limiter.recent_violations(10).len(), 1);
    }

    #[test]
    fn test_rule_crud_swaps_table() {
        let limiter = RateLimiter::new(
            vec![rule("a", RuleScope::User, 1, 10, RuleAction::Throttle)],
            100,
        )
        .unwrap();

        limiter
            .add_rule(rule("b", RuleScope::Ip, 5, 60, RuleAction::Block))
            .unwrap();
        assert_eq!(limiter.rules().len(), 2);

        // Duplicate id rejected
        assert!(limiter
            .add_rule(rule("a", RuleScope::User, 1, 10, RuleAction::Throttle))
            .is_err());

        let mut updated = rule("a", RuleScope::User, 10, 10, RuleAction::Throttle);
        updated.enabled = false;
        limiter.update_rule("a", updated).unwrap();
        assert!(!limiter.get_rule("a").unwrap().enabled);

        assert!(limiter.remove_rule("b"));
        assert!(!limiter.remove_rule("b"));
        assert_eq!(limiter.rules().len(), 1);
    }

    #[test]
    fn test_counter_survives_table_swap() {
        let limiter = RateLimiter::new(
            vec![rule("a", RuleScope::User, 1, 10, RuleAction::Throttle)],
            100,
        )
        .unwrap();
        let ctx = ctx(Some("u1"));

        limiter.check(&ctx);
        limiter.check(&ctx); // violation

        limiter
            .add_rule(rule("b", RuleScope::Ip, 5, 60, RuleAction::Block))
            .unwrap();

        let view = limiter.rules().into_iter().find(|v| v.rule.id == "a").unwrap();
        assert_eq!(view.violation_count, 1);
    }

    #[test]
    fn test_violation_ring_is_bounded() {
        let limiter = RateLimiter::new(
            vec![rule("msgs", RuleScope::User, 1, 60, RuleAction::Throttle)],
            3,
        )
        .unwrap();
        let ctx = ctx(Some("u1"));

        limiter.check(&ctx);
        for _ in 0..10 {
            limiter.check(&ctx);
        }

        assert_eq!(limiter.recent_violations(100).len(), 3);
        assert_eq!(limiter.total_violations(), 10);
        // The hourly count is tracked outside the ring and sees all 10.
        assert_eq!(limiter.violations_last_hour(), 10);
    }
}
