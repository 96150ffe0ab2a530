//! End-to-end rate limiting behavior against the public limiter API.

use std::time::Duration;

use uuid::Uuid;

use relay_realtime_service::ratelimit::{
    RateLimitContext, RateLimitDecision, RateLimitRule, RateLimiter, RuleAction, RuleScope,
};

fn rule(id: &str, scope: RuleScope, limit: u32, window_seconds: u64, action: RuleAction) -> RateLimitRule {
    RateLimitRule {
        id: id.to_string(),
        scope,
        target: None,
        limit,
        window_seconds,
        action,
        enabled: true,
    }
}

fn ctx(identity: &str) -> RateLimitContext<'_> {
    RateLimitContext {
        connection_id: Uuid::nil(),
        identity: Some(identity),
        ip: Some("10.0.0.1"),
        channel: None,
    }
}

#[test]
fn test_throttle_reports_remaining_window() {
    let limiter = RateLimiter::new(
        vec![rule("burst", RuleScope::User, 3, 10, RuleAction::Throttle)],
        100,
    )
    .unwrap();

    // Three messages in quick succession all pass.
    for _ in 0..3 {
        assert!(limiter.check(&ctx("alice")).is_allowed());
    }

    // Two seconds later the window still holds all three; the retry hint
    // points at when the oldest event ages out (10 - 2 = 8 seconds).
    std::thread::sleep(Duration::from_millis(2200));
    match limiter.check(&ctx("alice")) {
        RateLimitDecision::Rejected {
            rule_id,
            action,
            retry_after_seconds,
        } => {
            assert_eq!(rule_id, "burst");
            assert_eq!(action, RuleAction::Throttle);
            assert_eq!(retry_after_seconds, Some(8));
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    // The rejected attempt did not consume window capacity, so the hint
    // stays anchored to the original burst.
    let violations = limiter.recent_violations(10);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].identity.as_deref(), Some("alice"));

    // A different identity is unaffected.
    assert!(limiter.check(&ctx("bob")).is_allowed());
}

#[test]
fn test_block_outlasts_window_until_reset() {
    let limiter = RateLimiter::new(
        vec![rule("flood", RuleScope::User, 1, 1, RuleAction::Block)],
        100,
    )
    .unwrap();

    assert!(limiter.check(&ctx("alice")).is_allowed());

    // Second message trips the rule and starts a block.
    match limiter.check(&ctx("alice")) {
        RateLimitDecision::Rejected {
            action,
            retry_after_seconds,
            ..
        } => {
            assert_eq!(action, RuleAction::Block);
            assert_eq!(retry_after_seconds, Some(1));
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    // While blocked, everything is rejected regardless of rate.
    assert!(!limiter.check(&ctx("alice")).is_allowed());

    // An admin reset lifts the block immediately.
    let cleared = limiter.reset_connection_limits(Some("alice"), None);
    assert!(cleared > 0);
    assert!(limiter.check(&ctx("alice")).is_allowed());
}

#[test]
fn test_disconnect_action_gives_no_retry_hint() {
    let limiter = RateLimiter::new(
        vec![rule("abuse", RuleScope::User, 1, 60, RuleAction::Disconnect)],
        100,
    )
    .unwrap();

    assert!(limiter.check(&ctx("alice")).is_allowed());
    match limiter.check(&ctx("alice")) {
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
fn test_channel_scoped_rule_only_counts_that_channel() {
    let mut targeted = rule("alerts-cap", RuleScope::Channel, 1, 60, RuleAction::Throttle);
    targeted.target = Some("alerts".to_string());
    let limiter = RateLimiter::new(vec![targeted], 100).unwrap();

    let on_alerts = RateLimitContext {
        connection_id: Uuid::nil(),
        identity: Some("alice"),
        ip: None,
        channel: Some("alerts"),
    };
    let on_feed = RateLimitContext {
        connection_id: Uuid::nil(),
        identity: Some("alice"),
        ip: None,
        channel: Some("feed"),
    };

    assert!(limiter.check(&on_alerts).is_allowed());
    assert!(!limiter.check(&on_alerts).is_allowed());

    // Traffic on other channels never matches the rule.
    assert!(limiter.check(&on_feed).is_allowed());
    assert!(limiter.check(&on_feed).is_allowed());
}

#[test]
fn test_rule_update_resets_trackers_but_keeps_violation_counts() {
    let limiter = RateLimiter::new(
        vec![rule("burst", RuleScope::User, 1, 60, RuleAction::Throttle)],
        100,
    )
    .unwrap();

    assert!(limiter.check(&ctx("alice")).is_allowed());
    assert!(!limiter.check(&ctx("alice")).is_allowed());

    // Raising the limit installs fresh trackers; the full budget is
    // available again.
    limiter
        .update_rule("burst", rule("burst", RuleScope::User, 3, 60, RuleAction::Throttle))
        .unwrap();
    for _ in 0..3 {
        assert!(limiter.check(&ctx("alice")).is_allowed());
    }
    assert!(!limiter.check(&ctx("alice")).is_allowed());

    // Violation counters accumulate across the swap.
    let views = limiter.rules();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].violation_count, 2);
}

#[test]
fn test_removing_last_rule_allows_everything() {
    let limiter = RateLimiter::new(
        vec![rule("burst", RuleScope::User, 1, 60, RuleAction::Throttle)],
        100,
    )
    .unwrap();

    assert!(limiter.check(&ctx("alice")).is_allowed());
    assert!(!limiter.check(&ctx("alice")).is_allowed());

    assert!(limiter.remove_rule("burst"));
    for _ in 0..10 {
        assert!(limiter.check(&ctx("alice")).is_allowed());
    }
}
