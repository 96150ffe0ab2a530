//! Circuit breaker for the shared bus connection.
//!
//! While the circuit is open every bus command is refused up front, so
//! publishes degrade to local-only delivery instead of queueing behind
//! connection timeouts.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use super::current_time_ms;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

fn decode(raw: u8) -> CircuitState {
    match raw {
        OPEN => CircuitState::Open,
        HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing (ms).
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    /// Consecutive failures while closed, consecutive successes while
    /// half-open. Meaningless while open.
    streak: AtomicU32,
    /// When the current state was entered (ms since epoch).
    changed_at: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            streak: AtomicU32::new(0),
            changed_at: AtomicI64::new(current_time_ms()),
            config,
        }
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Gate a bus command. An open circuit whose reset timeout has lapsed
    /// flips to half-open here, letting this request through as the probe.
    pub fn allow_request(&self) -> bool {
        match decode(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let open_for = current_time_ms() - self.changed_at.load(Ordering::Acquire);
                if open_for < self.config.reset_timeout_ms as i64 {
                    return false;
                }
                // Only one caller wins the transition; the rest see
                // half-open and pass through as well.
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.streak.store(0, Ordering::Release);
                    self.changed_at.store(current_time_ms(), Ordering::Release);
                    tracing::info!("Bus circuit breaker half-open, probing");
                }
                true
            }
        }
    }

    pub fn record_success(&self) {
        match decode(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                self.streak.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.streak.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.enter(CLOSED);
                    tracing::info!("Bus circuit breaker closed after recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match decode(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                let failures = self.streak.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.enter(OPEN);
                    tracing::warn!(failures, "Bus circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                // The probe failed.
                self.enter(OPEN);
                tracing::warn!("Bus circuit breaker reopened, probe failed");
            }
            CircuitState::Open => {
                // Extend the open window.
                self.changed_at.store(current_time_ms(), Ordering::Release);
            }
        }
    }

    fn enter(&self, raw: u8) {
        self.state.store(raw, Ordering::Release);
        self.streak.store(0, Ordering::Release);
        self.changed_at.store(current_time_ms(), Ordering::Release);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
