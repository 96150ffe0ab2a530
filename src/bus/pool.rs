//! Shared Redis connection for bus commands.
//!
//! Publishes and room-membership commands multiplex over one cached
//! connection; the subscriber side holds its own dedicated pub/sub
//! connection and never goes through here. All command traffic is gated
//! by the circuit breaker so an unreachable Redis fails fast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use tokio::sync::RwLock;

use crate::config::BusConfig;

use super::{CircuitBreaker, CircuitState};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

pub struct RedisPool {
    client: Client,
    /// Cached multiplexed connection, cleared when a command reports a
    /// dead socket.
    cached: RwLock<Option<MultiplexedConnection>>,
    breaker: Arc<CircuitBreaker>,
    reconnects: AtomicU64,
    config: BusConfig,
}

impl RedisPool {
    pub fn new(config: BusConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, PoolError> {
        Ok(Self {
            client: Client::open(config.url.as_str())?,
            cached: RwLock::new(None),
            breaker,
            reconnects: AtomicU64::new(0),
            config,
        })
    }

    /// Hand out the cached connection, dialing Redis first if no live
    /// connection exists. Refused outright while the circuit is open.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.breaker.allow_request() {
            return Err(PoolError::CircuitOpen);
        }

        if let Some(conn) = self.cached.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut slot = self.cached.write().await;
        // A concurrent caller may have dialed while we waited for the lock.
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                let attempt = self.reconnects.fetch_add(1, Ordering::Relaxed);
                *slot = Some(conn.clone());
                self.breaker.record_success();
                tracing::info!(attempt, url = %self.config.url, "Bus connection established");
                Ok(conn)
            }
            Err(e) => {
                self.breaker.record_failure();
                tracing::error!(error = %e, "Bus connection failed");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Feed a command result back into the breaker. Errors that indicate a
    /// dead socket also drop the cached connection so the next command
    /// redials.
    pub async fn record_outcome(&self, error: Option<&RedisError>) {
        let Some(e) = error else {
            self.breaker.record_success();
            return;
        };

        if e.is_connection_dropped() || e.is_io_error() {
            self.cached.write().await.take();
            tracing::debug!(error = %e, "Dropped cached bus connection");
        }
        self.breaker.record_failure();
    }

    pub fn is_healthy(&self) -> bool {
        self.breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(breaker: Arc<CircuitBreaker>) -> RedisPool {
        RedisPool::new(BusConfig::default(), breaker).unwrap()
    }

    #[test]
    fn test_new_pool_reports_healthy() {
        let pool = pool_with(Arc::new(CircuitBreaker::new()));
        assert_eq!(pool.url(), "redis://localhost:6379");
        assert!(pool.is_healthy());
        assert_eq!(pool.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_health_follows_the_breaker() {
        let breaker = Arc::new(CircuitBreaker::new());
        let pool = pool_with(breaker.clone());

        for _ in 0..5 {
            breaker.record_failure();
        }

        assert_eq!(pool.circuit_state(), CircuitState::Open);
        assert!(!pool.is_healthy());
    }

    #[tokio::test]
    async fn test_open_circuit_refuses_connections() {
        let breaker = Arc::new(CircuitBreaker::new());
        let pool = pool_with(breaker.clone());

        for _ in 0..5 {
            breaker.record_failure();
        }

        let result = pool.get_connection().await;
        assert!(matches!(result, Err(PoolError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_io_errors_evict_the_cached_connection() {
        let pool = pool_with(Arc::new(CircuitBreaker::new()));

        let err = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        pool.record_outcome(Some(&err)).await;

        assert!(pool.cached.read().await.is_none());
    }
}
