//! Short-TTL fingerprint cache.
//!
//! A publish delivers locally right away and also goes out on the bus; the
//! bus echoes it back to the publishing process. Marking the fingerprint at
//! publish time and checking it on bus receipt keeps local delivery
//! exactly-once.

use dashmap::DashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::bus::current_time_ms;

pub struct DeliveryDedup {
    /// fingerprint -> expiry (ms since epoch)
    seen: DashMap<Uuid, i64>,
    ttl_ms: i64,
}

impl DeliveryDedup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    /// Record a locally-delivered fingerprint.
    pub fn mark(&self, fingerprint: Uuid) {
        self.seen.insert(fingerprint, current_time_ms() + self.ttl_ms);
        if self.seen.len() > 4096 {
            self.prune();
        }
    }

    /// Check whether a fingerprint was already delivered locally. Consumes
    /// the entry on a hit, so the cache stays small.
    pub fn check_and_clear(&self, fingerprint: Uuid) -> bool {
        if let Some((_, expiry)) = self.seen.remove(&fingerprint) {
            return expiry >= current_time_ms();
        }
        false
    }

    fn prune(&self) {
        let now = current_time_ms();
        self.seen.retain(|_, expiry| *expiry >= now);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
