//! Token bucket rate limiting for subscribe attempts.
//!
//! One bucket per connection, created full on first use and dropped when the
//! connection closes. Refill is computed from elapsed monotonic time on each
//! check; nothing runs in the background.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use pronto_core::ids::ConnectionId;
use pronto_settings::RateLimitSettings;

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Bucket capacity.
    pub max_tokens: u32,
    /// Tokens added per `refill_interval`.
    pub refill_rate: f64,
    pub refill_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from(&RateLimitSettings::default())
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(s: &RateLimitSettings) -> Self {
        Self {
            max_tokens: s.max_tokens,
            refill_rate: s.refill_rate,
            refill_interval: Duration::from_millis(s.refill_interval_ms),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.max_tokens),
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        // A clock that steps backwards adds nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let interval = config.refill_interval.as_secs_f64();
        let added = if interval > 0.0 {
            elapsed.as_secs_f64() / interval * config.refill_rate
        } else {
            f64::from(config.max_tokens)
        };
        self.tokens = (self.tokens + added).min(f64::from(config.max_tokens));
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<ConnectionId, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one token for `conn`. Returns `false` when the bucket is empty.
    pub fn check(&self, conn: &ConnectionId) -> bool {
        self.check_at(conn, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, conn: &ConnectionId, now: Instant) -> bool {
        let mut bucket = self
            .buckets
            .entry(conn.clone())
            .or_insert_with(|| TokenBucket::full(&self.config, now));
        bucket.refill(&self.config, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens that would be available at `now`, without consuming any.
    pub fn available_at(&self, conn: &ConnectionId, now: Instant) -> f64 {
        match self.buckets.get_mut(conn) {
            Some(mut bucket) => {
                bucket.refill(&self.config, now);
                bucket.tokens
            }
            None => f64::from(self.config.max_tokens),
        }
    }

    pub fn remove(&self, conn: &ConnectionId) {
        self.buckets.remove(conn);
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from_raw(id)
    }

    #[test]
    fn burst_of_eleven_admits_ten() {
        let limiter = RateLimiter::default();
        let now = Instant::now();
        let admitted = (0..11).filter(|_| limiter.check_at(&conn("c1"), now)).count();
        assert_eq!(admitted, 10);
        assert!(!limiter.check_at(&conn("c1"), now));
    }

    #[test]
    fn refills_after_interval_without_exceeding_capacity() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check_at(&conn("c1"), start));
        }
        assert!(!limiter.check_at(&conn("c1"), start));

        let later = start + Duration::from_secs(60);
        let available = limiter.available_at(&conn("c1"), later);
        assert!(available >= 1.0);
        assert!(available <= 10.0);

        let much_later = start + Duration::from_secs(3_600);
        assert_eq!(limiter.available_at(&conn("c1"), much_later), 10.0);
    }

    #[test]
    fn partial_refill_is_proportional() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        for _ in 0..10 {
            limiter.check_at(&conn("c1"), start);
        }
        // 10 tokens per 60s -> one token every 6s
        assert!(!limiter.check_at(&conn("c1"), start + Duration::from_secs(5)));
        assert!(limiter.check_at(&conn("c1"), start + Duration::from_secs(7)));
    }

    #[test]
    fn buckets_are_per_connection() {
        let limiter = RateLimiter::default();
        let now = Instant::now();
        for _ in 0..10 {
            limiter.check_at(&conn("c1"), now);
        }
        assert!(!limiter.check_at(&conn("c1"), now));
        assert!(limiter.check_at(&conn("c2"), now));
    }

    #[test]
    fn backwards_clock_adds_nothing() {
        let limiter = RateLimiter::default();
        let now = Instant::now() + Duration::from_secs(10);
        for _ in 0..10 {
            limiter.check_at(&conn("c1"), now);
        }
        assert!(!limiter.check_at(&conn("c1"), now - Duration::from_secs(5)));
    }

    #[test]
    fn remove_resets_bucket() {
        let limiter = RateLimiter::default();
        let now = Instant::now();
        for _ in 0..10 {
            limiter.check_at(&conn("c1"), now);
        }
        limiter.remove(&conn("c1"));
        assert!(limiter.is_empty());
        assert!(limiter.check_at(&conn("c1"), now));
    }

    #[test]
    fn config_from_settings() {
        let cfg = RateLimitConfig::default();
        assert_eq!(cfg.max_tokens, 10);
        assert_eq!(cfg.refill_rate, 10.0);
        assert_eq!(cfg.refill_interval, Duration::from_secs(60));
    }
}
