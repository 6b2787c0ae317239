//! Per-key admission control.
//!
//! Each key owns a fixed window of `points` tokens over `duration`. Tokens
//! regenerate in bulk at the window boundary rather than continuously.
//! Exhausting the window puts the key into a `block_duration` penalty during
//! which every consume fails without touching the token count.
//!
//! The server composes separate instances: one for general RPC traffic
//! (keyed by principal) and one for authentication attempts (keyed by peer
//! address).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Raised when a key is over budget. Carries the wait the caller should
/// surface as `retryAfterSeconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded — retry after {retry_after:?}")]
pub struct LimitExceeded {
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Tokens per window.
    pub points: u32,
    /// Window length.
    pub duration: Duration,
    /// Penalty applied once the window is exhausted.
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: 120,
            duration: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    consumed: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            consumed: 0,
            window_start: now,
            blocked_until: None,
            last_seen: now,
        }
    }

    /// Reset the window if `now` is past its boundary.
    fn roll(&mut self, window: Duration, now: Instant) {
        if now.duration_since(self.window_start) >= window {
            self.consumed = 0;
            self.window_start = now;
        }
    }
}

/// Token-budget limiter over an interior key map.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to consume `points` tokens for `key`.
    pub fn consume(&self, key: &str, points: u32) -> Result<(), LimitExceeded> {
        self.consume_at(key, points, Instant::now())
    }

    fn consume_at(&self, key: &str, points: u32, now: Instant) -> Result<(), LimitExceeded> {
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(now));
        bucket.last_seen = now;

        // A blocked key fails without consulting tokens.
        if let Some(until) = bucket.blocked_until {
            if now < until {
                return Err(LimitExceeded {
                    retry_after: until - now,
                });
            }
            bucket.blocked_until = None;
            bucket.consumed = 0;
            bucket.window_start = now;
        }

        bucket.roll(self.config.duration, now);

        if bucket.consumed.saturating_add(points) > self.config.points {
            let until = now + self.config.block_duration;
            bucket.blocked_until = Some(until);
            return Err(LimitExceeded {
                retry_after: self.config.block_duration,
            });
        }

        bucket.consumed += points;
        Ok(())
    }

    /// Remaining tokens in the current window for `key`.
    pub fn remaining(&self, key: &str) -> u32 {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        match buckets.get_mut(key) {
            Some(bucket) => {
                if bucket.blocked_until.is_some_and(|until| now < until) {
                    return 0;
                }
                bucket.roll(self.config.duration, now);
                self.config.points.saturating_sub(bucket.consumed)
            }
            None => self.config.points,
        }
    }

    /// Whether `key` is currently inside a block penalty.
    pub fn is_blocked(&self, key: &str) -> bool {
        let now = Instant::now();
        let buckets = self.buckets.lock().expect("rate limiter lock");
        buckets
            .get(key)
            .and_then(|b| b.blocked_until)
            .is_some_and(|until| now < until)
    }

    /// Forget `key` entirely (window and block state).
    pub fn reset(&self, key: &str) {
        self.buckets.lock().expect("rate limiter lock").remove(key);
    }

    pub fn clear_all(&self) {
        self.buckets.lock().expect("rate limiter lock").clear();
    }

    /// Drop keys idle longer than `duration + block_duration`. Called
    /// periodically so the map stays bounded by active traffic.
    pub fn sweep_idle(&self) {
        let cutoff = self.config.duration + self.config.block_duration;
        let now = Instant::now();
        self.buckets
            .lock()
            .expect("rate limiter lock")
            .retain(|_, b| now.duration_since(b.last_seen) < cutoff);
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(points: u32, duration_ms: u64, block_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            points,
            duration: Duration::from_millis(duration_ms),
            block_duration: Duration::from_millis(block_ms),
        })
    }

    #[test]
    fn consume_decrements_remaining_exactly() {
        let rl = limiter(10, 60_000, 60_000);
        assert_eq!(rl.remaining("k"), 10);
        rl.consume("k", 1).unwrap();
        assert_eq!(rl.remaining("k"), 9);
        rl.consume("k", 3).unwrap();
        assert_eq!(rl.remaining("k"), 6);
    }

    #[test]
    fn exceeding_budget_blocks_the_key() {
        let rl = limiter(2, 60_000, 60_000);
        rl.consume("k", 2).unwrap();
        let err = rl.consume("k", 1).unwrap_err();
        assert!(err.retry_after > Duration::ZERO);
        assert!(rl.is_blocked("k"));
        // Consumes during the block fail without touching tokens.
        assert!(rl.consume("k", 1).is_err());
        assert_eq!(rl.remaining("k"), 0);
    }

    #[test]
    fn window_boundary_regenerates_in_bulk() {
        let rl = limiter(5, 30, 30);
        rl.consume("k", 5).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(rl.remaining("k"), 5);
        rl.consume("k", 5).unwrap();
    }

    #[test]
    fn block_expires_and_key_recovers() {
        let rl = limiter(1, 20, 20);
        rl.consume("k", 1).unwrap();
        assert!(rl.consume("k", 1).is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!rl.is_blocked("k"));
        rl.consume("k", 1).unwrap();
    }

    #[test]
    fn keys_are_independent() {
        let rl = limiter(1, 60_000, 60_000);
        rl.consume("a", 1).unwrap();
        assert!(rl.consume("a", 1).is_err());
        rl.consume("b", 1).unwrap();
    }

    #[test]
    fn reset_and_clear() {
        let rl = limiter(1, 60_000, 60_000);
        rl.consume("a", 1).unwrap();
        assert!(rl.consume("a", 1).is_err());
        rl.reset("a");
        rl.consume("a", 1).unwrap();
        rl.clear_all();
        assert_eq!(rl.remaining("a"), 1);
    }

    #[test]
    fn sweep_drops_idle_keys() {
        let rl = limiter(5, 10, 10);
        rl.consume("old", 1).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        rl.consume("fresh", 1).unwrap();
        rl.sweep_idle();
        assert_eq!(rl.key_count(), 1);
    }

    #[test]
    fn oversized_single_consume_rejected() {
        let rl = limiter(3, 60_000, 60_000);
        assert!(rl.consume("k", 4).is_err());
    }
}
