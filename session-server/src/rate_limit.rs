//! Sliding-window admission control per (user, bucket). One ring of
//! second-granularity counters per key, summed on every check. State is
//! per-process and not replicated.

use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;

/// Window length of every bucket.
const WINDOW_SECS: usize = 60;

/// How many independently locked shards the key map is spread over.
const SHARDS: usize = 16;

/// The admission buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Action,
    Chat,
    Dm,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Action => "action",
            Bucket::Chat => "chat",
            Bucket::Dm => "dm",
        }
    }
}

/// The admission answer. `retry_after_ms` is only meaningful on denial and
/// estimates when the oldest window slot rolls off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_ms: u64,
}

struct Window {
    counts: [u32; WINDOW_SECS],
    last_sec: u64,
}

impl Window {
    fn new(sec: u64) -> Self {
        Window {
            counts: [0; WINDOW_SECS],
            last_sec: sec,
        }
    }

    /// Clears the slots that fell out of the window since the last touch.
    fn advance(&mut self, sec: u64) {
        if sec <= self.last_sec {
            return;
        }
        let stale = (sec - self.last_sec).min(WINDOW_SECS as u64);
        for step in 1..=stale {
            let slot = ((self.last_sec + step) % WINDOW_SECS as u64) as usize;
            self.counts[slot] = 0;
        }
        self.last_sec = sec;
    }

    fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    /// Milliseconds until the oldest occupied slot leaves the window.
    fn retry_after_ms(&self, sec: u64) -> u64 {
        for age in (0..WINDOW_SECS as u64).rev() {
            if age > sec {
                continue;
            }
            let slot = ((sec - age) % WINDOW_SECS as u64) as usize;
            if self.counts[slot] > 0 {
                return (WINDOW_SECS as u64 - age) * 1000;
            }
        }
        1000
    }
}

/// Sliding-window rate limiter, sharded by user to keep contention low.
pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<(String, Bucket), Window>>>,
    limits: RateLimitConfig,
    started: Instant,
}

impl RateLimiter {
    pub fn new(limits: RateLimitConfig) -> Self {
        RateLimiter {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            limits,
            started: Instant::now(),
        }
    }

    fn limit_of(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::Action => self.limits.action_per_minute,
            Bucket::Chat => self.limits.chat_per_minute,
            Bucket::Dm => self.limits.dm_per_minute,
        }
    }

    /// Admission check; counts the request when allowed.
    pub fn check(&self, user_id: &str, bucket: Bucket) -> Decision {
        let sec = self.started.elapsed().as_secs();
        self.check_at(user_id, bucket, sec)
    }

    /// Clock-explicit variant of [`Self::check`], the seam the tests use.
    pub fn check_at(&self, user_id: &str, bucket: Bucket, sec: u64) -> Decision {
        let limit = self.limit_of(bucket);
        let shard = &self.shards[Self::shard_index(user_id)];
        let mut map = shard.lock().unwrap();
        let window = map
            .entry((user_id.to_string(), bucket))
            .or_insert_with(|| Window::new(sec));
        window.advance(sec);

        let used = window.total();
        if used < limit {
            window.counts[(sec % WINDOW_SECS as u64) as usize] += 1;
            return Decision {
                allowed: true,
                retry_after_ms: 0,
            };
        }

        let retry_after_ms = window.retry_after_ms(sec);
        tracing::debug!(
            user_id,
            bucket = bucket.as_str(),
            used,
            limit,
            retry_after_ms,
            "rate limit denial"
        );
        Decision {
            allowed: false,
            retry_after_ms,
        }
    }

    fn shard_index(user_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        (hasher.finish() % SHARDS as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[test]
    fn thirty_first_action_in_a_window_is_denied() {
        let limiter = limiter();
        for i in 0..30 {
            let decision = limiter.check_at("u1", Bucket::Action, 100 + i % 10);
            assert!(decision.allowed, "request {i} should pass");
        }
        let denied = limiter.check_at("u1", Bucket::Action, 110);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
    }

    #[test]
    fn first_request_after_roll_off_is_accepted() {
        let limiter = limiter();
        for _ in 0..30 {
            assert!(limiter.check_at("u1", Bucket::Action, 100).allowed);
        }
        assert!(!limiter.check_at("u1", Bucket::Action, 120).allowed);
        // 100 + 60 is the first second where the burst has left the window.
        assert!(limiter.check_at("u1", Bucket::Action, 160).allowed);
    }

    #[test]
    fn buckets_and_users_are_independent() {
        let limiter = limiter();
        for _ in 0..30 {
            assert!(limiter.check_at("u1", Bucket::Action, 50).allowed);
        }
        assert!(!limiter.check_at("u1", Bucket::Action, 50).allowed);
        assert!(limiter.check_at("u1", Bucket::Chat, 50).allowed);
        assert!(limiter.check_at("u2", Bucket::Action, 50).allowed);
    }

    #[test]
    fn retry_hint_tracks_the_oldest_slot() {
        let limiter = limiter();
        for _ in 0..30 {
            assert!(limiter.check_at("u1", Bucket::Action, 100).allowed);
        }
        let denied = limiter.check_at("u1", Bucket::Action, 130);
        assert!(!denied.allowed);
        // Slot 100 is 30 s old, it rolls off in 30 s.
        assert_eq!(denied.retry_after_ms, 30_000);
    }
}
