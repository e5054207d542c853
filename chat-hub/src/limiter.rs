use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::trace;

pub const DEFAULT_CAPACITY: u32 = 5;
pub const DEFAULT_REFILL_RATE: u32 = 1;
pub const DEFAULT_REFILL_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum burst, and the number of tokens a fresh bucket holds.
    pub capacity: u32,
    /// Tokens added per refill period.
    pub refill_rate: u32,
    pub refill_period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_rate: DEFAULT_REFILL_RATE,
            refill_period: DEFAULT_REFILL_PERIOD,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_rate: u32,
}

impl TokenBucket {
    fn full(capacity: u32, refill_rate: u32) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
        }
    }

    fn try_consume(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        self.tokens = self
            .tokens
            .saturating_add(self.refill_rate)
            .min(self.capacity);
    }
}

/// Cloneable handle to one connection's token bucket.
///
/// The bucket starts full and a small tokio task adds `refill_rate` tokens
/// every `refill_period` until every handle is dropped. Consumption and
/// refill take the same lock, so the bucket can never be overdrawn or
/// overfilled.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Builds a full bucket and starts its refill ticker on the current tokio runtime.
    pub fn spawn(config: RateLimitConfig) -> Self {
        let limiter = Self::manual(config);
        spawn_refill_task(Arc::downgrade(&limiter.bucket), config.refill_period);
        limiter
    }

    /// Builds a full bucket that only refills when [`RateLimiter::refill`] is called.
    pub fn manual(config: RateLimitConfig) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::full(
                config.capacity,
                config.refill_rate,
            ))),
        }
    }

    /// Takes one token if any are left. Denial is final; nothing is queued.
    pub fn allow(&self) -> bool {
        self.with_bucket(TokenBucket::try_consume)
    }

    /// Applies one refill tick, capped at capacity.
    pub fn refill(&self) {
        self.with_bucket(TokenBucket::refill)
    }

    pub fn tokens(&self) -> u32 {
        self.with_bucket(|bucket| bucket.tokens)
    }

    #[cfg(test)]
    fn capacity(&self) -> u32 {
        self.with_bucket(|bucket| bucket.capacity)
    }

    fn with_bucket<T>(&self, f: impl FnOnce(&mut TokenBucket) -> T) -> T {
        // The critical sections cannot panic halfway, so a poisoned lock still holds a valid bucket.
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *bucket)
    }
}

fn spawn_refill_task(bucket: Weak<Mutex<TokenBucket>>, period: Duration) {
    let first_tick = Instant::now() + period;
    tokio::spawn(async move {
        let mut ticker = interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(bucket) = bucket.upgrade() else {
                trace!("rate limiter dropped, stopping refill");
                break;
            };
            bucket.lock().unwrap_or_else(PoisonError::into_inner).refill();
        }
    });
}
