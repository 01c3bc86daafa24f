//! Shared outbound rate limiter.
//!
//! Token bucket (burst capacity, one token per refill interval) plus an
//! explicit cooldown that blocks every caller until it expires. Cooldowns are
//! fixed delays set by the caller (after an auth failure or a 429), never
//! exponential backoff.
//!
//! One limiter is shared by every call site of the simulation service, so
//! submission workers, result paging and P&L fetches draw from one budget.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_every: Duration,
}

impl RateLimiter {
    /// `burst` calls may go out back to back; after that one call per
    /// `refill_every`.
    pub fn new(burst: u32, refill_every: Duration) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
            capacity,
            refill_every,
        }
    }

    /// No pacing; cooldowns still apply.
    pub fn unlimited() -> Self {
        Self::new(1, Duration::ZERO)
    }

    // Bucket holds plain numbers, so a panic elsewhere cannot leave it torn.
    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a token if one is available, otherwise report how long to wait.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut b = self.lock();
        let now = Instant::now();

        if let Some(until) = b.blocked_until {
            if until > now {
                return Err(until - now);
            }
            b.blocked_until = None;
        }

        if self.refill_every.is_zero() {
            return Ok(());
        }

        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        b.tokens = (b.tokens + elapsed / self.refill_every.as_secs_f64()).min(self.capacity);
        b.last_refill = now;

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.refill_every.mul_f64(1.0 - b.tokens))
        }
    }

    /// Block until a call may go out.
    pub fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            thread::sleep(wait);
        }
    }

    /// Hold every caller back for at least `duration` from now.
    pub fn cooldown(&self, duration: Duration) {
        let mut b = self.lock();
        let until = Instant::now() + duration;
        b.blocked_until = Some(b.blocked_until.map_or(until, |prev| prev.max(until)));
    }

    /// Remaining cooldown (zero if none).
    pub fn remaining_cooldown(&self) -> Duration {
        let b = self.lock();
        b.blocked_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_throttled() {
        let rl = RateLimiter::new(2, Duration::from_secs(60));
        assert!(rl.try_acquire().is_ok());
        assert!(rl.try_acquire().is_ok());
        let wait = rl.try_acquire().unwrap_err();
        assert!(wait > Duration::from_secs(50));
    }

    #[test]
    fn tokens_refill_over_time() {
        let rl = RateLimiter::new(1, Duration::from_millis(20));
        rl.acquire();
        assert!(rl.try_acquire().is_err());
        thread::sleep(Duration::from_millis(30));
        assert!(rl.try_acquire().is_ok());
    }

    #[test]
    fn cooldown_blocks_until_expiry() {
        let rl = RateLimiter::unlimited();
        assert!(rl.try_acquire().is_ok());
        rl.cooldown(Duration::from_millis(40));
        assert!(rl.try_acquire().is_err());
        assert!(rl.remaining_cooldown() > Duration::ZERO);
        thread::sleep(Duration::from_millis(50));
        assert!(rl.try_acquire().is_ok());
        assert_eq!(rl.remaining_cooldown(), Duration::ZERO);
    }

    #[test]
    fn shorter_cooldown_does_not_shorten_longer_one() {
        let rl = RateLimiter::unlimited();
        rl.cooldown(Duration::from_secs(60));
        rl.cooldown(Duration::from_millis(1));
        assert!(rl.remaining_cooldown() > Duration::from_secs(50));
    }

    #[test]
    fn acquire_waits_out_cooldown() {
        let rl = RateLimiter::unlimited();
        rl.cooldown(Duration::from_millis(25));
        let start = Instant::now();
        rl.acquire();
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
