//! Global send rate limiting using a token bucket.
//!
//! The bucket holds at most one token (burst 1) and refills at
//! `per_minute / 60` tokens per second. Waiters reserve their slot up front
//! by driving the token count negative, so concurrent callers are granted
//! evenly spaced slots in the order they arrived.
//!
//! ```text
//! Rate: 60/min
//! - t=0s   first caller proceeds immediately (bucket starts full)
//! - t=0s   second caller reserves the 1s slot
//! - t=0s   third caller reserves the 2s slot
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RateLimitError;

/// Maximum tokens in the bucket.
const BURST: f64 = 1.0;

#[derive(Debug)]
struct TokenBucket {
    /// May go negative while slots are reserved.
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
    /// Ticket of the most recent reservation still holding its slot.
    last_ticket: u64,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        Self {
            tokens: BURST,
            refill_rate: f64::from(per_minute.max(1)) / 60.0,
            last_refill: Instant::now(),
            last_ticket: 0,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(BURST);
        self.last_refill = now;
    }

    /// Take one token. Returns the reservation ticket and how long until the
    /// token is actually available.
    fn reserve(&mut self) -> (u64, Duration) {
        self.refill();
        self.tokens -= 1.0;
        self.last_ticket += 1;
        let delay = if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        };
        (self.last_ticket, delay)
    }

    /// Give back a cancelled reservation.
    ///
    /// Only the latest reservation can be returned. An earlier slot stays
    /// spent, since later waiters already hold the slots after it.
    fn refund(&mut self, ticket: u64) {
        if ticket != self.last_ticket {
            return;
        }
        self.refill();
        self.tokens = (self.tokens + 1.0).min(BURST);
        self.last_ticket -= 1;
    }
}

/// Shared limiter for outbound sends.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// A rate of 0 is clamped to 1 per minute.
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        Self {
            per_minute,
            bucket: Mutex::new(TokenBucket::new(per_minute)),
        }
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    /// Spacing between consecutive grants.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(60) / self.per_minute
    }

    /// Block until the caller may send, or until `cancel` fires.
    ///
    /// A cancelled waiter gives its slot back when no later caller has
    /// reserved after it.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        if cancel.is_cancelled() {
            return Err(RateLimitError::Cancelled);
        }

        let (ticket, delay) = self.bucket.lock().reserve();
        if delay.is_zero() {
            return Ok(());
        }

        tracing::trace!(wait_ms = delay.as_millis() as u64, "Waiting for send slot");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.bucket.lock().refund(ticket);
                Err(RateLimitError::Cancelled)
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn first_wait_is_immediate() {
        let limiter = RateLimiter::new(60);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_are_spaced_by_interval() {
        let limiter = RateLimiter::new(60);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(60));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..60 {
                    limiter.wait(&cancel).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(119), "took {elapsed:?}");
        assert!(elapsed < Duration::from_secs(121), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_refunds_slot() {
        let limiter = Arc::new(RateLimiter::new(60));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move { limiter.wait(&waiter_cancel).await })
        };
        tokio::task::yield_now().await;
        waiter_cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(RateLimitError::Cancelled));

        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert!(start.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_middle_waiter_keeps_later_slots_spaced() {
        let limiter = Arc::new(RateLimiter::new(60));
        let start = Instant::now();
        limiter.wait(&CancellationToken::new()).await.unwrap();

        let first_cancel = CancellationToken::new();
        let first = {
            let limiter = Arc::clone(&limiter);
            let cancel = first_cancel.clone();
            tokio::spawn(async move { limiter.wait(&cancel).await })
        };
        tokio::task::yield_now().await;

        let second = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.wait(&CancellationToken::new()).await.unwrap();
                Instant::now()
            })
        };
        tokio::task::yield_now().await;

        first_cancel.cancel();
        assert_eq!(first.await.unwrap(), Err(RateLimitError::Cancelled));

        limiter.wait(&CancellationToken::new()).await.unwrap();
        let third_at = start.elapsed();
        let second_at = second.await.unwrap() - start;

        assert!(second_at >= Duration::from_secs(2), "granted at {second_at:?}");
        assert!(second_at < Duration::from_secs(3), "granted at {second_at:?}");
        assert!(third_at >= Duration::from_secs(3), "granted at {third_at:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_returns_immediately() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(limiter.wait(&cancel).await, Err(RateLimitError::Cancelled));
        assert!(limiter.try_acquire(), "no token should have been reserved");
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_respects_bucket() {
        let limiter = RateLimiter::new(60);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn zero_rate_is_clamped() {
        let limiter = RateLimiter::new(0);
        assert_eq!(limiter.per_minute(), 1);
        assert_eq!(limiter.interval(), Duration::from_secs(60));
    }
}
