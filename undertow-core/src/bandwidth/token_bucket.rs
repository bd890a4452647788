//! Token bucket used by the shared rate limiter.
//!
//! Tokens are bytes. The bucket refills continuously at the configured rate
//! and holds at most one second of rate.

use std::time::Duration;

use tokio::time::Instant;

/// Single-direction token bucket.
///
/// A rate of zero disables limiting.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum tokens the bucket can hold (burst size)
    capacity: u64,
    tokens: f64,
    /// Bytes added per second
    refill_rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket refilling at `bytes_per_sec`.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            capacity: bytes_per_sec,
            tokens: bytes_per_sec as f64,
            refill_rate: bytes_per_sec,
            last_refill: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.refill_rate == 0
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Reconfigures the rate, keeping accrued tokens up to the new capacity.
    pub fn set_rate(&mut self, bytes_per_sec: u64) {
        self.refill();
        let was_unlimited = self.is_unlimited();
        self.refill_rate = bytes_per_sec;
        self.capacity = bytes_per_sec;
        self.tokens = if was_unlimited {
            bytes_per_sec as f64
        } else {
            self.tokens.min(bytes_per_sec as f64)
        };
    }

    /// Takes `tokens` if available, otherwise returns how long until they
    /// will be.
    ///
    /// Requests above capacity never succeed; callers split them first.
    pub fn try_consume(&mut self, tokens: u64) -> Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }
        self.refill();

        let requested = tokens as f64;
        if self.tokens >= requested {
            self.tokens -= requested;
            Ok(())
        } else {
            let missing = requested - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate as f64))
        }
    }

    /// Whole tokens currently available.
    pub fn available_tokens(&mut self) -> u64 {
        if self.is_unlimited() {
            return u64::MAX;
        }
        self.refill();
        self.tokens as u64
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        if self.is_unlimited() {
            return;
        }
        let added = elapsed.as_secs_f64() * self.refill_rate as f64;
        self.tokens = (self.tokens + added).min(self.capacity as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_starts_full_with_one_second_burst() {
        let mut bucket = TokenBucket::new(1000);
        assert_eq!(bucket.capacity(), 1000);
        assert_eq!(bucket.available_tokens(), 1000);
        assert!(bucket.try_consume(1000).is_ok());
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_consume_insufficient_reports_wait() {
        let mut bucket = TokenBucket::new(1000);
        bucket.try_consume(900).unwrap();

        let wait = bucket.try_consume(500).unwrap_err();
        assert!((399..=400).contains(&wait.as_millis()), "wait was {wait:?}");

        tokio::time::advance(wait + Duration::from_millis(1)).await;
        assert!(bucket.try_consume(500).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(50);
        bucket.try_consume(50).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(bucket.available_tokens(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_unlimited() {
        let mut bucket = TokenBucket::new(0);
        assert!(bucket.is_unlimited());
        assert!(bucket.try_consume(u64::MAX / 2).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_clamps_tokens_to_new_capacity() {
        let mut bucket = TokenBucket::new(1000);
        bucket.set_rate(100);
        assert_eq!(bucket.available_tokens(), 100);

        bucket.set_rate(0);
        assert!(bucket.is_unlimited());
        bucket.set_rate(200);
        assert_eq!(bucket.available_tokens(), 200);
    }
}
