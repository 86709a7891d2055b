//! Token bucket used by admission control

use std::time::Duration;

use tokio::time::Instant;

/// Upper bound on a single wait when the bucket never refills
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Floor for reported waits so float rounding never yields a zero-length sleep
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Token bucket for smooth rate limiting
///
/// Starts full. Uses the tokio clock so paused-time tests can drive it.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: usize, refill_rate: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if self.refill_rate > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        }
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    pub fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        if self.refill_rate <= 0.0 {
            return Err(MAX_WAIT);
        }
        let wait = Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_rate)
            .unwrap_or(MAX_WAIT);
        Err(wait.clamp(MIN_WAIT, MAX_WAIT))
    }

    /// Tokens available right now
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let mut bucket = TokenBucket::new(5, 5.0);

        for _ in 0..5 {
            assert!(bucket.try_take().is_ok());
        }
        let wait = bucket.try_take().unwrap_err();
        assert_eq!(wait, Duration::from_millis(200));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let mut bucket = TokenBucket::new(3, 10.0);
        assert!(bucket.try_take().is_ok());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_rate() {
        let mut bucket = TokenBucket::new(1, 0.5);
        assert!(bucket.try_take().is_ok());
        assert_eq!(bucket.try_take().unwrap_err(), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.try_take().unwrap_err(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_capacity_still_admits_one() {
        let bucket = TokenBucket::new(0, 1.0);
        assert_eq!(bucket.capacity(), 1.0);
    }
}
