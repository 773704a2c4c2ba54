//! Throughput limiting for mirror copies
//!
//! Bytes are accounted against fixed time slices. As long as the bytes
//! dispatched in the current slice stay under the slice quota no delay is
//! needed; once the quota is exceeded the slice is stretched in proportion to
//! the overshoot and the caller is told how long to sleep.
//!
//! # Example
//!
//! ```ignore
//! let mut limiter = RateLimiter::new(10 * 1024 * 1024); // 10 MB/s
//!
//! // After dispatching each request
//! let delay = limiter.account(io_bytes);
//! tokio::time::sleep(delay).await;
//! ```

use std::time::{Duration, Instant};

/// Default slice length
pub const SLICE_TIME: Duration = Duration::from_millis(100);

/// Slice-based rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second (0 = unlimited)
    speed: u64,
    /// Bytes allowed per slice
    slice_quota: u64,
    slice: Duration,
    slice_start: Instant,
    slice_end: Instant,
    /// Bytes dispatched in the current slice
    dispatched: u64,
}

impl RateLimiter {
    /// Create a limiter with the default slice length
    pub fn new(speed: u64) -> Self {
        Self::with_slice(speed, SLICE_TIME)
    }

    /// Create a limiter with a custom slice length
    pub fn with_slice(speed: u64, slice: Duration) -> Self {
        let now = Instant::now();
        let mut limiter = Self {
            speed: 0,
            slice_quota: 0,
            slice,
            slice_start: now,
            slice_end: now,
            dispatched: 0,
        };
        limiter.set_speed(speed);
        limiter
    }

    /// Update the limit; 0 disables limiting
    pub fn set_speed(&mut self, speed: u64) {
        self.speed = speed;
        let quota = (u128::from(speed) * self.slice.as_nanos()) / 1_000_000_000;
        // A non-zero speed always allows at least one byte per slice
        self.slice_quota = if speed == 0 {
            0
        } else {
            u64::try_from(quota).unwrap_or(u64::MAX).max(1)
        };
    }

    /// Configured speed in bytes per second
    pub fn speed(&self) -> u64 {
        self.speed
    }

    /// Whether a limit is configured
    pub fn is_limited(&self) -> bool {
        self.speed > 0
    }

    /// Account `bytes` and return how long the caller should wait
    pub fn account(&mut self, bytes: u64) -> Duration {
        self.account_at(bytes, Instant::now())
    }

    /// Delay `bytes` would incur right now, without accounting them
    pub fn delay_for(&self, bytes: u64) -> Duration {
        if !self.is_limited() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let (start, dispatched) = if self.slice_end < now {
            (now, bytes)
        } else {
            (self.slice_start, self.dispatched.saturating_add(bytes))
        };
        self.delay_from(start, dispatched, now).1
    }

    fn account_at(&mut self, bytes: u64, now: Instant) -> Duration {
        if !self.is_limited() {
            return Duration::ZERO;
        }

        if self.slice_end < now {
            // Previous, possibly stretched, slice is over
            self.slice_start = now;
            self.slice_end = now + self.slice;
            self.dispatched = 0;
        }

        self.dispatched = self.dispatched.saturating_add(bytes);
        let (end, delay) = self.delay_from(self.slice_start, self.dispatched, now);
        if let Some(end) = end {
            self.slice_end = end;
        }
        delay
    }

    fn delay_from(
        &self,
        start: Instant,
        dispatched: u64,
        now: Instant,
    ) -> (Option<Instant>, Duration) {
        if dispatched < self.slice_quota {
            return (None, Duration::ZERO);
        }
        let slices = dispatched as f64 / self.slice_quota as f64;
        let end = start + self.slice.mul_f64(slices);
        (Some(end), end.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_unlimited() {
        let mut limiter = RateLimiter::new(0);
        assert!(!limiter.is_limited());
        assert_eq!(limiter.account(100 * MB), Duration::ZERO);
        assert_eq!(limiter.delay_for(100 * MB), Duration::ZERO);
    }

    #[test]
    fn test_under_quota_has_no_delay() {
        // 10 MB/s, 100ms slices => 1 MB per slice
        let mut limiter = RateLimiter::new(10 * MB);
        let now = Instant::now();
        assert_eq!(limiter.account_at(MB / 2, now), Duration::ZERO);
        assert_eq!(limiter.dispatched, MB / 2);
    }

    #[test]
    fn test_overshoot_stretches_slice() {
        let mut limiter = RateLimiter::new(10 * MB);
        let now = Instant::now();

        // Three slices worth of data in one go
        let delay = limiter.account_at(3 * MB, now);
        assert!(delay >= Duration::from_millis(299), "delay {delay:?}");
        assert!(delay <= Duration::from_millis(301), "delay {delay:?}");
    }

    #[test]
    fn test_new_slice_resets_accounting() {
        let mut limiter = RateLimiter::new(10 * MB);
        let start = Instant::now();
        limiter.account_at(2 * MB, start);

        // Well past the stretched slice
        let later = start + Duration::from_secs(1);
        assert_eq!(limiter.account_at(MB / 4, later), Duration::ZERO);
        assert_eq!(limiter.dispatched, MB / 4);
    }

    #[test]
    fn test_set_speed_updates_quota() {
        let mut limiter = RateLimiter::new(10 * MB);
        assert_eq!(limiter.slice_quota, MB);
        limiter.set_speed(20 * MB);
        assert_eq!(limiter.slice_quota, 2 * MB);
        limiter.set_speed(0);
        assert!(!limiter.is_limited());
    }

    #[test]
    fn test_delay_for_does_not_account() {
        let limiter = RateLimiter::new(10 * MB);
        assert!(limiter.delay_for(5 * MB) > Duration::from_millis(400));
        assert_eq!(limiter.dispatched, 0);
    }
}
