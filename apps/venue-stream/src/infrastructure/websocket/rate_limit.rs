//! Outbound Rate Limiter
//!
//! Windowed limiter on the send path. A budget of zero means unlimited.
//! Sends that exceed the budget wait for the next window instead of failing.

use std::time::Duration;

use tokio::time::Instant;

/// Window the budget applies to.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Windowed rate limiter guarding outbound sends.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    window_start: Instant,
    remaining: u32,
}

impl RateLimiter {
    /// Limit to `per_second` messages per second (0 = unlimited).
    #[must_use]
    pub fn per_second(per_second: u32) -> Self {
        Self::new(per_second, RATE_LIMIT_WINDOW)
    }

    /// Limit to `max_per_window` messages per `window` (0 = unlimited).
    #[must_use]
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            window_start: Instant::now(),
            remaining: max_per_window,
        }
    }

    /// Check if the limiter never delays.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_per_window == 0
    }

    fn time_until_reset(&self, now: Instant) -> Duration {
        self.window
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }

    /// Take one send slot, or report how long until one frees up.
    ///
    /// # Errors
    ///
    /// Returns the wait until the next window if the budget is spent.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }

        let now = Instant::now();
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.remaining = self.max_per_window;
        }

        if self.remaining == 0 {
            return Err(self.time_until_reset(now));
        }

        self.remaining -= 1;
        Ok(())
    }

    /// Take one send slot, sleeping until the budget allows it.
    pub async fn acquire(&mut self) {
        while let Err(wait) = self.try_acquire() {
            tracing::trace!(wait_ms = wait.as_millis(), "Send rate limited");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn zero_is_unlimited() {
        let mut limiter = RateLimiter::per_second(0);
        for _ in 0..1_000 {
            assert!(limiter.try_acquire().is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhausts_then_resets() {
        let mut limiter = RateLimiter::per_second(2);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.try_acquire(), Err(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_next_window() {
        let mut limiter = RateLimiter::per_second(1);
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;

        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
