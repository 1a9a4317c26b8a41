//! Token-bucket rate limiter shared by the extraction orchestrator and the
//! embedding adapter (§5 "Rate limiting").
//!
//! A bounded queue of admission timestamps stands in for a token bucket,
//! since the limiter only needs to answer "may I proceed now, or how long
//! until I may."

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A request-admission limiter: at most `limit` requests may be admitted
/// in any trailing 60-second window.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting at most `requests_per_minute` requests
    /// per rolling 60-second window.
    #[must_use]
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            limit: requests_per_minute,
            window: Duration::from_secs(60),
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    fn evict_expired(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = admitted.front() {
            if now.duration_since(front) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Blocks the current thread, if necessary, until a slot is available,
    /// then records the admission.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned by a prior panicking
    /// holder (indicates a bug elsewhere, not a normal runtime condition).
    #[allow(clippy::expect_used)] // mutex poisoning indicates a prior panic elsewhere, not a normal runtime condition
    pub fn acquire(&self) {
        loop {
            let wait = {
                let mut admitted = self.admitted.lock().expect("rate limiter mutex poisoned");
                let now = Instant::now();
                self.evict_expired(&mut admitted, now);

                if admitted.len() < self.limit as usize {
                    admitted.push_back(now);
                    return;
                }

                let oldest = *admitted.front().expect("len >= limit > 0 implies front exists");
                self.window.saturating_sub(now.duration_since(oldest))
            };
            if wait.is_zero() {
                continue;
            }
            std::thread::sleep(wait);
        }
    }

    /// Number of requests admitted within the current window, without
    /// blocking or admitting a new one.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    #[allow(clippy::expect_used)] // mutex poisoning indicates a prior panic elsewhere, not a normal runtime condition
    pub fn current_load(&self) -> usize {
        let mut admitted = self.admitted.lock().expect("rate limiter mutex poisoned");
        self.evict_expired(&mut admitted, Instant::now());
        admitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_limit_without_blocking() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            limiter.acquire();
        }
        assert_eq!(limiter.current_load(), 5);
    }

    #[test]
    fn test_zero_load_initially() {
        let limiter = RateLimiter::new(100);
        assert_eq!(limiter.current_load(), 0);
    }
}
