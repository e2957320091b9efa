//! Bounded retry with backoff
//!
//! Kernel interfaces (ConfigFS attributes, loop partition nodes) settle
//! asynchronously. Every wait in the crate goes through [`Backoff`] so the
//! number of attempts and the total time spent are always bounded.

use std::time::Duration;

/// Retry schedule: `attempts` tries, sleeping `interval` between them.
///
/// With `exponential` set, the interval doubles after every failed attempt,
/// capped at `max_interval`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub interval: Duration,
    pub exponential: bool,
    pub max_interval: Duration,
}

impl Backoff {
    /// Fixed interval polling
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
            exponential: false,
            max_interval: interval,
        }
    }

    /// Doubling interval, capped at 8x the initial interval
    pub fn exponential(attempts: u32, initial: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval: initial,
            exponential: true,
            max_interval: initial * 8,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.interval;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// Returns the last error on exhaustion. Sleeps only between attempts.
    pub fn retry<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 >= self.attempts => return Err(e),
                Err(_) => {
                    let delay = self.delay_for(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Poll `check` until it returns true. Returns false if the bound is exceeded.
    pub fn poll_until<F>(&self, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        self.retry(|_| if check() { Ok(()) } else { Err(()) }).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_succeeds_after_failures() {
        let backoff = Backoff::exponential(5, Duration::ZERO);
        let mut calls = 0;
        let result: Result<u32, &str> = backoff.retry(|attempt| {
            calls += 1;
            if attempt < 2 {
                Err("busy")
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_exhaustion_returns_last_error() {
        let backoff = Backoff::fixed(3, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), u32> = backoff.retry(|attempt| {
            calls += 1;
            Err(attempt)
        });
        assert_eq!(result, Err(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let backoff = Backoff::fixed(0, Duration::ZERO);
        let mut calls = 0;
        assert!(!backoff.poll_until(|| {
            calls += 1;
            false
        }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let backoff = Backoff::exponential(10, Duration::from_millis(50));
        assert_eq!(backoff.delay_for(0), Duration::from_millis(50));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(9), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(400));
    }
}
