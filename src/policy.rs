// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Retry policy shared by every polling site.
//!
//! Context programming polls a busy bit, the mailbox polls its channel and
//! waits for acknowledgements, and queue stop polls the hardware consumer
//! index while draining. All of them take a [`RetryPolicy`] instead of doing
//! their own interval and timeout arithmetic.

use std::time::{Duration, Instant};

/// Default busy-bit poll interval for indirect context programming.
pub const DEFAULT_CONTEXT_INTERVAL: Duration = Duration::from_micros(10);

/// Default busy-bit timeout for indirect context programming.
pub const DEFAULT_CONTEXT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default mailbox channel poll interval.
pub const DEFAULT_MAILBOX_INTERVAL: Duration = Duration::from_millis(1);

/// Default time a `wait` mailbox request may block.
pub const DEFAULT_MAILBOX_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval while waiting for hardware to drain a stopping queue.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_micros(100);

/// Default bound on draining a stopping queue.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Consumed completion entries between hardware index updates.
pub const DEFAULT_INDEX_UPDATE_BATCH: u32 = 8;

/// Interval, timeout and backoff for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first re-check.
    pub interval: Duration,
    /// Total time budget.
    pub timeout: Duration,
    /// Multiplier applied to the interval after each attempt (1 = fixed).
    pub backoff: u32,
    /// Upper bound for the grown interval.
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Fixed-interval policy.
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            backoff: 1,
            max_interval: interval,
        }
    }

    /// Grow the interval by `factor` after every attempt, capped at `max_interval`.
    pub const fn with_backoff(self, factor: u32, max_interval: Duration) -> Self {
        Self {
            backoff: factor,
            max_interval,
            ..self
        }
    }

    /// Replace the timeout.
    pub const fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Policy for indirect context programming.
    pub const fn context() -> Self {
        Self::new(DEFAULT_CONTEXT_INTERVAL, DEFAULT_CONTEXT_TIMEOUT)
    }

    /// Policy for mailbox polling and response waits.
    pub const fn mailbox() -> Self {
        Self::new(DEFAULT_MAILBOX_INTERVAL, DEFAULT_MAILBOX_TIMEOUT)
    }

    /// Policy for draining a queue on stop.
    pub const fn drain() -> Self {
        Self::new(DEFAULT_DRAIN_INTERVAL, DEFAULT_DRAIN_TIMEOUT)
            .with_backoff(2, Duration::from_millis(10))
    }

    /// Deadline for an attempt starting now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Interval to use after `current`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        if self.backoff <= 1 {
            current
        } else {
            current.saturating_mul(self.backoff).min(self.max_interval)
        }
    }

    /// Call `attempt` until it yields a value or the timeout elapses.
    ///
    /// `attempt` always runs at least once, and once more after the deadline
    /// so a condition that became true during the last sleep is not missed.
    pub fn poll<T, F>(&self, mut attempt: F) -> Option<T>
    where
        F: FnMut() -> Option<T>,
    {
        let deadline = self.deadline();
        let mut interval = self.interval;
        loop {
            if let Some(value) = attempt() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let nap = interval.min(deadline - now);
            if nap.is_zero() {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(nap);
            }
            interval = self.next_interval(interval);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::context()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_succeeds_after_retries() {
        let policy = RetryPolicy::new(Duration::from_micros(1), Duration::from_secs(1));
        let mut calls = 0;
        let value = policy.poll(|| {
            calls += 1;
            (calls == 3).then_some(calls)
        });
        assert_eq!(value, Some(3));
    }

    #[test]
    fn test_poll_times_out() {
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5));
        let start = Instant::now();
        let value: Option<()> = policy.poll(|| None);
        assert!(value.is_none());
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(Duration::from_micros(100), Duration::from_secs(1))
            .with_backoff(4, Duration::from_millis(1));
        let mut iv = policy.interval;
        iv = policy.next_interval(iv);
        assert_eq!(iv, Duration::from_micros(400));
        iv = policy.next_interval(iv);
        assert_eq!(iv, Duration::from_millis(1));
        iv = policy.next_interval(iv);
        assert_eq!(iv, Duration::from_millis(1));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(RetryPolicy::context().timeout, Duration::from_millis(500));
        assert_eq!(RetryPolicy::mailbox().timeout, Duration::from_secs(5));
        assert_eq!(RetryPolicy::default(), RetryPolicy::context());
        assert_eq!(DEFAULT_INDEX_UPDATE_BATCH, 8);
    }
}
