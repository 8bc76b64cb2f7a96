//! Backoff primitives shared by the work-item queue, the generation retry
//! helper and the topic screener loop.

use std::time::Duration;

use rand::Rng;

/// Lower bound of the random jitter added to every backoff, in seconds.
pub const JITTER_MIN_SECS: f64 = 0.1;
/// Upper bound (exclusive) of the random jitter, in seconds.
pub const JITTER_MAX_SECS: f64 = 0.9;

/// `min(cap, 2^attempt seconds)` plus uniform jitter in `[0.1, 0.9)` seconds.
///
/// The jitter keeps concurrent retriers from waking up in lockstep. Large
/// attempt numbers saturate at `cap` instead of overflowing.
pub fn jittered_backoff(attempt: u32, cap: Duration) -> Duration {
    let exponential = 1u64
        .checked_shl(attempt)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(Duration::MAX);
    let jitter = rand::thread_rng().gen_range(JITTER_MIN_SECS..JITTER_MAX_SECS);

    exponential.min(cap) + Duration::from_secs_f64(jitter)
}

/// How a failed work item is pushed into the future before its next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// `jittered_backoff(attempts, cap)`
    Exponential { cap: Duration },
    /// Same delay after every failure.
    Fixed(Duration),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying an item that has now failed `attempts` times.
    pub fn delay(&self, attempts: u32) -> Duration {
        match self {
            RetryPolicy::Exponential { cap } => jittered_backoff(attempts, *cap),
            RetryPolicy::Fixed(delay) => *delay,
        }
    }
}

/// Idle wait for polling loops: doubles on every empty poll, clamped to
/// `[min, max]`, and snaps back to `min` as soon as work shows up.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the wait to use now and doubles the next one.
    pub fn advance(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
