//! Retry backoff
//!
//! Exponential backoff between full delivery cycles: the first retry waits
//! the base delay and every further retry doubles it, up to a cap.

use std::time::Duration;

/// Full delivery cycles before an attempt fails permanently
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Upper bound for any single delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry strategy with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries handed out so far
    pub attempt: u32,
    /// Retries available
    pub max_attempts: u32,
    /// Delay the next retry will wait
    pub current_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_cycles(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RetryPolicy {
    /// Policy for `cycles` full cycles, which leaves `cycles - 1` retries
    pub fn for_cycles(cycles: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts: cycles.saturating_sub(1),
            current_delay: base_delay,
            max_delay,
        }
    }

    /// Check if more retries are available
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Get next delay with exponential backoff, `None` once exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = std::cmp::min(self.current_delay * 2, self.max_delay);

        Some(delay)
    }
}
