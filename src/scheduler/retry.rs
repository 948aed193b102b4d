use std::time::Duration;

use crate::error::Error;

/// Decides whether a failed attempt is worth repeating, and after how long.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Linear backoff step.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// `attempts` counts the attempts already made, the failed one included.
    pub fn should_retry(&self, error: &Error, attempts: u32) -> bool {
        error.is_transient() && attempts <= self.max_retries
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        self.backoff * attempts
    }
}
