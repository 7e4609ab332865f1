//! Fragment request pacing and the retry policy.

use crate::config::Config;
use embassy_time::Duration;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum RetryVerdict {
    /// Ask for the same fragment again
    Retry,
    /// Give up on the session
    Exhausted,
}

/// Owns the retry counter of a session and derives the request timeout from it.
///
/// The timeout window grows linearly with every consecutive retry:
/// `base_timeout + retry_count * retry_increment`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RequestController {
    retry_count: u8,
    max_retries: u8,
    base_timeout: Duration,
    retry_increment: Duration,
}

impl RequestController {
    pub fn new(config: &Config) -> Self {
        Self {
            retry_count: 0,
            max_retries: config.max_retries,
            base_timeout: config.base_timeout,
            retry_increment: config.retry_increment,
        }
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn timeout_window(&self) -> Duration {
        self.base_timeout + self.retry_increment * u32::from(self.retry_count)
    }

    /// A fragment passed validation
    pub fn on_valid_fragment(&mut self) {
        self.retry_count = 0;
    }

    /// The request timed out or the answer was defective.
    /// After `max_retries` consecutive failures the session is exhausted.
    pub fn on_failure(&mut self) -> RetryVerdict {
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retry_count >= self.max_retries {
            RetryVerdict::Exhausted
        } else {
            RetryVerdict::Retry
        }
    }
}
