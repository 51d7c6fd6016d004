//! Two independent retry layers.
//!
//! The infrastructure layer ([`call_with_retry`]) re-sends a failed AI-service
//! call with exponential backoff when the failure is transient. The validation
//! layer lives in the generation loop and re-prompts the model with
//! corrective feedback built by [`build_correction_feedback`]. Each layer has
//! its own counter and limit.

mod feedback;
mod policy;

use std::time::Duration;

pub use feedback::{build_correction_feedback, expected_fields_for};
pub use policy::{backoff_delay, call_with_retry, classify, ErrorClass};

/// Configuration for infrastructure retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Delay before the first retry (default: 1s).
    pub initial_delay: Duration,
    /// Upper bound for any delay (default: 60s).
    pub max_delay: Duration,
    /// Multiplier applied per attempt (default: 2.0).
    pub backoff_factor: f64,
    /// Status codes worth retrying (default: 408, 429, 500, 502, 503, 504).
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    /// Sets the maximum number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub const fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Replaces the retryable status codes.
    #[must_use]
    pub fn with_retryable_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retryable_status_codes = codes;
        self
    }
}
