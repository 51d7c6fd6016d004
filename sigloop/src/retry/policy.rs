use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::RetryConfig;
use crate::ai::{AiService, ChatOutput, ChatRequest};
use crate::errors::{GenerateError, ServiceError};

/// How a service failure is treated by the infrastructure layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; worth another attempt.
    Retryable,
    /// Credentials problem; never retried.
    Authentication,
    /// Permanent; surfaced immediately.
    Fatal,
}

/// Classifies a service failure.
#[must_use]
pub fn classify(error: &ServiceError, config: &RetryConfig) -> ErrorClass {
    match error {
        ServiceError::Authentication { .. } => ErrorClass::Authentication,
        ServiceError::Status { status: 401 | 403, .. } => ErrorClass::Authentication,
        ServiceError::Status { status, .. } if config.retryable_status_codes.contains(status) => {
            ErrorClass::Retryable
        }
        ServiceError::Network { .. } | ServiceError::Timeout { .. } => ErrorClass::Retryable,
        ServiceError::Status { .. }
        | ServiceError::StreamTerminated { .. }
        | ServiceError::Other(_) => ErrorClass::Fatal,
    }
}

/// Delay before retry number `attempt` (zero-based): the exponential delay
/// capped at `max_delay`, then scaled by a random factor in `[0.75, 1.25)`.
#[must_use]
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let unit: f64 = rand::thread_rng().gen();
    jittered_delay(config, attempt, unit)
}

fn jittered_delay(config: &RetryConfig, attempt: u32, unit: f64) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * config.backoff_factor.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());
    Duration::from_secs_f64((capped * (0.75 + unit * 0.5)).max(0.0))
}

/// Sends `request`, retrying transient failures with backoff.
///
/// The call and every backoff sleep race the cancellation token. The total
/// number of calls never exceeds `max_retries + 1`.
pub async fn call_with_retry(
    ai: &dyn AiService,
    request: &ChatRequest,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<ChatOutput, GenerateError> {
    let mut attempt: u32 = 0;
    loop {
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(GenerateError::Cancelled),
            outcome = ai.chat(request.clone()) => outcome,
        };

        let err = match outcome {
            Ok(output) => return Ok(output),
            Err(err) => err,
        };

        let class = classify(&err, config);
        if class != ErrorClass::Retryable || attempt >= config.max_retries {
            if class == ErrorClass::Retryable {
                error!(
                    event = "infra_retry_exhausted",
                    service = ai.name(),
                    attempts = attempt + 1,
                    error = %err,
                    "AI service retries exhausted"
                );
            }
            return Err(GenerateError::Service {
                source: err,
                retries: attempt,
            });
        }

        let delay = backoff_delay(config, attempt);
        warn!(
            event = "infra_retry",
            service = ai.name(),
            attempt = attempt + 1,
            status = err.status_code(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Retrying AI service call"
        );

        tokio::select! {
            () = cancel.cancelled() => return Err(GenerateError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let config = RetryConfig::default();
        let status = |code| ServiceError::status(code, "u", "m");

        for code in [408, 429, 500, 502, 503, 504] {
            assert_eq!(classify(&status(code), &config), ErrorClass::Retryable, "{code}");
        }
        for code in [400, 404, 422, 501] {
            assert_eq!(classify(&status(code), &config), ErrorClass::Fatal, "{code}");
        }
        assert_eq!(classify(&status(401), &config), ErrorClass::Authentication);
        assert_eq!(classify(&status(403), &config), ErrorClass::Authentication);
        assert_eq!(
            classify(
                &ServiceError::Timeout {
                    url: "u".into(),
                    timeout_ms: 10
                },
                &config
            ),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(
                &ServiceError::Network {
                    url: "u".into(),
                    message: "reset".into()
                },
                &config
            ),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let config = RetryConfig::default();
        assert_eq!(jittered_delay(&config, 0, 0.5), Duration::from_secs(1));
        assert_eq!(jittered_delay(&config, 3, 0.5), Duration::from_secs(8));
        assert_eq!(jittered_delay(&config, 10, 0.5), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = RetryConfig::default();
        assert_eq!(jittered_delay(&config, 1, 0.0), Duration::from_millis(1500));
        assert!(jittered_delay(&config, 1, 0.999_999) < Duration::from_millis(2500));
        for attempt in 0..6 {
            let delay = backoff_delay(&config, attempt);
            let nominal = config.initial_delay.as_secs_f64() * 2f64.powi(attempt as i32);
            let nominal = nominal.min(60.0);
            assert!(delay.as_secs_f64() >= nominal * 0.75 - 1e-9);
            assert!(delay.as_secs_f64() <= nominal * 1.25 + 1e-9);
        }
    }
}
