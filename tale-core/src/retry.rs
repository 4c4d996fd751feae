//! Uniform retry contract for model calls.
//!
//! Transient failures and malformed output are retried with exponential
//! backoff up to the attempt budget; anything else fails at once. Both the
//! call and the backoff sleep observe cancellation.

use crate::error::ModelCallError;
use crate::model::{ModelClient, ModelRequest};
use claude::Response;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default total attempts per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Default cap on a single backoff delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 8_000;

/// Retry policy for model calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full attempt budget with no waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Delay after the `failures`-th failed attempt: base * multiplier^(failures - 1),
    /// capped at `max_delay_ms`, plus up to 10% jitter.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 || self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exp = self.backoff_multiplier.powi(failures as i32 - 1);
        let delay = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let jitter = delay * (rand::random::<f64>() * 0.1);
        Duration::from_millis((delay + jitter) as u64)
    }
}

/// Issue `request`, parse the response, and retry per `policy`.
///
/// `parse` turns a response into the caller's value, or explains why the
/// output is malformed; malformed output is retried with the same prompt.
pub async fn call_with_retry<T, F>(
    client: &dyn ModelClient,
    policy: &RetryPolicy,
    request: &ModelRequest,
    cancel: &CancellationToken,
    mut parse: F,
) -> Result<T, ModelCallError>
where
    F: FnMut(&Response) -> Result<T, String>,
{
    let purpose = request.purpose;
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelCallError::Cancelled),
            outcome = client.complete(request.clone()) => outcome,
        };

        let err = match outcome {
            Ok(response) => match parse(&response) {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(%purpose, attempt, "model call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(reason) => ModelCallError::Malformed(reason),
            },
            Err(e) => ModelCallError::from_client(e),
        };

        if !err.is_retryable() {
            tracing::warn!(%purpose, attempt, error = %err, "model call failed permanently");
            return Err(err);
        }

        tracing::warn!(%purpose, attempt, max_attempts, error = %err, "model call attempt failed");
        last_error = err.to_string();

        if attempt < max_attempts {
            let hinted = match &err {
                ModelCallError::Transient(e) => e.retry_after(),
                _ => None,
            };
            let delay = hinted.unwrap_or_else(|| policy.delay_for_attempt(attempt));
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ModelCallError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(ModelCallError::Exhausted {
        purpose,
        attempts: max_attempts,
        last: last_error,
    })
}

/// Parse helper: the response's text, rejecting empty output.
pub fn non_empty_text(response: &Response) -> Result<String, String> {
    let text = response.text();
    if text.trim().is_empty() {
        Err("empty response".to_string())
    } else {
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelTier;
    use crate::model::CallPurpose;
    use crate::testing::{MockModel, MockReply};

    fn request() -> ModelRequest {
        ModelRequest::new(CallPurpose::Summarize, ModelTier::Flagship, "sys", "summarize")
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        let first = policy.delay_for_attempt(1).as_millis();
        let second = policy.delay_for_attempt(2).as_millis();
        let capped = policy.delay_for_attempt(6).as_millis();
        assert!((100..=110).contains(&first));
        assert!((200..=220).contains(&second));
        assert!((350..=385).contains(&capped));
        assert_eq!(RetryPolicy::immediate().delay_for_attempt(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let model = MockModel::new(|_| MockReply::text("A summary."));
        model.fail_next(CallPurpose::Summarize, 2);

        let text = call_with_retry(
            &model,
            &RetryPolicy::immediate(),
            &request(),
            &CancellationToken::new(),
            non_empty_text,
        )
        .await
        .unwrap();

        assert_eq!(text, "A summary.");
        assert_eq!(model.calls_for(CallPurpose::Summarize), 3);
    }

    #[tokio::test]
    async fn test_exhausts_budget_on_malformed_output() {
        let model = MockModel::new(|_| MockReply::text("   "));

        let err = call_with_retry(
            &model,
            &RetryPolicy::immediate(),
            &request(),
            &CancellationToken::new(),
            non_empty_text,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ModelCallError::Exhausted { attempts: 5, .. }));
        assert_eq!(model.calls_for(CallPurpose::Summarize), 5);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let model = MockModel::new(|_| MockReply::Fail(claude::Error::NoApiKey));

        let err = call_with_retry(
            &model,
            &RetryPolicy::immediate(),
            &request(),
            &CancellationToken::new(),
            non_empty_text,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ModelCallError::Permanent(_)));
        assert_eq!(model.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let model = MockModel::new(|_| MockReply::text("never"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = call_with_retry(&model, &RetryPolicy::immediate(), &request(), &cancel, non_empty_text)
            .await
            .unwrap_err();

        assert!(matches!(err, ModelCallError::Cancelled));
        assert_eq!(model.total_calls(), 0);
    }
}
