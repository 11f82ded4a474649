use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::llm::types::{CompletionRequest, CompletionResponse};

use super::LlmProvider;

/// Configuration for retry behavior on transient oracle failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial call).
    pub max_retries: u32,
    /// Base delay for exponential backoff (doubled on each retry).
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Callback invoked before each retry attempt, just before the sleep.
///
/// Parameters: `(attempt, max_retries, delay_ms, error_class)`.
pub type OnRetry = dyn Fn(u32, u32, u64, &str) + Send + Sync;

/// Wraps any `LlmProvider` with automatic retry + exponential backoff.
///
/// Retries on:
/// - HTTP 429 (rate limit)
/// - HTTP 500, 502, 503, 529 (server errors)
/// - Network errors (`Error::Http`)
///
/// Does NOT retry on:
/// - HTTP 400, 401, 403, 404 (client errors — retrying won't help)
/// - JSON parse errors (deterministic failures)
/// - Agent/Config errors (not oracle-related)
pub struct RetryingProvider<P> {
    inner: P,
    config: RetryConfig,
    on_retry: Option<Arc<OnRetry>>,
}

impl<P> RetryingProvider<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            on_retry: None,
        }
    }

    /// Wrap a provider with the default retry config (2 retries, 500ms base delay).
    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    /// Set a callback invoked before each retry attempt.
    pub fn with_on_retry(mut self, callback: Arc<OnRetry>) -> Self {
        self.on_retry = Some(callback);
        self
    }
}

/// Classify an error into a short string for the retry callback.
fn classify_for_retry(err: &Error) -> &'static str {
    match err {
        Error::Api { status: 429, .. } => "rate_limited",
        Error::Api { status: 529, .. } => "overloaded",
        Error::Api { .. } => "server_error",
        Error::Http(_) => "network_error",
        _ => "unknown",
    }
}

/// Compute the delay for a given attempt using exponential backoff.
/// Attempt 0 = base_delay, attempt 1 = 2*base_delay, etc.
fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = config
        .base_delay
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    delay.min(config.max_delay)
}

impl<P: LlmProvider> LlmProvider for RetryingProvider<P> {
    fn model_name(&self) -> Option<&str> {
        self.inner.model_name()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = compute_delay(&self.config, attempt - 1);
                let delay_ms = delay.as_millis() as u64;
                let last = last_err.as_ref().expect("last_err set before retry");
                if let Some(ref cb) = self.on_retry {
                    cb(attempt, self.config.max_retries, delay_ms, classify_for_retry(last));
                }
                tracing::warn!(
                    attempt = attempt,
                    max_retries = self.config.max_retries,
                    delay_ms = delay_ms,
                    error = %last,
                    "retrying oracle call after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let last = last_err.expect("at least one attempt must have been made");
        Err(Error::OracleUnavailable {
            attempts: self.config.max_retries + 1,
            message: last.to_string(),
        })
    }
}
