//! Retry-wrapped model calls
//!
//! Every task handler reaches the language model through `ModelCaller`. A call
//! is attempted up to `max_retries` times; only rate-limit signals are retried,
//! with exponential backoff of `2^(attempt+1)` seconds (2s, 4s, ...). Any other
//! failure ends the call immediately.

use async_trait::async_trait;
use sdk::errors::EngineError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{LLMError, LanguageModel};

/// Default number of attempts per model call
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Source of backoff delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Markers that identify quota exhaustion in provider error text.
const RATE_LIMIT_MARKERS: &[&str] = &["429", "resource exhausted", "rate limit", "quota"];

/// Whether a provider error is a rate-limit signal (and therefore retryable).
pub fn is_rate_limit_signal(error: &LLMError) -> bool {
    if matches!(error, LLMError::RateLimitExceeded) {
        return true;
    }
    let text = error.to_string().to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Delay before the retry that follows the 0-indexed `attempt`.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt + 1))
}

/// Map a non-retryable provider error to the engine error surfaced to users.
fn terminal_error(error: LLMError) -> EngineError {
    match error {
        LLMError::InvalidRequest(msg) | LLMError::ParseError(msg) | LLMError::Unknown(msg) => {
            EngineError::ModelCall(msg)
        }
        other => EngineError::ModelUnavailable(other.to_string()),
    }
}

/// Language model handle shared by all task handlers.
#[derive(Clone)]
pub struct ModelCaller {
    model: Arc<dyn LanguageModel>,
    sleeper: Arc<dyn Sleeper>,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl ModelCaller {
    /// Create a caller with the tokio sleeper and the default retry budget
    pub fn new(model: Arc<dyn LanguageModel>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model,
            sleeper: Arc::new(TokioSleeper),
            temperature,
            max_tokens,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Replace the backoff sleeper
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Override the number of attempts per call
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Name of the underlying provider
    pub fn provider_name(&self) -> &str {
        self.model.name()
    }

    /// Call the model with the configured retry budget
    pub async fn call(&self, prompt: &str) -> Result<String, EngineError> {
        self.call_with_retries(prompt, self.max_retries).await
    }

    /// Call the model, retrying rate-limit failures up to `max_retries` attempts
    ///
    /// # Errors
    ///
    /// - `EngineError::RateLimited` when the final attempt is rate limited
    /// - `EngineError::ModelUnavailable` / `ModelCall` for non-retryable failures
    /// - `EngineError::ModelUnavailable` when no attempt was made
    pub async fn call_with_retries(
        &self,
        prompt: &str,
        max_retries: u32,
    ) -> Result<String, EngineError> {
        for attempt in 0..max_retries {
            debug!(
                "Calling {} (attempt {}/{})",
                self.model.name(),
                attempt + 1,
                max_retries
            );

            match self
                .model
                .generate(prompt, self.temperature, self.max_tokens)
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) if is_rate_limit_signal(&e) => {
                    if attempt + 1 < max_retries {
                        let delay = backoff_delay(attempt);
                        warn!(
                            "Rate limit hit. Retrying in {} seconds... (Attempt {}/{})",
                            delay.as_secs(),
                            attempt + 1,
                            max_retries
                        );
                        self.sleeper.sleep(delay).await;
                        continue;
                    }
                    error!("Rate limit exceeded after {} attempts", max_retries);
                    return Err(EngineError::RateLimited);
                }
                Err(e) => {
                    error!("LLM call failed: {}", e);
                    return Err(terminal_error(e));
                }
            }
        }

        Err(EngineError::ModelUnavailable(format!(
            "no response after {} attempts",
            max_retries
        )))
    }
}
