//! Language Model Abstraction Layer
//!
//! This module provides a common interface for the hosted or local language
//! model behind every task handler. The `LanguageModel` trait is the only
//! capability the engine needs: turn one prompt into one completion, and
//! report quota exhaustion distinctly from other failures so the retry layer
//! can back off.

use async_trait::async_trait;
use std::time::Duration;

pub mod gemini;
pub mod ollama;
pub mod retry;

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded (429)")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Language model trait that all providers must implement
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Returns the name of the provider (e.g., "gemini", "ollama")
    fn name(&self) -> &str;

    /// Generate a completion for a single prompt
    ///
    /// # Arguments
    /// * `prompt` - Full prompt text, role instruction included
    /// * `temperature` - Sampling temperature
    /// * `max_tokens` - Upper bound on generated tokens
    ///
    /// # Returns
    /// * `Ok(String)` - The completion text
    /// * `Err(LLMError::RateLimitExceeded)` - When the hosted quota is exhausted
    async fn generate(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String>;

    /// Check if the provider is currently healthy and available
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Build the HTTP client a provider uses, bounded by `timeout`
///
/// # Errors
///
/// Returns `LLMError::ProviderUnavailable` if the client cannot be built.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LLMError::ProviderUnavailable(format!("Failed to build HTTP client: {}", e)))
}

/// Language tags a model may put right after an opening fence
const FENCE_LANGUAGE_TAGS: &[&str] = &["sql", "sqlite", "json"];

/// Remove markdown code-fence markup from a model reply.
///
/// When the reply contains a fenced block, only the block body is kept, so
/// prose around the fence is dropped. Otherwise stray fence markers are
/// removed, along with a language tag that shared the opening fence's line.
pub fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();

    if let Some(body) = extract_fenced_block(trimmed) {
        return body.trim().to_string();
    }

    if !trimmed.contains("```") {
        return trimmed.to_string();
    }
    let unfenced = trimmed.replace("```", "");
    strip_language_tag(unfenced.trim()).trim().to_string()
}

fn strip_language_tag(text: &str) -> &str {
    match text.split_once(char::is_whitespace) {
        Some((first, rest))
            if FENCE_LANGUAGE_TAGS
                .iter()
                .any(|tag| first.eq_ignore_ascii_case(tag)) =>
        {
            rest
        }
        _ => text,
    }
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced_block(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "sql\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Find the first balanced JSON object in free-form model output.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let s = &content[start..];

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
