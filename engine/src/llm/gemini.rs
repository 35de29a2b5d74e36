use super::{LLMError, LanguageModel};
use crate::config::{GeminiConfig, GEMINI_API_KEY_ENV};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

pub struct GeminiProvider {
    config: GeminiConfig,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig, api_key: impl Into<String>) -> super::Result<Self> {
        Ok(Self {
            config,
            api_key: api_key.into(),
            client: super::http_client(Duration::from_secs(120))?,
        })
    }

    /// Build a provider with the key taken from `GEMINI_API_KEY`.
    pub fn from_env(config: GeminiConfig) -> super::Result<Self> {
        let api_key = std::env::var(GEMINI_API_KEY_ENV).map_err(|_| {
            LLMError::AuthenticationFailed(format!("{} is not set", GEMINI_API_KEY_ENV))
        })?;
        if api_key.trim().is_empty() {
            return Err(LLMError::AuthenticationFailed(format!(
                "{} is empty",
                GEMINI_API_KEY_ENV
            )));
        }
        Self::new(config, api_key)
    }
}

#[async_trait]
impl LanguageModel for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn check_health(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn generate(&self, prompt: &str, temperature: f32, max_tokens: u32) -> super::Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.base_url, self.config.model, self.api_key
        );

        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": prompt}]
            }],
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_tokens
            }
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LLMError::Timeout
                } else {
                    LLMError::NetworkError(e.without_url().to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                400 | 404 => LLMError::InvalidRequest(text),
                429 => LLMError::RateLimitExceeded,
                401 | 403 => LLMError::AuthenticationFailed(text),
                _ => LLMError::ProviderUnavailable(format!(
                    "Gemini API error ({}): {}",
                    status, text
                )),
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        let candidate = data
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| LLMError::ParseError("No candidates in response".to_string()))?;

        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .ok_or_else(|| LLMError::ParseError("No parts in candidate content".to_string()))?;

        let mut full_text = String::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                full_text.push_str(text);
            }
        }

        tracing::debug!("Gemini returned {} chars", full_text.len());
        Ok(full_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> GeminiProvider {
        let config = GeminiConfig {
            base_url: server.uri(),
            model: "gemini-2.0-flash".to_string(),
        };
        GeminiProvider::new(config, "test-key").unwrap()
    }

    #[tokio::test]
    async fn test_generate_joins_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"parts": [{"text": "SELECT "}, {"text": "1"}]}
                }]
            })))
            .mount(&server)
            .await;

        let text = provider_for(&server)
            .generate("prompt", 0.1, 128)
            .await
            .unwrap();
        assert_eq!(text, "SELECT 1");
    }

    #[tokio::test]
    async fn test_429_maps_to_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Resource exhausted"))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .generate("prompt", 0.1, 128)
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_missing_candidates_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .generate("prompt", 0.1, 128)
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::ParseError(_)));
    }
}
