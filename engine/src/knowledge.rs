//! External knowledge sources
//!
//! A `KnowledgeSource` answers a free-text lookup with reference text, or
//! `None` when it has nothing (or is unreachable). Lookups never fail the
//! calling handler.

use async_trait::async_trait;
use reqwest::{Client, Url};
use sdk::errors::EngineError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, query: &str) -> Option<String>;
}

/// Wikipedia search + page summary over the public REST API
pub struct WikipediaSource {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pages: Vec<SearchPage>,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    key: String,
}

#[derive(Debug, Deserialize)]
struct PageSummary {
    #[serde(default)]
    extract: String,
}

impl WikipediaSource {
    /// # Errors
    ///
    /// Returns `EngineError::Network` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("tabula/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, EngineError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| EngineError::Config(format!("Invalid Wikipedia URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| EngineError::Config("Wikipedia URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, EngineError> {
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Network(e.without_url().to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Network(format!(
                "Wikipedia returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Network(e.without_url().to_string()))
    }

    async fn search(&self, query: &str) -> Result<Option<String>, EngineError> {
        let url = self.endpoint(&["w", "rest.php", "v1", "search", "page"])?;
        let results: SearchResponse = self
            .get_json(self.client.get(url).query(&[("q", query), ("limit", "1")]))
            .await?;

        let Some(page) = results.pages.into_iter().next() else {
            debug!("No Wikipedia results for '{}'", query);
            return Ok(None);
        };

        let url = self.endpoint(&["api", "rest_v1", "page", "summary", &page.key])?;
        let summary: PageSummary = self.get_json(self.client.get(url)).await?;

        let extract = summary.extract.trim();
        Ok((!extract.is_empty()).then(|| extract.to_string()))
    }
}

#[async_trait]
impl KnowledgeSource for WikipediaSource {
    fn name(&self) -> &str {
        "Wikipedia"
    }

    async fn lookup(&self, query: &str) -> Option<String> {
        match self.search(query).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Wikipedia search error: {}", e);
                None
            }
        }
    }
}
