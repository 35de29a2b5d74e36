//! Application wiring
//!
//! `AppContext` is built explicitly from a `Config`: it opens the tabular
//! store, constructs the language model, registers the five handlers and
//! owns the orchestrator (and through it the conversation memory).

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agents::{KnowledgeLookup, QueryGenerator, ResultAnalyst, Router, Translator};
use crate::config::Config;
use crate::knowledge::WikipediaSource;
use crate::llm::gemini::GeminiProvider;
use crate::llm::ollama::OllamaProvider;
use crate::llm::retry::ModelCaller;
use crate::llm::LanguageModel;
use crate::memory::ConversationMemory;
use crate::orchestrator::{QueryOrchestrator, QueryResponse};
use crate::store::{ingest, SqliteBackend, TabularStore};

pub struct AppContext {
    backend: Arc<SqliteBackend>,
    store: Arc<TabularStore>,
    orchestrator: QueryOrchestrator,
}

/// Construct the provider named by `llm.default_provider`
pub fn build_model(config: &Config) -> Result<Arc<dyn LanguageModel>> {
    let model: Arc<dyn LanguageModel> = match config.llm.default_provider.as_str() {
        "gemini" => Arc::new(
            GeminiProvider::from_env(config.llm.gemini.clone())
                .context("Gemini provider is not available")?,
        ),
        "ollama" => Arc::new(
            OllamaProvider::new(
                config.llm.ollama.base_url.clone(),
                config.llm.ollama.model.clone(),
            )
            .context("Ollama provider is not available")?,
        ),
        other => bail!("Unknown LLM provider '{}'", other),
    };
    Ok(model)
}

/// Open the configured tabular store and snapshot its schema
pub async fn open_store(config: &Config) -> Result<(Arc<SqliteBackend>, Arc<TabularStore>)> {
    let backend = Arc::new(
        SqliteBackend::connect(&config.database.path)
            .await
            .context("Failed to open tabular store")?,
    );
    let store = Arc::new(TabularStore::new(
        backend.clone(),
        config.database.max_query_results,
        config.database.sample_rows,
    )?);
    store.rebuild_schema().await?;
    Ok((backend, store))
}

impl AppContext {
    /// Wire everything from config, using the configured provider
    pub async fn initialize(config: &Config, session_id: Option<String>) -> Result<Self> {
        let model = build_model(config)?;
        Self::with_model(config, model, session_id).await
    }

    /// Wire everything from config around an existing model
    pub async fn with_model(
        config: &Config,
        model: Arc<dyn LanguageModel>,
        session_id: Option<String>,
    ) -> Result<Self> {
        let (backend, store) = open_store(config).await?;

        if !model.check_health().await {
            warn!("Language model '{}' reports unhealthy", model.name());
        }
        let caller = ModelCaller::new(model, config.llm.temperature, config.llm.max_tokens)
            .with_max_retries(config.llm.max_retries);

        let mut knowledge = KnowledgeLookup::new(caller.clone());
        if config.knowledge.enabled {
            knowledge = knowledge.with_source(Arc::new(
                WikipediaSource::new(config.knowledge.wikipedia_base_url.clone())
                    .context("Failed to set up the Wikipedia source")?,
            ));
        }

        let memory = ConversationMemory::new(session_id, &config.memory)?;
        let orchestrator = QueryOrchestrator::new(memory)
            .with_router_plan(config.orchestrator.use_router_plan)
            .with_handler(Arc::new(Router::new(caller.clone())))
            .with_handler(Arc::new(QueryGenerator::new(caller.clone(), store.clone())))
            .with_handler(Arc::new(ResultAnalyst::new(caller.clone())))
            .with_handler(Arc::new(knowledge))
            .with_handler(Arc::new(Translator::new(caller)));

        info!(
            "Orchestrator initialized with {} handlers (session {})",
            orchestrator.handler_count(),
            orchestrator.memory().session_id()
        );

        Ok(Self {
            backend,
            store,
            orchestrator,
        })
    }

    pub fn store(&self) -> &Arc<TabularStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &QueryOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut QueryOrchestrator {
        &mut self.orchestrator
    }

    pub async fn process_query(&mut self, question: &str) -> QueryResponse {
        self.orchestrator.process_query(question).await
    }

    /// Load a seed script, CSV file or CSV directory and notify the guard
    pub async fn load_seed(&self, source: &Path) -> Result<BTreeMap<String, u64>> {
        load_seed(&self.backend, &self.store, source).await
    }

    /// Checkpoint the store before exit
    pub async fn shutdown(&self) -> Result<()> {
        self.backend.flush_wal().await
    }
}

/// Loader shared by the CLI and `AppContext`
///
/// A directory loads every CSV file in it, a `.csv` file loads one table,
/// anything else runs as a trusted SQL seed script.
pub async fn load_seed(
    backend: &SqliteBackend,
    store: &TabularStore,
    source: &Path,
) -> Result<BTreeMap<String, u64>> {
    let loaded = if source.is_dir() {
        backend.load_csv_dir(source).await?
    } else if ingest::is_csv(source) {
        let (table, rows) = backend.load_csv_file(source).await?;
        BTreeMap::from([(table, rows)])
    } else {
        backend.load_script_file(source).await?
    };
    store.on_tables_loaded(&loaded).await?;
    Ok(loaded)
}
