//! Query orchestrator
//!
//! Classifies each question, sequences the task handlers for its route and
//! merges their outputs into one `QueryResponse`. Both sides of every turn
//! are written to conversation memory, failures included.
//!
//! Turn lifecycle: `Idle → Classifying → {DataQuery, Translation, Knowledge,
//! General} → Responding → Idle`. Only the memory outlives a turn.

use futures::FutureExt;
use sdk::errors::{EngineError, TabulaErrorExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::agents::{HandlerKind, RoutingPlan, TaskContext, TaskHandler, TaskResult};
use crate::memory::{ConversationMemory, Metadata, Role};
use crate::store::ResultSet;

pub mod classifier;

pub use classifier::{classify, target_language, Intent};

pub const NO_RESULTS_ANSWER: &str = "The query executed successfully but returned no results.";
pub const ANALYSIS_UNAVAILABLE: &str = "Analysis not available.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Classifying,
    DataQuery,
    Translation,
    Knowledge,
    General,
    Responding,
}

impl From<Intent> for TurnState {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::DataQuery => TurnState::DataQuery,
            Intent::Translation => TurnState::Translation,
            Intent::Knowledge => TurnState::Knowledge,
            Intent::General => TurnState::General,
        }
    }
}

/// Answer for one turn
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResultSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    pub metadata: Metadata,
    pub success: bool,
}

impl QueryResponse {
    fn answered(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            data: None,
            sql_query: None,
            intent: None,
            metadata: Metadata::new(),
            success: true,
        }
    }

    fn failed(answer: impl Into<String>, error: &str) -> Self {
        Self {
            success: false,
            ..Self::answered(answer)
        }
        .with_metadata("error", error)
    }

    fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    fn with_hint(self, hint: Option<&str>) -> Self {
        match hint {
            Some(hint) => self.with_metadata("hint", hint),
            None => self,
        }
    }

    /// What the user can do about a failed turn
    pub fn hint(&self) -> Option<&str> {
        self.metadata.get("hint").and_then(Value::as_str)
    }
}

/// Exported view of one remembered message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: String,
}

pub struct QueryOrchestrator {
    handlers: HashMap<HandlerKind, Arc<dyn TaskHandler>>,
    memory: ConversationMemory,
    use_router_plan: bool,
    state: TurnState,
}

impl QueryOrchestrator {
    pub fn new(memory: ConversationMemory) -> Self {
        Self {
            handlers: HashMap::new(),
            memory,
            use_router_plan: false,
            state: TurnState::Idle,
        }
    }

    /// Register a handler under its own kind, replacing any previous one
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Let the router's plan pick the route when it parses
    pub fn with_router_plan(mut self, enabled: bool) -> Self {
        self.use_router_plan = enabled;
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut ConversationMemory {
        &mut self.memory
    }

    fn transition(&mut self, next: TurnState) {
        debug!("Turn state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn handler(&self, kind: HandlerKind) -> Result<Arc<dyn TaskHandler>, EngineError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::HandlerNotRegistered(kind.to_string()))
    }

    /// Answer one question; never fails, failures become a failed response
    pub async fn process_query(&mut self, question: &str) -> QueryResponse {
        info!(
            "Processing query: {}",
            question.chars().take(100).collect::<String>()
        );
        self.memory.add_message(Role::User, question, None);

        let outcome = AssertUnwindSafe(async {
            self.transition(TurnState::Classifying);
            let intent = self.route(question).await;
            info!("Query classified as {}", intent);
            self.transition(intent.into());

            let response = match intent {
                Intent::DataQuery => self.handle_data_query(question).await,
                Intent::Translation => self.handle_translation(question).await,
                Intent::Knowledge | Intent::General => self.handle_knowledge(question).await,
            };
            response.map(|mut r| {
                r.intent = Some(intent);
                r
            })
        })
        .catch_unwind()
        .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => Self::error_response(&e),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Self::error_response(&EngineError::Unclassified(message))
            }
        };

        self.transition(TurnState::Responding);
        self.memory.add_message(
            Role::Assistant,
            response.answer.clone(),
            Some(response.metadata.clone()),
        );
        self.transition(TurnState::Idle);
        response
    }

    fn error_response(e: &EngineError) -> QueryResponse {
        error!("Error processing query: {}", e);
        QueryResponse::failed(
            format!("I encountered an error processing your query: {}", e),
            &e.to_string(),
        )
        .with_hint(Some(e.user_hint()))
        .with_metadata("recoverable", e.is_recoverable())
    }

    /// Router plan when enabled and usable, keyword classifier otherwise
    async fn route(&self, question: &str) -> Intent {
        if self.use_router_plan {
            if let Some(intent) = self.route_with_plan(question).await {
                return intent;
            }
            debug!("Router plan unusable, falling back to keyword classifier");
        }
        classify(question)
    }

    async fn route_with_plan(&self, question: &str) -> Option<Intent> {
        let router = self.handlers.get(&HandlerKind::Router)?;
        let reply = router.execute(question, None).await;
        if !reply.is_success() {
            warn!("Router failed: {}", reply.error().unwrap_or_default());
            return None;
        }
        let plan = RoutingPlan::parse(reply.content())?;
        debug!("Routing plan: {} ({})", plan.primary_agent, plan.reasoning);
        Intent::from_handler(plan.primary()?)
    }

    async fn handle_data_query(&self, question: &str) -> Result<QueryResponse, EngineError> {
        info!("Handling data query");

        let generated = self
            .handler(HandlerKind::QueryGenerator)?
            .execute(question, None)
            .await;
        let sql_query = generated
            .metadata()
            .get("sql_query")
            .and_then(Value::as_str)
            .map(str::to_string);

        if !generated.is_success() {
            let err = generated.error().unwrap_or_default();
            let mut response = QueryResponse::failed(
                format!("I couldn't generate a valid SQL query. Error: {}", err),
                err,
            )
            .with_hint(generated.hint());
            response.sql_query = sql_query;
            return Ok(response);
        }

        let result = generated.into_data().unwrap_or_default();
        if result.is_empty() {
            let mut response = QueryResponse::answered(NO_RESULTS_ANSWER);
            response.sql_query = sql_query;
            return Ok(response);
        }

        let sql_text = sql_query.clone().unwrap_or_default();
        let mut context = TaskContext::analysis(result, sql_text.clone());
        let analysis = self
            .handler(HandlerKind::ResultAnalyst)?
            .execute(question, Some(&context))
            .await;
        let analysis_text = if analysis.is_success() {
            analysis.content()
        } else {
            warn!(
                "Analysis unavailable: {}",
                analysis.error().unwrap_or_default()
            );
            ANALYSIS_UNAVAILABLE
        };

        let result = context.result.take().unwrap_or_default();
        let answer = format!(
            "**Analysis:**\n{}\n\n**Query Details:**\n- Returned {} rows\n- SQL Query: `{}`",
            analysis_text,
            result.row_count(),
            sql_text
        );

        let mut response = QueryResponse::answered(answer)
            .with_metadata("row_count", result.row_count())
            .with_metadata("columns", result.columns.clone());
        response.sql_query = sql_query;
        response.data = Some(result);
        Ok(response)
    }

    async fn handle_translation(&self, question: &str) -> Result<QueryResponse, EngineError> {
        info!("Handling translation query");

        let target = target_language(question);
        let translated = self
            .handler(HandlerKind::Translator)?
            .execute(question, Some(&TaskContext::translation(target)))
            .await;

        Ok(Self::single_handler_response(
            translated,
            "Translation failed",
        )
        .with_metadata("target_language", target))
    }

    async fn handle_knowledge(&self, question: &str) -> Result<QueryResponse, EngineError> {
        info!("Handling knowledge query");

        let answer = self
            .handler(HandlerKind::KnowledgeLookup)?
            .execute(question, None)
            .await;
        Ok(Self::single_handler_response(
            answer,
            "Knowledge lookup failed",
        ))
    }

    fn single_handler_response(result: TaskResult, failure_prefix: &str) -> QueryResponse {
        if result.is_success() {
            let mut response = QueryResponse::answered(result.content());
            response.metadata.extend(result.metadata().clone());
            response
        } else {
            let err = result.error().unwrap_or_default();
            QueryResponse::failed(format!("{}: {}", failure_prefix, err), err)
                .with_hint(result.hint())
        }
    }

    /// Remembered messages, oldest first
    pub fn conversation_history(&self) -> Vec<HistoryEntry> {
        self.memory
            .get_messages(None)
            .into_iter()
            .map(|m| HistoryEntry {
                role: m.role,
                content: m.content,
                timestamp: m.timestamp.to_rfc3339(),
            })
            .collect()
    }

    pub fn clear_history(&mut self) {
        self.memory.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{caller, ScriptedModel};
    use crate::agents::{KnowledgeLookup, QueryGenerator, ResultAnalyst, Router, Translator};
    use crate::llm::LLMError;
    use crate::store::{SqliteBackend, TabularStore};
    use async_trait::async_trait;

    async fn store() -> Arc<TabularStore> {
        let backend = SqliteBackend::connect_in_memory().await.unwrap();
        let counts = backend
            .load_script(
                "CREATE TABLE orders (category TEXT, price REAL);
                 INSERT INTO orders VALUES ('toys', 10.0), ('books', 4.0);",
            )
            .await
            .unwrap();
        let store = TabularStore::new(Arc::new(backend), 1000, 3).unwrap();
        store.on_tables_loaded(&counts).await.unwrap();
        Arc::new(store)
    }

    /// Orchestrator where every handler shares one scripted model.
    async fn orchestrator(model: Arc<ScriptedModel>) -> QueryOrchestrator {
        let store = store().await;
        QueryOrchestrator::new(ConversationMemory::in_memory(None, 20))
            .with_handler(Arc::new(Router::new(caller(model.clone()))))
            .with_handler(Arc::new(QueryGenerator::new(caller(model.clone()), store)))
            .with_handler(Arc::new(ResultAnalyst::new(caller(model.clone()))))
            .with_handler(Arc::new(KnowledgeLookup::new(caller(model.clone()))))
            .with_handler(Arc::new(Translator::new(caller(model))))
    }

    #[tokio::test]
    async fn test_data_query_composes_answer() {
        let model = ScriptedModel::replying(&[
            "SELECT category, price FROM orders ORDER BY price DESC",
            "Toys sell best.",
        ]);
        let mut orch = orchestrator(model.clone()).await;

        let response = orch.process_query("Which category has top sales?").await;

        assert!(response.success);
        assert_eq!(response.intent, Some(Intent::DataQuery));
        assert_eq!(
            response.answer,
            "**Analysis:**\nToys sell best.\n\n**Query Details:**\n- Returned 2 rows\n- SQL Query: `SELECT category, price FROM orders ORDER BY price DESC`"
        );
        assert_eq!(response.metadata["row_count"], 2);
        assert_eq!(response.data.unwrap().row_count(), 2);
        assert_eq!(orch.state(), TurnState::Idle);
        assert_eq!(orch.memory().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_result_skips_analysis() {
        let model = ScriptedModel::replying(&["SELECT * FROM orders WHERE price > 100"]);
        let mut orch = orchestrator(model.clone()).await;

        let response = orch.process_query("orders above 100").await;

        assert!(response.success);
        assert_eq!(response.answer, NO_RESULTS_ANSWER);
        assert!(response.data.is_none());
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_analysis_failure_degrades() {
        let model = ScriptedModel::replying(&["SELECT category FROM orders"]);
        let mut orch = orchestrator(model).await;

        let response = orch.process_query("list product categories").await;

        assert!(response.success);
        assert!(response
            .answer
            .starts_with("**Analysis:**\nAnalysis not available."));
    }

    #[tokio::test]
    async fn test_rejected_query_is_failed_turn() {
        let model = ScriptedModel::replying(&["DELETE FROM orders"]);
        let mut orch = orchestrator(model).await;

        let response = orch.process_query("delete all orders").await;

        assert!(!response.success);
        assert!(response.answer.contains("dangerous"));
        assert_eq!(response.sql_query.as_deref(), Some("DELETE FROM orders"));
        assert_eq!(
            response.hint(),
            Some("Only read-only questions about the data are supported")
        );
        let history = orch.conversation_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, response.answer);
    }

    #[tokio::test]
    async fn test_translation_route() {
        let model = ScriptedModel::replying(&["'x' em português"]);
        let mut orch = orchestrator(model.clone()).await;

        let response = orch.process_query("Translate 'x' to Portuguese").await;

        assert!(response.success);
        assert_eq!(response.intent, Some(Intent::Translation));
        assert_eq!(response.metadata["target_language"], "Portuguese");
        assert!(model.prompt(0).contains("to Portuguese:"));
    }

    #[tokio::test]
    async fn test_knowledge_failure_is_recorded() {
        let model = ScriptedModel::failing(LLMError::Timeout);
        let mut orch = orchestrator(model).await;

        let response = orch.process_query("Explain churn rate").await;

        assert!(!response.success);
        assert!(response.answer.starts_with("Knowledge lookup failed:"));
        assert!(response.hint().is_some());
        assert_eq!(orch.memory().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_handler_is_error_response() {
        let mut orch = QueryOrchestrator::new(ConversationMemory::in_memory(None, 10));

        let response = orch.process_query("Hello").await;

        assert!(!response.success);
        assert!(response
            .answer
            .starts_with("I encountered an error processing your query:"));
        assert_eq!(response.hint(), Some("This kind of question is not supported"));
        assert_eq!(response.metadata["recoverable"], false);
        assert_eq!(orch.memory().len(), 2);
    }

    struct PanickingHandler;

    #[async_trait]
    impl TaskHandler for PanickingHandler {
        fn kind(&self) -> HandlerKind {
            HandlerKind::KnowledgeLookup
        }

        async fn execute(&self, _: &str, _: Option<&TaskContext>) -> TaskResult {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_turn() {
        let mut orch = QueryOrchestrator::new(ConversationMemory::in_memory(None, 10))
            .with_handler(Arc::new(PanickingHandler));

        let response = orch.process_query("Hello").await;

        assert!(!response.success);
        assert!(response.answer.contains("boom"));
        assert_eq!(
            response.hint(),
            Some("Something went wrong while answering. Please try again")
        );
        assert_eq!(orch.state(), TurnState::Idle);
        assert_eq!(orch.memory().len(), 2);
    }

    #[tokio::test]
    async fn test_router_plan_overrides_keywords() {
        let model = ScriptedModel::replying(&[
            "{\"primary_agent\": \"translator\", \"secondary_agents\": [], \"reasoning\": \"r\", \"requires_database\": false}",
            "translated",
        ]);
        let mut orch = orchestrator(model).await.with_router_plan(true);

        let response = orch.process_query("Hello there").await;

        assert_eq!(response.intent, Some(Intent::Translation));
        assert_eq!(response.answer, "translated");
    }

    #[tokio::test]
    async fn test_unparseable_plan_falls_back() {
        let model = ScriptedModel::replying(&["not json", "general answer"]);
        let mut orch = orchestrator(model).await.with_router_plan(true);

        let response = orch.process_query("Hello there").await;

        assert_eq!(response.intent, Some(Intent::General));
        assert_eq!(response.answer, "general answer");
    }
}
