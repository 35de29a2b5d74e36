//! Task handlers
//!
//! Each handler wraps one language-model call with a fixed role instruction.
//! The orchestrator holds them behind the `TaskHandler` trait and dispatches
//! by `HandlerKind`; handlers never return errors, they report failure through
//! `TaskResult`.

use async_trait::async_trait;
use sdk::errors::{EngineError, TabulaErrorExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::memory::Metadata;
use crate::store::ResultSet;

pub mod knowledge;
pub mod query_generator;
pub mod result_analyst;
pub mod router;
pub mod translator;

pub use knowledge::KnowledgeLookup;
pub use query_generator::QueryGenerator;
pub use result_analyst::ResultAnalyst;
pub use router::{Router, RoutingPlan};
pub use translator::Translator;

/// Identity of a task handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Router,
    QueryGenerator,
    ResultAnalyst,
    KnowledgeLookup,
    Translator,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 5] = [
        HandlerKind::Router,
        HandlerKind::QueryGenerator,
        HandlerKind::ResultAnalyst,
        HandlerKind::KnowledgeLookup,
        HandlerKind::Translator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Router => "router",
            HandlerKind::QueryGenerator => "query_generator",
            HandlerKind::ResultAnalyst => "result_analyst",
            HandlerKind::KnowledgeLookup => "knowledge_lookup",
            HandlerKind::Translator => "translator",
        }
    }

    /// One-line role description used in the routing prompt
    pub fn description(&self) -> &'static str {
        match self {
            HandlerKind::Router => "Decides which handlers should answer a question",
            HandlerKind::QueryGenerator => "Generates and executes SQL queries on the database",
            HandlerKind::ResultAnalyst => {
                "Performs statistical analysis and insights on query results"
            }
            HandlerKind::KnowledgeLookup => {
                "Provides external knowledge about products, markets, trends"
            }
            HandlerKind::Translator => "Translates text between languages",
        }
    }

    /// Parse a handler identity as a model might spell it
    pub fn from_identity(identity: &str) -> Option<Self> {
        let normalized = identity.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "router" | "orchestrator" => Some(HandlerKind::Router),
            "query_generator" | "sql_analyst" | "sql" => Some(HandlerKind::QueryGenerator),
            "result_analyst" | "data_analyst" => Some(HandlerKind::ResultAnalyst),
            "knowledge_lookup" | "knowledge_expert" | "knowledge" => {
                Some(HandlerKind::KnowledgeLookup)
            }
            "translator" | "translation" => Some(HandlerKind::Translator),
            _ => None,
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-call inputs
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub target_language: Option<String>,
    pub text: Option<String>,
    pub result: Option<ResultSet>,
    pub sql_query: Option<String>,
}

impl TaskContext {
    pub fn translation(target_language: impl Into<String>) -> Self {
        Self {
            target_language: Some(target_language.into()),
            ..Default::default()
        }
    }

    pub fn analysis(result: ResultSet, sql_query: impl Into<String>) -> Self {
        Self {
            result: Some(result),
            sql_query: Some(sql_query.into()),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// Outcome of one handler invocation
///
/// A failed result always has empty content and a non-empty error.
#[derive(Debug, Clone)]
pub struct TaskResult {
    handler: HandlerKind,
    content: String,
    metadata: Metadata,
    success: bool,
    error: Option<String>,
    data: Option<ResultSet>,
}

impl TaskResult {
    pub fn success(handler: HandlerKind, content: impl Into<String>) -> Self {
        Self {
            handler,
            content: content.into(),
            metadata: Metadata::new(),
            success: true,
            error: None,
            data: None,
        }
    }

    pub fn failure(handler: HandlerKind, error: impl fmt::Display) -> Self {
        let mut error = error.to_string();
        if error.trim().is_empty() {
            error = format!("{} failed", handler);
        }
        Self {
            handler,
            content: String::new(),
            metadata: Metadata::new(),
            success: false,
            error: Some(error),
            data: None,
        }
    }

    /// Failure carrying the error's user hint as `hint` metadata
    pub fn from_error(handler: HandlerKind, error: &EngineError) -> Self {
        Self::failure(handler, error).with_metadata("hint", error.user_hint())
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn hint(&self) -> Option<&str> {
        self.metadata.get("hint").and_then(Value::as_str)
    }

    pub fn with_data(mut self, data: ResultSet) -> Self {
        self.data = Some(data);
        self
    }

    pub fn handler(&self) -> HandlerKind {
        self.handler
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn data(&self) -> Option<&ResultSet> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<ResultSet> {
        self.data
    }
}

/// One specialised step of a turn
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    async fn execute(&self, query: &str, context: Option<&TaskContext>) -> TaskResult;
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::llm::retry::{ModelCaller, Sleeper};
    use crate::llm::{LLMError, LanguageModel};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Model stub replaying scripted replies and recording every prompt.
    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LLMError>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn replying(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub fn failing(error: LLMError) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::from(vec![Err(error)])),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub fn prompt(&self, idx: usize) -> String {
            self.prompts.lock().unwrap()[idx].clone()
        }

        pub fn call_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str, _: f32, _: u32) -> Result<String, LLMError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LLMError::Unknown("no scripted reply".into())))
        }
    }

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _: Duration) {}
    }

    pub fn caller(model: Arc<ScriptedModel>) -> ModelCaller {
        ModelCaller::new(model, 0.1, 256).with_sleeper(Arc::new(NoSleep))
    }
}
