use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, warn};

use super::{HandlerKind, TaskContext, TaskHandler, TaskResult};
use crate::llm::extract_json_object;
use crate::llm::retry::ModelCaller;

/// Handlers the router may choose between
const ROUTABLE: [HandlerKind; 4] = [
    HandlerKind::QueryGenerator,
    HandlerKind::ResultAnalyst,
    HandlerKind::KnowledgeLookup,
    HandlerKind::Translator,
];

/// Routing decision returned by the router model
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoutingPlan {
    pub primary_agent: String,
    #[serde(default)]
    pub secondary_agents: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub requires_database: bool,
}

impl RoutingPlan {
    /// Parse the first JSON object in a router reply
    pub fn parse(reply: &str) -> Option<Self> {
        let json = extract_json_object(reply)?;
        match serde_json::from_str(json) {
            Ok(plan) => Some(plan),
            Err(e) => {
                warn!("Failed to parse routing plan: {}", e);
                None
            }
        }
    }

    pub fn primary(&self) -> Option<HandlerKind> {
        HandlerKind::from_identity(&self.primary_agent)
    }

    /// Secondary handlers the model named, unknown identities dropped
    pub fn secondaries(&self) -> Vec<HandlerKind> {
        self.secondary_agents
            .iter()
            .filter_map(|s| HandlerKind::from_identity(s))
            .collect()
    }
}

fn system_prompt() -> String {
    let mut prompt = String::from(
        "You are an intelligent router for a business analytics system.\n\
         Your job is to understand user queries and determine which specialized handlers should answer them.\n\n\
         Available handlers:\n",
    );
    for (i, kind) in ROUTABLE.iter().enumerate() {
        prompt.push_str(&format!("{}. {} - {}\n", i + 1, kind, kind.description()));
    }
    prompt.push_str(
        "\nAnalyze the user query and respond in JSON format:\n\
         {\n    \"primary_agent\": \"handler_name\",\n    \"secondary_agents\": [\"handler1\", \"handler2\"],\n    \
         \"reasoning\": \"why these handlers were chosen\",\n    \"requires_database\": true/false\n}",
    );
    prompt
}

/// Asks the model for a JSON routing plan
pub struct Router {
    model: ModelCaller,
}

impl Router {
    pub fn new(model: ModelCaller) -> Self {
        Self { model }
    }
}

#[async_trait]
impl TaskHandler for Router {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Router
    }

    async fn execute(&self, query: &str, _context: Option<&TaskContext>) -> TaskResult {
        let prompt = format!("{}\n\nUser Query: {}", system_prompt(), query);

        match self.model.call(&prompt).await {
            Ok(reply) => TaskResult::success(self.kind(), reply).with_metadata("query", query),
            Err(e) => {
                error!("Router error: {}", e);
                TaskResult::from_error(self.kind(), &e)
            }
        }
    }
}
