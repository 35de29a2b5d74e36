use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use super::{HandlerKind, TaskContext, TaskHandler, TaskResult};
use crate::knowledge::KnowledgeSource;
use crate::llm::retry::ModelCaller;

const SYSTEM_PROMPT: &str = "You are a knowledge expert in e-commerce, retail, and business analytics.\n\
Your job is to provide additional context, industry insights, and external knowledge.\n\n\
Guidelines:\n\
1. Provide relevant industry benchmarks and standards\n\
2. Explain e-commerce metrics and KPIs\n\
3. Offer business context and interpretation\n\
4. Suggest best practices\n\
5. Provide definitions of technical terms\n\
6. Share market trends and insights\n\n\
Be informative and educational in your responses.";

/// Answers domain questions, optionally grounded by an external source
pub struct KnowledgeLookup {
    model: ModelCaller,
    source: Option<Arc<dyn KnowledgeSource>>,
}

impl KnowledgeLookup {
    pub fn new(model: ModelCaller) -> Self {
        Self {
            model,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn KnowledgeSource>) -> Self {
        self.source = Some(source);
        self
    }
}

#[async_trait]
impl TaskHandler for KnowledgeLookup {
    fn kind(&self) -> HandlerKind {
        HandlerKind::KnowledgeLookup
    }

    async fn execute(&self, query: &str, _context: Option<&TaskContext>) -> TaskResult {
        let mut reference = None;
        if let Some(source) = &self.source {
            if let Some(text) = source.lookup(query).await {
                info!("Using {} reference material", source.name());
                reference = Some((source.name().to_string(), text));
            }
        }

        let mut prompt = format!("{}\n\nUser Query: {}\n\n", SYSTEM_PROMPT, query);
        if let Some((name, text)) = &reference {
            prompt.push_str(&format!("Reference material ({}):\n{}\n\n", name, text));
        }
        prompt.push_str("Provide relevant knowledge and context:");

        match self.model.call(&prompt).await {
            Ok(answer) => {
                let result = TaskResult::success(self.kind(), answer);
                match reference {
                    Some((name, _)) => result.with_metadata("source", name),
                    None => result,
                }
            }
            Err(e) => {
                error!("Knowledge lookup error: {}", e);
                TaskResult::from_error(self.kind(), &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{caller, ScriptedModel};
    use crate::llm::LLMError;

    struct FixedSource(Option<&'static str>);

    #[async_trait]
    impl KnowledgeSource for FixedSource {
        fn name(&self) -> &str {
            "Fixed"
        }

        async fn lookup(&self, _query: &str) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    #[tokio::test]
    async fn test_reference_material_included() {
        let model = ScriptedModel::replying(&["NPS measures loyalty."]);
        let handler = KnowledgeLookup::new(caller(model.clone()))
            .with_source(Arc::new(FixedSource(Some("NPS is a metric."))));

        let result = handler.execute("What is NPS?", None).await;

        assert!(result.is_success());
        assert_eq!(result.metadata()["source"], "Fixed");
        assert!(model
            .prompt(0)
            .contains("Reference material (Fixed):\nNPS is a metric."));
    }

    #[tokio::test]
    async fn test_absent_reference_is_not_an_error() {
        let model = ScriptedModel::replying(&["answer"]);
        let handler =
            KnowledgeLookup::new(caller(model.clone())).with_source(Arc::new(FixedSource(None)));

        let result = handler.execute("Explain churn", None).await;

        assert!(result.is_success());
        assert!(!result.metadata().contains_key("source"));
        assert!(!model.prompt(0).contains("Reference material"));
    }

    #[tokio::test]
    async fn test_model_failure() {
        let model = ScriptedModel::failing(LLMError::AuthenticationFailed("bad key".into()));
        let result = KnowledgeLookup::new(caller(model)).execute("q", None).await;
        assert!(!result.is_success());
        assert!(result.error().unwrap().contains("bad key"));
    }
}
