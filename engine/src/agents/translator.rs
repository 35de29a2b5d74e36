use async_trait::async_trait;
use tracing::error;

use super::{HandlerKind, TaskContext, TaskHandler, TaskResult};
use crate::llm::retry::ModelCaller;

pub const DEFAULT_TARGET_LANGUAGE: &str = "English";

const SYSTEM_PROMPT: &str = "You are a professional translator specializing in business terminology.\n\
Your job is to accurately translate text while preserving meaning and context.\n\n\
Guidelines:\n\
1. Maintain professional tone\n\
2. Preserve technical terms when appropriate\n\
3. Adapt cultural references appropriately\n\
4. Indicate the source and target languages\n\
5. Handle product names and brands carefully\n\n\
Provide accurate, natural-sounding translations.";

pub struct Translator {
    model: ModelCaller,
}

impl Translator {
    pub fn new(model: ModelCaller) -> Self {
        Self { model }
    }
}

#[async_trait]
impl TaskHandler for Translator {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Translator
    }

    async fn execute(&self, query: &str, context: Option<&TaskContext>) -> TaskResult {
        let target = context
            .and_then(|c| c.target_language.as_deref())
            .unwrap_or(DEFAULT_TARGET_LANGUAGE);
        let text = context.and_then(|c| c.text.as_deref()).unwrap_or(query);

        let prompt = format!(
            "{}\n\nTranslate the following text to {}:\n\n{}\n\nTranslation:",
            SYSTEM_PROMPT, target, text
        );

        match self.model.call(&prompt).await {
            Ok(translation) => TaskResult::success(self.kind(), translation)
                .with_metadata("target_language", target),
            Err(e) => {
                error!("Translator error: {}", e);
                TaskResult::from_error(self.kind(), &e)
            }
        }
    }
}
