use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use super::{HandlerKind, TaskContext, TaskHandler, TaskResult};
use crate::llm::retry::ModelCaller;
use crate::llm::strip_code_fences;
use crate::store::TabularStore;

const SYSTEM_PROMPT: &str = "You are an expert SQL analyst specializing in business data analysis.\n\
Your job is to generate accurate, efficient SQL queries for SQLite based on user questions.\n\n\
Guidelines:\n\
1. Use proper JOIN operations when combining tables\n\
2. Include appropriate WHERE clauses for filtering\n\
3. Use aggregate functions (COUNT, SUM, AVG) for analytics\n\
4. Format dates properly\n\
5. Limit results to reasonable sizes\n\
6. Only use SELECT statements - never modify data\n\n\
Return ONLY the SQL query without any explanation or markdown formatting.";

/// Turns a question into SQL and runs it through the store guard
pub struct QueryGenerator {
    model: ModelCaller,
    store: Arc<TabularStore>,
}

impl QueryGenerator {
    pub fn new(model: ModelCaller, store: Arc<TabularStore>) -> Self {
        Self { model, store }
    }

    fn build_prompt(schema: &str, question: &str) -> String {
        format!(
            "{}\n\nDatabase Schema:\n{}\n\nUser Question: {}\n\nGenerate the SQL query:",
            SYSTEM_PROMPT, schema, question
        )
    }
}

#[async_trait]
impl TaskHandler for QueryGenerator {
    fn kind(&self) -> HandlerKind {
        HandlerKind::QueryGenerator
    }

    async fn execute(&self, query: &str, _context: Option<&TaskContext>) -> TaskResult {
        let schema = self.store.schema_description().await;
        let prompt = Self::build_prompt(&schema, query);

        let reply = match self.model.call(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Query generator error: {}", e);
                return TaskResult::from_error(self.kind(), &e);
            }
        };

        let sql = strip_code_fences(&reply);
        info!("Generated SQL: {}", sql);

        match self.store.execute(&sql).await {
            Ok(result) => {
                let (rows, columns) = result.shape();
                TaskResult::success(self.kind(), sql.clone())
                    .with_metadata("sql_query", sql)
                    .with_metadata("row_count", rows)
                    .with_metadata("column_count", columns)
                    .with_data(result)
            }
            Err(e) => TaskResult::from_error(self.kind(), &e).with_metadata("sql_query", sql),
        }
    }
}
