use async_trait::async_trait;
use sdk::errors::EngineError;
use tracing::error;

use super::{HandlerKind, TaskContext, TaskHandler, TaskResult};
use crate::llm::retry::ModelCaller;
use crate::store::ResultSet;

const SYSTEM_PROMPT: &str = "You are an expert data analyst specializing in business analytics.\n\
Your job is to analyze query results and provide clear, actionable insights.\n\n\
Guidelines:\n\
1. Identify key trends and patterns\n\
2. Provide statistical summaries\n\
3. Compare metrics across different dimensions\n\
4. Highlight anomalies or interesting findings\n\
5. Suggest follow-up questions or analyses\n\
6. Use clear, non-technical language for business users\n\n\
Be concise but thorough in your analysis.";

/// Rows shown to the model
const SAMPLE_ROWS: usize = 10;

/// Writes a narrative analysis of a result set
pub struct ResultAnalyst {
    model: ModelCaller,
}

impl ResultAnalyst {
    pub fn new(model: ModelCaller) -> Self {
        Self { model }
    }
}

fn render_summary(result: &ResultSet) -> String {
    let summary = result.numeric_summary();
    if summary.is_empty() {
        return "No numeric data".to_string();
    }
    summary
        .iter()
        .map(|s| {
            let std = s
                .std
                .map(|v| format!("{:.4}", v))
                .unwrap_or_else(|| "n/a".to_string());
            format!(
                "{}: count={} mean={:.4} std={} min={} max={}",
                s.column, s.count, s.mean, std, s.min, s.max
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_prompt(question: &str, sql: &str, result: &ResultSet) -> String {
    let (rows, columns) = result.shape();
    format!(
        "{system}\n\n\
         Query: {question}\n\
         SQL Query: {sql}\n\n\
         Data Shape: {rows} rows, {columns} columns\n\
         Columns: {names}\n\n\
         Sample Data:\n{sample}\n\n\
         Statistical Summary:\n{summary}\n\n\
         Provide your analysis and insights:",
        system = SYSTEM_PROMPT,
        names = result.columns.join(", "),
        sample = result.render_table(SAMPLE_ROWS),
        summary = render_summary(result),
    )
}

#[async_trait]
impl TaskHandler for ResultAnalyst {
    fn kind(&self) -> HandlerKind {
        HandlerKind::ResultAnalyst
    }

    async fn execute(&self, query: &str, context: Option<&TaskContext>) -> TaskResult {
        let Some(result) = context
            .and_then(|c| c.result.as_ref())
            .filter(|r| !r.is_empty())
        else {
            return TaskResult::from_error(self.kind(), &EngineError::NoData);
        };
        let sql = context
            .and_then(|c| c.sql_query.as_deref())
            .unwrap_or_default();

        match self.model.call(&build_prompt(query, sql, result)).await {
            Ok(analysis) => {
                let (rows, columns) = result.shape();
                TaskResult::success(self.kind(), analysis)
                    .with_metadata("data_shape", vec![rows, columns])
                    .with_metadata("columns", result.columns.clone())
            }
            Err(e) => {
                error!("Result analyst error: {}", e);
                TaskResult::from_error(self.kind(), &e)
            }
        }
    }
}
