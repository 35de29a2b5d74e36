//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - ask / chat: Answer questions through the orchestrator
//! - load: Load CSV data or a seed script into the tabular store
//! - schema: Show the schema snapshot or one table's statistics
//! - sessions / history / clear: Inspect and reset conversation sessions

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::app::{self, AppContext};
use crate::config::Config;
use crate::memory::ConversationMemory;
use crate::orchestrator::QueryResponse;

/// Rows printed under a text answer
const PREVIEW_ROWS: usize = 20;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn print_response(response: &QueryResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("{}", response.answer);
            if !response.success {
                if let Some(hint) = response.hint() {
                    println!("Hint: {}", hint);
                }
            }
            if let Some(data) = &response.data {
                println!();
                println!("Results ({} rows):", data.row_count());
                println!("{}", data.render_table(PREVIEW_ROWS));
                if data.row_count() > PREVIEW_ROWS {
                    println!("... {} more rows", data.row_count() - PREVIEW_ROWS);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
    }
    Ok(())
}

/// Answer one question
pub async fn handle_ask(
    question: String,
    session: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let mut app = AppContext::initialize(config, session).await?;

    let response = app.process_query(&question).await;
    print_response(&response, format)?;
    app.shutdown().await?;

    if !response.success {
        let error = response
            .metadata
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("query failed");
        bail!("{}", error);
    }
    Ok(())
}

/// Read questions from stdin until EOF or `exit`
pub async fn handle_chat(
    session: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let mut app = AppContext::initialize(config, session).await?;
    let session_id = app.orchestrator().memory().session_id().to_string();

    if let OutputFormat::Text = format {
        println!("Tabula chat (session {}). Type 'exit' to quit.", session_id);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if let OutputFormat::Text = format {
            print!("> ");
            std::io::stdout().flush()?;
        }

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        let response = app.process_query(question).await;
        print_response(&response, format)?;
        if let OutputFormat::Text = format {
            println!();
        }
    }

    app.shutdown().await
}

/// Load CSV data or a seed script and report the loaded tables
pub async fn handle_load(source: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    let (backend, store) = app::open_store(config).await?;
    let loaded = app::load_seed(&backend, &store, source)
        .await
        .with_context(|| format!("Failed to load {}", source.display()))?;
    backend.flush_wal().await?;

    match format {
        OutputFormat::Text => {
            println!("Loaded {} table(s):", loaded.len());
            for (table, rows) in &loaded {
                println!("  {}: {} rows", table, rows);
            }
        }
        OutputFormat::Json => {
            let output = json!({ "tables": loaded });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show the schema snapshot, or statistics for one table
pub async fn handle_schema(table: Option<String>, config: &Config, format: OutputFormat) -> Result<()> {
    let (_backend, store) = app::open_store(config).await?;

    match table {
        Some(name) => {
            let Some(stats) = store.table_stats(&name).await else {
                bail!("Unknown table '{}'", name);
            };
            match format {
                OutputFormat::Text => {
                    println!("Table: {}", stats.table_name);
                    println!("  Rows:    {}", stats.row_count);
                    println!("  Columns: {}", stats.column_count);
                    for col in &stats.columns {
                        let nullable = if col.nullable { "NULL" } else { "NOT NULL" };
                        println!("    - {} ({}) {}", col.name, col.data_type, nullable);
                    }
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
            }
        }
        None => {
            let schema = store.describe_schema().await;
            match format {
                OutputFormat::Text => {
                    if schema.is_empty() {
                        println!("No tables loaded. Use 'tabula load <path>' first.");
                    } else {
                        println!("{}", schema.describe());
                    }
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&schema)?);
                }
            }
        }
    }
    Ok(())
}

/// List stored sessions
pub async fn handle_sessions(config: &Config, format: OutputFormat) -> Result<()> {
    let sessions = ConversationMemory::list_sessions(&config.memory.storage_path);

    match format {
        OutputFormat::Text => {
            if sessions.is_empty() {
                println!("No stored sessions");
            } else {
                println!("Sessions ({}):", sessions.len());
                for id in &sessions {
                    println!("  {}", id);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({ "sessions": sessions, "count": sessions.len() });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show the latest messages of a session
pub async fn handle_history(
    session: String,
    limit: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let memory = ConversationMemory::new(Some(session.clone()), &config.memory)?;
    let messages = memory.get_messages(Some(limit));

    match format {
        OutputFormat::Text => {
            if messages.is_empty() {
                println!("No messages in session {}", session);
                return Ok(());
            }

            println!("{}", memory.summary());
            println!();
            for message in &messages {
                println!(
                    "[{}] {}:",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.role
                );
                println!("{}", message.content);
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "session_id": session,
                "message_count": memory.message_count(),
                "messages": messages,
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Clear a session's messages
pub async fn handle_clear(session: String, config: &Config, format: OutputFormat) -> Result<()> {
    let mut memory = ConversationMemory::new(Some(session.clone()), &config.memory)?;
    let removed = memory.len();
    memory.clear();

    match format {
        OutputFormat::Text => println!("Cleared {} message(s) from session {}", removed, session),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "session_id": session, "cleared": removed }))?
        ),
    }
    Ok(())
}
