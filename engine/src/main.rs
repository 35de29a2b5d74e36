// Tabula query engine
// Main entry point for the tabula binary

use clap::Parser;
use tabula_engine::cli::{Cli, Command};
use tabula_engine::config::Config;
use tabula_engine::handlers::{
    handle_ask, handle_chat, handle_clear, handle_history, handle_load, handle_schema,
    handle_sessions, OutputFormat,
};
use tabula_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::info!("Tabula v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Ask { question, session } => handle_ask(question, session, &config, format).await,
        Command::Chat { session } => handle_chat(session, &config, format).await,
        Command::Load { source } => handle_load(&source, &config, format).await,
        Command::Schema { table } => handle_schema(table, &config, format).await,
        Command::Sessions => handle_sessions(&config, format).await,
        Command::History { session, limit } => {
            handle_history(session, limit, &config, format).await
        }
        Command::Clear { session } => handle_clear(session, &config, format).await,
    }
}
