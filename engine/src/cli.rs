//! CLI interface for Tabula
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tabula query engine
///
/// Ask natural-language questions about your tabular data and get generated
/// SQL, the result rows and a narrative analysis back.
#[derive(Parser, Debug)]
#[command(name = "tabula")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ask a single question
    Ask {
        /// The question to answer
        question: String,

        /// Continue an existing conversation session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Interactive question/answer loop
    Chat {
        /// Continue an existing conversation session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Load tables from a CSV file, a directory of CSV files, or a SQL seed script
    Load {
        /// Path to the data
        source: PathBuf,
    },

    /// Show the database schema, or statistics for one table
    Schema {
        /// Table name
        table: Option<String>,
    },

    /// List stored conversation sessions
    Sessions,

    /// Show the messages of a session
    History {
        /// Session ID
        session: String,

        /// Number of messages to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Clear the messages of a session
    Clear {
        /// Session ID
        session: String,
    },
}
