//! Error types and handling
//!
//! This module provides the error types used throughout the Tabula engine.
//! All errors implement the `TabulaErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Error messages never carry API keys or the raw text of model prompts.
//! Generated queries are included where the user needs them to understand a
//! rejection.

use thiserror::Error;

/// Trait for Tabula error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait TabulaErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around by rephrasing the
    /// question. Non-recoverable errors end the current turn.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Model**: rate limiting and provider availability
/// - **Query**: read-only policy rejections and execution failures
/// - **Analysis**: missing input data
/// - **Orchestration**: internal failures caught at the top of a turn
/// - **Infrastructure**: configuration, database, persistence, IO
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, TabulaErrorExt};
///
/// let error = EngineError::QueryRejected {
///     keyword: "DROP".to_string(),
///     query: "DROP TABLE orders".to_string(),
/// };
/// assert!(error.to_string().contains("dangerous"));
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::ModelUnavailable("no provider".to_string());
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Model errors
    #[error("API rate limit exceeded. Please wait a moment and try again.")]
    RateLimited,

    #[error("Failed to get response from AI model: {0}")]
    ModelUnavailable(String),

    #[error("Model call failed: {0}")]
    ModelCall(String),

    // Query errors
    #[error("Query contains potentially dangerous keyword: {keyword}")]
    QueryRejected { keyword: String, query: String },

    #[error("Query execution error: {0}")]
    QueryFailed(String),

    // Analysis errors
    #[error("No data provided")]
    NoData,

    // Orchestration errors
    #[error("Unclassified orchestration error: {0}")]
    Unclassified(String),

    #[error("Handler not registered: {0}")]
    HandlerNotRegistered(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Session persistence errors
    #[error("Session persistence error: {0}")]
    Persistence(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The generated query attached to the error, if any.
    pub fn query(&self) -> Option<&str> {
        match self {
            Self::QueryRejected { query, .. } => Some(query),
            _ => None,
        }
    }
}

impl TabulaErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Model errors
            Self::RateLimited => "The AI service is busy. Wait a few seconds and try again",
            Self::ModelUnavailable(_) => "The AI model is unavailable. Check your API key and network",
            Self::ModelCall(_) => "The AI model rejected the request. Try rephrasing the question",

            // Query errors
            Self::QueryRejected { .. } => "Only read-only questions about the data are supported",
            Self::QueryFailed(_) => "The generated query could not run. Try rephrasing the question",

            // Analysis errors
            Self::NoData => "There is no data to analyze for this question",

            // Orchestration errors
            Self::Unclassified(_) => "Something went wrong while answering. Please try again",
            Self::HandlerNotRegistered(_) => "This kind of question is not supported",

            // Infrastructure errors
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Database operation failed. Check the database path",
            Self::Persistence(_) => "Conversation history could not be saved or loaded",
            Self::Network(_) => "Network operation failed. Check your connection",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::ModelUnavailable(_)
            | Self::HandlerNotRegistered(_)
            | Self::Config(_)
            | Self::Database(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
