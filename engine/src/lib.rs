//! Tabula Engine Library
//!
//! Natural-language questions over tabular data: a guarded SQL store,
//! conversation memory, five task handlers and the orchestrator that
//! routes between them. Used by both the `tabula` binary and the
//! integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// LLM provider abstraction layer
pub mod llm;

/// Guarded tabular store
pub mod store;

/// Conversation memory with optional on-disk sessions
pub mod memory;

/// External reference lookups
pub mod knowledge;

/// Task handlers (router, query generator, analyst, knowledge, translator)
pub mod agents;

/// Query orchestration
pub mod orchestrator;

/// Explicit application wiring
pub mod app;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
