//! Configuration management
//!
//! This module handles loading, validation, and management of the Tabula configuration.
//! Configuration is stored in TOML format at ~/.tabula/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **llm**: Language model provider, sampling settings and retry budget
//! - **database**: Tabular store location and result ceiling
//! - **memory**: Conversation history capacity and persistence
//! - **knowledge**: External knowledge source
//! - **orchestrator**: Routing behaviour
//!
//! Every section is optional; missing values fall back to defaults.
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Creates the data and session directories if they don't exist
//!
//! # Examples
//!
//! ```no_run
//! use tabula_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Database: {:?}", config.database.path);
//! println!("Default provider: {}", config.llm.default_provider);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable holding the Gemini API key
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Language model configuration
    #[serde(default)]
    pub llm: LLMConfig,

    /// Tabular store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Conversation memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// External knowledge configuration
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Orchestrator configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Default provider (gemini, ollama)
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Sampling temperature passed to every call
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum output tokens per call
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Attempts per model call when the provider is rate limiting
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Gemini provider settings
    #[serde(default)]
    pub gemini: GeminiConfig,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,
}

/// Gemini provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Base URL for Gemini API
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_gemini_model")]
    pub model: String,
    // Note: API key read from GEMINI_API_KEY, not stored in config
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// Tabular store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file (supports ~ expansion)
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Row ceiling applied to every query result
    #[serde(default = "default_max_query_results")]
    pub max_query_results: usize,

    /// Sample rows captured per table in the schema descriptor
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
}

/// Conversation memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of retained messages
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Persist sessions to disk after every mutation
    #[serde(default = "default_true")]
    pub enable_persistence: bool,

    /// Directory for session files (supports ~ expansion)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
}

/// External knowledge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Enable the Wikipedia knowledge source
    #[serde(default)]
    pub enabled: bool,

    /// Wikipedia base URL
    #[serde(default = "default_wikipedia_base_url")]
    pub wikipedia_base_url: String,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    /// Ask the router handler for a routing plan and follow it when it parses
    #[serde(default)]
    pub use_router_plan: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.tabula")
}

fn default_provider() -> String {
    "gemini".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_retries() -> u32 {
    3
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("~/.tabula/tabula.db")
}

fn default_max_query_results() -> usize {
    1000
}

fn default_sample_rows() -> usize {
    3
}

fn default_max_history() -> usize {
    20
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("~/.tabula/memory")
}

fn default_wikipedia_base_url() -> String {
    "https://en.wikipedia.org".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            gemini: GeminiConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: default_gemini_base_url(),
            model: default_gemini_model(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_query_results: default_max_query_results(),
            sample_rows: default_sample_rows(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            enable_persistence: true,
            storage_path: default_storage_path(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wikipedia_base_url: default_wikipedia_base_url(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.tabula/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse, validate and process configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Serialize before processing so the file keeps the portable ~ paths
        let defaults = Self::default();
        let toml_string = toml::to_string_pretty(&defaults)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = defaults;
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.tabula/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".tabula").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates value ranges
    /// - Expands ~ in paths
    /// - Creates the data directory and, when persistence is on, the session directory
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["gemini", "ollama"];
        if !valid_providers.contains(&self.llm.default_provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.llm.default_provider,
                valid_providers.join(", ")
            )));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(EngineError::Config(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if self.llm.max_tokens == 0 {
            return Err(EngineError::Config(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
        if self.database.max_query_results == 0 {
            return Err(EngineError::Config(
                "max_query_results must be greater than 0".to_string(),
            ));
        }
        if self.memory.max_history == 0 {
            return Err(EngineError::Config(
                "max_history must be greater than 0".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.database.path = expand_path(&self.database.path)?;
        self.memory.storage_path = expand_path(&self.memory.storage_path)?;

        create_dir(&self.core.data_dir)?;
        if self.memory.enable_persistence {
            create_dir(&self.memory.storage_path)?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

fn create_dir(path: &Path) -> Result<(), EngineError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            EngineError::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }
    Ok(())
}
