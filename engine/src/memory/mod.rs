//! Conversation memory
//!
//! A bounded, time-ordered message log for one session. The oldest message
//! is evicted when a new one would exceed `max_history`. When persistence is
//! enabled the whole session is rewritten to `session_<id>.json` after every
//! mutation and replayed from that file on construction.

use chrono::{DateTime, Local, Utc};
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;

/// Free-form per-message metadata
pub type Metadata = serde_json::Map<String, Value>;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One immutable entry in the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// Role/content pair handed to a model as chat context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Messages added since creation or the last clear, evicted ones included
    #[serde(default)]
    pub message_count: u64,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            message_count: 0,
        }
    }
}

/// On-disk session layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub session_id: String,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

/// Default session id, derived from the local start time
pub fn new_session_id() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Check that a session id names a single file inside the storage directory
///
/// # Errors
///
/// Returns `EngineError::Persistence` for empty ids and ids containing a
/// path separator, `..` or a NUL byte.
pub fn validate_session_id(session_id: &str) -> Result<(), EngineError> {
    let invalid = session_id.trim().is_empty()
        || session_id.contains(['/', '\\', '\0'])
        || session_id.contains("..");
    if invalid {
        return Err(EngineError::Persistence(format!(
            "Invalid session id '{}': use letters, digits, '-' or '_'",
            session_id.escape_default()
        )));
    }
    Ok(())
}

/// Bounded conversation log for one session
pub struct ConversationMemory {
    session_id: String,
    max_history: usize,
    /// `None` disables persistence
    storage_dir: Option<PathBuf>,
    messages: VecDeque<ConversationMessage>,
    metadata: SessionMetadata,
}

impl ConversationMemory {
    /// Build from config, replaying the session file when persistence is on
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Persistence` when the session id is not a plain
    /// file name (see [`validate_session_id`]).
    pub fn new(session_id: Option<String>, config: &MemoryConfig) -> Result<Self, EngineError> {
        let storage_dir = config
            .enable_persistence
            .then(|| config.storage_path.clone());
        Self::with_storage(session_id, config.max_history, storage_dir)
    }

    /// Memory that never touches the disk
    pub fn in_memory(session_id: Option<String>, max_history: usize) -> Self {
        Self::build(session_id.unwrap_or_else(new_session_id), max_history, None)
    }

    pub fn with_storage(
        session_id: Option<String>,
        max_history: usize,
        storage_dir: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        let session_id = session_id.unwrap_or_else(new_session_id);
        validate_session_id(&session_id)?;

        let mut memory = Self::build(session_id, max_history, storage_dir);
        if memory.storage_dir.is_some() {
            memory.load();
        }
        Ok(memory)
    }

    fn build(session_id: String, max_history: usize, storage_dir: Option<PathBuf>) -> Self {
        Self {
            session_id,
            max_history: max_history.max(1),
            storage_dir,
            messages: VecDeque::with_capacity(max_history.max(1)),
            metadata: SessionMetadata::default(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn message_count(&self) -> u64 {
        self.metadata.message_count
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message, evicting the oldest one at capacity
    pub fn add_message(&mut self, role: Role, content: impl Into<String>, metadata: Option<Metadata>) {
        self.push(ConversationMessage::new(
            role,
            content,
            metadata.unwrap_or_default(),
        ));
        self.metadata.message_count += 1;

        info!(
            "Added {} message to conversation (total: {})",
            role,
            self.messages.len()
        );
        self.save();
    }

    fn push(&mut self, message: ConversationMessage) {
        while self.messages.len() >= self.max_history {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Messages oldest-first; `Some(n)` keeps only the latest `n`
    pub fn get_messages(&self, limit: Option<usize>) -> Vec<ConversationMessage> {
        let skip = match limit {
            Some(n) if n > 0 => self.messages.len().saturating_sub(n),
            _ => 0,
        };
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Chat-style context, optionally led by a system prompt
    pub fn get_context_for_model(&self, system_prompt: Option<&str>) -> Vec<ContextMessage> {
        let mut context = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = system_prompt {
            context.push(ContextMessage {
                role: Role::System,
                content: prompt.to_string(),
            });
        }
        context.extend(self.messages.iter().map(|m| ContextMessage {
            role: m.role,
            content: m.content.clone(),
        }));
        context
    }

    pub fn summary(&self) -> String {
        if self.messages.is_empty() {
            return "No conversation history".to_string();
        }
        [
            format!("Conversation Session: {}", self.session_id),
            format!("Total Messages: {}", self.messages.len()),
            format!("Started: {}", self.metadata.created_at.to_rfc3339()),
        ]
        .join("\n")
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.metadata.message_count = 0;
        info!("Conversation history cleared");
        self.save();
    }

    /// Path of this session's file, `None` when persistence is off
    pub fn session_path(&self) -> Option<PathBuf> {
        self.storage_dir
            .as_ref()
            .map(|dir| session_file_path(dir, &self.session_id))
    }

    /// Write the session file; failures are logged, not propagated
    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            error!("Error saving session: {}", e);
        }
    }

    fn try_save(&self) -> Result<(), EngineError> {
        let Some(path) = self.session_path() else {
            return Ok(());
        };

        let file = SessionFile {
            session_id: self.session_id.clone(),
            metadata: self.metadata.clone(),
            messages: self.messages.iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, json)?;

        debug!("Session saved: {}", path.display());
        Ok(())
    }

    fn load(&mut self) {
        let Some(path) = self.session_path() else {
            return;
        };
        if !path.exists() {
            return;
        }

        match read_session_file(&path) {
            Ok(file) => {
                self.metadata = file.metadata;
                for message in file.messages {
                    self.push(message);
                }
                info!("Session loaded: {} messages", self.messages.len());
            }
            Err(e) => warn!("Could not load session: {}", e),
        }
    }

    /// Ids of every session stored in `storage_dir`, sorted
    pub fn list_sessions(storage_dir: &Path) -> Vec<String> {
        let entries = match std::fs::read_dir(storage_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if storage_dir.exists() {
                    error!("Error listing sessions: {}", e);
                }
                return Vec::new();
            }
        };

        let mut sessions: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_prefix("session_")
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();
        sessions.sort();
        sessions
    }
}

fn session_file_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("session_{}.json", session_id))
}

fn read_session_file(path: &Path) -> Result<SessionFile, EngineError> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| EngineError::Persistence(e.to_string()))
}
