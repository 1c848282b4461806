//! Session data model: messages, stats, bot configuration, and the shared
//! mutable session record.
//!
//! A [`ChatSession`] owns an append-only message log plus the two memory
//! tiers layered over it: the verbatim recent tail (bounded by
//! `history_message_count`) and the rolling compressed summary
//! (`memory_summary` up to `last_summarized_index`). Sessions are handed to
//! the engine and mutated in place; persistence is the caller's concern.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::text_utils::estimate_token_length;

/// Placeholder topic until one is derived from the conversation.
pub const DEFAULT_TOPIC: &str = "New Conversation";

/// Message role within a session log.
///
/// `Memory` marks the synthetic long-term-memory message; `Url` marks
/// pinned context entries whose content was fetched from a URL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Memory,
    Url,
}

/// Mime kind of an externally-sourced content reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MimeKind {
    Html,
    Pdf,
    #[serde(rename = "text")]
    PlainText,
}

/// Provenance of content fetched for a direct-content user input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDetail {
    pub url: String,
    pub byte_size: usize,
    pub mime_kind: MimeKind,
}

/// One turn entry in the session log.
///
/// Immutable once finalized, except that `content` grows while `streaming`
/// is set, and `is_error` flips when a request fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_detail: Option<SourceDetail>,
}

impl ChatMessage {
    /// Create a message with a fresh id and timestamp.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            is_error: false,
            model: None,
            source_detail: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_source_detail(mut self, detail: SourceDetail) -> Self {
        self.source_detail = Some(detail);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Approximate token cost of this message's content.
    pub fn estimated_tokens(&self) -> usize {
        estimate_token_length(&self.content)
    }
}

/// Sum of estimated token costs over a message slice.
pub fn count_message_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(ChatMessage::estimated_tokens).sum()
}

/// Cumulative content statistics for a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatStat {
    pub token_count: usize,
    pub word_count: usize,
    pub char_count: usize,
}

impl ChatStat {
    /// Fold one finalized completion into the counters.
    pub fn record_completion(&mut self, content: &str) {
        self.char_count += content.chars().count();
        self.word_count += content.split_whitespace().count();
        self.token_count += estimate_token_length(content);
    }
}

/// Model configuration snapshot for one turn.
///
/// A turn uses the config resolved at call time, never a live reference, so
/// a mid-stream config edit cannot corrupt an in-flight request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub max_tokens: usize,
    pub history_message_count: usize,
    pub compress_message_length_threshold: usize,
    pub send_memory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub stream: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4000,
            history_message_count: 4,
            compress_message_length_threshold: 1000,
            send_memory: true,
            template: None,
            stream: true,
        }
    }
}

/// Bot configuration: pinned context prompts plus model config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotProfile {
    pub name: String,
    /// Fixed context prompts, always sent verbatim before recent history.
    pub context: Vec<ChatMessage>,
    #[serde(default)]
    pub model_config: ModelConfig,
}

impl BotProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: Vec::new(),
            model_config: ModelConfig::default(),
        }
    }

    pub fn with_context(mut self, context: Vec<ChatMessage>) -> Self {
        self.context = context;
        self
    }

    pub fn with_model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = config;
        self
    }
}

/// One conversation with its message log, memory tiers, and stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub topic: String,
    pub messages: Vec<ChatMessage>,
    pub memory_summary: String,
    /// Messages before this index are covered by `memory_summary`.
    /// Invariant: never exceeds `messages.len()` and never decreases.
    pub last_summarized_index: usize,
    /// Hard floor: messages at or before this index are excluded from
    /// windows and summarization batches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_context_index: Option<usize>,
    pub stat: ChatStat,
    pub last_update: DateTime<Utc>,
    pub bot: BotProfile,
}

impl ChatSession {
    pub fn new(bot: BotProfile) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            messages: Vec::new(),
            memory_summary: String::new(),
            last_summarized_index: 0,
            clear_context_index: None,
            stat: ChatStat::default(),
            last_update: Utc::now(),
            bot,
        }
    }

    /// Drop the log and both memory tiers, keeping the bot configuration.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.memory_summary.clear();
        self.last_summarized_index = 0;
        self.clear_context_index = None;
        self.stat = ChatStat::default();
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new(BotProfile::default())
    }
}

/// Shared mutable session record.
///
/// All mutation goes through [`SharedSession::update`], which holds the
/// write lock for the duration of the closure, so concurrent readers (UI,
/// stream callbacks, background compression) never observe a half-written
/// field.
#[derive(Debug, Clone)]
pub struct SharedSession {
    inner: Arc<RwLock<ChatSession>>,
}

impl SharedSession {
    pub fn new(session: ChatSession) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
        }
    }

    /// Apply a mutation atomically and return its result.
    pub fn update<R>(&self, f: impl FnOnce(&mut ChatSession) -> R) -> R {
        let mut guard = self.inner.write();
        let result = f(&mut guard);
        debug_assert!(guard.last_summarized_index <= guard.messages.len());
        result
    }

    /// Read under the lock without cloning the whole session.
    pub fn read<R>(&self, f: impl FnOnce(&ChatSession) -> R) -> R {
        let guard = self.inner.read();
        f(&guard)
    }

    /// Clone the current state.
    pub fn snapshot(&self) -> ChatSession {
        self.inner.read().clone()
    }

    /// Session id (stable for the session's lifetime).
    pub fn id(&self) -> String {
        self.inner.read().id.clone()
    }
}

impl From<ChatSession> for SharedSession {
    fn from(session: ChatSession) -> Self {
        Self::new(session)
    }
}
