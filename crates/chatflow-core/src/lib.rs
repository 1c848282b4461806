//! ChatFlow Core - conversational-context engine
//!
//! This crate provides:
//! - Context window assembly over an append-only message log under a token
//!   budget, with two memory tiers (verbatim recent tail + rolling summary)
//! - Streaming request lifecycle (start, incremental update, completion,
//!   error, cancellation) with a process-wide controller pool
//! - Background memory compression and one-shot topic derivation
//! - OpenAI-compatible streaming completion client
//!
//! Rendering, persistence, and session selection are the embedder's
//! concern: sessions are handed in as [`SharedSession`] records and
//! mutated in place, and visible-state changes are published on a typed
//! event channel.

pub mod chat;
pub mod context;
pub mod controller;
pub mod error;
pub mod fetch;
mod http_client;
pub mod llm;
pub mod memory;
pub mod session;
pub mod text_utils;

// Re-export commonly used types
pub use chat::{ChatEngine, SessionEvent};
pub use controller::{ControllerPool, RequestHandle, RequestPhase};
pub use error::{ChatError, Result};
pub use fetch::{FetchedResource, HttpResourceFetcher, ResourceFetcher};
pub use llm::{
    CompletionRequest, CompletionResponse, LlmClient, LlmRetryConfig, MockLlmClient, MockStep,
    OpenAIClient, StreamChunk, StreamResult,
};
pub use session::{
    BotProfile, ChatMessage, ChatSession, ChatStat, DEFAULT_TOPIC, MimeKind, ModelConfig, Role,
    SharedSession, SourceDetail,
};
pub use text_utils::estimate_token_length;
