//! Background memory compression.
//!
//! After each successful turn the orchestrator spawns
//! [`compress_session`], which runs two independent jobs concurrently:
//! topic derivation (one-shot, only while the placeholder topic stands)
//! and summarization of history past the summarize floor into the rolling
//! `memory_summary`. Neither job blocks the user-visible turn; failures
//! are logged and retried naturally on the next turn.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::chat::SessionEvent;
use crate::context::{memory_prompt, to_request_message, to_request_messages};
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::session::{
    ChatMessage, DEFAULT_TOPIC, ModelConfig, SharedSession, count_message_tokens,
};
use crate::text_utils::trim_topic;

/// Minimum estimated session size before a topic is derived.
pub const TOPIC_MIN_TOKENS: usize = 50;

const TOPIC_PROMPT: &str = include_str!("../assets/prompts/topic_prompt.md");
const SUMMARIZE_PROMPT: &str = include_str!("../assets/prompts/summarize_prompt.md");

/// Compress older history and derive a topic label, in the background.
pub async fn compress_session(
    llm: Arc<dyn LlmClient>,
    session: SharedSession,
    events: mpsc::Sender<SessionEvent>,
    config: ModelConfig,
) {
    tokio::join!(
        derive_topic(llm.as_ref(), &session, &events),
        summarize_history(llm.as_ref(), &session, &config),
    );
}

/// One-shot topic derivation.
///
/// Idempotent: runs only while the placeholder topic stands, and a failed
/// or empty derivation leaves the placeholder so the check fires again
/// next turn.
async fn derive_topic(
    llm: &dyn LlmClient,
    session: &SharedSession,
    events: &mpsc::Sender<SessionEvent>,
) {
    let (session_id, needs_topic, messages) = session.read(|s| {
        (
            s.id.clone(),
            s.topic == DEFAULT_TOPIC,
            s.messages.clone(),
        )
    });

    if !needs_topic || count_message_tokens(&messages) < TOPIC_MIN_TOKENS {
        return;
    }

    let mut wire = to_request_messages(&messages);
    wire.push(Message::user(TOPIC_PROMPT));

    match llm.complete(CompletionRequest::new(wire)).await {
        Ok(response) => {
            let label = response.content.unwrap_or_default();
            let topic = if label.is_empty() {
                DEFAULT_TOPIC.to_string()
            } else {
                trim_topic(&label)
            };
            session.update(|s| s.topic = topic.clone());
            let _ = events
                .send(SessionEvent::TopicUpdated { session_id, topic })
                .await;
        }
        Err(error) => {
            tracing::warn!(error = %error, "topic derivation failed; retrying next turn");
        }
    }
}

/// Condense history past the summarize floor into the rolling summary.
///
/// The floor is `max(last_summarized_index, clear_context_index)`: already
/// summarized content is never re-read and cleared context never leaks
/// into a batch. The summary string grows monotonically as chunks arrive,
/// and `last_summarized_index` moves only after the stream completes,
/// to the message count captured at trigger time, so messages appended
/// while the summarizer runs are picked up by the next round.
async fn summarize_history(llm: &dyn LlmClient, session: &SharedSession, config: &ModelConfig) {
    let (batch, captured_index, memory_summary) = session.read(|s| {
        let floor = s
            .last_summarized_index
            .max(s.clear_context_index.unwrap_or(0))
            .min(s.messages.len());
        let batch: Vec<ChatMessage> = s.messages[floor..]
            .iter()
            .filter(|m| !m.is_error)
            .cloned()
            .collect();
        (batch, s.messages.len(), s.memory_summary.clone())
    });

    let history_tokens = count_message_tokens(&batch);

    if history_tokens <= config.compress_message_length_threshold || !config.send_memory {
        return;
    }

    // Oversized batches are trimmed from the front, never the back: the
    // most recent content carries the continuity. The trim threshold is
    // always the concrete `max_tokens` value.
    let mut batch = batch;
    if history_tokens > config.max_tokens {
        let keep = config.history_message_count.min(batch.len());
        batch = batch.split_off(batch.len() - keep);
    }

    let mut wire: Vec<Message> = Vec::with_capacity(batch.len() + 2);
    if !memory_summary.is_empty() {
        wire.push(to_request_message(&memory_prompt(&memory_summary)));
    }
    wire.extend(to_request_messages(&batch));
    wire.push(Message::system(SUMMARIZE_PROMPT));

    let mut stream = llm.complete_stream(CompletionRequest::new(wire));
    let mut summary = String::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if !chunk.text.is_empty() {
                    summary.push_str(&chunk.text);
                    let snapshot = summary.clone();
                    session.update(|s| s.memory_summary = snapshot);
                }
            }
            Err(error) => {
                // Leave last_summarized_index unchanged so the same batch
                // is retried next turn.
                tracing::warn!(error = %error, "summarization failed; retrying next turn");
                return;
            }
        }
    }

    session.update(|s| {
        // The index never regresses.
        s.last_summarized_index = s.last_summarized_index.max(captured_index);
    });
    tracing::debug!(summarized_to = captured_index, "memory summary updated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, MockStep};
    use crate::session::{BotProfile, ChatSession};

    fn session_with_messages(contents: &[&str]) -> SharedSession {
        let mut session = ChatSession::new(BotProfile::new("helper"));
        for (i, content) in contents.iter().enumerate() {
            let msg = if i % 2 == 0 {
                ChatMessage::user(*content)
            } else {
                ChatMessage::assistant(*content)
            };
            session.messages.push(msg);
        }
        SharedSession::new(session)
    }

    fn compressing_config() -> ModelConfig {
        ModelConfig {
            send_memory: true,
            compress_message_length_threshold: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn summarization_updates_summary_and_index() {
        let llm = MockLlmClient::from_steps("mock", vec![MockStep::text("they discussed rust")]);
        let session = session_with_messages(&["tell me about rust", "rust is a systems language"]);
        let (tx, _rx) = mpsc::channel(8);
        // Suppress topic derivation so only summarization runs.
        session.update(|s| s.topic = "Rust".to_string());

        compress_session(
            Arc::new(llm),
            session.clone(),
            tx,
            compressing_config(),
        )
        .await;

        assert_eq!(
            session.read(|s| s.memory_summary.clone()),
            "they discussed rust"
        );
        assert_eq!(session.read(|s| s.last_summarized_index), 2);
    }

    #[tokio::test]
    async fn summarization_failure_leaves_index_unchanged() {
        let llm = MockLlmClient::from_steps("mock", vec![MockStep::error("endpoint down")]);
        let session = session_with_messages(&["tell me about rust", "rust is a systems language"]);
        let (tx, _rx) = mpsc::channel(8);
        session.update(|s| s.topic = "Rust".to_string());

        compress_session(
            Arc::new(llm),
            session.clone(),
            tx,
            compressing_config(),
        )
        .await;

        assert_eq!(session.read(|s| s.last_summarized_index), 0);
    }

    #[tokio::test]
    async fn summarization_batch_respects_floor_and_errors() {
        let llm = MockLlmClient::from_steps("mock", vec![MockStep::text("summary")]);
        let session = session_with_messages(&[
            "cleared question",
            "cleared answer",
            "real question about lifetimes",
            "real answer about lifetimes",
        ]);
        session.update(|s| {
            s.topic = "Rust".to_string();
            s.clear_context_index = Some(2);
            s.messages[3].is_error = true;
        });
        let (tx, _rx) = mpsc::channel(8);

        let llm = Arc::new(llm);
        compress_session(llm.clone(), session.clone(), tx, compressing_config()).await;

        let requests = llm.requests().await;
        assert_eq!(requests.len(), 1);
        let sent = &requests[0].messages;
        assert!(!sent.iter().any(|m| m.content.contains("cleared")));
        assert!(!sent.iter().any(|m| m.content.contains("real answer")));
        assert!(sent.iter().any(|m| m.content.contains("real question")));
    }

    #[tokio::test]
    async fn oversized_batch_is_trimmed_from_the_front() {
        let llm = Arc::new(MockLlmClient::from_steps("mock", vec![MockStep::text("s")]));
        let contents: Vec<String> = (0..10).map(|i| format!("message {i} {}", "x".repeat(200))).collect();
        let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
        let session = session_with_messages(&refs);
        session.update(|s| s.topic = "Rust".to_string());
        let (tx, _rx) = mpsc::channel(8);

        let config = ModelConfig {
            send_memory: true,
            compress_message_length_threshold: 10,
            max_tokens: 50,
            history_message_count: 2,
            ..Default::default()
        };
        compress_session(llm.clone(), session.clone(), tx, config).await;

        let requests = llm.requests().await;
        assert_eq!(requests.len(), 1);
        let sent = &requests[0].messages;
        // Last two messages survive, plus the summarize instruction.
        assert!(sent.iter().any(|m| m.content.contains("message 8")));
        assert!(sent.iter().any(|m| m.content.contains("message 9")));
        assert!(!sent.iter().any(|m| m.content.contains("message 7")));
    }

    #[tokio::test]
    async fn existing_summary_is_prepended_as_context() {
        let llm = Arc::new(MockLlmClient::from_steps("mock", vec![MockStep::text("s2")]));
        let session = session_with_messages(&["more talk about traits", "traits are interfaces"]);
        session.update(|s| {
            s.topic = "Rust".to_string();
            s.memory_summary = "earlier: discussed lifetimes".to_string();
        });
        let (tx, _rx) = mpsc::channel(8);

        compress_session(llm.clone(), session.clone(), tx, compressing_config()).await;

        let requests = llm.requests().await;
        let first = &requests[0].messages[0];
        assert!(first.content.contains("earlier: discussed lifetimes"));
    }

    #[tokio::test]
    async fn below_threshold_no_summarization() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        let session = session_with_messages(&["hi", "hello"]);
        session.update(|s| s.topic = "Rust".to_string());
        let (tx, _rx) = mpsc::channel(8);

        compress_session(llm.clone(), session.clone(), tx, compressing_config()).await;

        assert!(llm.requests().await.is_empty());
        assert_eq!(session.read(|s| s.last_summarized_index), 0);
    }

    #[tokio::test]
    async fn memory_disabled_no_summarization() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        let session = session_with_messages(&["tell me about rust", "rust is a systems language"]);
        session.update(|s| s.topic = "Rust".to_string());
        let (tx, _rx) = mpsc::channel(8);

        let config = ModelConfig {
            send_memory: false,
            compress_message_length_threshold: 1,
            ..Default::default()
        };
        compress_session(llm.clone(), session.clone(), tx, config).await;

        assert!(llm.requests().await.is_empty());
    }

    #[tokio::test]
    async fn topic_derived_once_enough_content_accumulated() {
        let llm = Arc::new(MockLlmClient::from_steps(
            "mock",
            vec![MockStep::text("\"Rust Lifetimes Explained.\"")],
        ));
        let long = "lifetime questions and answers ".repeat(20);
        let session = session_with_messages(&[long.as_str(), long.as_str()]);
        let (tx, mut rx) = mpsc::channel(8);

        let config = ModelConfig {
            send_memory: false,
            ..Default::default()
        };
        compress_session(llm.clone(), session.clone(), tx, config).await;

        assert_eq!(session.read(|s| s.topic.clone()), "Rust Lifetimes Explained");
        match rx.recv().await {
            Some(SessionEvent::TopicUpdated { topic, .. }) => {
                assert_eq!(topic, "Rust Lifetimes Explained");
            }
            other => panic!("expected TopicUpdated, got {other:?}"),
        }

        // The topic request ends with the derivation instruction.
        let requests = llm.requests().await;
        assert_eq!(requests.len(), 1);
        let last = requests[0].messages.last().unwrap();
        assert!(last.content.contains("title in four to five words"));
    }

    #[tokio::test]
    async fn topic_not_rederived_when_already_set() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        let long = "plenty of conversation content here ".repeat(20);
        let session = session_with_messages(&[long.as_str(), long.as_str()]);
        session.update(|s| s.topic = "Existing Topic".to_string());
        let (tx, _rx) = mpsc::channel(8);

        let config = ModelConfig {
            send_memory: false,
            ..Default::default()
        };
        compress_session(llm.clone(), session.clone(), tx, config).await;

        assert!(llm.requests().await.is_empty());
        assert_eq!(session.read(|s| s.topic.clone()), "Existing Topic");
    }

    #[tokio::test]
    async fn topic_skipped_below_minimum_tokens() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        let session = session_with_messages(&["hi", "hello"]);
        let (tx, _rx) = mpsc::channel(8);

        let config = ModelConfig {
            send_memory: false,
            ..Default::default()
        };
        compress_session(llm.clone(), session.clone(), tx, config).await;

        assert!(llm.requests().await.is_empty());
        assert_eq!(session.read(|s| s.topic.clone()), DEFAULT_TOPIC);
    }

    #[tokio::test]
    async fn topic_failure_keeps_placeholder() {
        let llm = Arc::new(MockLlmClient::from_steps(
            "mock",
            vec![MockStep::error("unavailable")],
        ));
        let long = "plenty of conversation content here ".repeat(20);
        let session = session_with_messages(&[long.as_str(), long.as_str()]);
        let (tx, _rx) = mpsc::channel(8);

        let config = ModelConfig {
            send_memory: false,
            ..Default::default()
        };
        compress_session(llm.clone(), session.clone(), tx, config).await;

        assert_eq!(session.read(|s| s.topic.clone()), DEFAULT_TOPIC);
    }
}
