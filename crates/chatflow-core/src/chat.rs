//! Session orchestration.
//!
//! [`ChatEngine`] runs one turn end to end: build the user message (fetching
//! direct-content references), assemble the context window, append the turn
//! to the log, and drive the streaming completion in a background task.
//! Callers observe progress through the typed [`SessionEvent`] channel; the
//! turn itself returns as soon as the request is in flight.
//!
//! Incremental updates are published with `try_send` and may be dropped
//! under backpressure; finish and error updates are delivered with `send`,
//! so the terminal state is always observed.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::context::{assemble_window, fill_template, to_request_message, to_request_messages};
use crate::controller::{ControllerPool, RequestHandle, RequestPhase};
use crate::error::{ChatError, Result};
use crate::fetch::{HttpResourceFetcher, ResourceFetcher, is_direct_url};
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::memory::compress_session;
use crate::session::{ChatMessage, ChatSession, ModelConfig, SharedSession, SourceDetail};

/// Visible-state change notification.
///
/// Emitted whenever the session's messages or topic change: at least once
/// per incremental token batch and exactly once on finish or error.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    MessagesUpdated {
        session_id: String,
        messages: Vec<ChatMessage>,
    },
    TopicUpdated {
        session_id: String,
        topic: String,
    },
}

/// Top-level coordinator for chat turns.
pub struct ChatEngine {
    llm: Arc<dyn LlmClient>,
    /// Client used for background compression and topic derivation.
    compressor: Arc<dyn LlmClient>,
    fetcher: Arc<dyn ResourceFetcher>,
    pool: Arc<ControllerPool>,
    events: mpsc::Sender<SessionEvent>,
    lang: String,
}

impl ChatEngine {
    pub fn new(llm: Arc<dyn LlmClient>, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            compressor: llm.clone(),
            llm,
            fetcher: Arc::new(HttpResourceFetcher::new()),
            pool: Arc::new(ControllerPool::new()),
            events,
            lang: "en".to_string(),
        }
    }

    /// Substitute the resource fetcher (e.g. a PDF-capable one).
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Use a dedicated client for compression and topic derivation.
    pub fn with_compressor(mut self, compressor: Arc<dyn LlmClient>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Share or isolate the controller pool.
    pub fn with_pool(mut self, pool: Arc<ControllerPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Language tag substituted into templates.
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Run one user turn.
    ///
    /// Returns the streaming placeholder assistant message once the request
    /// is in flight (or the synthetic error message when a direct-content
    /// fetch fails). Progress arrives on the event channel.
    pub async fn run_turn(&self, session: &SharedSession, input: &str) -> Result<ChatMessage> {
        let (session_id, config) =
            session.read(|s| (s.id.clone(), s.bot.model_config.clone()));

        let user_message = if is_direct_url(input) {
            let reference = input.trim();
            match self.fetcher.fetch(reference).await {
                Ok(resource) => ChatMessage::user(resource.content).with_source_detail(
                    SourceDetail {
                        url: reference.to_string(),
                        byte_size: resource.byte_size,
                        mime_kind: resource.mime_kind,
                    },
                ),
                Err(error) => {
                    // Short-circuit: log the raw input plus a synthetic
                    // error reply. The pool is never touched on this path.
                    tracing::warn!(error = %error, url = reference, "direct-content fetch failed");
                    let user = ChatMessage::user(input);
                    let reply = ChatMessage::assistant(format_error_payload(&error.to_string()))
                        .with_model(config.model.clone());
                    let messages = session.update(|s| {
                        s.messages.push(user);
                        s.messages.push(reply.clone());
                        s.messages.clone()
                    });
                    let _ = self
                        .events
                        .send(SessionEvent::MessagesUpdated {
                            session_id,
                            messages,
                        })
                        .await;
                    return Ok(reply);
                }
            }
        } else {
            ChatMessage::user(fill_template(input, &config, &self.lang))
        };

        let assistant_message = ChatMessage::assistant("")
            .with_model(config.model.clone())
            .with_streaming(true);

        // One live request per (session, message); a second start for the
        // same key is a caller bug and must not corrupt pool state.
        let handle = self.pool.register(&session_id, &assistant_message.id)?;

        // The window is assembled before the new turn lands in the log.
        let window = session.read(|s| assemble_window(s, &config, &self.lang));
        let mut wire = to_request_messages(&window);
        wire.push(to_request_message(&user_message));

        // The log keeps the raw input; the wire carried the rendered form.
        let saved_user = ChatMessage {
            content: input.to_string(),
            ..user_message
        };
        let user_message_id = saved_user.id.clone();

        let messages = session.update(|s| {
            s.messages.push(saved_user);
            s.messages.push(assistant_message.clone());
            s.messages.clone()
        });
        let _ = self
            .events
            .send(SessionEvent::MessagesUpdated {
                session_id: session_id.clone(),
                messages,
            })
            .await;

        tokio::spawn(drive_request(DriveRequest {
            llm: self.llm.clone(),
            compressor: self.compressor.clone(),
            pool: self.pool.clone(),
            events: self.events.clone(),
            session: session.clone(),
            config,
            wire,
            session_id,
            user_message_id,
            assistant_message_id: assistant_message.id.clone(),
            handle,
        }));

        Ok(assistant_message)
    }

    /// Cancel the in-flight request for a message. Safe no-op if none.
    pub fn cancel(&self, session_id: &str, message_id: &str) {
        self.pool.cancel(session_id, message_id);
    }

    /// Whether any request is in flight across all sessions.
    pub fn has_pending(&self) -> bool {
        self.pool.has_pending()
    }

    /// Cancel every in-flight request.
    pub fn stop_all(&self) {
        self.pool.stop_all();
    }
}

/// Pretty-printed error payload appended to a failed assistant message.
fn format_error_payload(message: &str) -> String {
    let body = serde_json::json!({ "error": true, "message": message });
    let pretty = serde_json::to_string_pretty(&body).unwrap_or_else(|_| message.to_string());
    format!("```json\n{}\n```", pretty)
}

struct DriveRequest {
    llm: Arc<dyn LlmClient>,
    compressor: Arc<dyn LlmClient>,
    pool: Arc<ControllerPool>,
    events: mpsc::Sender<SessionEvent>,
    session: SharedSession,
    config: ModelConfig,
    wire: Vec<Message>,
    session_id: String,
    user_message_id: String,
    assistant_message_id: String,
    handle: RequestHandle,
}

enum TurnOutcome {
    Completed,
    Failed(ChatError),
    Cancelled,
}

fn message_mut<'a>(session: &'a mut ChatSession, id: &str) -> Option<&'a mut ChatMessage> {
    session.messages.iter_mut().rev().find(|m| m.id == id)
}

/// Drive one completion request to a terminal state.
///
/// Updates for the target message are applied in receipt order; only the
/// latest partial content needs to be observable at any instant, so
/// intermediate event sends may drop under backpressure.
async fn drive_request(ctx: DriveRequest) {
    let DriveRequest {
        llm,
        compressor,
        pool,
        events,
        session,
        config,
        wire,
        session_id,
        user_message_id,
        assistant_message_id,
        handle,
    } = ctx;

    let token = handle.cancellation_token();
    let request =
        CompletionRequest::new(wire).with_max_tokens(config.max_tokens as u32);

    let mut content = String::new();

    let outcome = if config.stream && llm.supports_streaming() {
        let mut stream = llm.complete_stream(request);
        loop {
            tokio::select! {
                _ = token.cancelled() => break TurnOutcome::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        if !chunk.text.is_empty() {
                            handle.set_phase(RequestPhase::Streaming);
                            content.push_str(&chunk.text);
                            publish_partial(
                                &session,
                                &events,
                                &session_id,
                                &assistant_message_id,
                                &content,
                            );
                        }
                    }
                    Some(Err(error)) => break TurnOutcome::Failed(error),
                    None => break TurnOutcome::Completed,
                }
            }
        }
    } else {
        tokio::select! {
            _ = token.cancelled() => TurnOutcome::Cancelled,
            result = llm.complete(request) => match result {
                Ok(response) => {
                    content = response.content.unwrap_or_default();
                    TurnOutcome::Completed
                }
                Err(error) => TurnOutcome::Failed(error),
            }
        }
    };

    match outcome {
        TurnOutcome::Completed => {
            let messages = session.update(|s| {
                if let Some(msg) = message_mut(s, &assistant_message_id) {
                    msg.streaming = false;
                    msg.content = content.clone();
                }
                if !content.is_empty() {
                    s.last_update = Utc::now();
                    s.stat.record_completion(&content);
                }
                s.messages.clone()
            });
            handle.set_phase(RequestPhase::Completed);
            pool.remove(&session_id, &assistant_message_id);
            let _ = events
                .send(SessionEvent::MessagesUpdated {
                    session_id: session_id.clone(),
                    messages,
                })
                .await;

            // Memory compression and topic derivation never block or fail
            // the turn that triggered them.
            if !content.is_empty() {
                tokio::spawn(compress_session(
                    compressor,
                    session.clone(),
                    events.clone(),
                    config,
                ));
            }
        }
        TurnOutcome::Failed(error) => {
            tracing::error!(error = %error, %session_id, "chat request failed");
            let payload = format_error_payload(&error.to_string());
            let messages = session.update(|s| {
                if let Some(user) = message_mut(s, &user_message_id) {
                    user.is_error = true;
                }
                if let Some(msg) = message_mut(s, &assistant_message_id) {
                    msg.streaming = false;
                    msg.is_error = true;
                    msg.content = if content.is_empty() {
                        payload.clone()
                    } else {
                        format!("{}\n\n{}", content, payload)
                    };
                }
                s.messages.clone()
            });
            handle.set_phase(RequestPhase::Failed);
            pool.remove(&session_id, &assistant_message_id);
            let _ = events
                .send(SessionEvent::MessagesUpdated {
                    session_id,
                    messages,
                })
                .await;
        }
        TurnOutcome::Cancelled => {
            // A user stop is a clean stop: partial content stays, no error
            // flags. The pool entry was already removed by cancel().
            let messages = session.update(|s| {
                if let Some(msg) = message_mut(s, &assistant_message_id) {
                    msg.streaming = false;
                    msg.content = content.clone();
                }
                s.messages.clone()
            });
            let _ = events
                .send(SessionEvent::MessagesUpdated {
                    session_id,
                    messages,
                })
                .await;
        }
    }
}

/// Publish an in-flight content update, dropping it under backpressure.
fn publish_partial(
    session: &SharedSession,
    events: &mpsc::Sender<SessionEvent>,
    session_id: &str,
    message_id: &str,
    content: &str,
) {
    let messages = session.update(|s| {
        if let Some(msg) = message_mut(s, message_id) {
            msg.streaming = true;
            msg.content = content.to_string();
        }
        s.messages.clone()
    });
    let _ = events.try_send(SessionEvent::MessagesUpdated {
        session_id: session_id.to_string(),
        messages,
    });
}
