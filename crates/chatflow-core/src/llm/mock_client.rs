//! Deterministic mock LLM client for engine and lifecycle tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};

use crate::error::{ChatError, Result};

use super::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, Role, StreamChunk,
    StreamResult, TokenUsage,
};

/// Deterministic step for scripted mock completions.
#[derive(Debug, Clone)]
pub enum MockStepKind {
    /// Return a plain assistant message.
    Text(String),
    /// Return an LLM error.
    Error(String),
}

/// Scripted completion step with optional delay.
///
/// For streaming calls the text is delivered one whitespace-separated word
/// per chunk, sleeping `delay_ms` between chunks, so callers can exercise
/// mid-stream cancellation deterministically.
#[derive(Debug, Clone)]
pub struct MockStep {
    pub delay_ms: u64,
    pub kind: MockStepKind,
}

impl MockStep {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            delay_ms: 0,
            kind: MockStepKind::Text(content.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            delay_ms: 0,
            kind: MockStepKind::Error(message.into()),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// A deterministic mock LLM client driven by scripted steps.
///
/// With an empty script it echoes the last user message, so it stays usable
/// as a placeholder client. Every request is captured for later assertion.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    model: String,
    script: Arc<Mutex<VecDeque<MockStep>>>,
    captured: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLlmClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn from_steps(model: impl Into<String>, steps: Vec<MockStep>) -> Self {
        Self {
            model: model.into(),
            script: Arc::new(Mutex::new(VecDeque::from(steps))),
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn push_step(&self, step: MockStep) {
        self.script.lock().await.push_back(step);
    }

    /// Requests seen so far, in call order.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.captured.lock().await.clone()
    }

    async fn next_step(&self) -> Option<MockStep> {
        self.script.lock().await.pop_front()
    }

    async fn capture(&self, request: &CompletionRequest) {
        self.captured.lock().await.push(request.clone());
    }

    fn usage_for(content_len: usize) -> TokenUsage {
        let completion_tokens = content_len as u32;
        TokenUsage {
            prompt_tokens: 1,
            completion_tokens,
            total_tokens: 1 + completion_tokens,
        }
    }

    fn fallback_response(request: &CompletionRequest) -> CompletionResponse {
        let text = request
            .messages
            .iter()
            .rev()
            .find(|msg| matches!(msg.role, Role::User))
            .map(|msg| format!("mock-echo: {}", msg.content))
            .unwrap_or_else(|| "mock-ok".to_string());

        CompletionResponse {
            usage: Some(Self::usage_for(text.len())),
            content: Some(text),
            finish_reason: FinishReason::Stop,
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.capture(&request).await;
        let step = self.next_step().await;
        let Some(step) = step else {
            return Ok(Self::fallback_response(&request));
        };

        if step.delay_ms > 0 {
            sleep(Duration::from_millis(step.delay_ms)).await;
        }

        match step.kind {
            MockStepKind::Text(content) => Ok(CompletionResponse {
                usage: Some(Self::usage_for(content.len())),
                content: Some(content),
                finish_reason: FinishReason::Stop,
            }),
            MockStepKind::Error(message) => Err(ChatError::Llm(message)),
        }
    }

    fn complete_stream(&self, request: CompletionRequest) -> StreamResult {
        let client = self.clone();
        Box::pin(try_stream! {
            client.capture(&request).await;
            let step = client.next_step().await;
            let Some(step) = step else {
                let response = Self::fallback_response(&request);
                if let Some(content) = response.content
                    && !content.is_empty()
                {
                    yield StreamChunk::text(content);
                }
                yield StreamChunk::final_chunk(response.finish_reason, response.usage);
                return;
            };

            match step.kind {
                MockStepKind::Text(content) => {
                    let mut first = true;
                    for word in content.split_inclusive(' ') {
                        if !first && step.delay_ms > 0 {
                            sleep(Duration::from_millis(step.delay_ms)).await;
                        }
                        first = false;
                        yield StreamChunk::text(word);
                    }
                    yield StreamChunk::final_chunk(
                        FinishReason::Stop,
                        Some(Self::usage_for(content.len())),
                    );
                }
                MockStepKind::Error(message) => {
                    if step.delay_ms > 0 {
                        sleep(Duration::from_millis(step.delay_ms)).await;
                    }
                    Err(ChatError::Llm(message))?;
                }
            }
        })
    }
}
