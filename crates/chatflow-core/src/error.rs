//! Error types for the context engine

use thiserror::Error;

/// Context-engine error types
#[derive(Error, Debug)]
pub enum ChatError {
    /// Resource retrieval for a direct-content input failed. Recovered
    /// locally: the turn surfaces a synthetic error message and completes
    /// without touching the network.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// A request is already in flight for this (session, message) key.
    #[error("request already pending for message {message_id} in session {session_id}")]
    DuplicateRequest {
        session_id: String,
        message_id: String,
    },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("{provider} API error (status {status}): {message}")]
    LlmHttp {
        provider: String,
        status: u16,
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Network or endpoint failure mid-stream. Partial content is
    /// preserved by the caller.
    #[error("stream error: {0}")]
    Stream(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Whether a retry may succeed for this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::LlmHttp { status, .. } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            ChatError::Llm(message) => {
                let lower = message.to_lowercase();
                lower.contains("rate limit")
                    || lower.contains("timeout")
                    || lower.contains("overloaded")
            }
            ChatError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Server-provided retry delay, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ChatError::LlmHttp {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for context-engine operations
pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_retryability() {
        let rate_limited = ChatError::LlmHttp {
            provider: "openai".to_string(),
            status: 429,
            message: "rate limit".to_string(),
            retry_after_secs: Some(2),
        };
        let unauthorized = ChatError::LlmHttp {
            provider: "openai".to_string(),
            status: 401,
            message: "unauthorized".to_string(),
            retry_after_secs: None,
        };
        assert!(rate_limited.is_retryable());
        assert_eq!(rate_limited.retry_after(), Some(2));
        assert!(!unauthorized.is_retryable());
        assert_eq!(unauthorized.retry_after(), None);
    }

    #[test]
    fn llm_message_retryability_fallback() {
        assert!(ChatError::Llm("Rate limit exceeded".to_string()).is_retryable());
        assert!(!ChatError::Llm("invalid request".to_string()).is_retryable());
    }

    #[test]
    fn fetch_and_duplicate_are_not_retryable() {
        assert!(!ChatError::FetchFailed("404".to_string()).is_retryable());
        let dup = ChatError::DuplicateRequest {
            session_id: "s".to_string(),
            message_id: "m".to_string(),
        };
        assert!(!dup.is_retryable());
        assert!(dup.to_string().contains("already pending"));
    }
}
