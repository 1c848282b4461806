//! Request lifecycle control.
//!
//! The engine owns exactly one streaming completion call per
//! `(session, message)` pair. Each in-flight call is represented by a
//! [`RequestHandle`] registered in a [`ControllerPool`]; the pool is an
//! explicitly constructed, injectable registry so tests can run isolated
//! pools side by side.
//!
//! Cancellation is cooperative: the handle's token is only ever tripped by
//! [`ControllerPool::cancel`] / [`ControllerPool::stop_all`], so a tripped
//! token always means a user-initiated stop, never an endpoint failure.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{ChatError, Result};

/// Lifecycle of one request. Terminal phases are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Sending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestPhase::Completed | RequestPhase::Failed | RequestPhase::Cancelled
        )
    }
}

/// Abort handle plus phase tracking for one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    token: CancellationToken,
    phase: Arc<Mutex<RequestPhase>>,
}

impl RequestHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            phase: Arc::new(Mutex::new(RequestPhase::Sending)),
        }
    }

    /// Token observed by the request driver.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn phase(&self) -> RequestPhase {
        *self.phase.lock()
    }

    /// Advance the lifecycle. Transitions out of a terminal phase are
    /// ignored, which makes completion/cancel races harmless.
    pub fn set_phase(&self, next: RequestPhase) {
        let mut phase = self.phase.lock();
        if phase.is_terminal() {
            tracing::debug!(current = ?*phase, requested = ?next, "ignoring phase change after terminal");
            return;
        }
        *phase = next;
    }

    fn cancel(&self) {
        self.set_phase(RequestPhase::Cancelled);
        self.token.cancel();
    }
}

/// Registry of all in-flight requests, keyed by `(session_id, message_id)`.
///
/// Entries are created by [`register`](Self::register) and destroyed exactly
/// once, by whichever of success, error, or cancel happens first.
#[derive(Debug, Default)]
pub struct ControllerPool {
    controllers: DashMap<(String, String), RequestHandle>,
}

impl ControllerPool {
    pub fn new() -> Self {
        Self {
            controllers: DashMap::new(),
        }
    }

    /// Register a new request. Rejects a second start for a live key with
    /// [`ChatError::DuplicateRequest`], leaving the existing entry intact.
    pub fn register(&self, session_id: &str, message_id: &str) -> Result<RequestHandle> {
        let key = (session_id.to_string(), message_id.to_string());
        match self.controllers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ChatError::DuplicateRequest {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let handle = RequestHandle::new();
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Remove a request on natural completion or failure. Returns the
    /// handle if this call was the one that removed it.
    pub fn remove(&self, session_id: &str, message_id: &str) -> Option<RequestHandle> {
        self.controllers
            .remove(&(session_id.to_string(), message_id.to_string()))
            .map(|(_, handle)| handle)
    }

    /// Cancel an in-flight request. No-op when the key is absent;
    /// cancellation is inherently racy with natural completion.
    pub fn cancel(&self, session_id: &str, message_id: &str) {
        if let Some(handle) = self.remove(session_id, message_id) {
            tracing::debug!(session_id, message_id, "cancelling in-flight request");
            handle.cancel();
        }
    }

    /// Whether any request is currently in flight.
    pub fn has_pending(&self) -> bool {
        !self.controllers.is_empty()
    }

    /// Number of in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.controllers.len()
    }

    /// Cancel every in-flight request. Safe to call with none pending.
    pub fn stop_all(&self) {
        let keys: Vec<(String, String)> = self
            .controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for (session_id, message_id) in keys {
            self.cancel(&session_id, &message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_remove() {
        let pool = ControllerPool::new();
        assert!(!pool.has_pending());

        let handle = pool.register("s1", "m1").expect("first start succeeds");
        assert_eq!(handle.phase(), RequestPhase::Sending);
        assert!(pool.has_pending());
        assert_eq!(pool.pending_count(), 1);

        assert!(pool.remove("s1", "m1").is_some());
        assert!(!pool.has_pending());
        assert!(pool.remove("s1", "m1").is_none());
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let pool = ControllerPool::new();
        let _first = pool.register("s1", "m1").unwrap();

        let second = pool.register("s1", "m1");
        assert!(matches!(second, Err(ChatError::DuplicateRequest { .. })));
        // The pool still contains exactly one entry for the key.
        assert_eq!(pool.pending_count(), 1);
    }

    #[test]
    fn register_again_after_removal() {
        let pool = ControllerPool::new();
        let _ = pool.register("s1", "m1").unwrap();
        pool.remove("s1", "m1");
        assert!(pool.register("s1", "m1").is_ok());
    }

    #[test]
    fn cancel_trips_token_and_clears_entry() {
        let pool = ControllerPool::new();
        let handle = pool.register("s1", "m1").unwrap();
        let token = handle.cancellation_token();
        assert!(!token.is_cancelled());

        pool.cancel("s1", "m1");

        assert!(token.is_cancelled());
        assert_eq!(handle.phase(), RequestPhase::Cancelled);
        assert!(!pool.has_pending());
    }

    #[test]
    fn double_cancel_and_missing_key_are_noops() {
        let pool = ControllerPool::new();
        let _ = pool.register("s1", "m1").unwrap();
        pool.cancel("s1", "m1");
        pool.cancel("s1", "m1");
        pool.cancel("s9", "m9");
        assert!(!pool.has_pending());
    }

    #[test]
    fn stop_all_cancels_everything_and_is_safe_when_empty() {
        let pool = ControllerPool::new();
        pool.stop_all();

        let a = pool.register("s1", "m1").unwrap();
        let b = pool.register("s2", "m2").unwrap();
        pool.stop_all();

        assert!(a.cancellation_token().is_cancelled());
        assert!(b.cancellation_token().is_cancelled());
        assert!(!pool.has_pending());
    }

    #[test]
    fn terminal_phase_is_sticky() {
        let pool = ControllerPool::new();
        let handle = pool.register("s1", "m1").unwrap();

        handle.set_phase(RequestPhase::Streaming);
        assert_eq!(handle.phase(), RequestPhase::Streaming);

        pool.cancel("s1", "m1");
        handle.set_phase(RequestPhase::Completed);
        assert_eq!(handle.phase(), RequestPhase::Cancelled);
    }

    #[test]
    fn pools_are_isolated() {
        let pool_a = ControllerPool::new();
        let pool_b = ControllerPool::new();
        let _ = pool_a.register("s1", "m1").unwrap();
        assert!(!pool_b.has_pending());
    }
}
