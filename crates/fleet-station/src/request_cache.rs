//! Outgoing-request cache
//!
//! Every outgoing CALL registers an entry keyed by its message id before the
//! frame hits the socket. The socket-reader task completes the entry when the
//! matching CALLRESULT/CALLERROR arrives; the caller's timeout removes it
//! otherwise. A given message id is cached at most once at a time.

use crate::OCPP_WS_COMMAND_TIMEOUT;
use dashmap::DashMap;
use fleet_types::{OcppError, OcppResult};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

/// Completed response delivered to the awaiting caller
pub type ResponsePayload = OcppResult<Value>;

struct PendingEntry {
    responder: oneshot::Sender<ResponsePayload>,
    command: String,
    #[allow(dead_code)]
    request_payload: Value,
    deadline: Instant,
}

/// Cache of in-flight requests keyed by OCPP message id
#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.entries.contains_key(unique_id)
    }

    /// Register a request; the returned receiver resolves with the response
    /// payload or a structured error. Registering a message id twice is a
    /// protocol error.
    pub fn register(
        &self,
        unique_id: &str,
        command: &str,
        request_payload: Value,
    ) -> OcppResult<oneshot::Receiver<ResponsePayload>> {
        if self.entries.contains_key(unique_id) {
            return Err(OcppError::protocol(format!(
                "Message id {} is already in flight",
                unique_id
            )));
        }
        let (responder, receiver) = oneshot::channel();
        self.entries.insert(
            unique_id.to_string(),
            PendingEntry {
                responder,
                command: command.to_string(),
                request_payload,
                deadline: Instant::now() + OCPP_WS_COMMAND_TIMEOUT,
            },
        );
        Ok(receiver)
    }

    /// Complete an entry with a successful payload; `false` when the id is
    /// unknown (late or duplicate response)
    pub fn complete(&self, unique_id: &str, payload: Value) -> bool {
        match self.entries.remove(unique_id) {
            Some((_, entry)) => {
                let _ = entry.responder.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Complete an entry with an error
    pub fn fail(&self, unique_id: &str, error: OcppError) -> bool {
        match self.entries.remove(unique_id) {
            Some((_, entry)) => {
                let _ = entry.responder.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop an entry without completing it (caller-side timeout)
    pub fn remove(&self, unique_id: &str) -> Option<(String, Duration)> {
        self.entries.remove(unique_id).map(|(_, entry)| {
            let overdue = Instant::now().saturating_duration_since(entry.deadline);
            (entry.command, overdue)
        })
    }

    /// Fail every in-flight request, e.g. when the connection closes
    pub fn fail_all(&self, reason: impl Fn(&str) -> OcppError) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for unique_id in ids {
            if let Some((_, entry)) = self.entries.remove(&unique_id) {
                warn!(command = %entry.command, "Cancelling in-flight request");
                let _ = entry.responder.send(Err(reason(&entry.command)));
            }
        }
    }
}
