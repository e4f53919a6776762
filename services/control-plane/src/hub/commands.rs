//! Command correlation.
//!
//! Every outbound command carries a fresh request ID; the agent echoes it
//! back in its `command_response`. The correlator maps request IDs to the
//! callers still waiting, and guarantees each caller settles exactly once:
//! resolve on a success response, reject on a failure response, reject on
//! timeout. An entry never outlives its resolution.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use shipway_id::ServerId;
use shipway_protocol::CommandResponse;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors a `send_command` caller can observe.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("agent for server {0} is not connected")]
    NotConnected(ServerId),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent rejected command: {0}")]
    Rejected(String),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,
}

type Resolver = oneshot::Sender<Result<Value, CommandError>>;

/// Pending-command registry, keyed by request ID.
#[derive(Default)]
pub(crate) struct CommandCorrelator {
    pending: Mutex<HashMap<String, Resolver>>,
}

impl CommandCorrelator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a pending command and returns the receiver the caller
    /// awaits.
    pub(crate) fn register(
        &self,
        request_id: &str,
    ) -> oneshot::Receiver<Result<Value, CommandError>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.to_string(), tx);
        rx
    }

    /// Removes a pending entry without resolving it (transmission failed or
    /// the caller timed out).
    pub(crate) fn discard(&self, request_id: &str) {
        self.pending.lock().unwrap().remove(request_id);
    }

    /// Resolves a pending command from an agent response. Returns false for
    /// unmatched or late responses, which callers drop silently.
    pub(crate) fn resolve(&self, response: CommandResponse) -> bool {
        let Some(tx) = self.pending.lock().unwrap().remove(&response.request_id) else {
            return false;
        };

        let result = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(CommandError::Rejected(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        };

        // The receiver may already be gone if the caller timed out between
        // our map removal and this send; that is fine either way.
        let _ = tx.send(result);
        true
    }

    /// Number of commands still in flight.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
