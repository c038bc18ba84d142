//! Error types shared by the protocol, RPC and chat layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the worker client and the chat session engine.
///
/// Protocol-level failures are caught at the RPC boundary and travel as values
/// (completion events, message error payloads) rather than as panics.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatError {
    /// An inbound message could not be decoded into a known envelope
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The worker channel is closed; every pending request is rejected with this
    #[error("Transport closed: worker is unreachable")]
    TransportClosed,

    /// The worker answered with a `throw` envelope
    #[error("Worker error: {message}")]
    WorkerReported {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },

    /// A streaming message never completed within the request timeout
    #[error("Empty response: generation did not complete in time")]
    EmptyResponseTimeout,

    /// Resend was invoked on a message with no pairable user message
    #[error("Resend target not found: {0}")]
    ResendTargetNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// The liveness monitor has declared the worker dead
    #[error("Worker is not responding to heartbeats")]
    WorkerDead,

    /// Loading or saving the session snapshot failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ChatError {
    /// Creates a worker-reported error without a stack
    pub fn worker(message: impl Into<String>) -> Self {
        Self::WorkerReported {
            message: message.into(),
            stack: None,
        }
    }

    /// Creates a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Whether the session may simply resubmit after this error.
    ///
    /// Transport and liveness failures need the worker to be recreated first.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::TransportClosed | Self::WorkerDead)
    }

    /// Render the error as the payload stored in a failed assistant message.
    pub fn format_for_display(&self) -> String {
        let mut body = serde_json::json!({
            "error": true,
            "message": self.to_string(),
        });
        if let Self::WorkerReported {
            stack: Some(stack), ..
        } = self
        {
            body["stack"] = serde_json::Value::String(stack.clone());
        }
        let pretty = serde_json::to_string_pretty(&body).unwrap_or_else(|_| self.to_string());
        format!("```json\n{}\n```", pretty)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Result alias for library operations.
pub type Result<T> = std::result::Result<T, ChatError>;
