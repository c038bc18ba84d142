//! Store change events for the rendering layer

use serde::{Deserialize, Serialize};

/// What changed in the session store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreAction {
    SessionCreated,
    SessionSelected,
    SessionDeleted,
    SessionUpdated,
    MessageAppended,
    /// Streamed content was appended to a message
    MessageDelta,
    /// A streaming message reached its terminal state
    MessageFinalized,
    MessageUpdated,
    MessageDeleted,
    ContextCleared,
    /// Stale messages were reconciled after loading
    Recovered,
}

/// A store mutation, emitted after it has been applied
///
/// Must be Clone for `tokio::sync::broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub action: StoreAction,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Optional payload (appended delta, new topic, ...)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl StoreEvent {
    /// Create a new StoreEvent with the current timestamp
    pub fn new(action: StoreAction, session_id: impl Into<String>) -> Self {
        Self {
            action,
            session_id: session_id.into(),
            message_id: None,
            payload: serde_json::Value::Null,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Sink for store events; implementations must never block or panic
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: StoreEvent);

    fn emit_session(&self, action: StoreAction, session_id: &str) {
        self.emit(StoreEvent::new(action, session_id));
    }

    fn emit_message(&self, action: StoreAction, session_id: &str, message_id: &str) {
        self.emit(StoreEvent::new(action, session_id).with_message(message_id));
    }
}
