//! Chat types: messages and sessions owned by the session store

use crate::protocol::{RequestMessage, Role};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic given to sessions before the user renames them
pub const DEFAULT_TOPIC: &str = "New Conversation";

/// A file or image attached to a user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// Data URL or remote URL of the content
    pub url: String,
}

/// A tool invocation recorded alongside an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMessage {
    pub tool_name: String,
    pub tool_input: String,
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub date: DateTime<Utc>,
    /// True from turn start until the terminal chunk, error or interrupt
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub is_error: bool,
    /// Model that produced an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_messages: Vec<ToolMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_infos: Vec<Attachment>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            date: Utc::now(),
            streaming: false,
            is_error: false,
            model: None,
            tool_messages: Vec::new(),
            file_infos: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            file_infos: attachments,
            ..Self::new(Role::User, content)
        }
    }

    /// Empty assistant message that receives streamed content
    pub fn assistant_placeholder(model: impl Into<String>) -> Self {
        Self {
            streaming: true,
            model: Some(model.into()),
            ..Self::new(Role::Assistant, "")
        }
    }

    /// How long ago the message was created
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.date
    }

    /// Whether the message may be sent to the engine as context
    pub fn counts_as_context(&self) -> bool {
        !self.is_error && !self.streaming && !self.content.trim().is_empty()
    }

    pub fn to_request(&self) -> RequestMessage {
        RequestMessage::new(self.role, self.content.clone())
    }
}

/// A conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Summary of earlier turns prepended to the context
    #[serde(default)]
    pub memory_prompt: String,
    /// Messages before this index are left out of the next prompt context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_context_index: Option<usize>,
    /// Messages pinned into every prompt context, after the memory prompt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned: Vec<ChatMessage>,
    pub last_update: DateTime<Utc>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            messages: Vec::new(),
            memory_prompt: String::new(),
            clear_context_index: None,
            pinned: Vec::new(),
            last_update: Utc::now(),
        }
    }

    pub fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }

    /// A generation is in flight for this session
    pub fn is_streaming(&self) -> bool {
        self.messages.iter().any(|m| m.streaming)
    }

    /// First message index that belongs to the prompt context
    pub fn context_start(&self) -> usize {
        self.clear_context_index
            .unwrap_or(0)
            .min(self.messages.len())
    }

    /// Remove exactly the message with `message_id`
    pub fn remove_message(&mut self, message_id: &str) -> Option<ChatMessage> {
        let index = self.position(message_id)?;
        self.touch();
        Some(self.messages.remove(index))
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    /// Force stale or failed messages out of the streaming state.
    ///
    /// A message is reconciled when it is already flagged as an error or older
    /// than `timeout`; if it has no content it becomes an error message.
    /// Returns the number of messages changed.
    pub fn reconcile_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let mut changed = 0;
        for message in &mut self.messages {
            if !(message.is_error || message.age(now) > timeout) {
                continue;
            }
            let before = (message.streaming, message.is_error);
            message.streaming = false;
            if message.content.is_empty() {
                message.is_error = true;
                message.content =
                    crate::error::ChatError::EmptyResponseTimeout.format_for_display();
            }
            if before != (message.streaming, message.is_error) {
                changed += 1;
            }
        }
        changed
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}
