//! Envelope codec: tagged messages exchanged across the worker boundary
//!
//! Wire shape: `{"kind": "...", "correlationId": "<uuid>", "payload": ...}`.
//! `kind` selects the payload type; unknown kinds and missing correlation ids
//! are rejected as [`ChatError::MalformedEnvelope`].

use super::types::*;
use crate::error::{ChatError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of message kinds understood by both sides of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    Reload,
    Generate,
    ChatCompletionNonStreaming,
    ChatCompletionStreamInit,
    ChatCompletionStreamNextChunk,
    InterruptGenerate,
    ResetChat,
    Unload,
    RuntimeStatsText,
    InitProgressCallback,
    GenerateProgressCallback,
    Return,
    Throw,
    Heartbeat,
}

impl RequestKind {
    pub const ALL: [RequestKind; 14] = [
        RequestKind::Reload,
        RequestKind::Generate,
        RequestKind::ChatCompletionNonStreaming,
        RequestKind::ChatCompletionStreamInit,
        RequestKind::ChatCompletionStreamNextChunk,
        RequestKind::InterruptGenerate,
        RequestKind::ResetChat,
        RequestKind::Unload,
        RequestKind::RuntimeStatsText,
        RequestKind::InitProgressCallback,
        RequestKind::GenerateProgressCallback,
        RequestKind::Return,
        RequestKind::Throw,
        RequestKind::Heartbeat,
    ];

    /// Wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Reload => "reload",
            RequestKind::Generate => "generate",
            RequestKind::ChatCompletionNonStreaming => "chatCompletionNonStreaming",
            RequestKind::ChatCompletionStreamInit => "chatCompletionStreamInit",
            RequestKind::ChatCompletionStreamNextChunk => "chatCompletionStreamNextChunk",
            RequestKind::InterruptGenerate => "interruptGenerate",
            RequestKind::ResetChat => "resetChat",
            RequestKind::Unload => "unload",
            RequestKind::RuntimeStatsText => "runtimeStatsText",
            RequestKind::InitProgressCallback => "initProgressCallback",
            RequestKind::GenerateProgressCallback => "generateProgressCallback",
            RequestKind::Return => "return",
            RequestKind::Throw => "throw",
            RequestKind::Heartbeat => "heartbeat",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == tag)
    }

    /// `return` and `throw` end a call's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestKind::Return | RequestKind::Throw)
    }

    /// Intermediate deliveries that may repeat before the terminal envelope
    pub fn is_stream_chunk(&self) -> bool {
        matches!(
            self,
            RequestKind::ChatCompletionStreamNextChunk
                | RequestKind::InitProgressCallback
                | RequestKind::GenerateProgressCallback
        )
    }

    /// Heartbeats are the only kind routed without a correlation id
    pub fn requires_correlation(&self) -> bool {
        !matches!(self, RequestKind::Heartbeat)
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an envelope, one variant per [`RequestKind`]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Reload(ReloadParams),
    Generate(GenerateParams),
    ChatCompletionNonStreaming(ChatCompletionParams),
    ChatCompletionStreamInit(ChatCompletionParams),
    ChatCompletionStreamNextChunk(ChatCompletionChunk),
    InterruptGenerate(InterruptParams),
    ResetChat(ResetChatParams),
    Unload,
    RuntimeStatsText,
    InitProgressCallback(InitProgressReport),
    GenerateProgressCallback(GenerateProgress),
    Return(Value),
    Throw(WorkerErrorPayload),
    Heartbeat,
}

impl Payload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Payload::Reload(_) => RequestKind::Reload,
            Payload::Generate(_) => RequestKind::Generate,
            Payload::ChatCompletionNonStreaming(_) => RequestKind::ChatCompletionNonStreaming,
            Payload::ChatCompletionStreamInit(_) => RequestKind::ChatCompletionStreamInit,
            Payload::ChatCompletionStreamNextChunk(_) => RequestKind::ChatCompletionStreamNextChunk,
            Payload::InterruptGenerate(_) => RequestKind::InterruptGenerate,
            Payload::ResetChat(_) => RequestKind::ResetChat,
            Payload::Unload => RequestKind::Unload,
            Payload::RuntimeStatsText => RequestKind::RuntimeStatsText,
            Payload::InitProgressCallback(_) => RequestKind::InitProgressCallback,
            Payload::GenerateProgressCallback(_) => RequestKind::GenerateProgressCallback,
            Payload::Return(_) => RequestKind::Return,
            Payload::Throw(_) => RequestKind::Throw,
            Payload::Heartbeat => RequestKind::Heartbeat,
        }
    }

    fn to_value(&self) -> Result<Value> {
        let value = match self {
            Payload::Reload(p) => serde_json::to_value(p)?,
            Payload::Generate(p) => serde_json::to_value(p)?,
            Payload::ChatCompletionNonStreaming(p) | Payload::ChatCompletionStreamInit(p) => {
                serde_json::to_value(p)?
            }
            Payload::ChatCompletionStreamNextChunk(p) => serde_json::to_value(p)?,
            Payload::InterruptGenerate(p) => serde_json::to_value(p)?,
            Payload::ResetChat(p) => serde_json::to_value(p)?,
            Payload::InitProgressCallback(p) => serde_json::to_value(p)?,
            Payload::GenerateProgressCallback(p) => serde_json::to_value(p)?,
            Payload::Return(v) => v.clone(),
            Payload::Throw(p) => serde_json::to_value(p)?,
            Payload::Unload | Payload::RuntimeStatsText | Payload::Heartbeat => Value::Null,
        };
        Ok(value)
    }

    fn from_value(kind: RequestKind, raw: Value) -> Result<Self> {
        let payload = match kind {
            RequestKind::Reload => Payload::Reload(parse(kind, raw)?),
            RequestKind::Generate => Payload::Generate(parse(kind, raw)?),
            RequestKind::ChatCompletionNonStreaming => {
                Payload::ChatCompletionNonStreaming(parse(kind, raw)?)
            }
            RequestKind::ChatCompletionStreamInit => {
                Payload::ChatCompletionStreamInit(parse(kind, raw)?)
            }
            RequestKind::ChatCompletionStreamNextChunk => {
                Payload::ChatCompletionStreamNextChunk(parse(kind, raw)?)
            }
            RequestKind::InterruptGenerate if raw.is_null() => {
                Payload::InterruptGenerate(InterruptParams::default())
            }
            RequestKind::InterruptGenerate => Payload::InterruptGenerate(parse(kind, raw)?),
            RequestKind::ResetChat if raw.is_null() => {
                Payload::ResetChat(ResetChatParams::default())
            }
            RequestKind::ResetChat => Payload::ResetChat(parse(kind, raw)?),
            RequestKind::Unload => Payload::Unload,
            RequestKind::RuntimeStatsText => Payload::RuntimeStatsText,
            RequestKind::InitProgressCallback => Payload::InitProgressCallback(parse(kind, raw)?),
            RequestKind::GenerateProgressCallback => {
                Payload::GenerateProgressCallback(parse(kind, raw)?)
            }
            RequestKind::Return => Payload::Return(raw),
            RequestKind::Throw => Payload::Throw(parse(kind, raw)?),
            RequestKind::Heartbeat => Payload::Heartbeat,
        };
        Ok(payload)
    }
}

fn parse<T: DeserializeOwned>(kind: RequestKind, raw: Value) -> Result<T> {
    serde_json::from_value(raw)
        .map_err(|e| ChatError::MalformedEnvelope(format!("invalid {} payload: {}", kind, e)))
}

/// A tagged message unit exchanged across the worker boundary
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Links a request to all of its replies; absent only on heartbeats
    pub correlation_id: Option<String>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(correlation_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            correlation_id: None,
            payload: Payload::Heartbeat,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

/// Encode an envelope into its JSON wire form
pub fn encode(envelope: &Envelope) -> Result<Value> {
    let mut object = serde_json::Map::new();
    object.insert(
        "kind".into(),
        Value::String(envelope.kind().as_str().to_string()),
    );
    if let Some(ref id) = envelope.correlation_id {
        object.insert("correlationId".into(), Value::String(id.clone()));
    }
    object.insert("payload".into(), envelope.payload.to_value()?);
    Ok(Value::Object(object))
}

/// Decode a raw JSON message into a typed envelope
pub fn decode(raw: &Value) -> Result<Envelope> {
    let object = raw
        .as_object()
        .ok_or_else(|| ChatError::MalformedEnvelope("envelope is not an object".into()))?;

    let tag = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ChatError::MalformedEnvelope("missing kind".into()))?;
    let kind = RequestKind::from_tag(tag)
        .ok_or_else(|| ChatError::MalformedEnvelope(format!("unknown kind '{}'", tag)))?;

    let correlation_id = match object.get("correlationId") {
        Some(Value::String(id)) => Some(id.clone()).filter(|id| !id.is_empty()),
        None | Some(Value::Null) => None,
        Some(other) => {
            return Err(ChatError::MalformedEnvelope(format!(
                "correlationId must be a string, got {}",
                other
            )))
        }
    };
    if correlation_id.is_none() && kind.requires_correlation() {
        return Err(ChatError::MalformedEnvelope(format!(
            "{} envelope without correlationId",
            kind
        )));
    }

    let payload = object.get("payload").cloned().unwrap_or(Value::Null);
    Ok(Envelope {
        correlation_id,
        payload: Payload::from_value(kind, payload)?,
    })
}
