//! Test helper factories and a scripted worker peer
//!
//! Provides convenience functions for creating test objects with sensible defaults,
//! and a `WorkerPeer` that plays the worker side of a `ChannelTransport` pair.
#![allow(dead_code)]

use crate::chat::config::DEFAULT_SYSTEM_TEMPLATE;
use crate::chat::{ChatConfig, ChatMessage, ChatSession, ChatSessionEngine, SessionStore};
use crate::inference::InferenceEngine;
use crate::liveness::{LivenessMonitor, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MISS_LIMIT};
use crate::protocol::*;
use crate::rpc::RpcClient;
use crate::transport::{ChannelTransport, Transport};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const PEER_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Environment
// ============================================================================

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that read or write process environment variables
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Scripted worker peer
// ============================================================================

/// Worker end of a channel pair, driven step by step by the test
pub struct WorkerPeer {
    port: ChannelTransport,
}

impl WorkerPeer {
    /// Next envelope sent by the client, heartbeats included
    pub async fn next_envelope(&self) -> Envelope {
        let raw = tokio::time::timeout(PEER_TIMEOUT, self.port.next_message())
            .await
            .expect("timed out waiting for a client envelope")
            .expect("client closed the channel");
        decode(&raw).expect("client sent a malformed envelope")
    }

    /// Next non-heartbeat envelope sent by the client
    pub async fn next_request(&self) -> Envelope {
        loop {
            let envelope = self.next_envelope().await;
            if envelope.kind() != RequestKind::Heartbeat {
                return envelope;
            }
        }
    }

    pub fn reply(&self, correlation_id: &str, payload: Payload) {
        self.send_raw(encode(&Envelope::new(correlation_id, payload)).unwrap());
    }

    /// Stream `pieces` as chat chunks, then return their concatenation
    pub fn stream_reply(&self, correlation_id: &str, pieces: &[&str]) {
        for piece in pieces {
            self.reply(
                correlation_id,
                Payload::ChatCompletionStreamNextChunk(ChatCompletionChunk::text(
                    "chatcmpl-test",
                    "test-model",
                    *piece,
                )),
            );
        }
        self.reply(correlation_id, Payload::Return(Value::String(pieces.concat())));
    }

    pub fn throw(&self, correlation_id: &str, message: &str) {
        self.reply(
            correlation_id,
            Payload::Throw(WorkerErrorPayload {
                message: message.into(),
                stack: None,
            }),
        );
    }

    pub fn send_raw(&self, raw: Value) {
        self.port.post(raw).expect("client endpoint dropped");
    }

    pub fn heartbeat(&self) {
        self.send_raw(encode(&Envelope::heartbeat()).unwrap());
    }

    /// Terminate the worker side of the channel
    pub fn close(&self) {
        self.port.close();
    }
}

/// RPC client wired to a scripted peer (requires a tokio runtime)
pub fn connected_client() -> (Arc<RpcClient>, WorkerPeer) {
    let (client_port, worker_port) = ChannelTransport::pair();
    let liveness = Arc::new(LivenessMonitor::new(
        DEFAULT_HEARTBEAT_INTERVAL,
        DEFAULT_MISS_LIMIT,
    ));
    let client = RpcClient::new(Arc::new(client_port), liveness);
    (client, WorkerPeer { port: worker_port })
}

pub fn connected_inference() -> (Arc<InferenceEngine>, WorkerPeer) {
    let (client, peer) = connected_client();
    (Arc::new(InferenceEngine::new(client)), peer)
}

pub fn connected_engine() -> (Arc<ChatSessionEngine>, WorkerPeer) {
    connected_engine_with(SessionStore::new())
}

pub fn connected_engine_with(store: SessionStore) -> (Arc<ChatSessionEngine>, WorkerPeer) {
    let (inference, peer) = connected_inference();
    let engine = ChatSessionEngine::new(inference, chat_config()).with_store(store);
    (Arc::new(engine), peer)
}

// ============================================================================
// Chat factories
// ============================================================================

/// Chat config with fixed values, independent of the environment
pub fn chat_config() -> ChatConfig {
    ChatConfig {
        model: "test-model".into(),
        provider: "WebLLM".into(),
        stream: true,
        generation: GenerationConfig {
            temperature: Some(0.7),
            top_p: Some(0.95),
            ..Default::default()
        },
        max_context_tokens: 4096,
        history_message_count: 64,
        enable_system_prompt: true,
        system_template: DEFAULT_SYSTEM_TEMPLATE.into(),
        request_timeout: Duration::from_secs(60),
    }
}

pub fn test_message(role: Role, content: &str) -> ChatMessage {
    ChatMessage::new(role, content)
}

/// Session holding the given messages in order
pub fn session_with(messages: &[(Role, &str)]) -> ChatSession {
    let mut session = ChatSession::new();
    session.messages = messages
        .iter()
        .map(|(role, content)| test_message(*role, content))
        .collect();
    session
}

/// Store whose only session holds the given messages
pub fn store_with(messages: &[(Role, &str)]) -> SessionStore {
    SessionStore::from_sessions(vec![session_with(messages)], 0)
}

/// Poll `check` until it holds, failing the test after a timeout
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(PEER_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
