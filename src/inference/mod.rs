//! Inference engine facade: typed surface over the worker RPC client
//!
//! Translates domain calls (`reload`, chat completions, `interrupt`, ...) into
//! request kinds. Completions are exposed as a [`CompletionStream`] of ordered
//! [`CompletionEvent`]s ending in exactly one `Finished` or `Failed`;
//! [`CompletionCallbacks`] adapts that stream to callback-style consumers.
//! The facade holds no conversation state.

mod stream;

pub use stream::{CompletionEvent, CompletionStream};

use crate::error::{ChatError, Result};
use crate::protocol::*;
use crate::rpc::{RpcClient, StreamItem};
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use stream::CompletionMode;
use tracing::{debug, info};

/// Per-request generation settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionConfig {
    pub model: Option<String>,
    pub stream: bool,
    pub generation: GenerationConfig,
}

/// Callback-style consumer of a completion.
///
/// `on_finish` and `on_error` are mutually exclusive and called exactly once.
pub trait CompletionCallbacks: Send {
    fn on_chunk(&mut self, _delta: &str) {}
    fn on_finish(&mut self, text: &str);
    fn on_error(&mut self, error: &ChatError);
}

/// Drive a completion stream into callbacks
pub async fn drive_callbacks<C: CompletionCallbacks + ?Sized>(
    mut stream: CompletionStream,
    callbacks: &mut C,
) {
    while let Some(event) = stream.next().await {
        match event {
            CompletionEvent::Delta(delta) => callbacks.on_chunk(&delta),
            CompletionEvent::Finished(text) => {
                callbacks.on_finish(&text);
                return;
            }
            CompletionEvent::Failed(err) => {
                callbacks.on_error(&err);
                return;
            }
        }
    }
}

pub struct InferenceEngine {
    rpc: Arc<RpcClient>,
    /// Correlation id of the generation currently in flight, if any
    current_generation: Arc<Mutex<Option<String>>>,
    loaded_model: Mutex<Option<String>>,
}

impl InferenceEngine {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            rpc,
            current_generation: Arc::new(Mutex::new(None)),
            loaded_model: Mutex::new(None),
        }
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    fn loaded(&self) -> MutexGuard<'_, Option<String>> {
        self.loaded_model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Model id of the last successful reload
    pub fn loaded_model(&self) -> Option<String> {
        self.loaded().clone()
    }

    /// Correlation id of the in-flight generation
    pub fn current_generation(&self) -> Option<String> {
        self.current_generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Load `model_id` in the worker, reporting fractional progress.
    ///
    /// Progress handed to `on_progress` never decreases within one reload.
    pub async fn reload<F>(
        &self,
        model_id: &str,
        chat_opts: Option<Value>,
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(&InitProgressReport),
    {
        info!(model = %model_id, "Reloading model");
        let mut stream = self.rpc.call_streaming(Payload::Reload(ReloadParams {
            model_id: model_id.to_string(),
            chat_opts,
        }))?;

        let mut last = 0.0_f64;
        while let Some(item) = stream.next().await {
            match item {
                StreamItem::Chunk(Payload::InitProgressCallback(mut report)) => {
                    report.progress = report.progress.clamp(0.0, 1.0).max(last);
                    last = report.progress;
                    on_progress(&report);
                }
                StreamItem::Chunk(other) => {
                    debug!(kind = %other.kind(), "Ignoring unexpected chunk during reload");
                }
                StreamItem::Done(outcome) => {
                    outcome?;
                    *self.loaded() = Some(model_id.to_string());
                    info!(model = %model_id, "Model loaded");
                    return Ok(());
                }
            }
        }
        Err(ChatError::TransportClosed)
    }

    /// Start a chat completion. Failures are delivered as a `Failed` event,
    /// never returned directly.
    pub fn chat_completion(
        &self,
        messages: Vec<RequestMessage>,
        config: &CompletionConfig,
    ) -> CompletionStream {
        let request = ChatCompletionRequest {
            messages,
            model: config.model.clone(),
            stream: config.stream,
            generation: config.generation.clone(),
        };
        if config.stream {
            self.start(
                Payload::ChatCompletionStreamInit(ChatCompletionParams { request }),
                CompletionMode::Chat,
            )
        } else {
            self.start(
                Payload::ChatCompletionNonStreaming(ChatCompletionParams { request }),
                CompletionMode::NonStreaming,
            )
        }
    }

    /// Legacy single-shot generation from a raw prompt
    pub fn generate(&self, input: &str, gen_config: Option<GenerationConfig>) -> CompletionStream {
        self.start(
            Payload::Generate(GenerateParams {
                input: input.to_string(),
                stream_interval: Some(1),
                gen_config,
            }),
            CompletionMode::Generate,
        )
    }

    /// Streaming variant of [`Self::chat_completion`] driving callbacks
    pub async fn chat_completion_with_callbacks<C: CompletionCallbacks + ?Sized>(
        &self,
        messages: Vec<RequestMessage>,
        config: &CompletionConfig,
        callbacks: &mut C,
    ) {
        drive_callbacks(self.chat_completion(messages, config), callbacks).await
    }

    fn start(&self, payload: Payload, mode: CompletionMode) -> CompletionStream {
        match self.rpc.call_streaming(payload) {
            Ok(call) => {
                let id = call.correlation_id().to_string();
                debug!(correlation_id = %id, "Generation started");
                *self
                    .current_generation
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id);
                CompletionStream::new(call, mode, self.current_generation.clone())
            }
            Err(e) => CompletionStream::failed(e),
        }
    }

    /// Interrupt the outstanding generation; no-op when nothing is running
    pub fn interrupt(&self) -> Result<()> {
        match self.current_generation() {
            Some(id) => self.rpc.cancel(&id),
            None => {
                debug!("Interrupt requested with no generation in flight");
                Ok(())
            }
        }
    }

    /// Interrupt the generation started with `correlation_id`, whether or not
    /// it is the most recent one
    pub fn interrupt_generation(&self, correlation_id: &str) -> Result<()> {
        debug!(correlation_id = %correlation_id, "Interrupting generation");
        self.rpc.cancel(correlation_id)
    }

    pub async fn reset_chat(&self, keep_stats: bool) -> Result<()> {
        self.rpc
            .call(Payload::ResetChat(ResetChatParams { keep_stats }))
            .await
            .map(|_| ())
    }

    pub async fn unload(&self) -> Result<()> {
        self.rpc.call(Payload::Unload).await?;
        *self.loaded() = None;
        Ok(())
    }

    /// Human-readable runtime statistics (prefill/decode speed)
    pub async fn runtime_stats_text(&self) -> Result<String> {
        let value = self.rpc.call(Payload::RuntimeStatsText).await?;
        Ok(match value {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }
}
