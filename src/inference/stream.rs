//! Completion event stream built on top of a streaming RPC call

use crate::error::ChatError;
use crate::protocol::{ChatCompletion, Payload};
use crate::rpc::{CallStream, StreamItem};
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tracing::debug;

/// Ordered output of one completion
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    /// Newly generated text
    Delta(String),
    /// Terminal: the full response text
    Finished(String),
    /// Terminal: the generation failed
    Failed(ChatError),
}

impl CompletionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CompletionEvent::Delta(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionMode {
    Chat,
    Generate,
    NonStreaming,
}

/// Stream of [`CompletionEvent`]s; yields nothing after the terminal event
pub struct CompletionStream {
    correlation_id: Option<String>,
    source: Option<CallStream>,
    early_failure: Option<ChatError>,
    mode: CompletionMode,
    accumulated: String,
    /// Bytes already handed out as deltas
    emitted: usize,
    tracker: Option<Arc<Mutex<Option<String>>>>,
}

impl CompletionStream {
    pub(crate) fn new(
        call: CallStream,
        mode: CompletionMode,
        tracker: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            correlation_id: Some(call.correlation_id().to_string()),
            source: Some(call),
            early_failure: None,
            mode,
            accumulated: String::new(),
            emitted: 0,
            tracker: Some(tracker),
        }
    }

    /// A stream that only yields `Failed(error)`
    pub fn failed(error: ChatError) -> Self {
        Self {
            correlation_id: None,
            source: None,
            early_failure: Some(error),
            mode: CompletionMode::Chat,
            accumulated: String::new(),
            emitted: 0,
            tracker: None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Forget this generation in the facade's in-flight slot
    fn release(&mut self) {
        self.source = None;
        if let (Some(tracker), Some(id)) = (self.tracker.take(), self.correlation_id.as_ref()) {
            let mut current = tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.as_ref() == Some(id) {
                *current = None;
            }
        }
    }

    fn delta_from(&mut self, payload: Payload) -> Option<String> {
        let delta = match payload {
            Payload::ChatCompletionStreamNextChunk(chunk) => {
                let delta = chunk.delta_text().to_string();
                self.accumulated.push_str(&delta);
                delta
            }
            // Legacy progress carries the whole message so far. Only text past
            // what was already emitted is new; a rewrite of earlier text is
            // settled by the terminal message.
            Payload::GenerateProgressCallback(progress) => {
                let message = progress.current_message;
                if !message.starts_with(self.accumulated.as_str()) {
                    debug!(
                        correlation_id = ?self.correlation_id,
                        "Generate progress rewrote earlier text"
                    );
                }
                let mut from = self.emitted;
                while from < message.len() && !message.is_char_boundary(from) {
                    from += 1;
                }
                let delta = message.get(from..).unwrap_or_default().to_string();
                self.emitted = from;
                self.accumulated = message;
                delta
            }
            _ => return None,
        };
        self.emitted += delta.len();
        (!delta.is_empty()).then_some(delta)
    }

    fn finish(&self, value: Value) -> CompletionEvent {
        match self.mode {
            CompletionMode::NonStreaming => match value {
                Value::String(text) => CompletionEvent::Finished(text),
                other => match serde_json::from_value::<ChatCompletion>(other) {
                    Ok(completion) => CompletionEvent::Finished(completion.text().to_string()),
                    Err(e) => CompletionEvent::Failed(e.into()),
                },
            },
            CompletionMode::Chat | CompletionMode::Generate => match value {
                Value::String(text) if !text.is_empty() => CompletionEvent::Finished(text),
                _ => CompletionEvent::Finished(self.accumulated.clone()),
            },
        }
    }
}

impl Stream for CompletionStream {
    type Item = CompletionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(error) = this.early_failure.take() {
            return Poll::Ready(Some(CompletionEvent::Failed(error)));
        }
        loop {
            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };
            let polled = Pin::new(source).poll_next(cx);
            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(StreamItem::Chunk(payload))) => {
                    if let Some(delta) = this.delta_from(payload) {
                        return Poll::Ready(Some(CompletionEvent::Delta(delta)));
                    }
                }
                Poll::Ready(Some(StreamItem::Done(outcome))) => {
                    this.release();
                    let event = match outcome {
                        Ok(value) => this.finish(value),
                        Err(e) => CompletionEvent::Failed(e),
                    };
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(None) => {
                    this.release();
                    return Poll::Ready(Some(CompletionEvent::Failed(ChatError::TransportClosed)));
                }
            }
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.release();
    }
}
