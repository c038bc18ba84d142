//! Model runtimes executed by the worker host

use crate::error::{ChatError, Result};
use crate::protocol::{GenerationConfig, InitProgressReport, RequestMessage, Role};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Opaque model runtime driven by the worker host.
///
/// Tokenization and execution are the runtime's business; the host only sees
/// progress reports and generated text pieces.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Load `model_id`, reporting progress through `progress`
    async fn load(
        &self,
        model_id: &str,
        progress: &(dyn Fn(InitProgressReport) + Send + Sync),
    ) -> Result<()>;

    /// Generate a reply to `messages` as ordered text pieces
    async fn complete(
        &self,
        messages: &[RequestMessage],
        config: &GenerationConfig,
    ) -> Result<Vec<String>>;

    fn reset(&self, keep_stats: bool);

    fn unload(&self);

    fn stats_text(&self) -> String;

    fn loaded_model(&self) -> Option<String>;
}

/// Deterministic runtime answering "You said: <last user message>" word by
/// word. Scripted replies, when queued, are used first.
///
/// # Example
///
/// ```rust
/// use llm_worker_chat::protocol::{GenerationConfig, RequestMessage, Role};
/// use llm_worker_chat::worker::{EchoRuntime, ModelRuntime};
///
/// # tokio_test::block_on(async {
/// let runtime = EchoRuntime::preloaded("echo-model");
/// let messages = [RequestMessage::new(Role::User, "hello world")];
/// let pieces = runtime
///     .complete(&messages, &GenerationConfig::default())
///     .await
///     .unwrap();
/// assert_eq!(pieces, vec!["You ", "said: ", "hello ", "world"]);
///
/// runtime.push_reply(["Hi", " there"]);
/// let pieces = runtime
///     .complete(&messages, &GenerationConfig::default())
///     .await
///     .unwrap();
/// assert_eq!(pieces.concat(), "Hi there");
/// # });
/// ```
#[derive(Debug)]
pub struct EchoRuntime {
    loaded: Mutex<Option<String>>,
    scripted: Mutex<VecDeque<Vec<String>>>,
    load_steps: usize,
    generated_tokens: AtomicUsize,
    completions: AtomicUsize,
}

impl EchoRuntime {
    pub fn new() -> Self {
        Self {
            loaded: Mutex::new(None),
            scripted: Mutex::new(VecDeque::new()),
            load_steps: 4,
            generated_tokens: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
        }
    }

    /// A runtime that starts with `model_id` already loaded
    pub fn preloaded(model_id: &str) -> Self {
        let runtime = Self::new();
        *runtime.lock_loaded() = Some(model_id.to_string());
        runtime
    }

    /// Queue a reply returned as-is by the next completion
    pub fn push_reply<I, S>(&self, pieces: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scripted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(pieces.into_iter().map(Into::into).collect());
    }

    /// Number of completions served so far
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    fn lock_loaded(&self) -> MutexGuard<'_, Option<String>> {
        self.loaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn echo(messages: &[RequestMessage]) -> Vec<String> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        format!("You said: {}", last)
            .split_inclusive(' ')
            .map(str::to_string)
            .collect()
    }
}

impl Default for EchoRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelRuntime for EchoRuntime {
    async fn load(
        &self,
        model_id: &str,
        progress: &(dyn Fn(InitProgressReport) + Send + Sync),
    ) -> Result<()> {
        if model_id.trim().is_empty() {
            return Err(ChatError::worker("Model id must not be empty"));
        }
        for step in 1..=self.load_steps {
            progress(InitProgressReport {
                progress: step as f64 / self.load_steps as f64,
                time_elapsed: step as f64 * 0.1,
                text: format!("Loading {} [{}/{}]", model_id, step, self.load_steps),
            });
            tokio::task::yield_now().await;
        }
        *self.lock_loaded() = Some(model_id.to_string());
        Ok(())
    }

    async fn complete(
        &self,
        messages: &[RequestMessage],
        _config: &GenerationConfig,
    ) -> Result<Vec<String>> {
        if self.lock_loaded().is_none() {
            return Err(ChatError::worker("Model not loaded"));
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        let pieces = scripted.unwrap_or_else(|| Self::echo(messages));
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.generated_tokens
            .fetch_add(pieces.len(), Ordering::SeqCst);
        Ok(pieces)
    }

    fn reset(&self, keep_stats: bool) {
        if !keep_stats {
            self.generated_tokens.store(0, Ordering::SeqCst);
        }
    }

    fn unload(&self) {
        *self.lock_loaded() = None;
    }

    fn stats_text(&self) -> String {
        format!(
            "decode: {} tokens over {} completions",
            self.generated_tokens.load(Ordering::SeqCst),
            self.completions.load(Ordering::SeqCst)
        )
    }

    fn loaded_model(&self) -> Option<String> {
        self.lock_loaded().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_echo_splits_words() {
        let runtime = EchoRuntime::preloaded("echo");
        let pieces = runtime
            .complete(
                &[RequestMessage::new(Role::User, "Hello world")],
                &GenerationConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(pieces, vec!["You ", "said: ", "Hello ", "world"]);
        assert_eq!(pieces.concat(), "You said: Hello world");
    }

    #[tokio::test]
    async fn test_requires_loaded_model() {
        let runtime = EchoRuntime::new();
        let err = runtime
            .complete(&[], &GenerationConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::worker("Model not loaded"));
    }

    #[tokio::test]
    async fn test_load_reports_increasing_progress() {
        let runtime = EchoRuntime::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        runtime
            .load("echo", &move |report: InitProgressReport| {
                sink.lock().unwrap().push(report.progress)
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(runtime.loaded_model().as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_scripted_reply_first() {
        let runtime = EchoRuntime::preloaded("echo");
        runtime.push_reply(["Hi", " there"]);
        let messages = [RequestMessage::new(Role::User, "Hello")];
        let config = GenerationConfig::default();
        assert_eq!(
            runtime.complete(&messages, &config).await.unwrap(),
            vec!["Hi", " there"]
        );
        assert_eq!(
            runtime.complete(&messages, &config).await.unwrap().concat(),
            "You said: Hello"
        );
        assert_eq!(runtime.completions(), 2);
    }
}
