//! Chat configuration

use crate::inference::CompletionConfig;
use crate::protocol::GenerationConfig;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "Llama-3.1-8B-Instruct-q4f32_1-MLC";
pub const DEFAULT_PROVIDER: &str = "WebLLM";
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 4096;
pub const DEFAULT_HISTORY_MESSAGE_COUNT: usize = 64;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.95;

/// Default system template; `{{provider}}`, `{{model}}` and `{{time}}` are
/// substituted when the prompt context is built
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You are an AI assistant running locally in the user's browser.
Provider: {{provider}}
Model: {{model}}
Current time: {{time}}
Answer concisely and use markdown for code.";

/// Configuration for the chat session engine
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Model id recorded on assistant messages and sent with each request
    pub model: String,
    /// Engine label substituted for `{{provider}}`
    pub provider: String,
    /// Use streamed completions
    pub stream: bool,
    pub generation: GenerationConfig,
    /// Token budget for the prompt context
    pub max_context_tokens: usize,
    /// Maximum number of history messages sent per turn
    pub history_message_count: usize,
    pub enable_system_prompt: bool,
    pub system_template: String,
    /// Age after which a message still marked streaming is considered stale
    pub request_timeout: Duration,
}

impl ChatConfig {
    /// Create config from environment, falling back to defaults on missing or
    /// unparsable values
    pub fn from_env() -> Self {
        Self {
            model: std::env::var("WEBLLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            provider: DEFAULT_PROVIDER.into(),
            stream: std::env::var("CHAT_STREAM")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            generation: GenerationConfig {
                temperature: Some(DEFAULT_TEMPERATURE),
                top_p: Some(DEFAULT_TOP_P),
                ..Default::default()
            },
            max_context_tokens: std::env::var("CHAT_MAX_CONTEXT_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_CONTEXT_TOKENS),
            history_message_count: std::env::var("CHAT_HISTORY_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_HISTORY_MESSAGE_COUNT),
            enable_system_prompt: true,
            system_template: DEFAULT_SYSTEM_TEMPLATE.into(),
            request_timeout: Duration::from_millis(
                std::env::var("CHAT_REQUEST_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
        }
    }

    /// Generation settings for one completion request
    pub fn completion_config(&self) -> CompletionConfig {
        CompletionConfig {
            model: Some(self.model.clone()),
            stream: self.stream,
            generation: self.generation.clone(),
        }
    }

    /// Request timeout as a chrono duration for timestamp arithmetic
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.request_timeout)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(DEFAULT_REQUEST_TIMEOUT_MS as i64))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
