//! LLM Worker Chat
//!
//! Client core for a chat application whose language model runs in an
//! isolated worker:
//! - Correlated request/response protocol over a message transport
//! - RPC client with streaming, cancellation and heartbeat liveness
//! - Inference facade mirroring the model engine API
//! - Chat session engine with prompt-context trimming and persistence

pub mod chat;
pub mod error;
pub mod events;
pub mod inference;
pub mod liveness;
pub mod persistence;
pub mod protocol;
pub mod rpc;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_helpers;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use chat::config::{
    DEFAULT_HISTORY_MESSAGE_COUNT, DEFAULT_MAX_CONTEXT_TOKENS, DEFAULT_MODEL,
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};
use chat::{ChatConfig, ChatSessionEngine};
use events::EventBus;
use inference::InferenceEngine;
use liveness::{LivenessMonitor, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MISS_LIMIT};
use persistence::SessionPersistence;
use protocol::{GenerationConfig, InitProgressReport};
use rpc::RpcClient;
use transport::{ChannelTransport, Transport};
use worker::{ModelRuntime, WorkerHost, WorkerOptions};

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub engine: EngineYamlConfig,
    pub chat: ChatYamlConfig,
    pub storage: StorageYamlConfig,
}

/// Model engine and worker link section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineYamlConfig {
    pub model: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_miss_limit: u32,
    /// Pause between streamed tokens of the in-process worker
    pub token_delay_ms: u64,
}

impl Default for EngineYamlConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            heartbeat_miss_limit: DEFAULT_MISS_LIMIT,
            token_delay_ms: 25,
        }
    }
}

/// Chat section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatYamlConfig {
    pub stream: bool,
    pub max_context_tokens: usize,
    pub history_message_count: usize,
    pub request_timeout_ms: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub enable_system_prompt: bool,
    /// Replaces the built-in system template when set
    pub system_template: Option<String>,
}

impl Default for ChatYamlConfig {
    fn default() -> Self {
        Self {
            stream: true,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            history_message_count: DEFAULT_HISTORY_MESSAGE_COUNT,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            enable_system_prompt: true,
            system_template: None,
        }
    }
}

/// Session storage section
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageYamlConfig {
    /// Snapshot file; `~/` expands to the home directory
    pub path: Option<String>,
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_limit: u32,
    pub token_delay: Duration,
    pub store_path: PathBuf,
    pub chat: ChatConfig,
}

impl Config {
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);

        let store_path = match std::env::var("CHAT_STORE_PATH").ok().or(yaml.storage.path) {
            Some(path) => expand_home(&path),
            None => persistence::default_store_path(),
        };

        let chat = ChatConfig {
            model: std::env::var("WEBLLM_MODEL").unwrap_or(yaml.engine.model),
            stream: env_parse("CHAT_STREAM").unwrap_or(yaml.chat.stream),
            generation: GenerationConfig {
                temperature: Some(yaml.chat.temperature),
                top_p: Some(yaml.chat.top_p),
                ..Default::default()
            },
            max_context_tokens: env_parse("CHAT_MAX_CONTEXT_TOKENS")
                .unwrap_or(yaml.chat.max_context_tokens),
            history_message_count: env_parse("CHAT_HISTORY_COUNT")
                .unwrap_or(yaml.chat.history_message_count),
            enable_system_prompt: yaml.chat.enable_system_prompt,
            system_template: yaml
                .chat
                .system_template
                .unwrap_or_else(|| chat::config::DEFAULT_SYSTEM_TEMPLATE.into()),
            request_timeout: Duration::from_millis(
                env_parse("CHAT_REQUEST_TIMEOUT_MS").unwrap_or(yaml.chat.request_timeout_ms),
            ),
            provider: chat::config::DEFAULT_PROVIDER.into(),
        };

        let heartbeat_miss_limit: u32 = env_parse("WEBLLM_HEARTBEAT_MISS_LIMIT")
            .unwrap_or(yaml.engine.heartbeat_miss_limit);
        if heartbeat_miss_limit == 0 {
            anyhow::bail!("heartbeat_miss_limit must be at least 1");
        }
        let heartbeat_interval = Duration::from_millis(
            env_parse("WEBLLM_HEARTBEAT_INTERVAL_MS").unwrap_or(yaml.engine.heartbeat_interval_ms),
        );
        if heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval_ms must be greater than 0");
        }

        Ok(Self {
            heartbeat_interval,
            heartbeat_miss_limit,
            token_delay: Duration::from_millis(yaml.engine.token_delay_ms),
            store_path,
            chat,
        })
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    pub fn model(&self) -> &str {
        &self.chat.model
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ============================================================================
// Application wiring
// ============================================================================

/// Fully wired client stack: RPC client with heartbeat, inference facade and
/// chat session engine publishing to an event bus
pub struct AppContext {
    pub config: Arc<Config>,
    pub rpc: Arc<RpcClient>,
    pub inference: Arc<InferenceEngine>,
    pub engine: Arc<ChatSessionEngine>,
    pub events: Arc<EventBus>,
    heartbeat: JoinHandle<()>,
    worker: Option<WorkerHost>,
}

impl AppContext {
    /// Wire the client stack on top of an already connected transport and
    /// restore persisted sessions
    pub async fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Result<Self> {
        let liveness = Arc::new(LivenessMonitor::new(
            config.heartbeat_interval,
            config.heartbeat_miss_limit,
        ));
        let rpc = RpcClient::new(transport, liveness);
        let heartbeat = rpc.start_heartbeat();
        let inference = Arc::new(InferenceEngine::new(rpc.clone()));
        let events = Arc::new(EventBus::default());
        let engine = Arc::new(
            ChatSessionEngine::new(inference.clone(), config.chat.clone())
                .with_event_emitter(events.clone())
                .with_persistence(persistence),
        );

        let reconciled = engine
            .restore()
            .await
            .context("Failed to restore chat sessions")?;
        if reconciled > 0 {
            tracing::info!(reconciled, "Recovered stale messages from previous run");
        }

        Ok(Self {
            config: Arc::new(config),
            rpc,
            inference,
            engine,
            events,
            heartbeat,
            worker: None,
        })
    }

    /// Start an in-process worker serving `runtime` and wire the client to it
    pub async fn in_process(
        config: Config,
        runtime: Arc<dyn ModelRuntime>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Result<Self> {
        let (client_port, worker_port) = ChannelTransport::pair();
        let worker = WorkerHost::spawn(
            Arc::new(worker_port),
            runtime,
            WorkerOptions {
                token_delay: config.token_delay,
                ..Default::default()
            },
        );
        let mut context = Self::with_transport(config, Arc::new(client_port), persistence).await?;
        context.worker = Some(worker);
        Ok(context)
    }

    /// Load the configured model, reporting monotonic progress
    pub async fn load_model<F>(&self, on_progress: F) -> Result<()>
    where
        F: FnMut(&InitProgressReport) + Send,
    {
        let model = self.config.model().to_string();
        self.inference
            .reload(&model, None, on_progress)
            .await
            .with_context(|| format!("Failed to load model {}", model))
    }

    pub fn worker(&self) -> Option<&WorkerHost> {
        self.worker.as_ref()
    }

    /// Stop the heartbeat, close the channel and terminate an in-process worker
    pub fn shutdown(&self) {
        self.heartbeat.abort();
        self.rpc.shutdown();
        if let Some(worker) = &self.worker {
            worker.shutdown();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
