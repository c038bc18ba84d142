//! Session store persistence
//!
//! The store is an opaque serializable blob to this layer: `load` returns the
//! last saved snapshot (or nothing), `save` replaces it.

use crate::chat::SessionStore;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const APP_DIR: &str = ".llm-worker-chat";
const STORE_FILE: &str = "sessions.json";

/// Default snapshot location: `~/.llm-worker-chat/sessions.json`
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(STORE_FILE)
}

#[async_trait]
pub trait SessionPersistence: Send + Sync {
    /// Last saved snapshot, `None` when nothing was saved yet
    async fn load(&self) -> Result<Option<SessionStore>>;

    async fn save(&self, store: &SessionStore) -> Result<()>;
}

/// Snapshot stored as pretty JSON in a single file
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| STORE_FILE.to_string());
        self.path.with_file_name(format!(".{}.tmp", name))
    }
}

impl Default for JsonFilePersistence {
    fn default() -> Self {
        Self::new(default_store_path())
    }
}

#[async_trait]
impl SessionPersistence for JsonFilePersistence {
    async fn load(&self) -> Result<Option<SessionStore>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No session snapshot yet");
                return Ok(None);
            }
            Err(e) => {
                return Err(ChatError::persistence(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let mut store: SessionStore = serde_json::from_str(&content).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Corrupt session snapshot");
            ChatError::persistence(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;
        store.normalize();
        info!(path = %self.path.display(), sessions = store.len(), "Loaded session snapshot");
        Ok(Some(store))
    }

    async fn save(&self, store: &SessionStore) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(store)?;

        // write then rename so a crash never leaves a truncated snapshot
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, json).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), "Saved session snapshot");
        Ok(())
    }
}

/// In-memory blob, used by tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blob: Mutex<Option<String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the blob with an existing store
    pub fn with_store(store: &SessionStore) -> Result<Self> {
        Ok(Self {
            blob: Mutex::new(Some(serde_json::to_string(store)?)),
        })
    }

    /// Raw saved blob, if any
    pub async fn blob(&self) -> Option<String> {
        self.blob.lock().await.clone()
    }
}

#[async_trait]
impl SessionPersistence for MemoryPersistence {
    async fn load(&self) -> Result<Option<SessionStore>> {
        match self.blob.lock().await.as_deref() {
            Some(blob) => {
                let mut store: SessionStore = serde_json::from_str(blob)?;
                store.normalize();
                Ok(Some(store))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, store: &SessionStore) -> Result<()> {
        *self.blob.lock().await = Some(serde_json::to_string(store)?);
        Ok(())
    }
}
