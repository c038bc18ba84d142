//! ChatSessionEngine: turns user actions into session store mutations and
//! inference calls
//!
//! Architecture:
//! - The engine is the single writer of the [`SessionStore`]; renderers read
//!   snapshots and follow [`StoreEvent`]s
//! - `submit` appends the user message and a streaming assistant placeholder
//!   under one write lock, so a concurrent second submit sees the session as
//!   streaming and is rejected
//! - Each turn is driven by a spawned task consuming the completion stream; the
//!   placeholder is finalized only by that task (`Finished` or `Failed`)
//! - `stop` only asks the facade to interrupt the current session's generation
//!   (by correlation id); the worker's terminal envelope finalizes the message
//!   through the normal path

use super::commands::ChatCommand;
use super::config::ChatConfig;
use super::context::build_prompt_context;
use super::store::SessionStore;
use super::types::{Attachment, ChatMessage, ChatSession};
use crate::error::{ChatError, Result};
use crate::events::{EventEmitter, StoreAction, StoreEvent};
use crate::inference::{CompletionEvent, CompletionStream, InferenceEngine};
use crate::persistence::SessionPersistence;
use crate::protocol::Role;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a submit did not start a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyInput,
    AlreadyStreaming,
}

/// A started assistant turn
#[derive(Debug)]
pub struct TurnHandle {
    pub session_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    /// Correlation id of the generation request, if it could be issued
    pub correlation_id: Option<String>,
    task: JoinHandle<()>,
}

impl TurnHandle {
    /// Wait until the assistant message has been finalized
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Turn task ended abnormally");
        }
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Started(TurnHandle),
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, SubmitOutcome::Started(_))
    }

    pub fn into_turn(self) -> Option<TurnHandle> {
        match self {
            SubmitOutcome::Started(turn) => Some(turn),
            SubmitOutcome::Rejected(_) => None,
        }
    }
}

/// Result of [`ChatSessionEngine::handle_input`]
#[derive(Debug)]
pub enum InputOutcome {
    Command(ChatCommand),
    Submitted(SubmitOutcome),
}

/// Turn state prepared under the store lock, launched after it is released
struct PreparedTurn {
    session_id: String,
    user_message_id: String,
    assistant_message_id: String,
    context: Vec<crate::protocol::RequestMessage>,
}

pub struct ChatSessionEngine {
    inference: Arc<InferenceEngine>,
    store: Arc<RwLock<SessionStore>>,
    config: ChatConfig,
    event_emitter: Option<Arc<dyn EventEmitter>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    /// Correlation id of the generation in flight, by session id
    active_turns: Mutex<HashMap<String, String>>,
}

impl ChatSessionEngine {
    pub fn new(inference: Arc<InferenceEngine>, config: ChatConfig) -> Self {
        Self {
            inference,
            store: Arc::new(RwLock::new(SessionStore::new())),
            config,
            event_emitter: None,
            persistence: None,
            active_turns: Mutex::new(HashMap::new()),
        }
    }

    /// Set the event emitter feeding the rendering layer
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    /// Set where the store snapshot is loaded from and saved to
    pub fn with_persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Start from an existing store instead of a fresh one
    pub fn with_store(self, mut store: SessionStore) -> Self {
        store.normalize();
        Self {
            store: Arc::new(RwLock::new(store)),
            ..self
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn inference(&self) -> &Arc<InferenceEngine> {
        &self.inference
    }

    fn active_turns(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.active_turns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the session's in-flight entry if it still belongs to this generation
    fn forget_turn(&self, session_id: &str, correlation_id: Option<&str>) {
        let mut active = self.active_turns();
        if correlation_id.is_some() && active.get(session_id).map(String::as_str) == correlation_id {
            active.remove(session_id);
        }
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(emitter) = &self.event_emitter {
            emitter.emit(event);
        }
    }

    async fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let snapshot = self.store.read().await.clone();
        if let Err(e) = persistence.save(&snapshot).await {
            warn!(error = %e, "Failed to persist session store");
        }
    }

    /// Copy of the whole store
    pub async fn snapshot(&self) -> SessionStore {
        self.store.read().await.clone()
    }

    pub async fn current_session(&self) -> ChatSession {
        self.store.read().await.current().clone()
    }

    // ========================================================================
    // Startup recovery
    // ========================================================================

    /// Load the persisted snapshot (if any) and reconcile stale messages.
    /// Returns the number of reconciled messages.
    pub async fn restore(&self) -> Result<usize> {
        if let Some(persistence) = &self.persistence {
            if let Some(store) = persistence.load().await? {
                *self.store.write().await = store;
            }
        }
        Ok(self.reconcile_stale().await)
    }

    /// Force messages left streaming past the request timeout (or already
    /// flagged as errors) out of the streaming state
    pub async fn reconcile_stale(&self) -> usize {
        let changed = self
            .store
            .write()
            .await
            .reconcile_stale(Utc::now(), self.config.stale_after());
        for (session_id, _) in &changed {
            self.emit(StoreEvent::new(StoreAction::Recovered, session_id));
        }
        let changed: usize = changed.iter().map(|(_, count)| count).sum();
        if changed > 0 {
            info!(messages = changed, "Reconciled stale streaming messages");
            self.persist().await;
        }
        changed
    }

    // ========================================================================
    // Turns
    // ========================================================================

    /// Submit user input to the current session
    pub async fn submit(
        self: &Arc<Self>,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<SubmitOutcome> {
        let prepared = {
            let mut store = self.store.write().await;
            match self.prepare_turn(&mut store, text, attachments) {
                Ok(prepared) => prepared,
                Err(reason) => {
                    debug!(reason = ?reason, "Submit rejected");
                    return Ok(SubmitOutcome::Rejected(reason));
                }
            }
        };
        Ok(SubmitOutcome::Started(self.launch(prepared)))
    }

    fn prepare_turn(
        &self,
        store: &mut SessionStore,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> std::result::Result<PreparedTurn, RejectReason> {
        if text.trim().is_empty() {
            return Err(RejectReason::EmptyInput);
        }
        let session = store.current_mut();
        if session.is_streaming() {
            return Err(RejectReason::AlreadyStreaming);
        }

        let user = ChatMessage::user(text, attachments);
        let user_message_id = user.id.clone();
        session.messages.push(user);

        let context = build_prompt_context(session, &self.config, Utc::now());
        debug!(
            session_id = %session.id,
            messages = context.messages.len(),
            tokens = context.estimated_tokens,
            evicted = context.evicted,
            "Prompt context built"
        );

        let model = self
            .inference
            .loaded_model()
            .unwrap_or_else(|| self.config.model.clone());
        let placeholder = ChatMessage::assistant_placeholder(model);
        let assistant_message_id = placeholder.id.clone();
        session.messages.push(placeholder);
        session.touch();

        let session_id = session.id.clone();
        self.emit(StoreEvent::new(StoreAction::MessageAppended, &session_id).with_message(&user_message_id));
        self.emit(
            StoreEvent::new(StoreAction::MessageAppended, &session_id)
                .with_message(&assistant_message_id),
        );

        Ok(PreparedTurn {
            session_id,
            user_message_id,
            assistant_message_id,
            context: context.messages,
        })
    }

    fn launch(self: &Arc<Self>, turn: PreparedTurn) -> TurnHandle {
        let stream = if self.inference.rpc().liveness().is_alive() {
            self.inference
                .chat_completion(turn.context, &self.config.completion_config())
        } else {
            CompletionStream::failed(ChatError::WorkerDead)
        };
        let correlation_id = stream.correlation_id().map(str::to_string);
        info!(
            session_id = %turn.session_id,
            message_id = %turn.assistant_message_id,
            correlation_id = ?correlation_id,
            "Assistant turn started"
        );

        if let Some(id) = &correlation_id {
            self.active_turns()
                .insert(turn.session_id.clone(), id.clone());
        }

        let engine = Arc::clone(self);
        let session_id = turn.session_id.clone();
        let message_id = turn.assistant_message_id.clone();
        let task = tokio::spawn(async move {
            engine.drive_turn(&session_id, &message_id, stream).await;
        });

        TurnHandle {
            session_id: turn.session_id,
            user_message_id: turn.user_message_id,
            assistant_message_id: turn.assistant_message_id,
            correlation_id,
            task,
        }
    }

    /// Apply completion events to the assistant message until the terminal one
    async fn drive_turn(&self, session_id: &str, message_id: &str, mut stream: CompletionStream) {
        let correlation_id = stream.correlation_id().map(str::to_string);
        while let Some(event) = stream.next().await {
            if event.is_terminal() {
                self.forget_turn(session_id, correlation_id.as_deref());
            }
            match event {
                CompletionEvent::Delta(delta) => {
                    let applied = self
                        .update_message(session_id, message_id, |m| m.content.push_str(&delta))
                        .await;
                    if applied {
                        self.emit(
                            StoreEvent::new(StoreAction::MessageDelta, session_id)
                                .with_message(message_id)
                                .with_payload(serde_json::json!({ "delta": delta })),
                        );
                    }
                }
                CompletionEvent::Finished(text) => {
                    self.update_message(session_id, message_id, |m| {
                        if !text.is_empty() {
                            m.content = text;
                        }
                        m.streaming = false;
                    })
                    .await;
                    debug!(session_id = %session_id, message_id = %message_id, "Assistant turn finished");
                    self.finalize(session_id, message_id, serde_json::Value::Null).await;
                    return;
                }
                CompletionEvent::Failed(err) => {
                    let recoverable = err.is_recoverable();
                    if recoverable {
                        warn!(
                            session_id = %session_id,
                            message_id = %message_id,
                            error = %err,
                            "Assistant turn failed"
                        );
                    } else {
                        error!(
                            session_id = %session_id,
                            message_id = %message_id,
                            error = %err,
                            "Assistant turn failed; worker must be restarted"
                        );
                    }
                    let rendered = err.format_for_display();
                    self.update_message(session_id, message_id, |m| {
                        if m.content.is_empty() {
                            m.content = rendered;
                        } else {
                            m.content = format!("{}\n\n{}", m.content, rendered);
                        }
                        m.is_error = true;
                        m.streaming = false;
                    })
                    .await;
                    self.finalize(
                        session_id,
                        message_id,
                        serde_json::json!({ "error": true, "recoverable": recoverable }),
                    )
                    .await;
                    return;
                }
            }
        }
    }

    async fn finalize(&self, session_id: &str, message_id: &str, payload: serde_json::Value) {
        self.emit(
            StoreEvent::new(StoreAction::MessageFinalized, session_id)
                .with_message(message_id)
                .with_payload(payload),
        );
        self.persist().await;
    }

    /// Mutate a message wherever its session is; false if either is gone
    async fn update_message<F>(&self, session_id: &str, message_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut ChatMessage),
    {
        let mut store = self.store.write().await;
        let Some(session) = store.session_mut(session_id) else {
            debug!(session_id = %session_id, "Session removed during generation");
            return false;
        };
        let Some(message) = session.message_mut(message_id) else {
            debug!(message_id = %message_id, "Message removed during generation");
            return false;
        };
        apply(message);
        session.touch();
        true
    }

    /// Interrupt the current session's generation. Message state is finalized
    /// when the worker answers, not here.
    pub async fn stop(&self) -> Result<()> {
        let session_id = self.store.read().await.current().id.clone();
        self.stop_session(&session_id)
    }

    /// Interrupt the generation running for `session_id`; no-op when that
    /// session has none, even if another session is streaming
    pub fn stop_session(&self, session_id: &str) -> Result<()> {
        let correlation_id = self.active_turns().get(session_id).cloned();
        match correlation_id {
            Some(id) => self.inference.interrupt_generation(&id),
            None => {
                debug!(session_id = %session_id, "Stop requested with no generation for session");
                Ok(())
            }
        }
    }

    /// Delete a message and its counterpart, then submit the user content again.
    ///
    /// For an assistant message the pair is the nearest preceding user message;
    /// for a user message it is the nearest following assistant message.
    pub async fn resend(self: &Arc<Self>, message_id: &str) -> Result<SubmitOutcome> {
        let prepared = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            if session.is_streaming() {
                return Ok(SubmitOutcome::Rejected(RejectReason::AlreadyStreaming));
            }
            let index = session
                .position(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;

            let (user_index, assistant_index) = match session.messages[index].role {
                Role::Assistant => (
                    session.messages[..index]
                        .iter()
                        .rposition(|m| m.role == Role::User),
                    Some(index),
                ),
                Role::User => (
                    Some(index),
                    session.messages[index + 1..]
                        .iter()
                        .position(|m| m.role == Role::Assistant)
                        .map(|offset| index + 1 + offset),
                ),
                Role::System => (None, None),
            };

            let Some(user_index) = user_index else {
                error!(session_id = %session.id, message_id = %message_id, "Resend target not found");
                return Err(ChatError::ResendTargetNotFound(message_id.to_string()));
            };

            let user = session.messages[user_index].clone();
            let mut removed = vec![user.id.clone()];
            if let Some(assistant_index) = assistant_index {
                removed.push(session.messages[assistant_index].id.clone());
            }
            for id in &removed {
                session.remove_message(id);
            }
            let session_id = session.id.clone();
            for id in &removed {
                self.emit(StoreEvent::new(StoreAction::MessageDeleted, &session_id).with_message(id));
            }

            match self.prepare_turn(&mut store, &user.content, user.file_infos) {
                Ok(prepared) => prepared,
                Err(reason) => return Ok(SubmitOutcome::Rejected(reason)),
            }
        };
        Ok(SubmitOutcome::Started(self.launch(prepared)))
    }

    // ========================================================================
    // Message mutations
    // ========================================================================

    /// Remove exactly the message with `message_id` from the current session
    pub async fn delete(&self, message_id: &str) -> Result<ChatMessage> {
        let (session_id, removed) = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            let removed = session
                .remove_message(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            (session.id.clone(), removed)
        };
        self.emit(StoreEvent::new(StoreAction::MessageDeleted, session_id).with_message(message_id));
        self.persist().await;
        Ok(removed)
    }

    /// Replace a message's content in place
    pub async fn edit(&self, message_id: &str, content: &str) -> Result<()> {
        let session_id = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            let message = session
                .message_mut(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            message.content = content.to_string();
            session.touch();
            session.id.clone()
        };
        self.emit(StoreEvent::new(StoreAction::MessageUpdated, session_id).with_message(message_id));
        self.persist().await;
        Ok(())
    }

    /// Toggle the clear-context boundary at `index`.
    ///
    /// Setting the boundary where it already is removes it; setting a new one
    /// also clears the memory prompt. Returns the resulting boundary.
    pub async fn set_clear_context_index(&self, index: usize) -> Option<usize> {
        let (session_id, boundary) = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            let index = index.min(session.messages.len());
            if session.clear_context_index == Some(index) {
                session.clear_context_index = None;
            } else {
                session.clear_context_index = Some(index);
                session.memory_prompt.clear();
            }
            session.touch();
            (session.id.clone(), session.clear_context_index)
        };
        self.emit(
            StoreEvent::new(StoreAction::ContextCleared, session_id)
                .with_payload(serde_json::json!({ "clearContextIndex": boundary })),
        );
        self.persist().await;
        boundary
    }

    /// Toggle the boundary at the current message count
    pub async fn toggle_clear_context(&self) -> Option<usize> {
        let len = self.store.read().await.current().messages.len();
        self.set_clear_context_index(len).await
    }

    /// Set the boundary at the current message count without toggling, so
    /// repeating it never brings the old history back
    pub async fn clear_context(&self) -> usize {
        let (session_id, boundary) = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            let boundary = session.messages.len();
            session.clear_context_index = Some(boundary);
            session.memory_prompt.clear();
            session.touch();
            (session.id.clone(), boundary)
        };
        self.emit(
            StoreEvent::new(StoreAction::ContextCleared, session_id)
                .with_payload(serde_json::json!({ "clearContextIndex": boundary })),
        );
        self.persist().await;
        boundary
    }

    /// Pin a copy of a message into every future prompt context of the
    /// current session. Pinning the same message twice keeps one copy.
    pub async fn pin_message(&self, message_id: &str) -> Result<()> {
        let session_id = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            let message = session
                .message(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            if session.pinned.iter().any(|m| m.id == message_id) {
                return Ok(());
            }
            let pinned = message.clone();
            session.pinned.push(pinned);
            session.touch();
            session.id.clone()
        };
        self.emit(
            StoreEvent::new(StoreAction::SessionUpdated, session_id)
                .with_message(message_id)
                .with_payload(serde_json::json!({ "pinned": true })),
        );
        self.persist().await;
        Ok(())
    }

    /// Remove a pinned message from the current session's context
    pub async fn unpin_message(&self, message_id: &str) -> Result<()> {
        let session_id = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            let before = session.pinned.len();
            session.pinned.retain(|m| m.id != message_id);
            if session.pinned.len() == before {
                return Err(ChatError::MessageNotFound(message_id.to_string()));
            }
            session.touch();
            session.id.clone()
        };
        self.emit(
            StoreEvent::new(StoreAction::SessionUpdated, session_id)
                .with_message(message_id)
                .with_payload(serde_json::json!({ "pinned": false })),
        );
        self.persist().await;
        Ok(())
    }

    pub async fn set_memory_prompt(&self, memory_prompt: &str) {
        let session_id = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            session.memory_prompt = memory_prompt.to_string();
            session.touch();
            session.id.clone()
        };
        self.emit(StoreEvent::new(StoreAction::SessionUpdated, session_id));
        self.persist().await;
    }

    // ========================================================================
    // Session management
    // ========================================================================

    pub async fn new_session(&self) -> ChatSession {
        let session = self.store.write().await.new_session().clone();
        self.emit(StoreEvent::new(StoreAction::SessionCreated, &session.id));
        self.persist().await;
        session
    }

    pub async fn select_session(&self, index: usize) -> Result<ChatSession> {
        let session = self.store.write().await.select(index)?.clone();
        self.emit(StoreEvent::new(StoreAction::SessionSelected, &session.id));
        self.persist().await;
        Ok(session)
    }

    /// Move to a neighbouring session, wrapping around
    pub async fn next_session(&self, delta: isize) -> ChatSession {
        let session = self.store.write().await.next(delta).clone();
        self.emit(StoreEvent::new(StoreAction::SessionSelected, &session.id));
        self.persist().await;
        session
    }

    pub async fn delete_session(&self, index: usize) -> Result<ChatSession> {
        let removed = self.store.write().await.delete(index)?;
        info!(session_id = %removed.id, "Session deleted");
        self.emit(StoreEvent::new(StoreAction::SessionDeleted, &removed.id));
        self.persist().await;
        Ok(removed)
    }

    pub async fn rename_topic(&self, topic: &str) {
        let session_id = {
            let mut store = self.store.write().await;
            let session = store.current_mut();
            session.topic = topic.to_string();
            session.touch();
            session.id.clone()
        };
        self.emit(
            StoreEvent::new(StoreAction::SessionUpdated, session_id)
                .with_payload(serde_json::json!({ "topic": topic })),
        );
        self.persist().await;
    }

    /// Run a `:` command or submit the input as a message
    pub async fn handle_input(self: &Arc<Self>, input: &str) -> Result<InputOutcome> {
        let Some(command) = ChatCommand::parse(input) else {
            return Ok(InputOutcome::Submitted(self.submit(input, Vec::new()).await?));
        };
        debug!(command = %command, "Running chat command");
        match command {
            ChatCommand::New => {
                self.new_session().await;
            }
            ChatCommand::Prev => {
                self.next_session(-1).await;
            }
            ChatCommand::Next => {
                self.next_session(1).await;
            }
            ChatCommand::Clear => {
                self.clear_context().await;
            }
            ChatCommand::Del => {
                let index = self.store.read().await.current_index();
                self.delete_session(index).await?;
            }
        }
        Ok(InputOutcome::Command(command))
    }
}

#[cfg(test)]
mod tests;
