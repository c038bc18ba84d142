//! Session store: the sessions plus which one is current
//!
//! Pure state container. The chat session engine is its only writer; the
//! rendering layer reads snapshots. The whole store is the persisted blob.

use super::types::ChatSession;
use crate::error::{ChatError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStore {
    sessions: Vec<ChatSession>,
    current_session_index: usize,
}

impl SessionStore {
    /// A store holding one empty session
    pub fn new() -> Self {
        Self {
            sessions: vec![ChatSession::new()],
            current_session_index: 0,
        }
    }

    /// Build a store from loaded sessions; never leaves the store empty
    pub fn from_sessions(sessions: Vec<ChatSession>, current: usize) -> Self {
        let mut store = Self {
            sessions,
            current_session_index: current,
        };
        store.normalize();
        store
    }

    /// Restore the invariants after deserialization
    pub fn normalize(&mut self) {
        if self.sessions.is_empty() {
            self.sessions.push(ChatSession::new());
        }
        if self.current_session_index >= self.sessions.len() {
            self.current_session_index = self.sessions.len() - 1;
        }
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_session_index
    }

    pub fn current(&self) -> &ChatSession {
        &self.sessions[self.current_session_index]
    }

    pub fn current_mut(&mut self) -> &mut ChatSession {
        &mut self.sessions[self.current_session_index]
    }

    pub fn session(&self, session_id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    pub fn session_mut(&mut self, session_id: &str) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|s| s.id == session_id)
    }

    /// Insert a fresh session at the top and make it current
    pub fn new_session(&mut self) -> &ChatSession {
        self.sessions.insert(0, ChatSession::new());
        self.current_session_index = 0;
        &self.sessions[0]
    }

    pub fn select(&mut self, index: usize) -> Result<&ChatSession> {
        if index >= self.sessions.len() {
            return Err(ChatError::SessionNotFound(format!("index {}", index)));
        }
        self.current_session_index = index;
        Ok(&self.sessions[index])
    }

    /// Move the current index by `delta`, wrapping around both ends
    pub fn next(&mut self, delta: isize) -> &ChatSession {
        let len = self.sessions.len() as isize;
        let index = (self.current_session_index as isize + delta).rem_euclid(len);
        self.current_session_index = index as usize;
        &self.sessions[self.current_session_index]
    }

    /// Delete the session at `index`.
    ///
    /// Deleting the only session replaces it with a fresh one. The current
    /// index keeps pointing at the same session when possible.
    pub fn delete(&mut self, index: usize) -> Result<ChatSession> {
        if index >= self.sessions.len() {
            return Err(ChatError::SessionNotFound(format!("index {}", index)));
        }
        let removed = self.sessions.remove(index);
        if self.sessions.is_empty() {
            self.sessions.push(ChatSession::new());
            self.current_session_index = 0;
        } else if index < self.current_session_index
            || self.current_session_index >= self.sessions.len()
        {
            self.current_session_index = self.current_session_index.saturating_sub(1);
        }
        Ok(removed)
    }

    /// Reconcile stale streaming messages in every session.
    /// Returns `(session id, messages changed)` for each session that changed.
    pub fn reconcile_stale(
        &mut self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Vec<(String, usize)> {
        self.sessions
            .iter_mut()
            .filter_map(|s| {
                let changed = s.reconcile_stale(now, timeout);
                (changed > 0).then(|| (s.id.clone(), changed))
            })
            .collect()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
