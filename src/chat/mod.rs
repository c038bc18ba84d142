//! Chat module: conversational state on top of the inference facade
//!
//! Owns sessions and messages, builds token-bounded prompt contexts and drives
//! one assistant turn per user submission.

pub mod commands;
pub mod config;
pub mod context;
pub mod engine;
pub mod store;
pub mod types;

pub use commands::ChatCommand;
pub use config::ChatConfig;
pub use engine::{ChatSessionEngine, InputOutcome, RejectReason, SubmitOutcome, TurnHandle};
pub use store::SessionStore;
pub use types::{Attachment, ChatMessage, ChatSession, ToolMessage};
