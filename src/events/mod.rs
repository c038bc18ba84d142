//! Store change notifications
//!
//! This module provides:
//! - `StoreEvent`: typed events emitted after every session store mutation
//! - `EventBus`: broadcast channel feeding the read-only rendering layer

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{EventEmitter, StoreAction, StoreEvent};
