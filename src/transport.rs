//! Transport: one-way asynchronous channels into and out of the worker
//!
//! The host platform owns the real message port; the core only needs to post
//! raw JSON messages and pull inbound ones in delivery order.

use crate::error::{ChatError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::RwLock;
use tokio::sync::{mpsc, Mutex};

/// Bidirectional message port to the worker.
///
/// `post` never blocks. `next_message` yields inbound messages in the order the
/// peer sent them and returns `None` once the channel is closed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post a raw message to the other side
    fn post(&self, message: Value) -> Result<()>;

    /// Wait for the next raw message from the other side
    async fn next_message(&self) -> Option<Value>;

    /// Close the outbound direction; the peer observes end-of-stream
    fn close(&self);
}

/// In-process transport backed by a pair of unbounded tokio channels
pub struct ChannelTransport {
    outbound: RwLock<Option<mpsc::UnboundedSender<Value>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl ChannelTransport {
    /// Create two connected endpoints: what one posts, the other receives
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                outbound: RwLock::new(Some(a_tx)),
                inbound: Mutex::new(b_rx),
            },
            ChannelTransport {
                outbound: RwLock::new(Some(b_tx)),
                inbound: Mutex::new(a_rx),
            },
        )
    }

    /// Whether the outbound side can still deliver
    pub fn is_open(&self) -> bool {
        self.outbound
            .read()
            .map(|tx| tx.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn post(&self, message: Value) -> Result<()> {
        let guard = self.outbound.read().map_err(|_| ChatError::TransportClosed)?;
        match guard.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| ChatError::TransportClosed),
            None => Err(ChatError::TransportClosed),
        }
    }

    async fn next_message(&self) -> Option<Value> {
        self.inbound.lock().await.recv().await
    }

    fn close(&self) {
        if let Ok(mut guard) = self.outbound.write() {
            guard.take();
        }
    }
}
