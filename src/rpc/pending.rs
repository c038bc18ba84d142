//! Pending request table: explicit correlation of outbound calls to replies

use crate::error::{ChatError, Result};
use crate::protocol::{Payload, RequestKind};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Item delivered to a streaming call, in worker emission order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// An intermediate delivery (stream chunk or progress report)
    Chunk(Payload),
    /// The terminal `return` (Ok) or `throw` (Err); always the last item
    Done(Result<Value>),
}

/// Where the outcome of a pending request goes
#[derive(Debug)]
pub enum Responder {
    Single(oneshot::Sender<Result<Value>>),
    Stream(mpsc::UnboundedSender<StreamItem>),
    /// Fire-and-forget requests (interrupts); replies are absorbed
    Detached,
}

#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub kind: RequestKind,
    pub issued_at: Instant,
    pub responder: Responder,
}

impl PendingRequest {
    pub fn new(correlation_id: impl Into<String>, kind: RequestKind, responder: Responder) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind,
            issued_at: Instant::now(),
            responder,
        }
    }

    /// Forward an intermediate delivery. Returns false if this request does
    /// not accept chunks.
    pub fn deliver_chunk(&self, payload: Payload) -> bool {
        match &self.responder {
            Responder::Stream(tx) => {
                // receiver gone means the caller stopped listening; the
                // terminal envelope still clears the entry
                let _ = tx.send(StreamItem::Chunk(payload));
                true
            }
            Responder::Single(_) | Responder::Detached => false,
        }
    }

    /// Consume the request with its terminal outcome
    pub fn settle(self, outcome: Result<Value>) {
        match self.responder {
            Responder::Single(tx) => {
                let _ = tx.send(outcome);
            }
            Responder::Stream(tx) => {
                let _ = tx.send(StreamItem::Done(outcome));
            }
            Responder::Detached => {}
        }
    }
}

/// Table of in-flight requests keyed by correlation id.
///
/// Once closed, no new request can be registered; closing drains every entry.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    closed: bool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Fails if the table is closed or the id is in use.
    pub fn insert(&mut self, request: PendingRequest) -> Result<()> {
        if self.closed {
            return Err(ChatError::TransportClosed);
        }
        if self.entries.contains_key(&request.correlation_id) {
            return Err(ChatError::MalformedEnvelope(format!(
                "correlation id {} already pending",
                request.correlation_id
            )));
        }
        self.entries.insert(request.correlation_id.clone(), request);
        Ok(())
    }

    pub fn get(&self, correlation_id: &str) -> Option<&PendingRequest> {
        self.entries.get(correlation_id)
    }

    pub fn remove(&mut self, correlation_id: &str) -> Option<PendingRequest> {
        self.entries.remove(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Ids currently awaiting a terminal envelope
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Close the table and reject every pending request with `TransportClosed`.
    /// Returns how many requests were rejected.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let drained: Vec<PendingRequest> = self.entries.drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for request in drained {
            request.settle(Err(ChatError::TransportClosed));
        }
        count
    }
}
