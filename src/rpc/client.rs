//! RpcClient: awaitable calls over the fire-and-forget worker channel
//!
//! Architecture:
//! - Every call gets a fresh uuid-v4 correlation id and an entry in the
//!   [`PendingTable`]
//! - A single dispatch task reads inbound envelopes and routes them by id:
//!   chunks to the streaming caller, `return`/`throw` settle and remove the entry
//! - Heartbeats are routed to the [`LivenessMonitor`]
//! - When the transport closes, every pending request is rejected with
//!   `TransportClosed` and the worker is declared dead

use super::pending::{PendingRequest, PendingTable, Responder, StreamItem};
use crate::error::{ChatError, Result};
use crate::liveness::LivenessMonitor;
use crate::protocol::{decode, encode, Envelope, InterruptParams, Payload, RequestKind};
use crate::transport::Transport;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// State shared between the client handle and its dispatch task
struct Shared {
    pending: Mutex<PendingTable>,
    liveness: Arc<LivenessMonitor>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, envelope: Envelope) {
        let kind = envelope.kind();
        if kind == RequestKind::Heartbeat {
            self.liveness.record_heartbeat();
            return;
        }

        // decode guarantees an id on every other kind
        let Some(correlation_id) = envelope.correlation_id else {
            return;
        };

        let outcome = match envelope.payload {
            Payload::Return(value) => Ok(value),
            Payload::Throw(err) => Err(ChatError::WorkerReported {
                message: err.message,
                stack: err.stack,
            }),
            payload if kind.is_stream_chunk() => {
                self.route_chunk(&correlation_id, payload);
                return;
            }
            _ => {
                warn!(correlation_id = %correlation_id, kind = %kind, "Unexpected request envelope from worker");
                return;
            }
        };

        let Some(request) = self.table().remove(&correlation_id) else {
            debug!(correlation_id = %correlation_id, kind = %kind, "Terminal envelope for unknown request, dropping");
            return;
        };
        debug!(
            correlation_id = %correlation_id,
            request_kind = %request.kind,
            ok = outcome.is_ok(),
            "Request settled"
        );
        request.settle(outcome);
    }

    fn route_chunk(&self, correlation_id: &str, payload: Payload) {
        let kind = payload.kind();
        let table = self.table();
        match table.get(correlation_id) {
            Some(request) => {
                if !request.deliver_chunk(payload) {
                    debug!(correlation_id = %correlation_id, kind = %kind, "Chunk for non-streaming request, dropping");
                }
            }
            None => {
                debug!(correlation_id = %correlation_id, kind = %kind, "Chunk for unknown request, dropping");
            }
        }
    }

    fn close(&self) {
        let rejected = self.table().close();
        if rejected > 0 {
            error!(rejected, "Worker channel closed, rejecting pending requests");
        }
        self.liveness.mark_dead();
    }
}

/// Ordered stream of chunks for one streaming call, ending with
/// [`StreamItem::Done`]
pub struct CallStream {
    correlation_id: String,
    kind: RequestKind,
    inner: UnboundedReceiverStream<StreamItem>,
}

impl CallStream {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }
}

impl Stream for CallStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Correlating RPC client over a [`Transport`]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl RpcClient {
    /// Create the client and spawn its dispatch task (requires a tokio runtime)
    pub fn new(transport: Arc<dyn Transport>, liveness: Arc<LivenessMonitor>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTable::new()),
            liveness,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(Self::dispatch_loop(
            transport.clone(),
            shared.clone(),
            cancel.clone(),
        ));
        Arc::new(Self {
            transport,
            shared,
            cancel,
        })
    }

    async fn dispatch_loop(
        transport: Arc<dyn Transport>,
        shared: Arc<Shared>,
        cancel: CancellationToken,
    ) {
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RpcClient dispatch loop cancelled");
                    break;
                }
                raw = transport.next_message() => raw,
            };
            let Some(raw) = raw else {
                break;
            };
            match decode(&raw) {
                Ok(envelope) => shared.route(envelope),
                Err(e) => warn!(error = %e, "Dropping malformed envelope"),
            }
        }
        shared.close();
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.shared.liveness
    }

    pub fn is_closed(&self) -> bool {
        self.shared.table().is_closed()
    }

    /// Number of requests awaiting a terminal envelope
    pub fn pending_count(&self) -> usize {
        self.shared.table().len()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.shared.table().ids()
    }

    fn register(&self, kind: RequestKind, responder: Responder) -> Result<String> {
        let correlation_id = Uuid::new_v4().to_string();
        self.shared
            .table()
            .insert(PendingRequest::new(correlation_id.clone(), kind, responder))?;
        Ok(correlation_id)
    }

    fn post(&self, correlation_id: &str, payload: Payload) -> Result<()> {
        let kind = payload.kind();
        let raw = encode(&Envelope::new(correlation_id, payload))?;
        if let Err(e) = self.transport.post(raw) {
            self.shared.table().remove(correlation_id);
            return Err(e);
        }
        debug!(correlation_id = %correlation_id, kind = %kind, "Request sent");
        Ok(())
    }

    /// Issue a request and wait for its single `return`/`throw`
    pub async fn call(&self, payload: Payload) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let correlation_id = self.register(payload.kind(), Responder::Single(tx))?;
        self.post(&correlation_id, payload)?;
        rx.await.unwrap_or(Err(ChatError::TransportClosed))
    }

    /// Issue a request whose replies arrive as chunks before the terminal envelope
    pub fn call_streaming(&self, payload: Payload) -> Result<CallStream> {
        let kind = payload.kind();
        let (tx, rx) = mpsc::unbounded_channel();
        let correlation_id = self.register(kind, Responder::Stream(tx))?;
        self.post(&correlation_id, payload)?;
        Ok(CallStream {
            correlation_id,
            kind,
            inner: UnboundedReceiverStream::new(rx),
        })
    }

    /// Ask the worker to interrupt the generation behind `correlation_id`.
    ///
    /// Best-effort: the target request stays pending until the worker sends its
    /// own terminal envelope.
    pub fn cancel(&self, correlation_id: &str) -> Result<()> {
        let interrupt_id = self.register(RequestKind::InterruptGenerate, Responder::Detached)?;
        debug!(target = %correlation_id, "Sending interrupt");
        self.post(
            &interrupt_id,
            Payload::InterruptGenerate(InterruptParams {
                target_correlation_id: Some(correlation_id.to_string()),
            }),
        )
    }

    /// Post one heartbeat probe
    pub fn send_heartbeat(&self) -> Result<()> {
        self.transport.post(encode(&Envelope::heartbeat())?)
    }

    /// Start the periodic heartbeat probe feeding this client's liveness monitor
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        self.shared.liveness.spawn(
            move || transport.post(encode(&Envelope::heartbeat())?),
            self.cancel.child_token(),
        )
    }

    /// Stop dispatching, close the channel and reject whatever is pending
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.transport.close();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
