//! Worker side of the envelope protocol
//!
//! [`WorkerHost`] reads request envelopes from its end of a [`Transport`],
//! drives a [`ModelRuntime`] and answers with chunks and a terminal
//! `return`/`throw` carrying the request's correlation id. Long-running
//! requests (reload, generations) run in their own tasks so heartbeats and
//! interrupts are answered while they are in flight.

mod runtime;

pub use runtime::{EchoRuntime, ModelRuntime};

use crate::error::ChatError;
use crate::protocol::*;
use crate::transport::Transport;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Pause between streamed pieces
    pub token_delay: Duration,
    /// Echo heartbeat probes; disabled to simulate a hung worker
    pub answer_heartbeats: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            token_delay: Duration::from_millis(25),
            answer_heartbeats: true,
        }
    }
}

/// Throw message for a generation stopped before it produced any text
pub const GENERATION_INTERRUPTED: &str = "Generation interrupted";

/// State shared by the host loop and its request tasks
struct HostState {
    port: Arc<dyn Transport>,
    runtime: Arc<dyn ModelRuntime>,
    options: WorkerOptions,
    /// Running generations by correlation id
    generations: Mutex<HashMap<String, CancellationToken>>,
}

impl HostState {
    fn generations(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, envelope: Envelope) {
        let kind = envelope.kind();
        let result = encode(&envelope).and_then(|raw| self.port.post(raw));
        if let Err(e) = result {
            debug!(kind = %kind, error = %e, "Worker reply not delivered");
        }
    }

    fn reply(&self, correlation_id: &str, payload: Payload) {
        self.send(Envelope::new(correlation_id, payload));
    }

    fn settle(&self, correlation_id: &str, outcome: crate::error::Result<Value>) {
        let payload = match outcome {
            Ok(value) => Payload::Return(value),
            Err(ChatError::WorkerReported { message, stack }) => {
                Payload::Throw(WorkerErrorPayload { message, stack })
            }
            Err(other) => Payload::Throw(WorkerErrorPayload {
                message: other.to_string(),
                stack: None,
            }),
        };
        self.reply(correlation_id, payload);
    }

    fn start_generation(&self, correlation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.generations()
            .insert(correlation_id.to_string(), token.clone());
        token
    }

    fn finish_generation(&self, correlation_id: &str) {
        self.generations().remove(correlation_id);
    }

    fn interrupt(&self, target: Option<&str>) {
        let generations = self.generations();
        match target {
            Some(id) => match generations.get(id) {
                Some(token) => token.cancel(),
                None => debug!(target = %id, "Interrupt for a generation that is not running"),
            },
            None => generations.values().for_each(CancellationToken::cancel),
        }
    }

    /// Wait before the next piece; false when interrupted
    async fn pace(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.options.token_delay) => !token.is_cancelled(),
        }
    }

    fn model_name(&self) -> String {
        self.runtime.loaded_model().unwrap_or_default()
    }

    async fn reload(self: Arc<Self>, correlation_id: String, params: ReloadParams) {
        info!(model = %params.model_id, "Worker loading model");
        let progress = {
            let state = self.clone();
            let id = correlation_id.clone();
            move |report: InitProgressReport| {
                state.reply(&id, Payload::InitProgressCallback(report));
            }
        };
        let outcome = self
            .runtime
            .load(&params.model_id, &progress)
            .await
            .map(|_| Value::Null);
        self.settle(&correlation_id, outcome);
    }

    /// Settle an interrupted generation that produced no text as a throw, so
    /// the client marks the reply instead of finalizing an empty message
    fn settle_generation(
        &self,
        correlation_id: &str,
        token: &CancellationToken,
        outcome: crate::error::Result<(String, Value)>,
    ) {
        self.finish_generation(correlation_id);
        let outcome = outcome.and_then(|(text, value)| {
            if text.is_empty() && token.is_cancelled() {
                debug!(correlation_id = %correlation_id, "Generation interrupted before any output");
                Err(ChatError::worker(GENERATION_INTERRUPTED))
            } else {
                Ok(value)
            }
        });
        self.settle(correlation_id, outcome);
    }

    async fn stream_chat(
        self: Arc<Self>,
        correlation_id: String,
        params: ChatCompletionParams,
        token: CancellationToken,
    ) {
        let outcome = match self
            .runtime
            .complete(&params.request.messages, &params.request.generation)
            .await
        {
            Ok(pieces) => {
                let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
                let model = self.model_name();
                let mut text = String::new();
                for (index, piece) in pieces.into_iter().enumerate() {
                    if index > 0 && !self.pace(&token).await {
                        debug!(correlation_id = %correlation_id, "Generation interrupted");
                        break;
                    }
                    if token.is_cancelled() {
                        break;
                    }
                    self.reply(
                        &correlation_id,
                        Payload::ChatCompletionStreamNextChunk(ChatCompletionChunk::text(
                            &completion_id,
                            &model,
                            piece.as_str(),
                        )),
                    );
                    text.push_str(&piece);
                }
                Ok((text.clone(), Value::String(text)))
            }
            Err(e) => Err(e),
        };
        self.settle_generation(&correlation_id, &token, outcome);
    }

    async fn complete_once(
        self: Arc<Self>,
        correlation_id: String,
        params: ChatCompletionParams,
        token: CancellationToken,
    ) {
        let outcome = self
            .runtime
            .complete(&params.request.messages, &params.request.generation)
            .await
            .and_then(|pieces| {
                let text = if token.is_cancelled() {
                    String::new()
                } else {
                    pieces.concat()
                };
                let completion = ChatCompletion {
                    id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
                    model: self.model_name(),
                    choices: vec![CompletionChoice {
                        index: 0,
                        message: RequestMessage::new(Role::Assistant, text.clone()),
                        finish_reason: Some("stop".into()),
                    }],
                    usage: None,
                };
                Ok((text, serde_json::to_value(completion)?))
            });
        self.settle_generation(&correlation_id, &token, outcome);
    }

    async fn generate(
        self: Arc<Self>,
        correlation_id: String,
        params: GenerateParams,
        token: CancellationToken,
    ) {
        let messages = [RequestMessage::new(Role::User, params.input)];
        let config = params.gen_config.unwrap_or_default();
        let outcome = match self.runtime.complete(&messages, &config).await {
            Ok(pieces) => {
                let mut current_message = String::new();
                for (step, piece) in pieces.into_iter().enumerate() {
                    if step > 0 && !self.pace(&token).await {
                        break;
                    }
                    if token.is_cancelled() {
                        break;
                    }
                    current_message.push_str(&piece);
                    self.reply(
                        &correlation_id,
                        Payload::GenerateProgressCallback(GenerateProgress {
                            step: step as u32,
                            current_message: current_message.clone(),
                        }),
                    );
                }
                Ok((current_message.clone(), Value::String(current_message)))
            }
            Err(e) => Err(e),
        };
        self.settle_generation(&correlation_id, &token, outcome);
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let kind = envelope.kind();
        let Some(correlation_id) = envelope.correlation_id else {
            if kind == RequestKind::Heartbeat && self.options.answer_heartbeats {
                self.send(Envelope::heartbeat());
            }
            return;
        };

        match envelope.payload {
            Payload::Reload(params) => {
                tokio::spawn(self.clone().reload(correlation_id, params));
            }
            // Generations are registered before their task is spawned so an
            // interrupt handled by this loop right after always finds them
            Payload::ChatCompletionStreamInit(params) => {
                let token = self.start_generation(&correlation_id);
                tokio::spawn(self.clone().stream_chat(correlation_id, params, token));
            }
            Payload::ChatCompletionNonStreaming(params) => {
                let token = self.start_generation(&correlation_id);
                tokio::spawn(self.clone().complete_once(correlation_id, params, token));
            }
            Payload::Generate(params) => {
                let token = self.start_generation(&correlation_id);
                tokio::spawn(self.clone().generate(correlation_id, params, token));
            }
            Payload::InterruptGenerate(params) => {
                self.interrupt(params.target_correlation_id.as_deref());
                self.settle(&correlation_id, Ok(Value::Null));
            }
            Payload::ResetChat(params) => {
                self.runtime.reset(params.keep_stats);
                self.settle(&correlation_id, Ok(Value::Null));
            }
            Payload::Unload => {
                self.interrupt(None);
                self.runtime.unload();
                info!("Worker unloaded model");
                self.settle(&correlation_id, Ok(Value::Null));
            }
            Payload::RuntimeStatsText => {
                let stats = self.runtime.stats_text();
                self.settle(&correlation_id, Ok(Value::String(stats)));
            }
            other => {
                warn!(correlation_id = %correlation_id, kind = %other.kind(), "Worker ignoring non-request envelope");
            }
        }
    }
}

/// In-process worker serving one transport endpoint
pub struct WorkerHost {
    state: Arc<HostState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHost {
    /// Start serving `port` (requires a tokio runtime)
    pub fn spawn(
        port: Arc<dyn Transport>,
        runtime: Arc<dyn ModelRuntime>,
        options: WorkerOptions,
    ) -> Self {
        let state = Arc::new(HostState {
            port,
            runtime,
            options,
            generations: Mutex::new(HashMap::new()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::serve(state.clone(), cancel.clone()));
        Self {
            state,
            cancel,
            task,
        }
    }

    async fn serve(state: Arc<HostState>, cancel: CancellationToken) {
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                raw = state.port.next_message() => raw,
            };
            let Some(raw) = raw else {
                debug!("Worker port closed by client");
                break;
            };
            match decode(&raw) {
                Ok(envelope) => state.dispatch(envelope),
                Err(e) => warn!(error = %e, "Worker dropping malformed envelope"),
            }
        }
        state.interrupt(None);
        state.port.close();
    }

    /// Number of generations currently running
    pub fn active_generations(&self) -> usize {
        self.state.generations().len()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Terminate the worker; the client observes a closed channel
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.state.port.close();
    }
}

impl Drop for WorkerHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    async fn recv(port: &ChannelTransport) -> Envelope {
        let raw = tokio::time::timeout(Duration::from_secs(5), port.next_message())
            .await
            .expect("worker reply timed out")
            .expect("worker port closed");
        decode(&raw).unwrap()
    }

    fn host(runtime: EchoRuntime) -> (WorkerHost, ChannelTransport) {
        let (client, worker) = ChannelTransport::pair();
        let host = WorkerHost::spawn(
            Arc::new(worker),
            Arc::new(runtime),
            WorkerOptions {
                token_delay: Duration::from_millis(1),
                answer_heartbeats: true,
            },
        );
        (host, client)
    }

    fn stream_request(text: &str) -> Payload {
        Payload::ChatCompletionStreamInit(ChatCompletionParams {
            request: ChatCompletionRequest {
                messages: vec![RequestMessage::new(Role::User, text)],
                model: None,
                stream: true,
                generation: GenerationConfig::default(),
            },
        })
    }

    #[tokio::test]
    async fn test_heartbeat_echo() {
        let (_host, client) = host(EchoRuntime::new());
        client.post(encode(&Envelope::heartbeat()).unwrap()).unwrap();
        assert_eq!(recv(&client).await.kind(), RequestKind::Heartbeat);
    }

    #[tokio::test]
    async fn test_reload_streams_progress_then_returns() {
        let (_host, client) = host(EchoRuntime::new());
        let request = Envelope::new(
            "r1",
            Payload::Reload(ReloadParams {
                model_id: "echo".into(),
                chat_opts: None,
            }),
        );
        client.post(encode(&request).unwrap()).unwrap();

        let mut progress = Vec::new();
        loop {
            let envelope = recv(&client).await;
            assert_eq!(envelope.correlation_id.as_deref(), Some("r1"));
            match envelope.payload {
                Payload::InitProgressCallback(report) => progress.push(report.progress),
                Payload::Return(value) => {
                    assert_eq!(value, Value::Null);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(progress.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_stream_chunks_then_full_text() {
        let runtime = EchoRuntime::preloaded("echo");
        runtime.push_reply(["Hi", " there"]);
        let (host, client) = host(runtime);
        client
            .post(encode(&Envelope::new("g1", stream_request("Hello"))).unwrap())
            .unwrap();

        let mut deltas = Vec::new();
        loop {
            match recv(&client).await.payload {
                Payload::ChatCompletionStreamNextChunk(chunk) => {
                    deltas.push(chunk.delta_text().to_string())
                }
                Payload::Return(value) => {
                    assert_eq!(value, json!("Hi there"));
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(deltas, vec!["Hi", " there"]);
        assert_eq!(host.active_generations(), 0);
    }

    #[tokio::test]
    async fn test_generation_without_model_throws() {
        let (_host, client) = host(EchoRuntime::new());
        client
            .post(encode(&Envelope::new("g1", stream_request("Hello"))).unwrap())
            .unwrap();
        match recv(&client).await.payload {
            Payload::Throw(err) => assert_eq!(err.message, "Model not loaded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interrupt_returns_partial_text() {
        let runtime = EchoRuntime::preloaded("echo");
        runtime.push_reply(["Hi", " there", " friend"]);
        let (client, worker) = ChannelTransport::pair();
        let _host = WorkerHost::spawn(
            Arc::new(worker),
            Arc::new(runtime),
            WorkerOptions {
                token_delay: Duration::from_secs(30),
                answer_heartbeats: true,
            },
        );
        client
            .post(encode(&Envelope::new("g1", stream_request("Hello"))).unwrap())
            .unwrap();
        assert!(matches!(
            recv(&client).await.payload,
            Payload::ChatCompletionStreamNextChunk(_)
        ));

        let interrupt = Envelope::new(
            "i1",
            Payload::InterruptGenerate(InterruptParams {
                target_correlation_id: Some("g1".into()),
            }),
        );
        client.post(encode(&interrupt).unwrap()).unwrap();

        let mut terminals = HashMap::new();
        while terminals.len() < 2 {
            let envelope = recv(&client).await;
            terminals.insert(envelope.correlation_id.unwrap(), envelope.payload);
        }
        assert_eq!(terminals["g1"], Payload::Return(json!("Hi")));
        assert_eq!(terminals["i1"], Payload::Return(Value::Null));
    }

    fn interrupt_request(target: &str) -> Envelope {
        Envelope::new(
            "i1",
            Payload::InterruptGenerate(InterruptParams {
                target_correlation_id: Some(target.into()),
            }),
        )
    }

    /// Collect the terminal envelope of `g1` and `i1`, skipping chunks
    async fn terminals(client: &ChannelTransport) -> HashMap<String, Payload> {
        let mut terminals = HashMap::new();
        while terminals.len() < 2 {
            let envelope = recv(client).await;
            if matches!(envelope.payload, Payload::Return(_) | Payload::Throw(_)) {
                terminals.insert(envelope.correlation_id.unwrap(), envelope.payload);
            }
        }
        terminals
    }

    #[tokio::test]
    async fn test_interrupt_right_after_request_is_not_lost() {
        let runtime = EchoRuntime::preloaded("echo");
        runtime.push_reply(["Hi", " there", " friend", " again"]);
        let (client, worker) = ChannelTransport::pair();
        let host = WorkerHost::spawn(
            Arc::new(worker),
            Arc::new(runtime),
            WorkerOptions {
                token_delay: Duration::from_secs(30),
                answer_heartbeats: true,
            },
        );
        client
            .post(encode(&Envelope::new("g1", stream_request("Hello"))).unwrap())
            .unwrap();
        client.post(encode(&interrupt_request("g1")).unwrap()).unwrap();

        let terminals = tokio::time::timeout(Duration::from_secs(5), terminals(&client))
            .await
            .expect("interrupted generation should settle without waiting for the delay");
        assert_eq!(
            terminals["g1"],
            Payload::Throw(WorkerErrorPayload {
                message: GENERATION_INTERRUPTED.into(),
                stack: None,
            })
        );
        assert_eq!(terminals["i1"], Payload::Return(Value::Null));
        assert_eq!(host.active_generations(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_non_streaming_completion_throws() {
        let runtime = EchoRuntime::preloaded("echo");
        let (_host, client) = host(runtime);
        let request = Payload::ChatCompletionNonStreaming(ChatCompletionParams {
            request: ChatCompletionRequest {
                messages: vec![RequestMessage::new(Role::User, "Hello")],
                model: None,
                stream: false,
                generation: GenerationConfig::default(),
            },
        });
        client
            .post(encode(&Envelope::new("g1", request)).unwrap())
            .unwrap();
        client.post(encode(&interrupt_request("g1")).unwrap()).unwrap();

        match &terminals(&client).await["g1"] {
            Payload::Throw(err) => assert_eq!(err.message, GENERATION_INTERRUPTED),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_port() {
        let (host, client) = host(EchoRuntime::new());
        host.shutdown();
        let next = tokio::time::timeout(Duration::from_secs(5), client.next_message())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
