use super::*;
use crate::events::EventBus;
use crate::persistence::MemoryPersistence;
use crate::protocol::{ChatCompletionChunk, Payload, RequestKind, RequestMessage};
use crate::test_helpers::{
    chat_config, connected_engine, connected_engine_with, connected_inference, store_with,
    wait_until, WorkerPeer,
};
use serde_json::json;

fn started(outcome: SubmitOutcome) -> TurnHandle {
    match outcome {
        SubmitOutcome::Started(turn) => turn,
        SubmitOutcome::Rejected(reason) => panic!("submit rejected: {:?}", reason),
    }
}

/// Next generation request: its correlation id and prompt context
async fn next_generation(peer: &WorkerPeer) -> (String, Vec<RequestMessage>) {
    let request = peer.next_request().await;
    let id = request.correlation_id.clone().unwrap();
    match request.payload {
        Payload::ChatCompletionStreamInit(params) => (id, params.request.messages),
        other => panic!("expected a streaming completion, got {:?}", other),
    }
}

fn contents(messages: &[RequestMessage]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

#[tokio::test]
async fn test_normal_turn() {
    let (engine, peer) = connected_engine();

    let turn = started(engine.submit("Hello", Vec::new()).await.unwrap());
    let session = engine.current_session().await;
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[0].content, "Hello");
    assert_eq!(session.messages[1].role, Role::Assistant);
    assert!(session.messages[1].streaming);
    assert!(session.messages[1].content.is_empty());
    assert_eq!(session.messages[1].model.as_deref(), Some("test-model"));

    let (id, context) = next_generation(&peer).await;
    assert_eq!(turn.correlation_id.as_deref(), Some(id.as_str()));
    assert_eq!(context[0].role, Role::System);
    assert_eq!(context.last().unwrap().content, "Hello");

    peer.stream_reply(&id, &["Hi", " there"]);
    turn.finished().await;

    let assistant = &engine.current_session().await.messages[1];
    assert_eq!(assistant.content, "Hi there");
    assert!(!assistant.streaming);
    assert!(!assistant.is_error);
}

#[tokio::test]
async fn test_empty_input_is_rejected() {
    let (engine, _peer) = connected_engine();
    let outcome = engine.submit("   \n", Vec::new()).await.unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::Rejected(RejectReason::EmptyInput)
    ));
    assert!(engine.current_session().await.messages.is_empty());
}

#[tokio::test]
async fn test_double_submit_starts_one_generation() {
    let (engine, peer) = connected_engine();

    let (first, second) = tokio::join!(
        engine.submit("A", Vec::new()),
        engine.submit("B", Vec::new())
    );
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_started()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, SubmitOutcome::Rejected(RejectReason::AlreadyStreaming))));

    peer.next_request().await;
    assert_eq!(engine.inference().rpc().pending_count(), 1);
    assert_eq!(engine.current_session().await.messages.len(), 2);
}

#[tokio::test]
async fn test_stop_finalizes_through_worker_terminal() {
    let (engine, peer) = connected_engine();

    let turn = started(engine.submit("Hello", Vec::new()).await.unwrap());
    let (id, _) = next_generation(&peer).await;
    peer.reply(
        &id,
        Payload::ChatCompletionStreamNextChunk(ChatCompletionChunk::text("c", "m", "Hi")),
    );
    wait_until(|| {
        let engine = engine.clone();
        async move { engine.current_session().await.messages[1].content == "Hi" }
    })
    .await;

    engine.stop().await.unwrap();
    let interrupt = peer.next_request().await;
    assert_eq!(interrupt.kind(), RequestKind::InterruptGenerate);
    // stop never touches message state itself
    assert!(engine.current_session().await.messages[1].streaming);

    peer.reply(&id, Payload::Return(json!("Hi")));
    turn.finished().await;

    let assistant = &engine.current_session().await.messages[1];
    assert_eq!(assistant.content, "Hi");
    assert!(!assistant.streaming);
    assert!(!assistant.is_error);
}

#[tokio::test]
async fn test_worker_error_marks_message_and_returns_to_idle() {
    let (engine, peer) = connected_engine();

    let turn = started(engine.submit("Hello", Vec::new()).await.unwrap());
    let (id, _) = next_generation(&peer).await;
    peer.throw(&id, "out of memory");
    turn.finished().await;

    let assistant = &engine.current_session().await.messages[1];
    assert!(assistant.is_error);
    assert!(!assistant.streaming);
    assert!(assistant.content.contains("out of memory"));

    // the session is idle again
    assert!(engine.submit("again", Vec::new()).await.unwrap().is_started());
}

#[tokio::test]
async fn test_dead_worker_fails_turn_without_request() {
    let (engine, _peer) = connected_engine();
    engine.inference().rpc().liveness().mark_dead();

    let turn = started(engine.submit("Hello", Vec::new()).await.unwrap());
    assert_eq!(turn.correlation_id, None);
    turn.finished().await;

    let assistant = &engine.current_session().await.messages[1];
    assert!(assistant.is_error);
    assert!(assistant.content.contains("not responding"));
    assert_eq!(engine.inference().rpc().pending_count(), 0);
}

#[tokio::test]
async fn test_turn_follows_its_session_after_switch() {
    let (engine, peer) = connected_engine();

    let turn = started(engine.submit("Hello", Vec::new()).await.unwrap());
    let (id, _) = next_generation(&peer).await;
    engine.new_session().await;

    peer.stream_reply(&id, &["Hi"]);
    let session_id = turn.session_id.clone();
    turn.finished().await;

    let store = engine.snapshot().await;
    assert!(store.current().messages.is_empty());
    assert_eq!(store.session(&session_id).unwrap().messages[1].content, "Hi");
}

#[tokio::test]
async fn test_resend_assistant_message() {
    let (engine, peer) =
        connected_engine_with(store_with(&[(Role::User, "A"), (Role::Assistant, "B")]));
    let before = engine.current_session().await;
    let old_ids: Vec<_> = before.messages.iter().map(|m| m.id.clone()).collect();

    let turn = started(engine.resend(&old_ids[1]).await.unwrap());
    let session = engine.current_session().await;
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "A");
    assert!(!old_ids.contains(&session.messages[0].id));
    assert!(session.messages[1].streaming);

    let (id, context) = next_generation(&peer).await;
    assert!(!contents(&context).contains(&"B"));
    assert_eq!(context.last().unwrap().content, "A");

    peer.stream_reply(&id, &["B2"]);
    turn.finished().await;
    assert_eq!(engine.current_session().await.messages[1].content, "B2");
}

#[tokio::test]
async fn test_resend_user_message_pairs_following_assistant() {
    let (engine, peer) = connected_engine_with(store_with(&[
        (Role::User, "A"),
        (Role::Assistant, "B"),
        (Role::User, "C"),
        (Role::Assistant, "D"),
    ]));
    let user_id = engine.current_session().await.messages[0].id.clone();

    let _turn = started(engine.resend(&user_id).await.unwrap());
    let session = engine.current_session().await;
    let remaining: Vec<_> = session.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(remaining, vec!["C", "D", "A", ""]);

    let (_, context) = next_generation(&peer).await;
    assert_eq!(contents(&context[1..]), vec!["C", "D", "A"]);
}

#[tokio::test]
async fn test_resend_without_user_message_changes_nothing() {
    let (engine, _peer) = connected_engine_with(store_with(&[(Role::Assistant, "orphan")]));
    let id = engine.current_session().await.messages[0].id.clone();

    let err = engine.resend(&id).await.unwrap_err();
    assert_eq!(err, ChatError::ResendTargetNotFound(id));
    assert_eq!(engine.current_session().await.messages.len(), 1);
    assert_eq!(engine.inference().rpc().pending_count(), 0);
}

#[tokio::test]
async fn test_resend_rejected_while_streaming() {
    let (engine, _peer) = connected_engine_with(store_with(&[(Role::User, "A")]));
    let id = engine.current_session().await.messages[0].id.clone();
    started(engine.submit("B", Vec::new()).await.unwrap());

    let outcome = engine.resend(&id).await.unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::Rejected(RejectReason::AlreadyStreaming)
    ));
    assert_eq!(engine.current_session().await.messages.len(), 3);
}

#[tokio::test]
async fn test_delete_removes_exactly_one_message() {
    let (engine, _peer) = connected_engine_with(store_with(&[
        (Role::User, "A"),
        (Role::Assistant, "B"),
        (Role::User, "C"),
    ]));
    let id = engine.current_session().await.messages[1].id.clone();

    let removed = engine.delete(&id).await.unwrap();
    assert_eq!(removed.content, "B");
    let remaining: Vec<_> = engine
        .current_session()
        .await
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(remaining, vec!["A", "C"]);

    let err = engine.delete(&id).await.unwrap_err();
    assert_eq!(err, ChatError::MessageNotFound(id));
}

#[tokio::test]
async fn test_edit_replaces_content() {
    let (engine, _peer) = connected_engine_with(store_with(&[(Role::User, "typo")]));
    let id = engine.current_session().await.messages[0].id.clone();

    engine.edit(&id, "fixed").await.unwrap();
    assert_eq!(engine.current_session().await.messages[0].content, "fixed");
    assert!(matches!(
        engine.edit("missing", "x").await,
        Err(ChatError::MessageNotFound(_))
    ));
}

#[tokio::test]
async fn test_clear_context_boundary() {
    let (engine, peer) = connected_engine_with(store_with(&[
        (Role::User, "1"),
        (Role::Assistant, "2"),
        (Role::User, "3"),
        (Role::Assistant, "4"),
        (Role::User, "5"),
    ]));
    engine.set_memory_prompt("earlier summary").await;

    assert_eq!(engine.set_clear_context_index(5).await, Some(5));
    let session = engine.current_session().await;
    assert_eq!(session.clear_context_index, Some(5));
    assert!(session.memory_prompt.is_empty());

    // toggles off, then on again
    assert_eq!(engine.toggle_clear_context().await, None);
    assert_eq!(engine.toggle_clear_context().await, Some(5));

    started(engine.submit("fresh", Vec::new()).await.unwrap());
    let (_, context) = next_generation(&peer).await;
    assert_eq!(context.len(), 2);
    assert_eq!(context[0].role, Role::System);
    assert_eq!(context[1].content, "fresh");
}

#[tokio::test]
async fn test_restore_reconciles_stale_messages() {
    let mut store = store_with(&[(Role::User, "Hello")]);
    let mut stale = ChatMessage::assistant_placeholder("test-model");
    stale.date = Utc::now() - chrono::Duration::seconds(120);
    store.current_mut().messages.push(stale);
    let persistence = Arc::new(MemoryPersistence::with_store(&store).unwrap());

    let (inference, _peer) = connected_inference();
    let engine =
        ChatSessionEngine::new(inference, chat_config()).with_persistence(persistence.clone());
    assert_eq!(engine.restore().await.unwrap(), 1);

    let recovered = &engine.current_session().await.messages[1];
    assert!(!recovered.streaming);
    assert!(recovered.is_error);
    assert!(!recovered.content.is_empty());

    let saved = persistence.load().await.unwrap().unwrap();
    assert!(!saved.current().messages[1].streaming);
}

#[tokio::test]
async fn test_finished_turn_is_persisted() {
    let persistence = Arc::new(MemoryPersistence::new());
    let (inference, peer) = connected_inference();
    let engine = Arc::new(
        ChatSessionEngine::new(inference, chat_config()).with_persistence(persistence.clone()),
    );

    let turn = started(engine.submit("Hello", Vec::new()).await.unwrap());
    let (id, _) = next_generation(&peer).await;
    peer.stream_reply(&id, &["Hi", " there"]);
    turn.finished().await;

    let saved = persistence.load().await.unwrap().unwrap();
    assert_eq!(saved.current().messages[1].content, "Hi there");
    assert!(!saved.current().messages[1].streaming);
}

#[tokio::test]
async fn test_turn_emits_store_events() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let (inference, peer) = connected_inference();
    let engine =
        Arc::new(ChatSessionEngine::new(inference, chat_config()).with_event_emitter(bus.clone()));

    let turn = started(engine.submit("Hello", Vec::new()).await.unwrap());
    let (id, _) = next_generation(&peer).await;
    peer.stream_reply(&id, &["Hi"]);
    turn.finished().await;

    let mut actions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        actions.push(event.action);
    }
    assert_eq!(
        actions,
        vec![
            StoreAction::MessageAppended,
            StoreAction::MessageAppended,
            StoreAction::MessageDelta,
            StoreAction::MessageFinalized,
        ]
    );
}

#[tokio::test]
async fn test_handle_input_commands() {
    let (engine, peer) = connected_engine();

    assert!(matches!(
        engine.handle_input(":new").await.unwrap(),
        InputOutcome::Command(ChatCommand::New)
    ));
    assert_eq!(engine.snapshot().await.len(), 2);

    engine.handle_input(":next").await.unwrap();
    assert_eq!(engine.snapshot().await.current_index(), 1);

    engine.handle_input(":del").await.unwrap();
    let store = engine.snapshot().await;
    assert_eq!(store.len(), 1);
    assert_eq!(store.current_index(), 0);

    assert!(matches!(
        engine.handle_input("hello").await.unwrap(),
        InputOutcome::Submitted(SubmitOutcome::Started(_))
    ));
    next_generation(&peer).await;
}

#[tokio::test]
async fn test_session_management() {
    let (engine, _peer) = connected_engine();
    let first = engine.current_session().await.id;

    let second = engine.new_session().await;
    assert_eq!(engine.current_session().await.id, second.id);

    engine.rename_topic("Rust questions").await;
    assert_eq!(engine.current_session().await.topic, "Rust questions");

    assert_eq!(engine.select_session(1).await.unwrap().id, first);
    assert_eq!(engine.next_session(1).await.id, second.id);
    assert!(matches!(
        engine.select_session(9).await,
        Err(ChatError::SessionNotFound(_))
    ));

    engine.delete_session(0).await.unwrap();
    engine.delete_session(0).await.unwrap();
    let store = engine.snapshot().await;
    assert_eq!(store.len(), 1);
    assert_ne!(store.current().id, first);
}

#[tokio::test]
async fn test_stop_interrupts_only_current_sessions_generation() {
    let (engine, peer) = connected_engine();

    let first = started(engine.submit("one", Vec::new()).await.unwrap());
    let (first_id, _) = next_generation(&peer).await;
    engine.new_session().await;
    let second = started(engine.submit("two", Vec::new()).await.unwrap());
    let (second_id, _) = next_generation(&peer).await;

    // back to the first session while the second one started last
    engine.select_session(1).await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(
        peer.next_request().await.payload,
        Payload::InterruptGenerate(crate::protocol::InterruptParams {
            target_correlation_id: Some(first_id.clone()),
        })
    );

    engine.stop_session(&second.session_id).unwrap();
    assert_eq!(
        peer.next_request().await.payload,
        Payload::InterruptGenerate(crate::protocol::InterruptParams {
            target_correlation_id: Some(second_id.clone()),
        })
    );

    peer.reply(&first_id, Payload::Return(json!("")));
    peer.stream_reply(&second_id, &["done"]);
    first.finished().await;
    second.finished().await;

    // nothing left streaming: stop sends no interrupt
    let pending = engine.inference().rpc().pending_count();
    engine.stop().await.unwrap();
    assert_eq!(engine.inference().rpc().pending_count(), pending);
}

#[tokio::test]
async fn test_pinned_message_reaches_later_prompts() {
    let (engine, peer) = connected_engine_with(store_with(&[
        (Role::User, "my name is Ada"),
        (Role::Assistant, "Nice to meet you, Ada"),
    ]));
    let pinned_id = engine.current_session().await.messages[1].id.clone();
    engine.pin_message(&pinned_id).await.unwrap();
    engine.pin_message(&pinned_id).await.unwrap();
    assert_eq!(engine.current_session().await.pinned.len(), 1);
    assert!(matches!(
        engine.pin_message("missing").await,
        Err(ChatError::MessageNotFound(_))
    ));

    // clearing the context keeps the pinned message in the prefix
    engine.clear_context().await;
    started(engine.submit("what is my name?", Vec::new()).await.unwrap());
    let (id, context) = next_generation(&peer).await;
    assert_eq!(
        contents(&context)[1..],
        ["Nice to meet you, Ada", "what is my name?"]
    );
    peer.stream_reply(&id, &["Ada"]);

    wait_until(|| {
        let engine = engine.clone();
        async move { !engine.current_session().await.is_streaming() }
    })
    .await;
    engine.unpin_message(&pinned_id).await.unwrap();
    assert!(engine.current_session().await.pinned.is_empty());
    assert!(matches!(
        engine.unpin_message(&pinned_id).await,
        Err(ChatError::MessageNotFound(_))
    ));
}

#[tokio::test]
async fn test_clear_command_never_restores_history() {
    let (engine, _peer) =
        connected_engine_with(store_with(&[(Role::User, "1"), (Role::Assistant, "2")]));
    engine.set_memory_prompt("summary").await;

    engine.handle_input(":clear").await.unwrap();
    engine.handle_input(":clear").await.unwrap();
    let session = engine.current_session().await;
    assert_eq!(session.clear_context_index, Some(2));
    assert!(session.memory_prompt.is_empty());
}

#[tokio::test]
async fn test_with_store_normalizes_empty_store() {
    let store: SessionStore =
        serde_json::from_str(r#"{"sessions":[],"currentSessionIndex":2}"#).unwrap();
    let (inference, _peer) = connected_inference();
    let engine = ChatSessionEngine::new(inference, chat_config()).with_store(store);

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.current_index(), 0);
    assert!(engine.current_session().await.messages.is_empty());
}

#[tokio::test]
async fn test_failed_turn_reports_recoverability() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let (inference, peer) = connected_inference();
    let engine =
        Arc::new(ChatSessionEngine::new(inference, chat_config()).with_event_emitter(bus.clone()));

    let turn = started(engine.submit("Hello", Vec::new()).await.unwrap());
    let (id, _) = next_generation(&peer).await;
    peer.throw(&id, "out of memory");
    turn.finished().await;

    engine.inference().rpc().liveness().mark_dead();
    started(engine.submit("again", Vec::new()).await.unwrap())
        .finished()
        .await;

    let mut finalized = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.action == StoreAction::MessageFinalized {
            finalized.push(event.payload);
        }
    }
    assert_eq!(
        finalized,
        vec![
            json!({ "error": true, "recoverable": true }),
            json!({ "error": true, "recoverable": false }),
        ]
    );
}
