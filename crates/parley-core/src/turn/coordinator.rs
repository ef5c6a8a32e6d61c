//! Turn coordination: the one write path for conversations.
//!
//! `TurnCoordinator` owns the full lifecycle of a turn: validate, resolve
//! the conversation under tenancy scoping, take the per-conversation guard,
//! persist the user message, invoke the agent (complete or streaming), and
//! persist the assistant message exactly once. Streaming turns run in a
//! spawned worker so the assistant output is persisted even when the client
//! stops reading, cancels, or falls behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use parley_types::agent::{AgentEvent, AgentInvocation, HistoryMessage};
use parley_types::conversation::{Conversation, ConversationRef, MessageRole, NewMessage};
use parley_types::error::{TurnError, WritePhase};
use parley_types::turn::{AgentKind, Fragment, TokenUsage, TurnRequest, TurnResult, TurnSource};

use crate::agent::{AgentEventStream, AgentPort};
use crate::store::ConversationStore;
use crate::turn::guard::{TurnGuard, TurnPermit};
use crate::turn::title::{needs_title, truncate_title};

/// Default capacity of the fragment channel between worker and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 16;

/// Default time the worker waits for the consumer to drain a fragment
/// before giving up on the stream.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Live fragment stream for one turn.
///
/// Carries the resolved conversation id so transports can tell clients
/// which conversation a freshly created turn landed in.
pub struct TurnStream {
    pub conversation_id: Uuid,
    inner: ReceiverStream<Fragment>,
}

impl tokio_stream::Stream for TurnStream {
    type Item = Fragment;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Fragment>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Coordinates conversation turns over a store and an agent backend.
///
/// Cheap to clone via the `Arc`s it holds; transport adapters share one
/// instance so the per-conversation guard is global to the process.
pub struct TurnCoordinator<S, A> {
    store: Arc<S>,
    agent: Arc<A>,
    guard: TurnGuard,
    stream_buffer: usize,
    forward_timeout: Duration,
}

impl<S, A> Clone for TurnCoordinator<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            agent: Arc::clone(&self.agent),
            guard: self.guard.clone(),
            stream_buffer: self.stream_buffer,
            forward_timeout: self.forward_timeout,
        }
    }
}

impl<S, A> TurnCoordinator<S, A>
where
    S: ConversationStore + 'static,
    A: AgentPort,
{
    pub fn new(store: Arc<S>, agent: Arc<A>) -> Self {
        Self {
            store,
            agent,
            guard: TurnGuard::new(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
        }
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    /// Number of turns currently in flight across all conversations.
    pub fn in_flight_turns(&self) -> usize {
        self.guard.in_flight_count()
    }

    /// Run a complete (non-streaming) turn.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnResult, TurnError> {
        self.run_turn_cancellable(request, CancellationToken::new()).await
    }

    /// Run a complete turn that can be interrupted by `cancel`.
    ///
    /// Cancellation before the agent replies returns `TurnError::Cancelled`;
    /// the user message, once written, stays written.
    pub async fn run_turn_cancellable(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnResult, TurnError> {
        request.validate()?;
        let started = Instant::now();

        let conversation = self.resolve_conversation(&request).await?;
        let _permit = self
            .guard
            .try_acquire(conversation.id)
            .ok_or(TurnError::ConversationBusy)?;

        let history = self.load_history(&conversation).await?;
        self.persist_user_message(&conversation, &request).await?;

        let invocation = build_invocation(&conversation, &request, history);
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(conversation_id = %conversation.id, "turn cancelled before agent reply");
                return Err(TurnError::Cancelled);
            }
            reply = self.agent.invoke(&invocation) => reply?,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let metadata = assistant_metadata(
            false,
            None,
            request.agent.kind,
            &reply.model,
            request.source,
            None,
        );
        let persisted = self
            .store
            .append_message(&NewMessage {
                conversation_id: conversation.id,
                user_id: None,
                role: MessageRole::Assistant,
                content: reply.content.clone(),
                metadata: metadata.clone(),
            })
            .await
            .map_err(|source| TurnError::Persistence {
                phase: WritePhase::PartialWrite,
                source,
            })?;

        maybe_update_title(self.store.as_ref(), &conversation, &request.message).await;

        debug!(
            conversation_id = %conversation.id,
            message_id = %persisted.id,
            elapsed_ms,
            "turn completed"
        );

        Ok(TurnResult {
            conversation_id: conversation.id,
            message_id: persisted.id,
            content: reply.content,
            usage: reply.usage,
            elapsed_ms,
            metadata,
        })
    }

    /// Run a streaming turn.
    ///
    /// Setup failures (validation, resolution, guard, user-message write)
    /// fail this call directly. Once `Ok` is returned a worker owns the
    /// turn: it forwards fragments through the returned stream and persists
    /// the assistant message on every termination path, including agent
    /// errors, cancellation, backpressure timeout, and the consumer
    /// dropping the stream. The final fragment has `is_final = true` and is
    /// sent only after persistence has been attempted.
    pub async fn run_turn_stream(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnStream, TurnError> {
        request.validate()?;

        let conversation = self.resolve_conversation(&request).await?;
        let conversation_id = conversation.id;
        let permit = self
            .guard
            .try_acquire(conversation.id)
            .ok_or(TurnError::ConversationBusy)?;

        let history = self.load_history(&conversation).await?;
        self.persist_user_message(&conversation, &request).await?;

        let invocation = build_invocation(&conversation, &request, history);
        let events = self.agent.invoke_streaming(invocation);
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        let worker = StreamWorker {
            store: Arc::clone(&self.store),
            conversation,
            user_message: request.message,
            agent_kind: request.agent.kind,
            model: request.agent.model,
            source: request.source,
            forward_timeout: self.forward_timeout,
        };
        tokio::spawn(worker.run(events, tx, cancel, permit));

        Ok(TurnStream {
            conversation_id,
            inner: ReceiverStream::new(rx),
        })
    }

    async fn resolve_conversation(&self, request: &TurnRequest) -> Result<Conversation, TurnError> {
        match request.conversation_id {
            Some(id) => match self
                .store
                .find_owned(&ConversationRef {
                    conversation_id: id,
                    user_id: request.user_id,
                    org_id: request.org_id,
                })
                .await
            {
                Ok(Some(conversation)) => Ok(conversation),
                Ok(None) => Err(TurnError::ConversationNotFound),
                Err(source) => Err(TurnError::Persistence {
                    phase: WritePhase::BeforeWrite,
                    source,
                }),
            },
            None => {
                let title = truncate_title(&request.message);
                self.store
                    .create(
                        request.user_id,
                        request.org_id,
                        title,
                        request.context.clone(),
                        serde_json::json!({ "source": request.source.to_string() }),
                    )
                    .await
                    .map_err(|source| TurnError::Persistence {
                        phase: WritePhase::BeforeWrite,
                        source,
                    })
            }
        }
    }

    async fn load_history(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<HistoryMessage>, TurnError> {
        let messages = self
            .store
            .get_messages(&conversation.id, None, None)
            .await
            .map_err(|source| TurnError::Persistence {
                phase: WritePhase::BeforeWrite,
                source,
            })?;
        Ok(messages
            .into_iter()
            .map(|m| HistoryMessage {
                role: m.role,
                content: m.content,
            })
            .collect())
    }

    async fn persist_user_message(
        &self,
        conversation: &Conversation,
        request: &TurnRequest,
    ) -> Result<(), TurnError> {
        self.store
            .append_message(&NewMessage {
                conversation_id: conversation.id,
                user_id: Some(request.user_id),
                role: MessageRole::User,
                content: request.message.clone(),
                metadata: serde_json::json!({ "source": request.source.to_string() }),
            })
            .await
            .map_err(|source| TurnError::Persistence {
                phase: WritePhase::BeforeWrite,
                source,
            })?;
        Ok(())
    }
}

fn build_invocation(
    conversation: &Conversation,
    request: &TurnRequest,
    history: Vec<HistoryMessage>,
) -> AgentInvocation {
    AgentInvocation {
        conversation_id: conversation.id,
        message: request.message.clone(),
        history,
        kind: request.agent.kind,
        model: request.agent.model.clone(),
        temperature: request.agent.temperature,
        max_output_tokens: request.agent.max_output_tokens,
        context: request.context.clone(),
    }
}

fn assistant_metadata(
    streaming: bool,
    fragments: Option<u64>,
    kind: AgentKind,
    model: &str,
    source: TurnSource,
    abnormal: Option<&str>,
) -> serde_json::Value {
    let mut metadata = serde_json::json!({
        "streaming": streaming,
        "agent_kind": kind.to_string(),
        "model": model,
        "source": source.to_string(),
    });
    let map = metadata.as_object_mut().unwrap();
    if let Some(fragments) = fragments {
        map.insert("fragments".to_string(), fragments.into());
    }
    if let Some(reason) = abnormal {
        map.insert("incomplete".to_string(), true.into());
        map.insert("error".to_string(), reason.into());
    }
    metadata
}

/// Set the conversation title from the first user message when the stored
/// title is still a placeholder. Failures are logged, never surfaced.
async fn maybe_update_title<S: ConversationStore>(
    store: &S,
    conversation: &Conversation,
    user_message: &str,
) {
    if !needs_title(&conversation.title) {
        return;
    }
    let title = truncate_title(user_message);
    if let Err(err) = store.update_title(&conversation.id, title).await {
        warn!(conversation_id = %conversation.id, error = %err, "title update failed");
    }
}

/// How a streaming turn's event loop ended.
enum StreamEnd {
    Completed,
    AgentFailed(String),
    Backpressure,
    Cancelled,
    ClientGone,
}

/// Owns a streaming turn after setup.
///
/// Holds the `TurnPermit` for the whole run and releases it only after the
/// assistant message has been written (or the write has failed), so a new
/// turn can never interleave with this one's persistence.
struct StreamWorker<S> {
    store: Arc<S>,
    conversation: Conversation,
    user_message: String,
    agent_kind: AgentKind,
    model: String,
    source: TurnSource,
    forward_timeout: Duration,
}

impl<S: ConversationStore> StreamWorker<S> {
    async fn run(
        self,
        mut events: AgentEventStream,
        tx: mpsc::Sender<Fragment>,
        cancel: CancellationToken,
        permit: TurnPermit,
    ) {
        let started = Instant::now();
        let mut buffer = String::new();
        let mut index: u64 = 0;
        let mut usage: Option<TokenUsage> = None;

        let end = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                event = events.next() => event,
            };
            match event {
                None | Some(Ok(AgentEvent::Done)) => break StreamEnd::Completed,
                Some(Ok(AgentEvent::Usage(reported))) => usage = Some(reported),
                Some(Ok(AgentEvent::TextDelta { text })) => {
                    buffer.push_str(&text);
                    let fragment = Fragment::delta(index, text);
                    index += 1;
                    match tx.send_timeout(fragment, self.forward_timeout).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(_)) => break StreamEnd::Backpressure,
                        Err(SendTimeoutError::Closed(_)) => break StreamEnd::ClientGone,
                    }
                }
                Some(Err(err)) => break StreamEnd::AgentFailed(err.to_string()),
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match end {
            StreamEnd::Completed => {
                self.finish_completed(buffer, index, usage, elapsed_ms, &tx).await;
            }
            StreamEnd::AgentFailed(reason) => {
                self.finish_abnormal(reason, buffer, index, elapsed_ms, &tx).await;
            }
            StreamEnd::Backpressure => {
                self.finish_abnormal(
                    TurnError::BackpressureTimeout.to_string(),
                    buffer,
                    index,
                    elapsed_ms,
                    &tx,
                )
                .await;
            }
            StreamEnd::Cancelled => {
                self.finish_abnormal(
                    TurnError::Cancelled.to_string(),
                    buffer,
                    index,
                    elapsed_ms,
                    &tx,
                )
                .await;
            }
            StreamEnd::ClientGone => {
                self.finish_abnormal(
                    "client disconnected".to_string(),
                    buffer,
                    index,
                    elapsed_ms,
                    &tx,
                )
                .await;
            }
        }

        drop(permit);
    }

    async fn finish_completed(
        &self,
        content: String,
        fragments: u64,
        usage: Option<TokenUsage>,
        elapsed_ms: u64,
        tx: &mpsc::Sender<Fragment>,
    ) {
        let metadata = assistant_metadata(
            true,
            Some(fragments),
            self.agent_kind,
            &self.model,
            self.source,
            None,
        );
        let write = self
            .store
            .append_message(&NewMessage {
                conversation_id: self.conversation.id,
                user_id: None,
                role: MessageRole::Assistant,
                content,
                metadata,
            })
            .await;

        let fragment = match write {
            Ok(persisted) => {
                maybe_update_title(self.store.as_ref(), &self.conversation, &self.user_message)
                    .await;
                debug!(
                    conversation_id = %self.conversation.id,
                    message_id = %persisted.id,
                    fragments,
                    elapsed_ms,
                    "streaming turn completed"
                );
                Fragment::complete(fragments, usage.unwrap_or_default(), elapsed_ms)
            }
            Err(err) => {
                error!(
                    conversation_id = %self.conversation.id,
                    error = %err,
                    "assistant message write failed after stream completion"
                );
                Fragment::failed(fragments, format!("persistence failed: {err}"), elapsed_ms)
            }
        };
        let _ = tx.send_timeout(fragment, self.forward_timeout).await;
    }

    async fn finish_abnormal(
        &self,
        reason: String,
        content: String,
        fragments: u64,
        elapsed_ms: u64,
        tx: &mpsc::Sender<Fragment>,
    ) {
        warn!(
            conversation_id = %self.conversation.id,
            reason = %reason,
            fragments,
            "streaming turn ended early"
        );
        if !content.is_empty() {
            let metadata = assistant_metadata(
                true,
                Some(fragments),
                self.agent_kind,
                &self.model,
                self.source,
                Some(&reason),
            );
            if let Err(err) = self
                .store
                .append_message(&NewMessage {
                    conversation_id: self.conversation.id,
                    user_id: None,
                    role: MessageRole::Assistant,
                    content,
                    metadata,
                })
                .await
            {
                error!(
                    conversation_id = %self.conversation.id,
                    error = %err,
                    "partial assistant message write failed"
                );
            }
        }
        let _ = tx
            .send_timeout(Fragment::failed(fragments, reason, elapsed_ms), self.forward_timeout)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConversationStore, ScriptedAgent, ScriptedEvent};
    use parley_types::turn::AgentParams;
    use uuid::Uuid;

    fn request(
        conversation_id: Option<Uuid>,
        user_id: Uuid,
        org_id: Uuid,
        message: &str,
    ) -> TurnRequest {
        TurnRequest {
            conversation_id,
            user_id,
            org_id,
            message: message.to_string(),
            agent: AgentParams {
                kind: AgentKind::Master,
                model: "gpt-4o".to_string(),
                temperature: 0.7,
                max_output_tokens: 2048,
            },
            context: serde_json::json!({}),
            source: TurnSource::Rest,
        }
    }

    fn coordinator(
        store: Arc<MemoryConversationStore>,
        agent: ScriptedAgent,
    ) -> TurnCoordinator<MemoryConversationStore, ScriptedAgent> {
        TurnCoordinator::new(store, Arc::new(agent))
    }

    async fn wait_for_messages(
        store: &MemoryConversationStore,
        conversation_id: &Uuid,
        count: usize,
    ) {
        for _ in 0..200 {
            if store.messages_for(conversation_id).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} messages");
    }

    async fn wait_for_idle(coordinator: &TurnCoordinator<MemoryConversationStore, ScriptedAgent>) {
        for _ in 0..200 {
            if coordinator.in_flight_turns() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for in-flight turns to drain");
    }

    #[tokio::test]
    async fn test_sync_turn_persists_user_then_assistant() {
        let store = Arc::new(MemoryConversationStore::new());
        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::replying("42."));

        let user_id = Uuid::now_v7();
        let result = coordinator
            .run_turn(request(None, user_id, Uuid::now_v7(), "What is the answer?"))
            .await
            .unwrap();

        assert_eq!(result.content, "42.");
        let messages = store.messages_for(&result.conversation_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].user_id, Some(user_id));
        assert_eq!(messages[0].content, "What is the answer?");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].user_id, None);
        assert_eq!(messages[1].id, result.message_id);
        assert_eq!(messages[1].metadata["streaming"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_new_conversation_gets_title_and_source() {
        let store = Arc::new(MemoryConversationStore::new());
        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::replying("ok"));

        let long_message = "x".repeat(150);
        let result = coordinator
            .run_turn(request(None, Uuid::now_v7(), Uuid::now_v7(), &long_message))
            .await
            .unwrap();

        let conversation = store.conversation(&result.conversation_id).unwrap();
        assert_eq!(conversation.title.chars().count(), 103);
        assert!(conversation.title.ends_with("..."));
        assert_eq!(conversation.metadata["source"], serde_json::json!("rest"));
    }

    #[tokio::test]
    async fn test_cross_tenant_lookup_fails_without_writes() {
        let store = Arc::new(MemoryConversationStore::new());
        let owner = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(owner, org, "private");

        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::replying("nope"));
        let stranger = Uuid::now_v7();
        let err = coordinator
            .run_turn(request(Some(conversation.id), stranger, org, "hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::ConversationNotFound));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_conversation_not_found() {
        let store = Arc::new(MemoryConversationStore::new());
        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::replying("nope"));

        let err = coordinator
            .run_turn(request(Some(Uuid::now_v7()), Uuid::now_v7(), Uuid::now_v7(), "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::ConversationNotFound));
    }

    #[tokio::test]
    async fn test_invalid_request_writes_nothing() {
        let store = Arc::new(MemoryConversationStore::new());
        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::replying("nope"));

        let err = coordinator
            .run_turn(request(None, Uuid::now_v7(), Uuid::now_v7(), "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::InvalidRequest(_)));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_agent_failure_keeps_user_message() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::failing("upstream 502"));
        let err = coordinator
            .run_turn(request(Some(conversation.id), user_id, org, "hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::AgentInvocation(_)));
        let messages = store.messages_for(&conversation.id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_sync_assistant_write_failure_is_partial_write() {
        let store = Arc::new(MemoryConversationStore::new());
        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::replying("ok"));
        store.set_fail_assistant_appends(true);

        let err = coordinator
            .run_turn(request(None, Uuid::now_v7(), Uuid::now_v7(), "hi"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TurnError::Persistence { phase: WritePhase::PartialWrite, .. }
        ));
    }

    #[tokio::test]
    async fn test_sync_cancellation_before_reply() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::hanging());
        let cancel = CancellationToken::new();
        let task = {
            let coordinator = coordinator.clone();
            let req = request(Some(conversation.id), user_id, org, "hi");
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.run_turn_cancellable(req, cancel).await })
        };

        wait_for_messages(&store, &conversation.id, 1).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TurnError::Cancelled));
        assert_eq!(store.messages_for(&conversation.id).len(), 1);
        assert_eq!(coordinator.in_flight_turns(), 0);
    }

    #[tokio::test]
    async fn test_stream_happy_path() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let agent = ScriptedAgent::streaming(vec![
            ScriptedEvent::Delta("Hel".to_string()),
            ScriptedEvent::Delta("lo, ".to_string()),
            ScriptedEvent::Delta("world".to_string()),
            ScriptedEvent::Usage(TokenUsage { input_tokens: 7, output_tokens: 3 }),
            ScriptedEvent::Done,
        ]);
        let coordinator = coordinator(Arc::clone(&store), agent);

        let mut stream = coordinator
            .run_turn_stream(
                request(Some(conversation.id), user_id, org, "say hello"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next().await {
            fragments.push(fragment);
        }

        assert_eq!(fragments.len(), 4);
        for (i, fragment) in fragments[..3].iter().enumerate() {
            assert_eq!(fragment.index, i as u64);
            assert!(!fragment.is_final);
        }
        let last = fragments.last().unwrap();
        assert!(last.is_final);
        assert!(last.error.is_none());
        assert_eq!(last.usage.unwrap().input_tokens, 7);

        let messages = store.messages_for(&conversation.id);
        assert_eq!(messages.len(), 2);
        let assistant = &messages[1];
        assert_eq!(assistant.content, "Hello, world");
        assert_eq!(assistant.metadata["streaming"], serde_json::json!(true));
        assert_eq!(assistant.metadata["fragments"], serde_json::json!(3));
        assert!(assistant.metadata.get("incomplete").is_none());
    }

    #[tokio::test]
    async fn test_stream_agent_error_persists_partial() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let agent = ScriptedAgent::streaming(vec![
            ScriptedEvent::Delta("Par".to_string()),
            ScriptedEvent::Delta("tial".to_string()),
            ScriptedEvent::Error("boom".to_string()),
        ]);
        let coordinator = coordinator(Arc::clone(&store), agent);

        let mut stream = coordinator
            .run_turn_stream(
                request(Some(conversation.id), user_id, org, "go"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next().await {
            fragments.push(fragment);
        }

        assert_eq!(fragments.len(), 3);
        let last = fragments.last().unwrap();
        assert!(last.is_final);
        assert!(last.error.as_deref().unwrap().contains("boom"));

        let messages = store.messages_for(&conversation.id);
        assert_eq!(messages.len(), 2);
        let assistant = &messages[1];
        assert_eq!(assistant.content, "Partial");
        assert_eq!(assistant.metadata["incomplete"], serde_json::json!(true));
        assert!(assistant.metadata["error"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_stream_error_before_output_keeps_only_user_message() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let agent =
            ScriptedAgent::streaming(vec![ScriptedEvent::Error("dead on arrival".to_string())]);
        let coordinator = coordinator(Arc::clone(&store), agent);

        let mut stream = coordinator
            .run_turn_stream(
                request(Some(conversation.id), user_id, org, "go"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next().await {
            fragments.push(fragment);
        }
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_final);
        assert!(fragments[0].error.is_some());

        let messages = store.messages_for(&conversation.id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_concurrent_turn_rejected_while_stream_in_flight() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let agent = ScriptedAgent::streaming(vec![
            ScriptedEvent::Delta("a".to_string()),
            ScriptedEvent::Delta("b".to_string()),
            ScriptedEvent::Delta("c".to_string()),
            ScriptedEvent::Done,
        ]);
        let coordinator =
            coordinator(Arc::clone(&store), agent).with_stream_buffer(1);

        let mut stream = coordinator
            .run_turn_stream(
                request(Some(conversation.id), user_id, org, "first"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // Permit is held by the worker, so a second turn is rejected.
        let err = coordinator
            .run_turn(request(Some(conversation.id), user_id, org, "second"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::ConversationBusy));
        assert_eq!(store.messages_for(&conversation.id).len(), 1);

        while stream.next().await.is_some() {}
        wait_for_idle(&coordinator).await;

        let result = coordinator
            .run_turn(request(Some(conversation.id), user_id, org, "second"))
            .await;
        assert!(matches!(result, Err(TurnError::AgentInvocation(_))));
    }

    #[tokio::test]
    async fn test_stream_cancellation_persists_partial() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let agent = ScriptedAgent::streaming(vec![
            ScriptedEvent::Delta("Par".to_string()),
            ScriptedEvent::Delta("tial".to_string()),
            ScriptedEvent::Hang,
        ]);
        let coordinator = coordinator(Arc::clone(&store), agent);

        let cancel = CancellationToken::new();
        let mut stream = coordinator
            .run_turn_stream(
                request(Some(conversation.id), user_id, org, "go"),
                cancel.clone(),
            )
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().delta, "Par");
        assert_eq!(stream.next().await.unwrap().delta, "tial");
        cancel.cancel();

        let last = stream.next().await.unwrap();
        assert!(last.is_final);
        assert!(last.error.as_deref().unwrap().contains("cancelled"));
        assert!(stream.next().await.is_none());

        let messages = store.messages_for(&conversation.id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Partial");
        assert_eq!(messages[1].metadata["incomplete"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_backpressure_timeout_persists_partial() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let agent = ScriptedAgent::streaming(vec![
            ScriptedEvent::Delta("a".to_string()),
            ScriptedEvent::Delta("b".to_string()),
            ScriptedEvent::Delta("c".to_string()),
            ScriptedEvent::Done,
        ]);
        let coordinator = coordinator(Arc::clone(&store), agent)
            .with_stream_buffer(1)
            .with_forward_timeout(Duration::from_millis(50));

        // Never read from the stream, but keep it alive so the channel
        // stays open and the worker hits the timeout rather than Closed.
        let _stream = coordinator
            .run_turn_stream(
                request(Some(conversation.id), user_id, org, "go"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        wait_for_messages(&store, &conversation.id, 2).await;
        let messages = store.messages_for(&conversation.id);
        let assistant = &messages[1];
        assert_eq!(assistant.content, "ab");
        assert_eq!(
            assistant.metadata["error"].as_str().unwrap(),
            TurnError::BackpressureTimeout.to_string()
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_persists_partial() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "t");

        let agent = ScriptedAgent::streaming(vec![
            ScriptedEvent::Delta("orphaned".to_string()),
            ScriptedEvent::Done,
        ]);
        let coordinator = coordinator(Arc::clone(&store), agent).with_stream_buffer(1);

        let stream = coordinator
            .run_turn_stream(
                request(Some(conversation.id), user_id, org, "go"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        drop(stream);

        wait_for_messages(&store, &conversation.id, 2).await;
        let messages = store.messages_for(&conversation.id);
        let assistant = &messages[1];
        assert_eq!(assistant.metadata["incomplete"], serde_json::json!(true));
        assert!(assistant.metadata["error"]
            .as_str()
            .unwrap()
            .contains("disconnected"));
    }

    #[tokio::test]
    async fn test_title_set_once_then_stable() {
        let store = Arc::new(MemoryConversationStore::new());
        let user_id = Uuid::now_v7();
        let org = Uuid::now_v7();
        let conversation = store.seed_conversation(user_id, org, "");

        let coordinator = coordinator(Arc::clone(&store), ScriptedAgent::replying("sure"));
        coordinator
            .run_turn(request(Some(conversation.id), user_id, org, "Explain tax codes"))
            .await
            .unwrap();
        assert_eq!(store.conversation(&conversation.id).unwrap().title, "Explain tax codes");

        coordinator
            .run_turn(request(Some(conversation.id), user_id, org, "And payroll?"))
            .await
            .unwrap();
        assert_eq!(store.conversation(&conversation.id).unwrap().title, "Explain tax codes");
    }
}
