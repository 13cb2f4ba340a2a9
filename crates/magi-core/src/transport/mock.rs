//! In-memory transport used in mock mode and by tests.
//!
//! Mutations write to in-memory tables and fan out over broadcast channels;
//! subscriptions are per-scope forwarder tasks draining those channels.
//! User messages trigger the simulated MAGI pipeline, which inserts the
//! assistant reply and its trace steps as a side effect of "sending".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agents::run_decision;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    Conversation, ConversationPatch, Message, NewConversation, NewMessage, Role, TraceStep,
};
use crate::transport::{Page, RemoteEvent, TransportClient};

const BROADCAST_CAPACITY: usize = 256;
const FORWARD_CAPACITY: usize = 64;

struct MockState {
    conversations: Mutex<Vec<Conversation>>,
    messages: Mutex<Vec<Message>>,
    trace_steps: Mutex<Vec<TraceStep>>,

    conversation_tx: broadcast::Sender<RemoteEvent<Conversation>>,
    message_tx: broadcast::Sender<RemoteEvent<Message>>,
    trace_tx: broadcast::Sender<RemoteEvent<TraceStep>>,
    /// Fired to tear down all live subscription streams (tests exercise the
    /// reconnect path with this).
    reset_tx: broadcast::Sender<()>,

    /// Errors injected ahead of the next mutations, FIFO.
    fail_next: Mutex<VecDeque<CoreError>>,
    /// When set, subscribe calls fail outright.
    subscriptions_failing: AtomicBool,

    pipeline_enabled: AtomicBool,
    pipeline_delay: Mutex<Duration>,
}

/// In-memory `TransportClient`.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (conversation_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (message_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (trace_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (reset_tx, _) = broadcast::channel(4);
        Self {
            state: Arc::new(MockState {
                conversations: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                trace_steps: Mutex::new(Vec::new()),
                conversation_tx,
                message_tx,
                trace_tx,
                reset_tx,
                fail_next: Mutex::new(VecDeque::new()),
                subscriptions_failing: AtomicBool::new(false),
                pipeline_enabled: AtomicBool::new(true),
                pipeline_delay: Mutex::new(Duration::from_millis(50)),
            }),
        }
    }

    /// Disable the simulated agent pipeline (tests that only exercise CRUD).
    pub fn without_pipeline() -> Self {
        let transport = Self::new();
        transport.state.pipeline_enabled.store(false, Ordering::SeqCst);
        transport
    }

    pub fn set_pipeline_delay(&self, delay: Duration) {
        *self.state.pipeline_delay.lock() = delay;
    }

    /// Queue errors to be returned by the next mutations, in order.
    pub fn fail_next_mutations(&self, errors: impl IntoIterator<Item = CoreError>) {
        self.state.fail_next.lock().extend(errors);
    }

    /// Make subscribe calls fail until cleared. Combined with
    /// `drop_subscription_streams` this drives the reconnect state machine.
    pub fn set_subscriptions_failing(&self, failing: bool) {
        self.state.subscriptions_failing.store(failing, Ordering::SeqCst);
    }

    /// Tear down every live subscription stream, as a transport outage would.
    pub fn drop_subscription_streams(&self) {
        let _ = self.state.reset_tx.send(());
    }

    fn take_injected_failure(&self) -> CoreResult<()> {
        match self.state.fail_next.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn page<T: Clone>(items: Vec<T>, limit: usize, cursor: Option<&str>) -> CoreResult<Page<T>> {
        let offset: usize = match cursor {
            Some(token) => token
                .parse()
                .map_err(|_| CoreError::validation(format!("bad cursor: {token}")))?,
            None => 0,
        };
        let end = (offset + limit).min(items.len());
        let next_token = if end < items.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok(Page {
            items: items.get(offset..end).map(<[T]>::to_vec).unwrap_or_default(),
            next_token,
        })
    }

    /// Forward broadcast events matching `scope` into a private channel
    /// until the receiver is dropped or the streams are torn down.
    fn forward<T, F>(
        &self,
        mut source: broadcast::Receiver<RemoteEvent<T>>,
        in_scope: F,
    ) -> mpsc::Receiver<RemoteEvent<T>>
    where
        T: Clone + Send + 'static,
        F: Fn(&T) -> bool + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
        let mut reset_rx = self.state.reset_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = source.recv() => match event {
                        Ok(event) if in_scope(event.record()) => {
                            if tx.send(event).await.is_err() {
                                break; // receiver dropped = unsubscribe
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "mock subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = reset_rx.recv() => break,
                }
            }
        });
        rx
    }

    fn run_pipeline(&self, conversation_id: String, question: String) {
        let state = self.state.clone();
        let delay = *self.state.pipeline_delay.lock();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let assistant_id = Uuid::new_v4().to_string();
            let decision = match run_decision(&question, &assistant_id) {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(%err, "agent pipeline failed");
                    return;
                }
            };

            let message = Message {
                id: assistant_id,
                conversation_id,
                role: Role::Assistant,
                content: decision.judge_response.final_recommendation.clone(),
                agent_responses: Some(decision.agent_responses.clone()),
                judge_response: Some(decision.judge_response.clone()),
                trace_id: Some(decision.trace_id.clone()),
                created_at: Utc::now(),
            };

            state.messages.lock().push(message.clone());
            let _ = state.message_tx.send(RemoteEvent::Created(message));

            for step in decision.trace_steps {
                state.trace_steps.lock().push(step.clone());
                let _ = state.trace_tx.send(RemoteEvent::Created(step));
            }
            debug!("agent pipeline completed");
        });
    }

    fn check_subscribable(&self) -> CoreResult<()> {
        if self.state.subscriptions_failing.load(Ordering::SeqCst) {
            return Err(CoreError::subscription("subscription channel unavailable"));
        }
        Ok(())
    }
}

impl TransportClient for MockTransport {
    async fn list_conversations(
        &self,
        user_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> CoreResult<Page<Conversation>> {
        let mut items: Vec<Conversation> = self
            .state
            .conversations
            .lock()
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        // Conversation lists are newest-first.
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Self::page(items, limit, cursor)
    }

    async fn get_conversation(&self, id: &str) -> CoreResult<Option<Conversation>> {
        Ok(self
            .state
            .conversations
            .lock()
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn create_conversation(&self, input: NewConversation) -> CoreResult<Conversation> {
        self.take_injected_failure()?;
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id,
            title: input.title,
            agent_preset_id: input.agent_preset_id,
            created_at: now,
            updated_at: now,
        };
        self.state.conversations.lock().push(conversation.clone());
        let _ = self
            .state
            .conversation_tx
            .send(RemoteEvent::Created(conversation.clone()));
        Ok(conversation)
    }

    async fn update_conversation(&self, patch: ConversationPatch) -> CoreResult<Conversation> {
        self.take_injected_failure()?;
        let updated = {
            let mut conversations = self.state.conversations.lock();
            let conversation = conversations
                .iter_mut()
                .find(|c| c.id == patch.id)
                .ok_or_else(|| CoreError::not_found("conversation", &patch.id))?;
            conversation.apply_patch(&patch);
            conversation.clone()
        };
        let _ = self
            .state
            .conversation_tx
            .send(RemoteEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn delete_conversation(&self, id: &str) -> CoreResult<bool> {
        self.take_injected_failure()?;
        let removed = {
            let mut conversations = self.state.conversations.lock();
            match conversations.iter().position(|c| c.id == id) {
                Some(idx) => Some(conversations.remove(idx)),
                None => None,
            }
        };
        match removed {
            Some(conversation) => {
                let _ = self
                    .state
                    .conversation_tx
                    .send(RemoteEvent::Deleted(conversation));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn conversation_events(
        &self,
        user_id: &str,
    ) -> CoreResult<mpsc::Receiver<RemoteEvent<Conversation>>> {
        self.check_subscribable()?;
        let user_id = user_id.to_string();
        let source = self.state.conversation_tx.subscribe();
        Ok(self.forward(source, move |c: &Conversation| c.user_id == user_id))
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> CoreResult<Page<Message>> {
        let mut items: Vec<Message> = self
            .state
            .messages
            .lock()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        // Message lists are oldest-first.
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Self::page(items, limit, cursor)
    }

    async fn create_message(&self, input: NewMessage) -> CoreResult<Message> {
        self.take_injected_failure()?;
        if !self
            .state
            .conversations
            .lock()
            .iter()
            .any(|c| c.id == input.conversation_id)
        {
            return Err(CoreError::not_found("conversation", &input.conversation_id));
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: input.conversation_id.clone(),
            role: input.role,
            content: input.content.clone(),
            agent_responses: None,
            judge_response: None,
            trace_id: None,
            created_at: Utc::now(),
        };
        self.state.messages.lock().push(message.clone());
        let _ = self.state.message_tx.send(RemoteEvent::Created(message.clone()));

        if input.role == Role::User && self.state.pipeline_enabled.load(Ordering::SeqCst) {
            self.run_pipeline(input.conversation_id, input.content);
        }
        Ok(message)
    }

    async fn update_message(&self, id: &str, content: String) -> CoreResult<Message> {
        self.take_injected_failure()?;
        let updated = {
            let mut messages = self.state.messages.lock();
            let message = messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| CoreError::not_found("message", id))?;
            message.content = content;
            message.clone()
        };
        let _ = self.state.message_tx.send(RemoteEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn delete_message(&self, id: &str) -> CoreResult<bool> {
        self.take_injected_failure()?;
        let removed = {
            let mut messages = self.state.messages.lock();
            match messages.iter().position(|m| m.id == id) {
                Some(idx) => Some(messages.remove(idx)),
                None => None,
            }
        };
        match removed {
            Some(message) => {
                let _ = self.state.message_tx.send(RemoteEvent::Deleted(message));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn message_events(
        &self,
        conversation_id: &str,
    ) -> CoreResult<mpsc::Receiver<RemoteEvent<Message>>> {
        self.check_subscribable()?;
        let conversation_id = conversation_id.to_string();
        let source = self.state.message_tx.subscribe();
        Ok(self.forward(source, move |m: &Message| m.conversation_id == conversation_id))
    }

    async fn list_trace_steps(&self, message_id: &str) -> CoreResult<Vec<TraceStep>> {
        let mut steps: Vec<TraceStep> = self
            .state
            .trace_steps
            .lock()
            .iter()
            .filter(|s| s.message_id == message_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }

    async fn trace_step_events(
        &self,
        message_id: &str,
    ) -> CoreResult<mpsc::Receiver<RemoteEvent<TraceStep>>> {
        self.check_subscribable()?;
        let message_id = message_id.to_string();
        let source = self.state.trace_tx.subscribe();
        Ok(self.forward(source, move |s: &TraceStep| s.message_id == message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn new_conversation(user_id: &str, title: &str) -> NewConversation {
        NewConversation {
            user_id: user_id.to_string(),
            title: title.to_string(),
            agent_preset_id: None,
        }
    }

    #[tokio::test]
    async fn test_list_conversations_newest_first_with_cursor() {
        let transport = MockTransport::without_pipeline();
        for i in 0..5 {
            transport
                .create_conversation(new_conversation("u1", &format!("c{i}")))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        transport
            .create_conversation(new_conversation("u2", "other user"))
            .await
            .unwrap();

        let first = transport.list_conversations("u1", 3, None).await.unwrap();
        assert_eq!(first.items.len(), 3);
        assert_eq!(first.items[0].title, "c4");
        let token = first.next_token.unwrap();

        let rest = transport
            .list_conversations("u1", 3, Some(&token))
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 2);
        assert!(rest.next_token.is_none());
        assert_eq!(rest.items[1].title, "c0");
    }

    #[tokio::test]
    async fn test_subscription_is_scoped_to_user() {
        let transport = MockTransport::without_pipeline();
        let mut events = transport.conversation_events("u1").await.unwrap();

        transport
            .create_conversation(new_conversation("u2", "not mine"))
            .await
            .unwrap();
        let mine = transport
            .create_conversation(new_conversation("u1", "mine"))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            RemoteEvent::Created(c) => assert_eq!(c.id, mine.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let transport = MockTransport::without_pipeline();
        transport.fail_next_mutations([CoreError::server("500 server error")]);

        let err = transport
            .create_conversation(new_conversation("u1", "boom"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Server);

        // Next mutation succeeds.
        assert!(transport
            .create_conversation(new_conversation("u1", "ok"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_user_message_triggers_pipeline() {
        let transport = MockTransport::new();
        transport.set_pipeline_delay(Duration::from_millis(1));
        let conversation = transport
            .create_conversation(new_conversation("u1", "magi"))
            .await
            .unwrap();
        let mut events = transport.message_events(&conversation.id).await.unwrap();

        transport
            .create_message(NewMessage {
                conversation_id: conversation.id.clone(),
                role: Role::User,
                content: "Should we deploy?".to_string(),
            })
            .await
            .unwrap();

        // First event is the user's own message, second is the assistant.
        let user_event = events.recv().await.unwrap();
        assert_eq!(user_event.record().role, Role::User);
        let assistant_event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let assistant = assistant_event.record();
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.agent_responses.as_ref().unwrap().len(), 3);
        assert!(assistant.judge_response.is_some());

        let steps = transport.list_trace_steps(&assistant.id).await.unwrap();
        assert_eq!(steps.len(), 4);
    }

    #[tokio::test]
    async fn test_drop_subscription_streams_ends_receivers() {
        let transport = MockTransport::without_pipeline();
        let mut events = transport.conversation_events("u1").await.unwrap();
        transport.drop_subscription_streams();
        assert!(tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .unwrap()
            .is_none());
    }
}
