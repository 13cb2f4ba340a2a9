//! Composition root.
//!
//! `CoreRuntime` constructs the transport, recovery manager, offline queue,
//! subscription manager, and stores, and owns the background tasks that
//! connect them: one drain loop routing subscription updates into stores,
//! and one connectivity watcher that replays the offline queue when the
//! network comes back. Everything is dependency-injected; there are no
//! globals, and tests can run any number of runtimes side by side.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, TransportMode};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::models::{Conversation, Message, NewConversation, Role, TraceStep};
use crate::offline::OfflineQueue;
use crate::recovery::ErrorRecoveryManager;
use crate::store::{ConversationStore, MessageStore};
use crate::subscriptions::{SubscriptionManager, SubscriptionUpdate};
use crate::transport::{MockTransport, RemoteEvent, TransportClient};

pub struct CoreRuntime<C: TransportClient> {
    client: Arc<C>,
    config: CoreConfig,
    user_id: String,
    recovery: Arc<ErrorRecoveryManager>,
    offline: Arc<OfflineQueue>,
    subscriptions: Arc<SubscriptionManager<C>>,
    conversations: Arc<ConversationStore<C>>,
    messages: Mutex<HashMap<String, Arc<MessageStore<C>>>>,
    traces: Mutex<HashMap<String, Vec<TraceStep>>>,
    update_tx: mpsc::Sender<SubscriptionUpdate>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreRuntime<MockTransport> {
    /// Runtime backed by the in-memory transport, for local runs and tests.
    pub fn mock(config: CoreConfig, user_id: impl Into<String>) -> Arc<Self> {
        Self::new(Arc::new(MockTransport::new()), config, user_id)
    }

    /// Build the runtime for the transport mode named in `config`. The mode
    /// is fixed for the runtime's lifetime; there is no per-call switching.
    pub fn from_config(config: CoreConfig, user_id: impl Into<String>) -> CoreResult<Arc<Self>> {
        match config.transport_mode {
            TransportMode::Mock => Ok(Self::mock(config, user_id)),
            TransportMode::Real => Err(CoreError::new(
                ErrorKind::Client,
                "no real transport backend is built in; use the mock transport",
            )),
        }
    }
}

impl<C: TransportClient> CoreRuntime<C> {
    pub fn new(client: Arc<C>, config: CoreConfig, user_id: impl Into<String>) -> Arc<Self> {
        let user_id = user_id.into();
        let recovery = Arc::new(ErrorRecoveryManager::new());
        let offline = Arc::new(OfflineQueue::new());
        let subscriptions = Arc::new(SubscriptionManager::new(
            client.clone(),
            config.reconnect.clone(),
        ));
        let conversations = Arc::new(ConversationStore::new(
            client.clone(),
            recovery.clone(),
            offline.clone(),
            config.clone(),
            user_id.clone(),
        ));
        let (update_tx, update_rx) = mpsc::channel(256);

        let runtime = Arc::new(Self {
            client,
            config,
            user_id: user_id.clone(),
            recovery,
            offline: offline.clone(),
            subscriptions,
            conversations,
            messages: Mutex::new(HashMap::new()),
            traces: Mutex::new(HashMap::new()),
            update_tx: update_tx.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        runtime
            .subscriptions
            .subscribe_conversations(&user_id, update_tx);

        let drain = tokio::spawn(drain_updates(Arc::downgrade(&runtime), update_rx));
        let watcher = tokio::spawn(watch_connectivity(offline));
        runtime.tasks.lock().extend([drain, watcher]);
        info!(user_id = %user_id, "core runtime started");
        runtime
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.recovery
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager<C>> {
        &self.subscriptions
    }

    pub fn conversations(&self) -> &Arc<ConversationStore<C>> {
        &self.conversations
    }

    pub fn is_online(&self) -> bool {
        self.offline.is_online()
    }

    /// Flip connectivity. Going online wakes the watcher, which replays the
    /// offline queue.
    pub fn set_online(&self, online: bool) {
        self.offline.set_online(online);
    }

    pub fn pending_offline_operations(&self) -> usize {
        self.offline.pending_count()
    }

    /// Open (or reuse) the message store for one conversation and subscribe
    /// to its events.
    pub fn open_conversation(&self, conversation_id: &str) -> Arc<MessageStore<C>> {
        let mut stores = self.messages.lock();
        if let Some(store) = stores.get(conversation_id) {
            return store.clone();
        }
        let store = Arc::new(MessageStore::new(
            self.client.clone(),
            self.recovery.clone(),
            self.offline.clone(),
            self.config.clone(),
            conversation_id,
        ));
        stores.insert(conversation_id.to_string(), store.clone());
        self.subscriptions
            .subscribe_messages(conversation_id, self.update_tx.clone());
        store
    }

    pub fn close_conversation(&self, conversation_id: &str) {
        self.messages.lock().remove(conversation_id);
        self.subscriptions
            .unsubscribe(&format!("messages:{conversation_id}"));
    }

    /// Follow the execution trace of one message as its steps stream in.
    pub fn watch_trace(&self, message_id: &str) {
        self.subscriptions
            .subscribe_trace_steps(message_id, self.update_tx.clone());
    }

    pub fn trace_steps(&self, message_id: &str) -> Vec<TraceStep> {
        self.traces
            .lock()
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn create_conversation(&self, title: impl Into<String>) -> CoreResult<Conversation> {
        self.conversations
            .create(NewConversation {
                user_id: self.user_id.clone(),
                title: title.into(),
                agent_preset_id: None,
            })
            .await
    }

    /// Send a question and wait for the decision reply.
    ///
    /// The assistant message arrives through the subscription drain like
    /// any other event; this just polls the store until it shows up.
    pub async fn ask(
        &self,
        conversation_id: &str,
        question: &str,
        timeout: Duration,
    ) -> CoreResult<Message> {
        let store = self.open_conversation(conversation_id);
        // Give the message subscription a moment to connect before the
        // pipeline can reply.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = store.send(question).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(reply) = store
                .items()
                .into_iter()
                .find(|m| m.role == Role::Assistant && m.created_at >= sent.created_at)
            {
                return Ok(reply);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::network("timed out waiting for decision"));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn apply_trace_event(&self, event: RemoteEvent<TraceStep>) {
        let mut traces = self.traces.lock();
        let record = event.record().clone();
        let steps = traces.entry(record.message_id.clone()).or_default();
        match event {
            RemoteEvent::Created(step) | RemoteEvent::Updated(step) => {
                match steps.iter_mut().find(|s| s.id == step.id) {
                    Some(existing) => *existing = step,
                    None => steps.push(step),
                }
                steps.sort_by_key(|s| s.step_number);
            }
            RemoteEvent::Deleted(step) => {
                steps.retain(|s| s.id != step.id);
            }
        }
    }

    /// Stop background tasks and tear down every subscription.
    pub fn shutdown(&self) {
        self.subscriptions.unsubscribe_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("core runtime stopped");
    }
}

impl<C: TransportClient> Drop for CoreRuntime<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drain_updates<C: TransportClient>(
    runtime: Weak<CoreRuntime<C>>,
    mut updates: mpsc::Receiver<SubscriptionUpdate>,
) {
    while let Some(update) = updates.recv().await {
        let Some(runtime) = runtime.upgrade() else {
            return;
        };
        match update {
            SubscriptionUpdate::Conversation(event) => {
                runtime.conversations.apply_event(event);
            }
            SubscriptionUpdate::Message(event) => {
                let conversation_id = event.record().conversation_id.clone();
                let store = runtime.messages.lock().get(&conversation_id).cloned();
                match store {
                    Some(store) => store.apply_event(event),
                    None => debug!(conversation_id = %conversation_id, "event for closed conversation"),
                }
            }
            SubscriptionUpdate::TraceStep(event) => {
                runtime.apply_trace_event(event);
            }
            SubscriptionUpdate::Error { key, error } => {
                // The supervisor has already scheduled the reconnect; this
                // is for visibility only.
                warn!(key = %key, "subscription error: {error}");
            }
        }
    }
}

async fn watch_connectivity(offline: Arc<OfflineQueue>) {
    let mut changes = offline.network_changes();
    let mut was_online = *changes.borrow();
    while changes.changed().await.is_ok() {
        let online = *changes.borrow();
        if online && !was_online {
            info!(
                pending = offline.pending_count(),
                "back online, replaying offline queue"
            );
            offline.sync_queued_operations().await;
        }
        was_online = online;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CoreConfig {
        CoreConfig {
            retry_delay: Duration::from_millis(1),
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_from_config_selects_mock_and_rejects_real() {
        let runtime = CoreRuntime::from_config(fast_config(), "u1").unwrap();
        assert!(runtime.is_online());
        runtime.shutdown();

        let config = CoreConfig {
            transport_mode: TransportMode::Real,
            ..fast_config()
        };
        let err = match CoreRuntime::from_config(config, "u1") {
            Ok(_) => panic!("real transport should be rejected"),
            Err(err) => err,
        };
        assert_eq!(err.kind, ErrorKind::Client);
    }

    #[tokio::test]
    async fn test_ask_returns_decision_with_verdict() {
        let runtime = CoreRuntime::mock(fast_config(), "u1");
        runtime.client().set_pipeline_delay(Duration::from_millis(10));

        let conversation = runtime.create_conversation("deploy?").await.unwrap();
        let reply = runtime
            .ask(&conversation.id, "should we deploy on friday?", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(reply.role, Role::Assistant);
        let judge = reply.judge_response.expect("verdict attached");
        assert_eq!(judge.voting_result.total_votes(), 3);
        assert_eq!(reply.agent_responses.map(|r| r.len()), Some(3));
        assert!(reply.trace_id.is_some());

        // Both the question and the reply live in the store, oldest-first.
        let store = runtime.open_conversation(&conversation.id);
        let items = store.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].role, Role::User);
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_offline_queue_flushes_on_reconnect() {
        let runtime = CoreRuntime::mock(fast_config(), "u1");

        runtime.set_online(false);
        runtime.create_conversation("written offline").await.unwrap();
        assert_eq!(runtime.pending_offline_operations(), 1);

        runtime.set_online(true);
        // The connectivity watcher replays in the background.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runtime.pending_offline_operations(), 0);

        let page = runtime
            .client()
            .list_conversations("u1", 10, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].title, "written offline");
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_conversation_events_from_other_clients_land_in_store() {
        let runtime = CoreRuntime::mock(fast_config(), "u1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Another client for the same user creates a conversation.
        runtime
            .client()
            .create_conversation(NewConversation {
                user_id: "u1".to_string(),
                title: "from another tab".to_string(),
                agent_preset_id: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let items = runtime.conversations().items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "from another tab");
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_trace_steps_stream_into_runtime() {
        let runtime = CoreRuntime::mock(fast_config(), "u1");
        runtime.client().set_pipeline_delay(Duration::from_millis(10));

        let conversation = runtime.create_conversation("t").await.unwrap();
        let reply = runtime
            .ask(&conversation.id, "proceed?", Duration::from_secs(5))
            .await
            .unwrap();

        // Steps already exist server-side; fetch the backlog the way a
        // trace view would before following live updates.
        runtime.watch_trace(&reply.id);
        let steps = runtime.client().list_trace_steps(&reply.id).await.unwrap();
        assert_eq!(steps.len(), 4);
        assert!(steps.windows(2).all(|w| w[0].step_number < w[1].step_number));
        runtime.shutdown();
    }
}
