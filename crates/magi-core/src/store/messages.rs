//! Message list store, scoped to one conversation.
//!
//! Sending a user message is the entry point of the whole decision flow:
//! the transport persists it and kicks off the agent pipeline, and the
//! assistant reply plus its trace steps arrive back through subscriptions.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::{Message, NewMessage, Role};
use crate::offline::{OfflineQueue, OperationKind, Priority, QueuedOperation};
use crate::recovery::{ErrorRecoveryManager, RecoveryOptions};
use crate::search::text_contains_term;
use crate::store::{run_with_recovery, Entry, StoreState};
use crate::transport::{RemoteEvent, TransportClient};

/// Messages of one conversation, oldest-first.
pub struct MessageStore<C> {
    client: Arc<C>,
    recovery: Arc<ErrorRecoveryManager>,
    offline: Arc<OfflineQueue>,
    config: CoreConfig,
    conversation_id: String,
    /// Shared with queued offline replays, which commit into it directly.
    state: Arc<Mutex<StoreState<Message>>>,
}

fn sort_oldest_first(state: &mut StoreState<Message>) {
    state
        .entries
        .sort_by(|a, b| a.record().created_at.cmp(&b.record().created_at));
}

fn commit_record(state: &Mutex<StoreState<Message>>, temp_id: &str, record: Message) {
    let mut state = state.lock();
    state.commit(temp_id, record);
    sort_oldest_first(&mut state);
    state.error = None;
}

impl<C: TransportClient> MessageStore<C> {
    pub fn new(
        client: Arc<C>,
        recovery: Arc<ErrorRecoveryManager>,
        offline: Arc<OfflineQueue>,
        config: CoreConfig,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            recovery,
            offline,
            config,
            conversation_id: conversation_id.into(),
            state: Arc::new(Mutex::new(StoreState::new())),
        }
    }

    pub fn items(&self) -> Vec<Message> {
        self.state.lock().records()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    pub fn last_error(&self) -> Option<CoreError> {
        self.state.lock().error.clone()
    }

    pub fn has_more(&self) -> bool {
        self.state.lock().next_token.is_some()
    }

    fn options(&self, context: &str) -> RecoveryOptions {
        RecoveryOptions::new(context)
            .with_max_retries(self.config.max_retries)
            .with_retry_delay(self.config.retry_delay)
    }

    pub async fn refresh(&self) -> CoreResult<()> {
        self.state.lock().loading = true;
        let client = self.client.clone();
        let conversation_id = self.conversation_id.clone();
        let page_size = self.config.page_size;
        let result = run_with_recovery(&self.recovery, &self.options("listMessages"), || {
            let client = client.clone();
            let conversation_id = conversation_id.clone();
            async move { client.list_messages(&conversation_id, page_size, None).await }
        })
        .await;

        let mut state = self.state.lock();
        state.loading = false;
        match result {
            Ok(page) => {
                state.entries.retain(|e| e.is_pending());
                for record in page.items {
                    if !state.contains_id(&record.id) {
                        state.entries.push(Entry::Committed { record });
                    }
                }
                sort_oldest_first(&mut state);
                state.next_token = page.next_token;
                state.error = None;
                Ok(())
            }
            Err(err) => {
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub async fn load_more(&self) -> CoreResult<bool> {
        let Some(token) = self.state.lock().next_token.clone() else {
            return Ok(false);
        };
        self.state.lock().loading = true;
        let client = self.client.clone();
        let conversation_id = self.conversation_id.clone();
        let page_size = self.config.page_size;
        let result = run_with_recovery(&self.recovery, &self.options("listMessages"), || {
            let client = client.clone();
            let conversation_id = conversation_id.clone();
            let token = token.clone();
            async move {
                client
                    .list_messages(&conversation_id, page_size, Some(&token))
                    .await
            }
        })
        .await;

        let mut state = self.state.lock();
        state.loading = false;
        match result {
            Ok(page) => {
                for record in page.items {
                    if !state.contains_id(&record.id) {
                        state.entries.push(Entry::Committed { record });
                    }
                }
                sort_oldest_first(&mut state);
                state.next_token = page.next_token;
                state.error = None;
                Ok(state.next_token.is_some())
            }
            Err(err) => {
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Send a user message. The optimistic entry appears immediately; the
    /// committed record triggers the agent pipeline server-side.
    pub async fn send(&self, content: impl Into<String>) -> CoreResult<Message> {
        let input = NewMessage {
            conversation_id: self.conversation_id.clone(),
            role: Role::User,
            content: content.into(),
        };
        if input.content.trim().is_empty() {
            return Err(CoreError::validation("message content must not be empty"));
        }

        let optimistic = Message::optimistic(&input);
        let temp_id = optimistic.id.clone();
        {
            let mut state = self.state.lock();
            state.entries.push(Entry::pending(optimistic.clone()));
            sort_oldest_first(&mut state);
        }

        if !self.offline.is_online() {
            debug!(temp_id = %temp_id, "offline, queueing message send");
            let client = self.client.clone();
            let shared = self.state.clone();
            let replay_input = input.clone();
            self.offline.queue_operation(QueuedOperation::new(
                OperationKind::Create,
                Priority::High,
                "sendMessage",
                move || {
                    let client = client.clone();
                    let shared = shared.clone();
                    let input = replay_input.clone();
                    let temp_id = temp_id.clone();
                    Box::pin(async move {
                        let created = client.create_message(input).await?;
                        commit_record(&shared, &temp_id, created);
                        Ok(())
                    })
                },
            ));
            return Ok(optimistic);
        }

        let client = self.client.clone();
        let result = run_with_recovery(&self.recovery, &self.options("sendMessage"), || {
            let client = client.clone();
            let input = input.clone();
            async move { client.create_message(input).await }
        })
        .await;

        match result {
            Ok(created) => {
                self.commit(&temp_id, created.clone());
                Ok(created)
            }
            Err(err) => {
                warn!(temp_id = %temp_id, "send failed, rolling back: {err}");
                let mut state = self.state.lock();
                state.remove_id(&temp_id);
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Edit a message's content, rolling back on failure.
    pub async fn update(&self, id: &str, content: String) -> CoreResult<Message> {
        let (snapshot, optimistic) = {
            let mut state = self.state.lock();
            let Some(index) = state.position_of(id) else {
                return Err(CoreError::not_found("message", id));
            };
            let snapshot = state.entries[index].clone();
            state.entries[index].record_mut().content = content.clone();
            (snapshot, state.entries[index].record().clone())
        };

        if !self.offline.is_online() {
            debug!(id, "offline, queueing message update");
            let client = self.client.clone();
            let shared = self.state.clone();
            let replay_id = id.to_string();
            let replay_content = content.clone();
            self.offline.queue_operation(QueuedOperation::new(
                OperationKind::Update,
                Priority::Normal,
                "updateMessage",
                move || {
                    let client = client.clone();
                    let shared = shared.clone();
                    let id = replay_id.clone();
                    let content = replay_content.clone();
                    Box::pin(async move {
                        let updated = client.update_message(&id, content).await?;
                        let id = updated.id.clone();
                        commit_record(&shared, &id, updated);
                        Ok(())
                    })
                },
            ));
            return Ok(optimistic);
        }

        let client = self.client.clone();
        let owned_id = id.to_string();
        let result = run_with_recovery(&self.recovery, &self.options("updateMessage"), || {
            let client = client.clone();
            let id = owned_id.clone();
            let content = content.clone();
            async move { client.update_message(&id, content).await }
        })
        .await;

        match result {
            Ok(updated) => {
                let mut state = self.state.lock();
                if let Some(index) = state.position_of(&updated.id) {
                    state.entries[index] = Entry::Committed {
                        record: updated.clone(),
                    };
                }
                Ok(updated)
            }
            Err(err) => {
                warn!(id, "message update failed, rolling back: {err}");
                let mut state = self.state.lock();
                if let Some(index) = state.position_of(id) {
                    state.entries[index] = snapshot;
                }
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let removed = {
            let mut state = self.state.lock();
            state.remove_id(id)
        };
        let Some((index, entry)) = removed else {
            return Err(CoreError::not_found("message", id));
        };

        if !self.offline.is_online() {
            debug!(id, "offline, queueing message delete");
            let client = self.client.clone();
            let id = id.to_string();
            self.offline.queue_operation(QueuedOperation::new(
                OperationKind::Delete,
                Priority::Normal,
                "deleteMessage",
                move || {
                    let client = client.clone();
                    let id = id.clone();
                    Box::pin(async move {
                        client.delete_message(&id).await?;
                        Ok(())
                    })
                },
            ));
            return Ok(());
        }

        let client = self.client.clone();
        let owned_id = id.to_string();
        let result = run_with_recovery(&self.recovery, &self.options("deleteMessage"), || {
            let client = client.clone();
            let id = owned_id.clone();
            async move { client.delete_message(&id).await }
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(id, "message delete failed, restoring: {err}");
                let mut state = self.state.lock();
                let index = index.min(state.entries.len());
                state.entries.insert(index, entry);
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Apply a server-push event, dropping echoes of our own mutations.
    pub fn apply_event(&self, event: RemoteEvent<Message>) {
        let mut state = self.state.lock();
        match event {
            RemoteEvent::Created(record) => {
                if state.contains_id(&record.id) {
                    debug!(id = %record.id, "dropping created echo");
                    return;
                }
                state.entries.push(Entry::Committed { record });
                sort_oldest_first(&mut state);
            }
            RemoteEvent::Updated(record) => match state.position_of(&record.id) {
                Some(index) if state.entries[index].is_pending() => {}
                Some(index) => {
                    state.entries[index] = Entry::Committed { record };
                }
                None => {
                    state.entries.push(Entry::Committed { record });
                    sort_oldest_first(&mut state);
                }
            },
            RemoteEvent::Deleted(record) => {
                state.remove_id(&record.id);
            }
        }
    }

    /// Case-insensitive content search over the loaded list. Read-only; the
    /// underlying list is untouched.
    pub fn search(&self, term: &str) -> Vec<Message> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.record())
            .filter(|m| text_contains_term(&m.content, term))
            .cloned()
            .collect()
    }

    fn commit(&self, temp_id: &str, record: Message) {
        commit_record(&self.state, temp_id, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewConversation;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn fast_config() -> CoreConfig {
        CoreConfig {
            retry_delay: Duration::from_millis(1),
            ..CoreConfig::default()
        }
    }

    async fn conversation(transport: &MockTransport) -> String {
        transport
            .create_conversation(NewConversation {
                user_id: "u1".to_string(),
                title: "t".to_string(),
                agent_preset_id: None,
            })
            .await
            .unwrap()
            .id
    }

    fn store_for(
        transport: Arc<MockTransport>,
        conversation_id: &str,
    ) -> Arc<MessageStore<MockTransport>> {
        Arc::new(MessageStore::new(
            transport,
            Arc::new(ErrorRecoveryManager::new()),
            Arc::new(OfflineQueue::new()),
            fast_config(),
            conversation_id,
        ))
    }

    #[tokio::test]
    async fn test_send_commits_and_rejects_blank_content() {
        let transport = Arc::new(MockTransport::without_pipeline());
        let conversation_id = conversation(&transport).await;
        let store = store_for(transport, &conversation_id);

        assert!(store.send("   ").await.is_err());
        assert!(store.items().is_empty());

        let sent = store.send("should we deploy?").await.unwrap();
        assert_eq!(store.items().len(), 1);
        assert_eq!(store.items()[0].id, sent.id);
        assert_eq!(sent.role, Role::User);
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back() {
        let transport = Arc::new(MockTransport::without_pipeline());
        let conversation_id = conversation(&transport).await;
        let store = store_for(transport.clone(), &conversation_id);

        transport.fail_next_mutations(
            (0..4).map(|_| CoreError::server("500 internal server error")),
        );
        assert!(store.send("doomed").await.is_err());
        assert!(store.items().is_empty());
        assert!(store.last_error().is_some());
    }

    #[tokio::test]
    async fn test_pipeline_reply_arrives_as_event() {
        let transport = Arc::new(MockTransport::new());
        transport.set_pipeline_delay(Duration::from_millis(10));
        let conversation_id = conversation(&transport).await;
        let store = store_for(transport.clone(), &conversation_id);

        store.send("should we deploy?").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The assistant reply exists server-side; feed it in the way the
        // runtime's subscription drain would.
        let page = transport.list_messages(&conversation_id, 10, None).await.unwrap();
        let assistant = page
            .items
            .into_iter()
            .find(|m| m.role == Role::Assistant)
            .expect("pipeline reply");
        store.apply_event(RemoteEvent::Created(assistant.clone()));

        let items = store.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].id, assistant.id);
        assert!(items[1].judge_response.is_some());

        // The same event again is an echo and changes nothing.
        store.apply_event(RemoteEvent::Created(assistant));
        assert_eq!(store.items().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_update_queues_instead_of_calling_transport() {
        let transport = Arc::new(MockTransport::without_pipeline());
        let offline = Arc::new(OfflineQueue::new());
        let conversation_id = conversation(&transport).await;
        let store = Arc::new(MessageStore::new(
            transport.clone(),
            Arc::new(ErrorRecoveryManager::new()),
            offline.clone(),
            fast_config(),
            &conversation_id,
        ));

        let sent = store.send("draft").await.unwrap();
        offline.set_online(false);
        let optimistic = store.update(&sent.id, "revised".to_string()).await.unwrap();
        assert_eq!(optimistic.content, "revised");
        assert_eq!(offline.pending_count(), 1);
        // The transport still holds the original content.
        let page = transport.list_messages(&conversation_id, 10, None).await.unwrap();
        assert_eq!(page.items[0].content, "draft");

        offline.set_online(true);
        offline.sync_queued_operations().await;

        let page = transport.list_messages(&conversation_id, 10, None).await.unwrap();
        assert_eq!(page.items[0].content, "revised");
        assert_eq!(store.items()[0].content, "revised");
    }

    #[tokio::test]
    async fn test_offline_delete_queues_instead_of_calling_transport() {
        let transport = Arc::new(MockTransport::without_pipeline());
        let offline = Arc::new(OfflineQueue::new());
        let conversation_id = conversation(&transport).await;
        let store = Arc::new(MessageStore::new(
            transport.clone(),
            Arc::new(ErrorRecoveryManager::new()),
            offline.clone(),
            fast_config(),
            &conversation_id,
        ));

        let sent = store.send("soon gone").await.unwrap();
        offline.set_online(false);
        store.delete(&sent.id).await.unwrap();
        assert!(store.items().is_empty());
        assert_eq!(offline.pending_count(), 1);
        // The record is still server-side until the queue replays.
        let page = transport.list_messages(&conversation_id, 10, None).await.unwrap();
        assert_eq!(page.items.len(), 1);

        offline.set_online(true);
        offline.sync_queued_operations().await;

        let page = transport.list_messages(&conversation_id, 10, None).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(offline.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_search_matches_content_and_leaves_list_untouched() {
        let transport = Arc::new(MockTransport::without_pipeline());
        let conversation_id = conversation(&transport).await;
        let store = store_for(transport, &conversation_id);
        store.send("Should we Deploy the new build?").await.unwrap();
        store.send("unrelated chatter").await.unwrap();

        let hits = store.search("deploy");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Should we Deploy the new build?");
        assert_eq!(store.search("deploy"), hits);
        assert_eq!(store.items().len(), 2);
    }

    #[tokio::test]
    async fn test_messages_stay_oldest_first() {
        let transport = Arc::new(MockTransport::without_pipeline());
        let conversation_id = conversation(&transport).await;
        let store = store_for(transport.clone(), &conversation_id);

        let first = store.send("first").await.unwrap();
        let second = store.send("second").await.unwrap();
        store.refresh().await.unwrap();

        let items = store.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, first.id);
        assert_eq!(items[1].id, second.id);
    }
}
