//! Conversation list store, scoped to one user.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::{Conversation, ConversationPatch, NewConversation};
use crate::offline::{OfflineQueue, OperationKind, Priority, QueuedOperation};
use crate::recovery::{ErrorRecoveryManager, RecoveryOptions};
use crate::search::text_contains_term;
use crate::store::{run_with_recovery, Entry, StoreState};
use crate::transport::{RemoteEvent, TransportClient};

/// Conversations for one user, newest-first.
///
/// All mutations are optimistic: the local list changes immediately, the
/// transport confirms in the background, and a failed confirmation restores
/// the exact prior state. While offline, mutations queue on the
/// [`OfflineQueue`] and the optimistic entry stays pending until replay.
pub struct ConversationStore<C> {
    client: Arc<C>,
    recovery: Arc<ErrorRecoveryManager>,
    offline: Arc<OfflineQueue>,
    config: CoreConfig,
    user_id: String,
    /// Shared with queued offline replays, which commit into it directly.
    state: Arc<Mutex<StoreState<Conversation>>>,
}

fn sort_newest_first(state: &mut StoreState<Conversation>) {
    state
        .entries
        .sort_by(|a, b| b.record().created_at.cmp(&a.record().created_at));
}

fn commit_record(state: &Mutex<StoreState<Conversation>>, temp_id: &str, record: Conversation) {
    let mut state = state.lock();
    state.commit(temp_id, record);
    sort_newest_first(&mut state);
    state.error = None;
}

impl<C: TransportClient> ConversationStore<C> {
    pub fn new(
        client: Arc<C>,
        recovery: Arc<ErrorRecoveryManager>,
        offline: Arc<OfflineQueue>,
        config: CoreConfig,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            recovery,
            offline,
            config,
            user_id: user_id.into(),
            state: Arc::new(Mutex::new(StoreState::new())),
        }
    }

    pub fn items(&self) -> Vec<Conversation> {
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

    /// Fetch the first page, replacing committed entries. Pending entries
    /// survive a refresh; they are not on the server yet.
    pub async fn refresh(&self) -> CoreResult<()> {
        self.state.lock().loading = true;
        let client = self.client.clone();
        let user_id = self.user_id.clone();
        let page_size = self.config.page_size;
        let result = run_with_recovery(&self.recovery, &self.options("listConversations"), || {
            let client = client.clone();
            let user_id = user_id.clone();
            async move { client.list_conversations(&user_id, page_size, None).await }
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
                sort_newest_first(&mut state);
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

    /// Fetch the next page if one exists. Returns whether more pages remain.
    pub async fn load_more(&self) -> CoreResult<bool> {
        let Some(token) = self.state.lock().next_token.clone() else {
            return Ok(false);
        };
        self.state.lock().loading = true;
        let client = self.client.clone();
        let user_id = self.user_id.clone();
        let page_size = self.config.page_size;
        let result = run_with_recovery(&self.recovery, &self.options("listConversations"), || {
            let client = client.clone();
            let user_id = user_id.clone();
            let token = token.clone();
            async move {
                client
                    .list_conversations(&user_id, page_size, Some(&token))
                    .await
            }
        })
        .await;

        let mut state = self.state.lock();
        state.loading = false;
        match result {
            Ok(page) => {
                for record in page.items {
                    // Pages can overlap after concurrent inserts; dedup by id.
                    if !state.contains_id(&record.id) {
                        state.entries.push(Entry::Committed { record });
                    }
                }
                sort_newest_first(&mut state);
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

    /// Create a conversation, showing it immediately. Offline creates stay
    /// pending until the queue replays them.
    pub async fn create(&self, input: NewConversation) -> CoreResult<Conversation> {
        let optimistic = Conversation::optimistic(&input);
        let temp_id = optimistic.id.clone();
        {
            let mut state = self.state.lock();
            state.entries.push(Entry::pending(optimistic.clone()));
            sort_newest_first(&mut state);
        }

        if !self.offline.is_online() {
            debug!(temp_id = %temp_id, "offline, queueing conversation create");
            let client = self.client.clone();
            let shared = self.state.clone();
            let replay_input = input.clone();
            self.offline.queue_operation(QueuedOperation::new(
                OperationKind::Create,
                Priority::High,
                "createConversation",
                move || {
                    let client = client.clone();
                    let shared = shared.clone();
                    let input = replay_input.clone();
                    let temp_id = temp_id.clone();
                    Box::pin(async move {
                        let created = client.create_conversation(input).await?;
                        commit_record(&shared, &temp_id, created);
                        Ok(())
                    })
                },
            ));
            return Ok(optimistic);
        }

        let client = self.client.clone();
        let result = run_with_recovery(&self.recovery, &self.options("createConversation"), || {
            let client = client.clone();
            let input = input.clone();
            async move { client.create_conversation(input).await }
        })
        .await;

        match result {
            Ok(created) => {
                self.commit(&temp_id, created.clone());
                Ok(created)
            }
            Err(err) => {
                warn!(temp_id = %temp_id, "create failed, rolling back: {err}");
                let mut state = self.state.lock();
                state.remove_id(&temp_id);
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Patch a conversation in place; restores the previous record if the
    /// server rejects the update.
    pub async fn update(&self, patch: ConversationPatch) -> CoreResult<Conversation> {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(index) = state.position_of(&patch.id) else {
                return Err(CoreError::not_found("conversation", &patch.id));
            };
            let snapshot = state.entries[index].clone();
            let record = state.entries[index].record_mut();
            record.apply_patch(&patch);
            sort_newest_first(&mut state);
            snapshot
        };
        let optimistic = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .find(|e| e.id() == patch.id)
                .map(|e| e.record().clone())
        };

        if !self.offline.is_online() {
            debug!(id = %patch.id, "offline, queueing conversation update");
            let client = self.client.clone();
            let shared = self.state.clone();
            let replay_patch = patch.clone();
            self.offline.queue_operation(QueuedOperation::new(
                OperationKind::Update,
                Priority::Normal,
                "updateConversation",
                move || {
                    let client = client.clone();
                    let shared = shared.clone();
                    let patch = replay_patch.clone();
                    Box::pin(async move {
                        let updated = client.update_conversation(patch).await?;
                        let id = updated.id.clone();
                        commit_record(&shared, &id, updated);
                        Ok(())
                    })
                },
            ));
            return optimistic.ok_or_else(|| CoreError::not_found("conversation", &patch.id));
        }

        let client = self.client.clone();
        let result = run_with_recovery(&self.recovery, &self.options("updateConversation"), || {
            let client = client.clone();
            let patch = patch.clone();
            async move { client.update_conversation(patch).await }
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
                sort_newest_first(&mut state);
                Ok(updated)
            }
            Err(err) => {
                warn!(id = %patch.id, "update failed, rolling back: {err}");
                let mut state = self.state.lock();
                if let Some(index) = state.position_of(patch.id.as_str()) {
                    state.entries[index] = snapshot;
                }
                sort_newest_first(&mut state);
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Remove a conversation optimistically; reinserts it on failure.
    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let removed = {
            let mut state = self.state.lock();
            state.remove_id(id)
        };
        let Some((index, entry)) = removed else {
            return Err(CoreError::not_found("conversation", id));
        };

        if !self.offline.is_online() {
            debug!(id, "offline, queueing conversation delete");
            let client = self.client.clone();
            let id = id.to_string();
            self.offline.queue_operation(QueuedOperation::new(
                OperationKind::Delete,
                Priority::Normal,
                "deleteConversation",
                move || {
                    let client = client.clone();
                    let id = id.clone();
                    Box::pin(async move {
                        client.delete_conversation(&id).await?;
                        Ok(())
                    })
                },
            ));
            return Ok(());
        }

        let client = self.client.clone();
        let owned_id = id.to_string();
        let result = run_with_recovery(&self.recovery, &self.options("deleteConversation"), || {
            let client = client.clone();
            let id = owned_id.clone();
            async move { client.delete_conversation(&id).await }
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(id, "delete failed, restoring: {err}");
                let mut state = self.state.lock();
                let index = index.min(state.entries.len());
                state.entries.insert(index, entry);
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Apply a server-push event. Created events whose id is already present
    /// are echoes of our own mutations and are dropped.
    pub fn apply_event(&self, event: RemoteEvent<Conversation>) {
        let mut state = self.state.lock();
        match event {
            RemoteEvent::Created(record) => {
                if state.contains_id(&record.id) {
                    debug!(id = %record.id, "dropping created echo");
                    return;
                }
                state.entries.push(Entry::Committed { record });
                sort_newest_first(&mut state);
            }
            RemoteEvent::Updated(record) => match state.position_of(&record.id) {
                // A pending local edit wins until it commits or rolls back.
                Some(index) if state.entries[index].is_pending() => {}
                Some(index) => {
                    state.entries[index] = Entry::Committed { record };
                    sort_newest_first(&mut state);
                }
                None => {
                    state.entries.push(Entry::Committed { record });
                    sort_newest_first(&mut state);
                }
            },
            RemoteEvent::Deleted(record) => {
                state.remove_id(&record.id);
            }
        }
    }

    /// Case-insensitive title search over the loaded list. Read-only; the
    /// underlying list is untouched.
    pub fn search(&self, term: &str) -> Vec<Conversation> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.record())
            .filter(|c| text_contains_term(&c.title, term))
            .cloned()
            .collect()
    }

    fn commit(&self, temp_id: &str, record: Conversation) {
        commit_record(&self.state, temp_id, record);
    }
}
