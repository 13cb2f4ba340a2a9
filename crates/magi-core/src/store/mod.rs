//! Entity stores with optimistic mutations.
//!
//! Each store owns a list of [`Entry`] values: mutations insert or patch
//! records locally first, then confirm against the transport and either
//! commit the server record or roll the local change back. Subscription
//! events land through `apply_event`, which drops echoes of our own
//! committed mutations by id. Concurrent mutations on the same id are
//! last-write-wins; there is no per-id serialization.

pub mod conversations;
pub mod messages;

pub use conversations::ConversationStore;
pub use messages::MessageStore;

use std::future::Future;

use crate::error::{CoreError, CoreResult};
use crate::models::{Conversation, Message};
use crate::recovery::{ErrorRecoveryManager, RecoveryOptions};

/// Drive one transport operation through the recovery manager, retrying as
/// long as the chosen strategy reports recovery. Successful completion after
/// failures clears the attempt counter for the error key.
pub(crate) async fn run_with_recovery<T, F, Fut>(
    recovery: &ErrorRecoveryManager,
    options: &RecoveryOptions,
    op: F,
) -> CoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut last_failure: Option<CoreError> = None;
    loop {
        match op().await {
            Ok(value) => {
                if let Some(err) = last_failure {
                    recovery.reset_error_state(&err, &options.context);
                }
                return Ok(value);
            }
            Err(err) => {
                let outcome = recovery.handle_error(&err, options).await;
                if !outcome.recovered {
                    return Err(err);
                }
                last_failure = Some(err);
            }
        }
    }
}

/// Record types a store can hold.
pub trait Record: Clone + Send + 'static {
    fn id(&self) -> &str;
}

impl Record for Conversation {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Message {
    fn id(&self) -> &str {
        &self.id
    }
}

/// One store slot. A record is `Pending` from the moment it is shown
/// optimistically until the transport confirms it; the variant tag is the
/// only thing that distinguishes the two, ids carry no special prefixes.
#[derive(Debug, Clone)]
pub enum Entry<T> {
    Pending { temp_id: String, record: T },
    Committed { record: T },
}

impl<T: Record> Entry<T> {
    pub fn pending(record: T) -> Self {
        Entry::Pending {
            temp_id: record.id().to_string(),
            record,
        }
    }

    pub fn record(&self) -> &T {
        match self {
            Entry::Pending { record, .. } | Entry::Committed { record } => record,
        }
    }

    pub fn record_mut(&mut self) -> &mut T {
        match self {
            Entry::Pending { record, .. } | Entry::Committed { record } => record,
        }
    }

    /// The id this entry is addressed by: the temp id while pending, the
    /// record's own id once committed.
    pub fn id(&self) -> &str {
        match self {
            Entry::Pending { temp_id, .. } => temp_id,
            Entry::Committed { record } => record.id(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Entry::Pending { .. })
    }
}

/// Mutable store internals, kept behind one lock.
pub(crate) struct StoreState<T> {
    pub entries: Vec<Entry<T>>,
    pub next_token: Option<String>,
    pub loading: bool,
    pub error: Option<CoreError>,
}

impl<T: Record> StoreState<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_token: None,
            loading: false,
            error: None,
        }
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id() == id)
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == id)
    }

    pub fn remove_id(&mut self, id: &str) -> Option<(usize, Entry<T>)> {
        let index = self.position_of(id)?;
        Some((index, self.entries.remove(index)))
    }

    /// Swap the pending entry `temp_id` for the confirmed server record.
    /// If a subscription echo already inserted the server record, the
    /// pending entry is simply dropped.
    pub fn commit(&mut self, temp_id: &str, record: T) {
        let server_id = record.id().to_string();
        match self.position_of(temp_id) {
            Some(index) if self.contains_id(&server_id) && server_id != temp_id => {
                self.entries.remove(index);
            }
            Some(index) => {
                self.entries[index] = Entry::Committed { record };
            }
            None if !self.contains_id(&server_id) => {
                self.entries.push(Entry::Committed { record });
            }
            None => {}
        }
    }

    pub fn records(&self) -> Vec<T> {
        self.entries.iter().map(|e| e.record().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewConversation;

    fn conversation(title: &str) -> Conversation {
        Conversation::optimistic(&NewConversation {
            user_id: "u1".to_string(),
            title: title.to_string(),
            agent_preset_id: None,
        })
    }

    #[test]
    fn test_commit_swaps_pending_for_server_record() {
        let mut state: StoreState<Conversation> = StoreState::new();
        let local = conversation("draft");
        let temp_id = local.id.clone();
        state.entries.push(Entry::pending(local));

        let mut server = conversation("draft");
        server.id = "server-assigned".to_string();
        state.commit(&temp_id, server);

        assert_eq!(state.entries.len(), 1);
        assert!(!state.entries[0].is_pending());
        assert_eq!(state.entries[0].id(), "server-assigned");
    }

    #[test]
    fn test_commit_drops_pending_when_echo_arrived_first() {
        let mut state: StoreState<Conversation> = StoreState::new();
        let local = conversation("draft");
        let temp_id = local.id.clone();
        state.entries.push(Entry::pending(local));

        let mut server = conversation("draft");
        server.id = "server-assigned".to_string();
        // Subscription echo landed before the mutation response.
        state.entries.push(Entry::Committed {
            record: server.clone(),
        });

        state.commit(&temp_id, server);
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].id(), "server-assigned");
    }
}
