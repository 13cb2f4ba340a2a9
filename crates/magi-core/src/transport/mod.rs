//! Abstract data-access contract the core depends on.
//!
//! A `TransportClient` exposes schema-typed CRUD plus push subscriptions per
//! entity. Exactly one implementation is selected at startup from
//! [`CoreConfig`](crate::config::CoreConfig); this crate ships the in-memory
//! [`MockTransport`]. The AppSync-backed client lives outside this crate and
//! implements the same trait.

pub mod mock;

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::CoreResult;
use crate::models::{Conversation, ConversationPatch, Message, NewConversation, NewMessage, TraceStep};

pub use mock::MockTransport;

/// One page of a forward-only cursor listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// Server-push event for one entity scope. Subscriptions only reflect
/// mutations, they never originate them.
#[derive(Debug, Clone)]
pub enum RemoteEvent<T> {
    Created(T),
    Updated(T),
    Deleted(T),
}

impl<T> RemoteEvent<T> {
    pub fn record(&self) -> &T {
        match self {
            RemoteEvent::Created(r) | RemoteEvent::Updated(r) | RemoteEvent::Deleted(r) => r,
        }
    }
}

/// Schema-typed data-access client.
///
/// Subscription methods return a receiver that yields events until the
/// underlying channel fails or the subscription is cancelled by dropping
/// the receiver.
pub trait TransportClient: Send + Sync + 'static {
    // Conversations (scoped by user)
    fn list_conversations(
        &self,
        user_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> impl Future<Output = CoreResult<Page<Conversation>>> + Send;

    fn get_conversation(
        &self,
        id: &str,
    ) -> impl Future<Output = CoreResult<Option<Conversation>>> + Send;

    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> impl Future<Output = CoreResult<Conversation>> + Send;

    fn update_conversation(
        &self,
        patch: ConversationPatch,
    ) -> impl Future<Output = CoreResult<Conversation>> + Send;

    fn delete_conversation(&self, id: &str) -> impl Future<Output = CoreResult<bool>> + Send;

    fn conversation_events(
        &self,
        user_id: &str,
    ) -> impl Future<Output = CoreResult<mpsc::Receiver<RemoteEvent<Conversation>>>> + Send;

    // Messages (scoped by conversation)
    fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> impl Future<Output = CoreResult<Page<Message>>> + Send;

    fn create_message(
        &self,
        input: NewMessage,
    ) -> impl Future<Output = CoreResult<Message>> + Send;

    fn update_message(
        &self,
        id: &str,
        content: String,
    ) -> impl Future<Output = CoreResult<Message>> + Send;

    fn delete_message(&self, id: &str) -> impl Future<Output = CoreResult<bool>> + Send;

    fn message_events(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = CoreResult<mpsc::Receiver<RemoteEvent<Message>>>> + Send;

    // Trace steps (scoped by message)
    fn list_trace_steps(
        &self,
        message_id: &str,
    ) -> impl Future<Output = CoreResult<Vec<TraceStep>>> + Send;

    fn trace_step_events(
        &self,
        message_id: &str,
    ) -> impl Future<Output = CoreResult<mpsc::Receiver<RemoteEvent<TraceStep>>>> + Send;
}
