//! Subscription lifecycle supervision.
//!
//! Each subscription key gets a supervisor task that connects the transport
//! stream, forwards events into the caller's channel, and drives the
//! reconnect state machine when the stream fails. Attempt `n` waits
//! `base_interval * 2^(n-1)`; after `max_attempts` consecutive failures the
//! subscription parks in [`SubscriptionStatus::Error`] until replaced.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ReconnectConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::{Conversation, Message, TraceStep};
use crate::transport::{RemoteEvent, TransportClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// The stream has failed. Transient while a reconnect is being
    /// scheduled; terminal once the reconnect budget is exhausted.
    Error,
}

/// What a supervisor forwards into the caller's channel. Errors are
/// forwarded before any reconnect is scheduled, so consumers always see
/// the failure even when recovery succeeds.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    Conversation(RemoteEvent<Conversation>),
    Message(RemoteEvent<Message>),
    TraceStep(RemoteEvent<TraceStep>),
    Error { key: String, error: CoreError },
}

/// Snapshot of one managed subscription, for status surfaces.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub key: String,
    pub status: SubscriptionStatus,
    pub attempts: u32,
    pub last_error: Option<CoreError>,
}

struct SubscriptionState {
    status: Mutex<SubscriptionStatus>,
    attempts: AtomicU32,
    last_error: Mutex<Option<CoreError>>,
}

impl SubscriptionState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(SubscriptionStatus::Disconnected),
            attempts: AtomicU32::new(0),
            last_error: Mutex::new(None),
        })
    }
}

struct ManagedSubscription {
    state: Arc<SubscriptionState>,
    task: JoinHandle<()>,
}

/// Owns every live subscription and its supervisor task.
///
/// Instances are cheap to share behind an `Arc`; there is no global
/// singleton, the runtime constructs one and hands it down.
pub struct SubscriptionManager<C> {
    client: Arc<C>,
    config: ReconnectConfig,
    entries: Mutex<HashMap<String, ManagedSubscription>>,
}

impl<C: TransportClient> SubscriptionManager<C> {
    pub fn new(client: Arc<C>, config: ReconnectConfig) -> Self {
        Self {
            client,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to conversation events for one user. Subscribing an
    /// already-subscribed key replaces the previous subscription.
    pub fn subscribe_conversations(&self, user_id: &str, tx: mpsc::Sender<SubscriptionUpdate>) {
        let client = self.client.clone();
        let user_id = user_id.to_string();
        self.install(
            format!("conversations:{user_id}"),
            tx,
            move || {
                let client = client.clone();
                let user_id = user_id.clone();
                async move { client.conversation_events(&user_id).await }
            },
            SubscriptionUpdate::Conversation,
        );
    }

    pub fn subscribe_messages(&self, conversation_id: &str, tx: mpsc::Sender<SubscriptionUpdate>) {
        let client = self.client.clone();
        let conversation_id = conversation_id.to_string();
        self.install(
            format!("messages:{conversation_id}"),
            tx,
            move || {
                let client = client.clone();
                let conversation_id = conversation_id.clone();
                async move { client.message_events(&conversation_id).await }
            },
            SubscriptionUpdate::Message,
        );
    }

    pub fn subscribe_trace_steps(&self, message_id: &str, tx: mpsc::Sender<SubscriptionUpdate>) {
        let client = self.client.clone();
        let message_id = message_id.to_string();
        self.install(
            format!("trace-steps:{message_id}"),
            tx,
            move || {
                let client = client.clone();
                let message_id = message_id.clone();
                async move { client.trace_step_events(&message_id).await }
            },
            SubscriptionUpdate::TraceStep,
        );
    }

    fn install<T, F, Fut, M>(
        &self,
        key: String,
        tx: mpsc::Sender<SubscriptionUpdate>,
        connect: F,
        map: M,
    ) where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<mpsc::Receiver<RemoteEvent<T>>>> + Send + 'static,
        M: Fn(RemoteEvent<T>) -> SubscriptionUpdate + Send + 'static,
    {
        let state = SubscriptionState::new();
        let task = tokio::spawn(supervise(
            key.clone(),
            state.clone(),
            self.config.clone(),
            connect,
            map,
            tx,
        ));
        let previous = self.entries.lock().insert(
            key.clone(),
            ManagedSubscription { state, task },
        );
        if let Some(previous) = previous {
            debug!(key = %key, "replacing existing subscription");
            previous.task.abort();
        }
    }

    /// Tear down one subscription. A no-op for unknown keys.
    pub fn unsubscribe(&self, key: &str) {
        if let Some(entry) = self.entries.lock().remove(key) {
            *entry.state.status.lock() = SubscriptionStatus::Disconnected;
            entry.task.abort();
            debug!(key, "unsubscribed");
        }
    }

    pub fn unsubscribe_all(&self) {
        let entries: Vec<_> = self.entries.lock().drain().collect();
        for (key, entry) in entries {
            *entry.state.status.lock() = SubscriptionStatus::Disconnected;
            entry.task.abort();
            debug!(key = %key, "unsubscribed");
        }
    }

    pub fn subscription_status(&self, key: &str) -> Option<SubscriptionStatus> {
        self.entries.lock().get(key).map(|e| *e.state.status.lock())
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| SubscriptionInfo {
                key: key.clone(),
                status: *entry.state.status.lock(),
                attempts: entry.state.attempts.load(Ordering::SeqCst),
                last_error: entry.state.last_error.lock().clone(),
            })
            .collect()
    }
}

impl<C> Drop for SubscriptionManager<C> {
    fn drop(&mut self) {
        for entry in self.entries.lock().values() {
            entry.task.abort();
        }
    }
}

/// Backoff before reconnect attempt `attempt` (1-based).
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

async fn supervise<T, F, Fut, M>(
    key: String,
    state: Arc<SubscriptionState>,
    config: ReconnectConfig,
    connect: F,
    map: M,
    tx: mpsc::Sender<SubscriptionUpdate>,
) where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = CoreResult<mpsc::Receiver<RemoteEvent<T>>>> + Send + 'static,
    M: Fn(RemoteEvent<T>) -> SubscriptionUpdate + Send + 'static,
{
    loop {
        let prior_attempts = state.attempts.load(Ordering::SeqCst);
        *state.status.lock() = if prior_attempts == 0 {
            SubscriptionStatus::Connecting
        } else {
            SubscriptionStatus::Reconnecting {
                attempt: prior_attempts,
            }
        };

        let error = match connect().await {
            Ok(mut events) => {
                *state.status.lock() = SubscriptionStatus::Connected;
                state.attempts.store(0, Ordering::SeqCst);
                debug!(key = %key, "subscription connected");

                loop {
                    match events.recv().await {
                        Some(event) => {
                            if tx.send(map(event)).await.is_err() {
                                // Consumer gone; nothing left to supervise.
                                *state.status.lock() = SubscriptionStatus::Disconnected;
                                return;
                            }
                        }
                        None => break CoreError::subscription("event stream ended"),
                    }
                }
            }
            Err(err) => err,
        };

        let attempt = state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        // The stream is gone the moment the failure is observed; the status
        // must reflect that before any reconnect is scheduled.
        *state.status.lock() = SubscriptionStatus::Error;
        *state.last_error.lock() = Some(error.clone());
        warn!(key = %key, attempt, "subscription failed: {error}");

        // Surface the failure before deciding whether to reconnect.
        if tx
            .send(SubscriptionUpdate::Error {
                key: key.clone(),
                error,
            })
            .await
            .is_err()
        {
            *state.status.lock() = SubscriptionStatus::Disconnected;
            return;
        }

        if !config.auto_reconnect || attempt >= config.max_attempts {
            warn!(key = %key, attempt, "reconnect budget exhausted, parking");
            *state.status.lock() = SubscriptionStatus::Error;
            return;
        }

        *state.status.lock() = SubscriptionStatus::Reconnecting { attempt };
        tokio::time::sleep(backoff_delay(config.base_interval, attempt)).await;
    }
}
