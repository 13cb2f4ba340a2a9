//! Offline mutation queue.
//!
//! While the network is down, stores hand their mutations here instead of
//! the transport. Operations are replayed on demand in priority order,
//! FIFO within a priority tier. The queue is in-memory; durability belongs
//! to the hosting application.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// Replayable operation. The work closure re-issues the mutation against
/// the transport and owns whatever reconciliation follows.
pub struct QueuedOperation {
    pub kind: OperationKind,
    pub priority: Priority,
    /// Short human-readable label for logs.
    pub label: String,
    pub retry: bool,
    work: Arc<dyn Fn() -> BoxFuture<'static, CoreResult<()>> + Send + Sync>,
}

impl QueuedOperation {
    pub fn new<F>(kind: OperationKind, priority: Priority, label: impl Into<String>, work: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, CoreResult<()>> + Send + Sync + 'static,
    {
        Self {
            kind,
            priority,
            label: label.into(),
            retry: true,
            work: Arc::new(work),
        }
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }
}

/// How many times a retryable operation is re-queued before being dropped.
const MAX_REPLAY_ATTEMPTS: u32 = 3;

struct QueueSlot {
    operation: QueuedOperation,
    attempts: u32,
    /// Monotonic enqueue sequence, used to keep FIFO order within a tier.
    sequence: u64,
}

pub struct OfflineQueue {
    online_tx: watch::Sender<bool>,
    queue: Mutex<Vec<QueueSlot>>,
    next_sequence: Mutex<u64>,
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineQueue {
    pub fn new() -> Self {
        let (online_tx, _) = watch::channel(true);
        Self {
            online_tx,
            queue: Mutex::new(Vec::new()),
            next_sequence: Mutex::new(0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        // send_replace never fails even with no subscribers.
        self.online_tx.send_replace(online);
    }

    /// Subscribe to connectivity changes. The receiver yields the current
    /// value first, then every transition.
    pub fn network_changes(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Buffer an operation for deferred replay.
    pub fn queue_operation(&self, operation: QueuedOperation) {
        debug!(label = %operation.label, "queueing offline operation");
        let sequence = {
            let mut next = self.next_sequence.lock();
            let seq = *next;
            *next += 1;
            seq
        };
        self.queue.lock().push(QueueSlot {
            operation,
            attempts: 0,
            sequence,
        });
    }

    /// Replay everything queued, highest priority first and FIFO within a
    /// tier. Failed retryable operations go back to the queue until their
    /// replay budget is spent; non-retryable failures are dropped.
    pub async fn sync_queued_operations(&self) {
        let mut slots: Vec<QueueSlot> = {
            let mut queue = self.queue.lock();
            std::mem::take(&mut *queue)
        };
        if slots.is_empty() {
            return;
        }
        slots.sort_by(|a, b| {
            b.operation
                .priority
                .cmp(&a.operation.priority)
                .then(a.sequence.cmp(&b.sequence))
        });

        debug!(count = slots.len(), "replaying offline queue");
        for mut slot in slots {
            let work = slot.operation.work.clone();
            match work().await {
                Ok(()) => debug!(label = %slot.operation.label, "replayed"),
                Err(err) => {
                    slot.attempts += 1;
                    if slot.operation.retry && slot.attempts < MAX_REPLAY_ATTEMPTS {
                        warn!(label = %slot.operation.label, %err, "replay failed, re-queueing");
                        self.queue.lock().push(slot);
                    } else {
                        warn!(label = %slot.operation.label, %err, "replay failed, dropping");
                    }
                }
            }
        }
    }
}
