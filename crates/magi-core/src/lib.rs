//! Client-side core of the MAGI decision system.
//!
//! Everything between the UI and the backend lives here: entity stores
//! with optimistic mutations, supervised subscriptions with exponential
//! backoff, an offline queue that replays on reconnect, centralized error
//! recovery, the deterministic mock agent pipeline, and the windowing math
//! for long message lists. [`runtime::CoreRuntime`] wires the pieces
//! together.

pub mod agents;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod offline;
pub mod recovery;
pub mod runtime;
pub mod scroll;
pub mod search;
pub mod store;
pub mod subscriptions;
pub mod transport;

pub use config::{CoreConfig, ReconnectConfig, TransportMode};
pub use error::{CoreError, CoreResult, ErrorKind, Severity};
pub use runtime::CoreRuntime;
pub use store::{ConversationStore, MessageStore};
pub use subscriptions::{SubscriptionManager, SubscriptionStatus, SubscriptionUpdate};
pub use transport::{MockTransport, RemoteEvent, TransportClient};
