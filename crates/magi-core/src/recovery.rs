//! Error classification and recovery.
//!
//! The single place where errors are classified and a recovery strategy is
//! chosen. Stores and subscription handlers route caught errors through
//! here instead of re-implementing classification.
//!
//! Errors born inside this crate carry an explicit [`ErrorKind`] and are
//! trusted as-is; the ordered pattern table is only a fallback adapter for
//! foreign errors that arrive as bare text.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult, ErrorKind, Severity};

/// What the manager decided to do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Retry,
    ExponentialBackoff,
    Fallback,
    Reconnect,
    RefreshAuth,
    ClearCache,
    UserAction,
    NoRecovery,
}

type RecoveryHook = Arc<dyn Fn() -> BoxFuture<'static, CoreResult<()>> + Send + Sync>;

/// Per-call knobs for [`ErrorRecoveryManager::handle_error`].
#[derive(Clone)]
pub struct RecoveryOptions {
    /// Label for the operation that failed ("createConversation", ...).
    pub context: String,
    pub retryable: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub fallback: Option<RecoveryHook>,
}

impl RecoveryOptions {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            retryable: true,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            fallback: None,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_fallback(mut self, fallback: RecoveryHook) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub recovered: bool,
    pub strategy: RecoveryStrategy,
    /// Attempts consumed for this error key, including this one.
    pub attempts: u32,
    pub user_message: String,
    pub technical_message: String,
    pub suggested_actions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub context: String,
    pub message: String,
    pub strategy: RecoveryStrategy,
    pub recovered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorStatistics {
    pub total: u64,
    pub recovered: u64,
    pub unrecovered: u64,
    pub by_kind: HashMap<ErrorKind, u64>,
}

const HISTORY_CAPACITY: usize = 100;
const KEY_MESSAGE_PREFIX: usize = 50;

struct Hooks {
    reconnect: Option<RecoveryHook>,
    refresh_auth: Option<RecoveryHook>,
    clear_cache: Option<RecoveryHook>,
}

pub struct ErrorRecoveryManager {
    /// Ordered (pattern, kind) pairs; first match wins. Custom patterns are
    /// inserted at the front and therefore take priority.
    patterns: Mutex<Vec<(String, ErrorKind)>>,
    attempt_counts: Mutex<HashMap<String, u32>>,
    history: Mutex<VecDeque<ErrorRecord>>,
    hooks: Mutex<Hooks>,
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorRecoveryManager {
    pub fn new() -> Self {
        Self {
            patterns: Mutex::new(default_patterns()),
            attempt_counts: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            hooks: Mutex::new(Hooks {
                reconnect: None,
                refresh_auth: None,
                clear_cache: None,
            }),
        }
    }

    pub fn set_reconnect_hook(&self, hook: RecoveryHook) {
        self.hooks.lock().reconnect = Some(hook);
    }

    pub fn set_refresh_auth_hook(&self, hook: RecoveryHook) {
        self.hooks.lock().refresh_auth = Some(hook);
    }

    pub fn set_clear_cache_hook(&self, hook: RecoveryHook) {
        self.hooks.lock().clear_cache = Some(hook);
    }

    /// Register a classification pattern that outranks the built-in table.
    pub fn add_custom_pattern(&self, pattern: impl Into<String>, kind: ErrorKind) {
        self.patterns.lock().insert(0, (pattern.into().to_lowercase(), kind));
    }

    /// Fallback classifier for errors arriving as bare text.
    pub fn classify_foreign(&self, message: &str) -> ErrorKind {
        let lowered = message.to_lowercase();
        for (pattern, kind) in self.patterns.lock().iter() {
            if lowered.contains(pattern.as_str()) {
                return *kind;
            }
        }
        ErrorKind::Unknown
    }

    /// Wrap a foreign error, classifying it by message text.
    pub fn adapt_foreign(&self, error: &anyhow::Error) -> CoreError {
        let message = error.to_string();
        CoreError::new(self.classify_foreign(&message), message)
    }

    fn classify(&self, error: &CoreError) -> ErrorKind {
        if error.kind != ErrorKind::Unknown {
            return error.kind;
        }
        self.classify_foreign(&error.message)
    }

    fn attempt_key(kind: ErrorKind, context: &str, message: &str) -> String {
        let prefix: String = message.chars().take(KEY_MESSAGE_PREFIX).collect();
        format!("{}:{}:{}", kind.as_str(), context, prefix)
    }

    /// Clear the attempt counter for an error key (call after the operation
    /// eventually succeeds).
    pub fn reset_error_state(&self, error: &CoreError, context: &str) {
        let kind = self.classify(error);
        let key = Self::attempt_key(kind, context, &error.message);
        self.attempt_counts.lock().remove(&key);
    }

    pub fn reset_all(&self) {
        self.attempt_counts.lock().clear();
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        let history = self.history.lock();
        let mut stats = ErrorStatistics {
            total: history.len() as u64,
            ..Default::default()
        };
        for record in history.iter() {
            *stats.by_kind.entry(record.kind).or_insert(0) += 1;
            if record.recovered {
                stats.recovered += 1;
            } else {
                stats.unrecovered += 1;
            }
        }
        stats
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    fn record(&self, record: ErrorRecord) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn strategy_for(
        &self,
        kind: ErrorKind,
        options: &RecoveryOptions,
    ) -> RecoveryStrategy {
        let base = match kind {
            ErrorKind::Network | ErrorKind::RateLimit => RecoveryStrategy::ExponentialBackoff,
            ErrorKind::Subscription => RecoveryStrategy::Reconnect,
            ErrorKind::Authentication => RecoveryStrategy::RefreshAuth,
            ErrorKind::Permission | ErrorKind::Validation => RecoveryStrategy::UserAction,
            ErrorKind::DataSync | ErrorKind::Server => RecoveryStrategy::Retry,
            ErrorKind::Client => RecoveryStrategy::ClearCache,
            ErrorKind::Unknown => {
                if options.retryable {
                    RecoveryStrategy::Retry
                } else {
                    RecoveryStrategy::NoRecovery
                }
            }
        };
        // Retry strategies respect the per-call retryable flag.
        match base {
            RecoveryStrategy::Retry | RecoveryStrategy::ExponentialBackoff if !options.retryable => {
                RecoveryStrategy::NoRecovery
            }
            other => other,
        }
    }

    async fn run_hook(&self, hook: Option<RecoveryHook>) -> bool {
        match hook {
            Some(hook) => hook().await.is_ok(),
            None => false,
        }
    }

    /// Classify an error, pick a strategy, and execute it.
    ///
    /// `recovered: true` means the caller should retry the failed
    /// operation now; `false` means give up and surface the error. Once a
    /// key's attempts reach `max_retries`, further calls short-circuit to
    /// failure without executing any strategy, until the key is reset.
    pub async fn handle_error(
        &self,
        error: &CoreError,
        options: &RecoveryOptions,
    ) -> RecoveryResult {
        let kind = self.classify(error);
        let key = Self::attempt_key(kind, &options.context, &error.message);

        let prior_attempts = *self.attempt_counts.lock().get(&key).unwrap_or(&0);
        if prior_attempts >= options.max_retries {
            debug!(context = %options.context, kind = kind.as_str(), "retry budget exhausted");
            let result = self.failure_result(kind, error, RecoveryStrategy::NoRecovery, prior_attempts);
            self.record(ErrorRecord {
                timestamp: Utc::now(),
                kind,
                context: options.context.clone(),
                message: error.message.clone(),
                strategy: RecoveryStrategy::NoRecovery,
                recovered: false,
            });
            return result;
        }

        let attempts = prior_attempts + 1;
        self.attempt_counts.lock().insert(key, attempts);

        let strategy = self.strategy_for(kind, options);
        // Logging is fire-and-forget; MEDIUM+ severity additionally reaches
        // the UI through the result's user_message.
        warn!(
            context = %options.context,
            kind = kind.as_str(),
            attempts,
            ?strategy,
            "handling error: {}",
            error.message
        );

        let mut recovered = match strategy {
            RecoveryStrategy::Retry => {
                tokio::time::sleep(options.retry_delay).await;
                true
            }
            RecoveryStrategy::ExponentialBackoff => {
                let factor = 2u32.saturating_pow(prior_attempts);
                tokio::time::sleep(options.retry_delay * factor).await;
                true
            }
            RecoveryStrategy::Fallback => self.run_hook(options.fallback.clone()).await,
            RecoveryStrategy::Reconnect => {
                let hook = self.hooks.lock().reconnect.clone();
                self.run_hook(hook).await
            }
            RecoveryStrategy::RefreshAuth => {
                let hook = self.hooks.lock().refresh_auth.clone();
                self.run_hook(hook).await
            }
            RecoveryStrategy::ClearCache => {
                let hook = self.hooks.lock().clear_cache.clone();
                self.run_hook(hook).await
            }
            RecoveryStrategy::UserAction | RecoveryStrategy::NoRecovery => false,
        };

        // A named side effect that did not run falls through to the
        // caller-supplied fallback, when present.
        let mut executed = strategy;
        if !recovered
            && !matches!(strategy, RecoveryStrategy::Fallback)
            && options.fallback.is_some()
        {
            recovered = self.run_hook(options.fallback.clone()).await;
            if recovered {
                executed = RecoveryStrategy::Fallback;
            }
        }

        self.record(ErrorRecord {
            timestamp: Utc::now(),
            kind,
            context: options.context.clone(),
            message: error.message.clone(),
            strategy: executed,
            recovered,
        });

        if recovered {
            RecoveryResult {
                recovered: true,
                strategy: executed,
                attempts,
                user_message: String::new(),
                technical_message: error.message.clone(),
                suggested_actions: Vec::new(),
            }
        } else {
            self.failure_result(kind, error, executed, attempts)
        }
    }

    fn failure_result(
        &self,
        kind: ErrorKind,
        error: &CoreError,
        strategy: RecoveryStrategy,
        attempts: u32,
    ) -> RecoveryResult {
        let (user_message, suggested_actions) = user_guidance(kind);
        // Silent failure is disallowed: MEDIUM+ severity must surface.
        debug_assert!(
            kind.severity() < Severity::Medium || !user_message.is_empty(),
            "medium+ errors need a user message"
        );
        RecoveryResult {
            recovered: false,
            strategy,
            attempts,
            user_message,
            technical_message: error.message.clone(),
            suggested_actions,
        }
    }
}

fn user_guidance(kind: ErrorKind) -> (String, Vec<String>) {
    let (message, actions): (&str, &[&str]) = match kind {
        ErrorKind::Network => (
            "A network problem interrupted the operation.",
            &["Check your connection", "Retry in a moment"],
        ),
        ErrorKind::Subscription => (
            "The live update channel was interrupted.",
            &["Wait for automatic reconnection", "Refresh the view"],
        ),
        ErrorKind::Authentication => (
            "Your session has expired.",
            &["Sign in again"],
        ),
        ErrorKind::Permission => (
            "You do not have permission to do that.",
            &["Contact an administrator"],
        ),
        ErrorKind::DataSync => (
            "Your local data is out of sync with the server.",
            &["Refresh the view", "Retry the operation"],
        ),
        ErrorKind::Validation => (
            "The submitted data is invalid.",
            &["Correct the highlighted fields"],
        ),
        ErrorKind::RateLimit => (
            "Too many requests in a short time.",
            &["Wait a moment before retrying"],
        ),
        ErrorKind::Server => (
            "The server reported an internal error.",
            &["Retry", "Try again later if the problem persists"],
        ),
        ErrorKind::Client => (
            "The app hit an internal problem.",
            &["Reload the application"],
        ),
        ErrorKind::Unknown => (
            "Something went wrong.",
            &["Retry", "Reload the application"],
        ),
    };
    (
        message.to_string(),
        actions.iter().map(|s| (*s).to_string()).collect(),
    )
}

fn default_patterns() -> Vec<(String, ErrorKind)> {
    [
        ("network", ErrorKind::Network),
        ("fetch failed", ErrorKind::Network),
        ("connection", ErrorKind::Network),
        ("timeout", ErrorKind::Network),
        ("subscription", ErrorKind::Subscription),
        ("websocket", ErrorKind::Subscription),
        ("unauthenticated", ErrorKind::Authentication),
        ("not authenticated", ErrorKind::Authentication),
        ("token expired", ErrorKind::Authentication),
        ("unauthorized", ErrorKind::Permission),
        ("forbidden", ErrorKind::Permission),
        ("access denied", ErrorKind::Permission),
        ("conflict", ErrorKind::DataSync),
        ("version mismatch", ErrorKind::DataSync),
        ("validation", ErrorKind::Validation),
        ("invalid input", ErrorKind::Validation),
        ("rate limit", ErrorKind::RateLimit),
        ("too many requests", ErrorKind::RateLimit),
        ("429", ErrorKind::RateLimit),
        ("internal server error", ErrorKind::Server),
        ("500", ErrorKind::Server),
        ("502", ErrorKind::Server),
        ("503", ErrorKind::Server),
    ]
    .into_iter()
    .map(|(pattern, kind)| (pattern.to_string(), kind))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_options(context: &str) -> RecoveryOptions {
        RecoveryOptions::new(context).with_retry_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_pattern_fallback_first_match_wins() {
        let manager = ErrorRecoveryManager::new();
        assert_eq!(manager.classify_foreign("500 server error"), ErrorKind::Server);
        assert_eq!(manager.classify_foreign("Network request failed"), ErrorKind::Network);
        assert_eq!(manager.classify_foreign("totally novel"), ErrorKind::Unknown);
    }

    #[test]
    fn test_custom_patterns_take_priority() {
        let manager = ErrorRecoveryManager::new();
        // "connection" would normally classify as Network.
        manager.add_custom_pattern("connection pool", ErrorKind::Server);
        assert_eq!(
            manager.classify_foreign("connection pool exhausted"),
            ErrorKind::Server
        );
        assert_eq!(manager.classify_foreign("connection refused"), ErrorKind::Network);
    }

    #[test]
    fn test_explicit_kind_bypasses_patterns() {
        let manager = ErrorRecoveryManager::new();
        // Message mentions "network" but the origin said Validation.
        let error = CoreError::validation("network field is invalid");
        assert_eq!(manager.classify(&error), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_server_error_retries_then_short_circuits() {
        let manager = ErrorRecoveryManager::new();
        let error = CoreError::server("500 server error");
        let options = fast_options("updateConversation");

        for expected in 1..=3 {
            let result = manager.handle_error(&error, &options).await;
            assert!(result.recovered, "attempt {expected} should signal retry");
            assert_eq!(result.strategy, RecoveryStrategy::Retry);
            assert_eq!(result.attempts, expected);
        }

        // Budget spent: identical error short-circuits with no side effect.
        let exhausted = manager.handle_error(&error, &options).await;
        assert!(!exhausted.recovered);
        assert_eq!(exhausted.strategy, RecoveryStrategy::NoRecovery);
        assert!(exhausted.user_message.contains("server"));
        assert!(!exhausted.suggested_actions.is_empty());
    }

    #[tokio::test]
    async fn test_identical_errors_share_attempt_counter() {
        let manager = ErrorRecoveryManager::new();
        let options = fast_options("sync");
        let error = CoreError::network("connection reset");

        let first = manager.handle_error(&error, &options).await;
        let second = manager.handle_error(&error, &options).await;
        assert_eq!(first.attempts, 1);
        assert_eq!(second.attempts, 2);

        // Different context gets its own counter.
        let elsewhere = manager.handle_error(&error, &fast_options("other")).await;
        assert_eq!(elsewhere.attempts, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_attempt_counter() {
        let manager = ErrorRecoveryManager::new();
        let options = fast_options("op").with_max_retries(1);
        let error = CoreError::server("503");

        assert!(manager.handle_error(&error, &options).await.recovered);
        assert!(!manager.handle_error(&error, &options).await.recovered);

        manager.reset_error_state(&error, "op");
        assert!(manager.handle_error(&error, &options).await.recovered);
    }

    #[tokio::test]
    async fn test_permission_errors_require_user_action() {
        let manager = ErrorRecoveryManager::new();
        let result = manager
            .handle_error(&CoreError::permission("access denied"), &fast_options("op"))
            .await;
        assert!(!result.recovered);
        assert_eq!(result.strategy, RecoveryStrategy::UserAction);
        assert!(result.suggested_actions.iter().any(|a| a.contains("administrator")));
    }

    #[tokio::test]
    async fn test_reconnect_hook_is_invoked_for_subscription_errors() {
        let manager = ErrorRecoveryManager::new();
        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = invoked.clone();
        manager.set_reconnect_hook(Arc::new(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }));

        let result = manager
            .handle_error(&CoreError::subscription("websocket closed"), &fast_options("subs"))
            .await;
        assert!(result.recovered);
        assert_eq!(result.strategy, RecoveryStrategy::Reconnect);
        assert!(invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fallback_runs_when_named_side_effect_is_missing() {
        let manager = ErrorRecoveryManager::new();
        // No clear-cache hook registered; fallback should take over.
        let options = fast_options("op").with_fallback(Arc::new(|| Box::pin(async { Ok(()) })));
        let result = manager
            .handle_error(&CoreError::new(ErrorKind::Client, "corrupt local state"), &options)
            .await;
        assert!(result.recovered);
        assert_eq!(result.strategy, RecoveryStrategy::Fallback);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_statistics_add_up() {
        let manager = ErrorRecoveryManager::new();
        let options = RecoveryOptions::new("bulk")
            .with_retry_delay(Duration::from_millis(0))
            .with_max_retries(u32::MAX);
        for i in 0..120 {
            let error = CoreError::server(format!("500 burst {i}"));
            manager.handle_error(&error, &options).await;
        }
        let stats = manager.error_statistics();
        assert_eq!(stats.total, 100);
        assert_eq!(stats.recovered + stats.unrecovered, stats.total);
        assert_eq!(stats.by_kind.get(&ErrorKind::Server), Some(&100));
        assert_eq!(manager.recent_errors(5).len(), 5);
    }
}
