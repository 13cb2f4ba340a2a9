use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error categories used across the core.
///
/// The kind is assigned at the point the error originates (transport,
/// subscription supervisor, store) so nothing downstream has to sniff
/// message strings. Foreign errors that arrive without a kind go through
/// the recovery manager's pattern fallback instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Subscription,
    Authentication,
    Permission,
    DataSync,
    Validation,
    RateLimit,
    Server,
    Client,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Subscription => "subscription",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::DataSync => "data-sync",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimit => "rate-limit",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Error severity, used to decide what must be surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorKind {
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Validation => Severity::Low,
            ErrorKind::Network | ErrorKind::Subscription | ErrorKind::RateLimit => Severity::Medium,
            ErrorKind::DataSync | ErrorKind::Server | ErrorKind::Client | ErrorKind::Unknown => {
                Severity::Medium
            }
            ErrorKind::Authentication | ErrorKind::Permission => Severity::High,
        }
    }
}

/// Core error type carrying an explicit kind.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Subscription, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn data_sync(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataSync, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::new(ErrorKind::Client, format!("{entity} {id} not found"))
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_preserved() {
        let err = CoreError::network("connection refused");
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn test_auth_and_permission_are_high_severity() {
        assert_eq!(ErrorKind::Authentication.severity(), Severity::High);
        assert_eq!(ErrorKind::Permission.severity(), Severity::High);
        assert!(ErrorKind::Network.severity() < Severity::High);
    }
}
