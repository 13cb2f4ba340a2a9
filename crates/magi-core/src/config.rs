use std::time::Duration;

/// Which transport backs the runtime. Chosen once at startup; there is no
/// per-call mode switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Mock,
    Real,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub transport_mode: TransportMode,
    /// Page size for initial fetch and load-more.
    pub page_size: usize,
    pub reconnect: ReconnectConfig,
    /// Default mutation retry budget routed through the recovery manager.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

/// Subscription reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    /// Base backoff interval; attempt n waits `base * 2^(n-1)`.
    pub base_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 5,
            base_interval: Duration::from_millis(3000),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            transport_mode: TransportMode::Mock,
            page_size: 50,
            reconnect: ReconnectConfig::default(),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}
