//! Configuration surface for the gateway
//!
//! All durations are milliseconds to match the recognized configuration
//! keys. Defaults follow the operational values the switch expects.

use serde::{Deserialize, Serialize};

/// One TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// "host:port" form for connectors and logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-socket configuration: primary endpoint, optional backup, timeouts
/// and TCP options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    pub primary: EndpointConfig,
    pub backup: Option<EndpointConfig>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub recv_buffer_bytes: Option<usize>,
    pub send_buffer_bytes: Option<usize>,
}

impl SocketConfig {
    /// Reasonable defaults against one endpoint
    pub fn for_endpoint(primary: EndpointConfig) -> Self {
        Self {
            primary,
            backup: None,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 5_000,
            idle_timeout_ms: 120_000,
            keep_alive: true,
            no_delay: true,
            recv_buffer_bytes: None,
            send_buffer_bytes: None,
        }
    }

    /// Same defaults plus a backup endpoint
    pub fn with_backup(mut self, backup: EndpointConfig) -> Self {
        self.backup = Some(backup);
        self
    }
}

/// Whether the logical link runs over two sockets or one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMode {
    /// Separate send and receive sockets (standard FISC topology)
    Dual,
    /// Both roles over one socket
    Single,
}

/// What to do when one socket of a dual-channel link drops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureStrategy {
    /// Keep serving while either socket is up; queue sends until the send
    /// socket is restored
    FailWhenBothDown,
    /// Single-socket loss cancels all pending requests and forces a full
    /// reconnect
    FailWhenAnyDown,
    /// Route both directions over the surviving socket while the dead one
    /// reconnects in the background. Non-standard upstream.
    FallbackToSingle,
}

/// Retry / backoff parameters, shared by reconnect and dispatch retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Cap applied after backoff
    pub max_delay_ms: u64,
    /// Exponential multiplier per attempt
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.0..1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Financial transactions cap at two retries after the initial
    /// dispatch so a duplicate effect can never outlive the reversal
    /// window
    pub fn financial() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Base delay for attempt `n` (1-based), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = (self.initial_delay_ms as f64 * exp) as u64;
        delay.min(self.max_delay_ms)
    }
}

/// Configuration of one logical FISC link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Institution id carried in sign-on
    pub institution_id: String,
    /// Logical channel id for logs and the connection registry
    pub channel_id: String,
    /// Dual- or single-socket topology
    pub mode: ChannelMode,
    /// Send-socket configuration
    pub send: SocketConfig,
    /// Receive-socket configuration (ignored in single mode)
    pub receive: SocketConfig,
    /// Echo-test interval
    pub heartbeat_interval_ms: u64,
    /// Health-check sweep interval
    pub health_check_interval_ms: u64,
    /// Behavior when one socket of a dual link drops
    pub failure_strategy: FailureStrategy,
    /// Reconnect backoff parameters
    pub retry: RetryConfig,
    /// Reconnect automatically on failure
    pub auto_reconnect: bool,
    /// Connect on startup
    pub auto_connect: bool,
    /// Sign on right after connecting
    pub auto_sign_on: bool,
    /// Grace period for inflight completions on close
    pub graceful_shutdown_timeout_ms: u64,
}

impl ConnectionConfig {
    /// Dual-channel defaults against the given endpoints
    pub fn dual(
        institution_id: impl Into<String>,
        send: SocketConfig,
        receive: SocketConfig,
    ) -> Self {
        Self {
            institution_id: institution_id.into(),
            channel_id: "fisc".to_string(),
            mode: ChannelMode::Dual,
            send,
            receive,
            heartbeat_interval_ms: 30_000,
            health_check_interval_ms: 10_000,
            failure_strategy: FailureStrategy::FailWhenBothDown,
            retry: RetryConfig::default(),
            auto_reconnect: true,
            auto_connect: true,
            auto_sign_on: true,
            graceful_shutdown_timeout_ms: 10_000,
        }
    }

    /// Single-socket defaults against one endpoint
    pub fn single(institution_id: impl Into<String>, socket: SocketConfig) -> Self {
        Self {
            institution_id: institution_id.into(),
            channel_id: "fisc".to_string(),
            mode: ChannelMode::Single,
            send: socket.clone(),
            receive: socket,
            heartbeat_interval_ms: 30_000,
            health_check_interval_ms: 10_000,
            failure_strategy: FailureStrategy::FailWhenAnyDown,
            retry: RetryConfig::default(),
            auto_reconnect: true,
            auto_connect: true,
            auto_sign_on: true,
            graceful_shutdown_timeout_ms: 10_000,
        }
    }
}
