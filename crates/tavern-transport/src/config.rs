//! Channel configuration.
//!
//! All durations are stored in milliseconds so the structs deserialize
//! cleanly from JSON or TOML settings; `Duration` accessors are provided.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::kinds;

/// Default time allowed for the physical link to open.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default request deadline.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
/// Default outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
/// Default base reconnection delay.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
/// Default reconnection delay cap.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default number of reconnection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Heartbeat settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// Period between heartbeat frames.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Silence after which the link is considered dead (default: 2x interval).
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

impl HeartbeatConfig {
    /// Heartbeat every `interval`, timing out after two missed periods.
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Self {
            interval_ms,
            timeout_ms: interval_ms.saturating_mul(2),
        }
    }

    /// Heartbeat period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Acknowledgment timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

/// Reconnection backoff settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failures tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ReconnectConfig {
    /// Base delay.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Transport channel configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// Time allowed for the physical link to open.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline applied by `Channel::request`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Frames held while disconnected; newer frames are dropped beyond this.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reconnection settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Client name sent in the handshake.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Capabilities declared in the handshake.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

impl TransportConfig {
    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Default request deadline.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Replace the heartbeat settings.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Replace the reconnection settings.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the outbound queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the default request deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the client name announced in the handshake.
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            client_name: default_client_name(),
            capabilities: default_capabilities(),
        }
    }
}

const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
const fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
const fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
const fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
const fn default_heartbeat_timeout_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS * 2
}
const fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
const fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_client_name() -> String {
    "tavern-client".to_owned()
}
fn default_capabilities() -> Vec<String> {
    [
        kinds::HEARTBEAT,
        kinds::AGENT_THINKING,
        kinds::AGENT_RESPONSE,
        kinds::CONVERSATION_START,
        kinds::CONVERSATION_UPDATE,
        kinds::AGENT_STATE_CHANGE,
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}
