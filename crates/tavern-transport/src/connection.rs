//! Connection record owned by the channel driver.

use serde::{Deserialize, Serialize};

use crate::link::Link;

/// Lifecycle of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Last attempt failed, or reconnection gave up.
    Errored,
}

impl ConnectionState {
    /// Whether moving to `next` is allowed. `Connected` is only reachable
    /// from `Connecting`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Connected => matches!(self, Self::Connecting),
            Self::Connecting => !matches!(self, Self::Connected | Self::Connecting),
            Self::Disconnected | Self::Errored => true,
        }
    }
}

/// The single connection of a channel: at most one live link at a time.
#[derive(Debug, Default)]
pub struct Connection {
    state: ConnectionState,
    endpoint: Option<String>,
    link: Option<Link>,
}

impl Connection {
    /// Create a disconnected record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(from = ?self.state, to = ?next, "Connection state change");
            self.state = next;
        } else {
            tracing::warn!(from = ?self.state, to = ?next, "Rejected connection state change");
        }
    }

    /// An attempt to reach `endpoint` started.
    pub fn begin_connecting(&mut self, endpoint: &str) {
        self.endpoint = Some(endpoint.to_owned());
        self.transition(ConnectionState::Connecting);
    }

    /// The attempt succeeded.
    pub fn established(&mut self, link: Link) {
        self.link = Some(link);
        self.transition(ConnectionState::Connected);
    }

    /// The attempt failed.
    pub fn attempt_failed(&mut self) {
        self.link = None;
        self.transition(ConnectionState::Errored);
    }

    /// The link went away on its own. Returns it so the caller can close it.
    pub fn lost(&mut self) -> Option<Link> {
        self.transition(ConnectionState::Disconnected);
        self.link.take()
    }

    /// Reconnection gave up.
    pub fn give_up(&mut self) {
        self.transition(ConnectionState::Errored);
    }

    /// Intentional close. Returns the link so the caller can close it.
    pub fn close(&mut self) -> Option<Link> {
        self.transition(ConnectionState::Disconnected);
        self.link.take()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Endpoint of the current or last connection.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Whether a link is up.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected) && self.link.is_some()
    }

    /// The live link, if any.
    pub const fn link_mut(&mut self) -> Option<&mut Link> {
        self.link.as_mut()
    }
}

/// Diagnostics snapshot published by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub queued_message_count: usize,
    pub pending_request_count: usize,
    pub dropped_message_count: u64,
    pub endpoint: Option<String>,
}
