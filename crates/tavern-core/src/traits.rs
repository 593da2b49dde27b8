//! Session and participant types plus the observer traits presentation
//! collaborators implement.

use std::{borrow::Borrow, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::SessionMetadata;

/// Session identifier.
pub type SessionId = Uuid;

/// Agent identifier as announced by the simulation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Wrap a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is blank.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Submitted, admission not yet decided.
    Requested,
    /// Waiting for capacity.
    Queued,
    /// Capacity granted, not yet announced.
    Admitted,
    /// Live conversation.
    Active,
    /// Being torn down.
    Retiring,
    /// Finished; capacity released.
    Closed,
}

/// Where a session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// Requested by this client; announced over the channel.
    Local,
    /// Started by the simulation server.
    Remote,
}

/// Why a session was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Lifetime budget elapsed.
    Expired,
    /// Explicit end signal.
    Ended,
    /// The connection dropped or was closed.
    ConnectionClosed,
    /// Withdrawn while still queued.
    Cancelled,
}

/// One conversation between two or more agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Participants in speaking order; the first is the initiator.
    pub participants: Vec<AgentId>,
    /// Free-form metadata.
    pub metadata: SessionMetadata,
    /// Current status.
    pub status: SessionStatus,
    /// Local or remote origin.
    pub origin: SessionOrigin,
    /// Creation timestamp (unix epoch millis).
    pub created_at: i64,
    /// Lifetime budget in milliseconds.
    pub lifetime_ms: u64,
}

impl Session {
    /// The agent that opened the conversation.
    #[must_use]
    pub fn initiator(&self) -> Option<&AgentId> {
        self.participants.first()
    }

    /// Every participant except the initiator.
    pub fn listeners(&self) -> impl Iterator<Item = &AgentId> {
        self.participants.iter().skip(1)
    }

    /// Whether `agent` takes part in this session.
    #[must_use]
    pub fn involves(&self, agent: &AgentId) -> bool {
        self.participants.contains(agent)
    }

    /// Lifetime budget.
    #[must_use]
    pub const fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }
}

/// Interaction phase of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not engaged.
    #[default]
    Idle,
    /// Reasoning about a reply.
    Thinking,
    /// Delivering a reply.
    Speaking,
    /// Named as a non-initiating participant of a live session.
    Listening,
}

impl Phase {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Staying in the same phase is allowed and refreshes the state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self == next
            || matches!(
                (self, next),
                (_, Self::Idle)
                    | (Self::Idle, Self::Thinking)
                    | (Self::Thinking, Self::Speaking)
                    | (Self::Idle | Self::Thinking, Self::Listening)
            )
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Listening => "listening",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown phase name.
#[derive(Debug, Error)]
#[error("Unknown participant phase: {0}")]
pub struct ParsePhaseError(pub String);

impl FromStr for Phase {
    type Err = ParsePhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "thinking" => Ok(Self::Thinking),
            "speaking" => Ok(Self::Speaking),
            "listening" => Ok(Self::Listening),
            other => Err(ParsePhaseError(other.to_owned())),
        }
    }
}

/// Current state of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    /// Current phase.
    pub phase: Phase,
    /// Optional free text, e.g. a reasoning trace or the spoken line.
    pub annotation: Option<String>,
    /// Last update timestamp (unix epoch millis).
    pub updated_at: i64,
}

impl ParticipantState {
    /// Fresh idle state.
    #[must_use]
    pub const fn idle(at: i64) -> Self {
        Self {
            phase: Phase::Idle,
            annotation: None,
            updated_at: at,
        }
    }
}

/// UI-side handle for a mounted session (a conversation bubble, say).
pub trait PresentationHandle: Send {
    /// Unmount; called exactly once when the session retires.
    fn close(&mut self, reason: RetireReason);
}

/// Session lifecycle callbacks for presentation collaborators.
///
/// Callbacks run outside the scheduler's lock, so they may call back into
/// the scheduler.
pub trait SessionObserver: Send + Sync {
    /// A session became active. The returned handle is closed on retirement.
    fn on_session_active(&self, _session: &Session) -> Option<Box<dyn PresentationHandle>> {
        None
    }

    /// A session is waiting for capacity.
    fn on_session_queued(&self, _session: &Session) {}

    /// A session left the active set.
    fn on_session_retired(&self, _session_id: SessionId, _reason: RetireReason) {}
}

/// Participant state callbacks for presentation collaborators.
pub trait ParticipantObserver: Send + Sync {
    /// An agent's state changed.
    fn on_participant_state_changed(&self, agent_id: &AgentId, state: &ParticipantState);
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

impl ParticipantObserver for NoopObserver {
    fn on_participant_state_changed(&self, _agent_id: &AgentId, _state: &ParticipantState) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transition_table() {
        use Phase::{Idle, Listening, Speaking, Thinking};

        assert!(Idle.can_transition_to(Thinking));
        assert!(Thinking.can_transition_to(Speaking));
        assert!(Idle.can_transition_to(Listening));
        assert!(Thinking.can_transition_to(Listening));
        for phase in [Idle, Thinking, Speaking, Listening] {
            assert!(phase.can_transition_to(Idle));
            assert!(phase.can_transition_to(phase));
        }

        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Speaking.can_transition_to(Thinking));
        assert!(!Speaking.can_transition_to(Listening));
        assert!(!Listening.can_transition_to(Speaking));
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!("Thinking".parse::<Phase>().unwrap(), Phase::Thinking);
        assert_eq!(" idle ".parse::<Phase>().unwrap(), Phase::Idle);
        assert!("dancing".parse::<Phase>().is_err());
    }

    #[test]
    fn test_session_roles() {
        let session = Session {
            id: Uuid::new_v4(),
            participants: vec!["barkeep".into(), "bard".into(), "rogue".into()],
            metadata: SessionMetadata::new(),
            status: SessionStatus::Active,
            origin: SessionOrigin::Local,
            created_at: 0,
            lifetime_ms: 5_000,
        };

        assert_eq!(session.initiator().map(AgentId::as_str), Some("barkeep"));
        let listeners: Vec<_> = session.listeners().map(AgentId::as_str).collect();
        assert_eq!(listeners, ["bard", "rogue"]);
        assert!(session.involves(&"rogue".into()));
        assert!(!session.involves(&"cook".into()));
        assert_eq!(session.lifetime(), Duration::from_secs(5));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Retiring).unwrap();
        assert_eq!(json, "\"retiring\"");
    }
}
