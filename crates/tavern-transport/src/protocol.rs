//! Wire protocol for client-server communication.
//!
//! Every frame is a JSON text message `{type, id?, payload, error?}`.
//! Frames carrying an `id` that matches an outstanding request are
//! responses; everything else is an unsolicited event decoded into
//! [`InboundEvent`].

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use tavern_core::{AgentId, Phase, SessionId, SessionMetadata};

use crate::{error::ProtocolError, events::EventKind};

/// Frame type names.
pub mod kinds {
    pub const HANDSHAKE: &str = "handshake";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const AGENT_THINKING: &str = "agent-thinking";
    pub const AGENT_RESPONSE: &str = "agent-response";
    pub const CONVERSATION_START: &str = "conversation-start";
    pub const CONVERSATION_UPDATE: &str = "conversation-update";
    pub const AGENT_STATE_CHANGE: &str = "agent-state-change";
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Declared frame type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id (requests and their responses only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Error reported by the remote side, either a string or `{message}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Frame {
    /// Create an unsolicited frame.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            payload,
            error: None,
        }
    }

    /// Create a correlated request frame.
    #[must_use]
    pub fn request(kind: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(kind, payload)
        }
    }

    /// Heartbeat frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(kinds::HEARTBEAT, Value::Null)
    }

    /// Handshake frame declaring the client and its capabilities.
    #[must_use]
    pub fn handshake(client: &str, capabilities: &[String]) -> Self {
        Self::new(
            kinds::HANDSHAKE,
            json!({
                "client": client,
                "version": env!("CARGO_PKG_VERSION"),
                "capabilities": capabilities,
            }),
        )
    }

    /// Attach an error to a frame (used by servers and tests).
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Value::String(message.into()));
        self
    }

    /// Serialize to JSON text.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse JSON text.
    ///
    /// # Errors
    /// Returns error if the text is not a frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Human-readable error carried by the frame, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => Some(
                obj.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("remote error")
                    .to_owned(),
            ),
            other => Some(other.to_string()),
        }
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|source| ProtocolError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }
}

/// `agent-thinking` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentThinking {
    pub agent_id: AgentId,
    /// Reasoning trace, when the server shares one.
    #[serde(default, alias = "thinking", alias = "reasoning")]
    pub thought: Option<String>,
}

/// `agent-response` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub agent_id: AgentId,
    #[serde(default, alias = "response", alias = "content")]
    pub message: Option<String>,
}

/// `conversation-start` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStart {
    /// Present when the server already assigned an id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub participants: Vec<AgentId>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

/// `conversation-update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    pub session_id: SessionId,
    #[serde(default)]
    pub ended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Remaining fields (messages, speaker, ...), passed through untouched.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ConversationUpdate {
    /// Whether this update ends the conversation.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.ended
            || self.status.as_deref().is_some_and(|status| {
                matches!(
                    status.to_ascii_lowercase().as_str(),
                    "ended" | "end" | "closed" | "complete" | "completed"
                )
            })
    }
}

/// `agent-state-change` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateChange {
    pub agent_id: AgentId,
    pub state: Phase,
    #[serde(default)]
    pub annotation: Option<String>,
}

/// Unsolicited inbound event, decoded by frame type.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Heartbeat,
    AgentThinking(AgentThinking),
    AgentResponse(AgentResponse),
    ConversationStart(ConversationStart),
    ConversationUpdate(ConversationUpdate),
    AgentStateChange(AgentStateChange),
    /// Any other frame type, delivered as-is.
    Custom { kind: String, payload: Value },
}

impl InboundEvent {
    /// Decode a frame by its declared type.
    ///
    /// # Errors
    /// Returns error if a known frame type carries a malformed payload.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let event = match frame.kind.as_str() {
            kinds::HEARTBEAT => Self::Heartbeat,
            kinds::AGENT_THINKING => Self::AgentThinking(frame.payload_as()?),
            kinds::AGENT_RESPONSE => Self::AgentResponse(frame.payload_as()?),
            kinds::CONVERSATION_START => Self::ConversationStart(frame.payload_as()?),
            kinds::CONVERSATION_UPDATE => Self::ConversationUpdate(frame.payload_as()?),
            kinds::AGENT_STATE_CHANGE => Self::AgentStateChange(frame.payload_as()?),
            _ => Self::Custom {
                kind: frame.kind,
                payload: frame.payload,
            },
        };
        Ok(event)
    }

    /// Subscription key for this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Heartbeat => EventKind::Heartbeat,
            Self::AgentThinking(_) => EventKind::AgentThinking,
            Self::AgentResponse(_) => EventKind::AgentResponse,
            Self::ConversationStart(_) => EventKind::ConversationStart,
            Self::ConversationUpdate(_) => EventKind::ConversationUpdate,
            Self::AgentStateChange(_) => EventKind::AgentStateChange,
            Self::Custom { kind, .. } => EventKind::Custom(kind.clone()),
        }
    }
}
