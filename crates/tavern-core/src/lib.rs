//! Core vocabulary for tavern agent conversations.
//!
//! This crate provides the fundamental building blocks:
//! - `Session` / `SessionStatus` - Conversation sessions and their lifecycle
//! - `Phase` / `ParticipantState` - Per-agent interaction phase
//! - `SessionMetadata` - Free-form metadata attached to a session
//! - `Clock` - Wall-clock abstraction for timestamps
//! - Observer traits consumed by presentation collaborators

pub mod clock;
pub mod context;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::SessionMetadata;
pub use traits::{
    AgentId, NoopObserver, ParsePhaseError, ParticipantObserver, ParticipantState, Phase,
    PresentationHandle, RetireReason, Session, SessionId, SessionObserver, SessionOrigin,
    SessionStatus,
};
