//! Conversation scheduling for the tavern simulation.
//!
//! Provides:
//! - `SessionScheduler` - admit, queue and retire conversation sessions
//!   under a concurrency cap
//! - `ParticipantTracker` - per-agent phase machine fed by the scheduler
//!   and the transport channel

pub mod config;
pub mod participants;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use participants::ParticipantTracker;
pub use scheduler::{SchedulerBuilder, SchedulerError, SessionScheduler};
