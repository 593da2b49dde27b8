//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of sessions live at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
/// Default session lifetime.
pub const DEFAULT_SESSION_LIFETIME_MS: u64 = 5_000;
/// Default pause between freeing capacity and admitting the next queued session.
pub const DEFAULT_ADMISSION_COOLDOWN_MS: u64 = 2_000;

/// Session scheduler configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Admission cap.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Lifetime budget given to each session.
    #[serde(default = "default_session_lifetime_ms")]
    pub session_lifetime_ms: u64,
    /// Delay before a queued session takes freed capacity.
    #[serde(default = "default_admission_cooldown_ms")]
    pub admission_cooldown_ms: u64,
}

impl SchedulerConfig {
    /// Session lifetime.
    #[must_use]
    pub const fn session_lifetime(&self) -> Duration {
        Duration::from_millis(self.session_lifetime_ms)
    }

    /// Admission cooldown.
    #[must_use]
    pub const fn admission_cooldown(&self) -> Duration {
        Duration::from_millis(self.admission_cooldown_ms)
    }

    /// Set the admission cap.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the session lifetime.
    #[must_use]
    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime_ms = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            session_lifetime_ms: DEFAULT_SESSION_LIFETIME_MS,
            admission_cooldown_ms: DEFAULT_ADMISSION_COOLDOWN_MS,
        }
    }
}

const fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
const fn default_session_lifetime_ms() -> u64 {
    DEFAULT_SESSION_LIFETIME_MS
}
const fn default_admission_cooldown_ms() -> u64 {
    DEFAULT_ADMISSION_COOLDOWN_MS
}
