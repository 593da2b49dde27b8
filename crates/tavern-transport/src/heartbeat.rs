//! Heartbeat liveness monitoring.
//!
//! While connected a heartbeat frame is due every `interval`. An inbound
//! heartbeat counts as the acknowledgment. If nothing is acknowledged for
//! `timeout` the link is declared dead, which the channel handles like any
//! other unintentional close.

use std::time::Duration;

use tokio::time::Instant;

/// What the driver should do after polling the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing due.
    Idle,
    /// Send a heartbeat frame now.
    Beat,
    /// No acknowledgment within the timeout; close the link.
    TimedOut,
}

/// Heartbeat schedule for one connection.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    next_beat: Option<Instant>,
    last_ack: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_beat: None,
            last_ack: None,
        }
    }

    /// Start monitoring a fresh connection.
    pub fn start(&mut self, now: Instant) {
        self.next_beat = Some(now + self.interval);
        self.last_ack = Some(now);
    }

    /// Stop monitoring.
    pub const fn stop(&mut self) {
        self.next_beat = None;
    }

    /// Whether the monitor is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.next_beat.is_some()
    }

    /// Record an acknowledgment.
    pub fn record_ack(&mut self, now: Instant) {
        if self.is_running() {
            self.last_ack = Some(now);
        }
    }

    /// Instant of the last acknowledgment (or of the connection start).
    #[must_use]
    pub const fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    /// Advance the schedule.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        let (Some(next_beat), Some(last_ack)) = (self.next_beat, self.last_ack) else {
            return HeartbeatAction::Idle;
        };

        if now.saturating_duration_since(last_ack) >= self.timeout {
            self.stop();
            return HeartbeatAction::TimedOut;
        }

        if now >= next_beat {
            self.next_beat = Some(now + self.interval);
            return HeartbeatAction::Beat;
        }

        HeartbeatAction::Idle
    }

    /// Next instant at which `poll` may return something other than `Idle`.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let next_beat = self.next_beat?;
        let expiry = self.last_ack.map_or(next_beat, |ack| ack + self.timeout);
        Some(next_beat.min(expiry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_stopped_monitor_is_idle() {
        let mut hb = HeartbeatMonitor::new(secs(30), secs(60));
        let now = Instant::now();
        assert_eq!(hb.poll(now + secs(500)), HeartbeatAction::Idle);
        assert!(hb.next_deadline().is_none());
    }

    #[test]
    fn test_beats_every_interval_while_acknowledged() {
        let start = Instant::now();
        let mut hb = HeartbeatMonitor::new(secs(30), secs(60));
        hb.start(start);

        assert_eq!(hb.next_deadline(), Some(start + secs(30)));
        assert_eq!(hb.poll(start + secs(29)), HeartbeatAction::Idle);
        assert_eq!(hb.poll(start + secs(30)), HeartbeatAction::Beat);
        hb.record_ack(start + secs(31));

        assert_eq!(hb.poll(start + secs(60)), HeartbeatAction::Beat);
        hb.record_ack(start + secs(61));
        assert_eq!(hb.poll(start + secs(90)), HeartbeatAction::Beat);
    }

    #[test]
    fn test_times_out_after_two_silent_intervals() {
        let start = Instant::now();
        let mut hb = HeartbeatMonitor::new(secs(30), secs(60));
        hb.start(start);

        assert_eq!(hb.poll(start + secs(30)), HeartbeatAction::Beat);
        assert_eq!(hb.next_deadline(), Some(start + secs(60)));
        assert_eq!(hb.poll(start + secs(60)), HeartbeatAction::TimedOut);
        assert!(!hb.is_running());
        assert_eq!(hb.poll(start + secs(90)), HeartbeatAction::Idle);
    }

    #[test]
    fn test_ack_ignored_when_stopped() {
        let start = Instant::now();
        let mut hb = HeartbeatMonitor::new(secs(30), secs(60));
        hb.record_ack(start);
        assert!(hb.last_ack().is_none());
    }
}
