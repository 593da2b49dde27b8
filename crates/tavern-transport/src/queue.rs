//! Bounded FIFO of frames produced while the link is down.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::{error::QueueError, protocol::Frame};

/// A frame waiting for the link.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub frame: Frame,
    pub enqueued_at: Instant,
}

/// Outbound queue.
///
/// Once full, new frames are rejected; frames already queued are never
/// evicted to make room.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedFrame>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(32)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a frame.
    ///
    /// # Errors
    /// Returns `QueueError::Overflow` (and counts the drop) when full.
    pub fn push(&mut self, frame: Frame, now: Instant) -> Result<(), QueueError> {
        if self.entries.len() >= self.capacity {
            self.dropped += 1;
            return Err(QueueError::Overflow {
                capacity: self.capacity,
            });
        }
        self.entries.push_back(QueuedFrame {
            frame,
            enqueued_at: now,
        });
        Ok(())
    }

    /// Put back a frame that was popped but could not be written.
    pub fn requeue_front(&mut self, entry: QueuedFrame) {
        self.entries.push_front(entry);
    }

    /// Take the oldest frame.
    pub fn pop_front(&mut self) -> Option<QueuedFrame> {
        self.entries.pop_front()
    }

    /// Keep only the frames for which `keep` returns true, returning how many
    /// were removed. Order is preserved.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&QueuedFrame) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|entry| keep(entry));
        before - self.entries.len()
    }

    /// Drop every queued frame, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Queued frame count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of frames held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames rejected since creation.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}
