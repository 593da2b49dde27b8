//! Pending-request table.
//!
//! Maps correlation ids to the oneshot sender of the waiting caller. Each
//! entry carries its own deadline; the channel driver sleeps until the
//! earliest one and calls [`PendingRequests::expire`].

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};

use crate::{error::RequestError, protocol::Frame};

/// Outcome delivered to a waiting caller.
pub type Reply = Result<Value, RequestError>;

struct PendingEntry {
    kind: String,
    timeout: Duration,
    deadline: Instant,
    tx: oneshot::Sender<Reply>,
}

/// Outstanding requests keyed by correlation id.
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<String, PendingEntry>,
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request expiring at `now + timeout`.
    pub fn insert(
        &mut self,
        id: String,
        kind: String,
        timeout: Duration,
        now: Instant,
        tx: oneshot::Sender<Reply>,
    ) {
        let entry = PendingEntry {
            kind,
            timeout,
            deadline: now + timeout,
            tx,
        };
        if let Some(previous) = self.entries.insert(id, entry) {
            tracing::warn!(kind = %previous.kind, "Duplicate correlation id replaced an older request");
        }
    }

    /// Settle the request matching `frame.id`.
    ///
    /// Returns false (and leaves the frame for subscribers) when no request
    /// matches.
    pub fn settle(&mut self, frame: &Frame) -> bool {
        let Some(entry) = frame.id.as_ref().and_then(|id| self.entries.remove(id)) else {
            return false;
        };
        let reply = match frame.error_message() {
            Some(message) => Err(RequestError::Remote(message)),
            None => Ok(frame.payload.clone()),
        };
        // The caller may have stopped waiting; nothing to do then.
        let _ = entry.tx.send(reply);
        true
    }

    /// Fail every request whose deadline has passed.
    ///
    /// Returns the number of expired requests.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                tracing::debug!(request_id = %id, kind = %entry.kind, "Request timed out");
                let _ = entry.tx.send(Err(RequestError::Timeout {
                    id: id.clone(),
                    kind: entry.kind,
                    timeout_ms: u64::try_from(entry.timeout.as_millis()).unwrap_or(u64::MAX),
                }));
            }
        }
        expired.len()
    }

    /// Fail every outstanding request with `error`.
    pub fn fail_all(&mut self, error: &RequestError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    /// Earliest deadline, if any request is outstanding.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Whether `id` is outstanding.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Outstanding request count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Future returned by `Channel::request`.
///
/// Resolves with the response payload or a [`RequestError`].
#[derive(Debug)]
#[must_use = "a request does nothing useful unless its response is awaited"]
pub struct ResponseFuture {
    rx: Option<oneshot::Receiver<Reply>>,
}

impl ResponseFuture {
    pub(crate) const fn new(rx: oneshot::Receiver<Reply>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A future that fails immediately with `ConnectionClosed`.
    pub(crate) const fn closed() -> Self {
        Self { rx: None }
    }
}

impl Future for ResponseFuture {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            None => Poll::Ready(Err(RequestError::ConnectionClosed)),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|reply| reply.unwrap_or(Err(RequestError::ConnectionClosed))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;

    fn register(
        table: &mut PendingRequests,
        id: &str,
        timeout_ms: u64,
        now: Instant,
    ) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        table.insert(
            id.to_owned(),
            "get-state".to_owned(),
            Duration::from_millis(timeout_ms),
            now,
            tx,
        );
        ResponseFuture::new(rx)
    }

    #[test]
    fn test_settle_matching_response() {
        let now = Instant::now();
        let mut table = PendingRequests::new();
        let mut fut = task::spawn(register(&mut table, "r1", 1_000, now));
        assert_pending!(fut.poll());

        let response = Frame::request("get-state", "r1", json!({ "mood": "merry" }));
        assert!(table.settle(&response));
        assert!(table.is_empty());
        assert_ready_eq!(fut.poll(), Ok(json!({ "mood": "merry" })));

        // A second frame with the same id is no longer a response.
        assert!(!table.settle(&response));
    }

    #[test]
    fn test_remote_error_rejects() {
        let now = Instant::now();
        let mut table = PendingRequests::new();
        let mut fut = task::spawn(register(&mut table, "r1", 1_000, now));
        assert!(table.settle(&Frame::request("get-state", "r1", Value::Null).with_error("unknown agent")));
        assert_ready_eq!(fut.poll(), Err(RequestError::Remote("unknown agent".into())));
    }

    #[test]
    fn test_expire_only_past_deadlines() {
        let now = Instant::now();
        let mut table = PendingRequests::new();
        let mut short = task::spawn(register(&mut table, "short", 1_000, now));
        let mut long = task::spawn(register(&mut table, "long", 5_000, now));
        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(1_000)));

        assert_eq!(table.expire(now + Duration::from_millis(999)), 0);
        assert_eq!(table.expire(now + Duration::from_millis(1_000)), 1);
        assert!(!table.contains("short"));
        assert!(table.contains("long"));

        assert_ready_eq!(
            short.poll(),
            Err(RequestError::Timeout {
                id: "short".into(),
                kind: "get-state".into(),
                timeout_ms: 1_000,
            })
        );
        assert_pending!(long.poll());
    }

    #[test]
    fn test_fail_all_settles_everything_once() {
        let now = Instant::now();
        let mut table = PendingRequests::new();
        let mut a = task::spawn(register(&mut table, "a", 1_000, now));
        let mut b = task::spawn(register(&mut table, "b", 1_000, now));

        assert_eq!(table.fail_all(&RequestError::ConnectionClosed), 2);
        assert_eq!(table.expire(now + Duration::from_secs(60)), 0);
        assert_ready_eq!(a.poll(), Err(RequestError::ConnectionClosed));
        assert_ready_eq!(b.poll(), Err(RequestError::ConnectionClosed));
    }

    #[test]
    fn test_dropped_sender_reads_as_closed() {
        let (tx, rx) = oneshot::channel::<Reply>();
        drop(tx);
        let mut fut = task::spawn(ResponseFuture::new(rx));
        assert_ready_eq!(fut.poll(), Err(RequestError::ConnectionClosed));

        let mut fut = task::spawn(ResponseFuture::closed());
        assert_ready_eq!(fut.poll(), Err(RequestError::ConnectionClosed));
    }
}
