//! Typed channel events and the subscriber registry.
//!
//! Handlers are keyed by [`EventKind`] and run on the channel's driver task,
//! in registration order. A handler that fails or panics is logged and the
//! remaining handlers for the same event still run.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use crate::protocol::InboundEvent;

/// Event published by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Unsolicited frame from the server.
    Inbound(InboundEvent),
    /// The link is up and the outbound queue has been flushed.
    Connected { endpoint: String },
    /// First unintentional loss of an established link.
    ConnectionLost { endpoint: String, reason: String },
    /// A reconnection attempt has been scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnection gave up; nothing more happens until `connect` is called.
    ReconnectionFailed { attempts: u32 },
    /// Intentional close via `disconnect`.
    Disconnected,
}

impl ChannelEvent {
    /// Subscription key for this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Inbound(event) => event.kind(),
            Self::Connected { .. } => EventKind::Connected,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::ReconnectionFailed { .. } => EventKind::ReconnectionFailed,
            Self::Disconnected => EventKind::Disconnected,
        }
    }

    /// The inbound event, if this is one.
    #[must_use]
    pub const fn as_inbound(&self) -> Option<&InboundEvent> {
        match self {
            Self::Inbound(event) => Some(event),
            _ => None,
        }
    }
}

/// Subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Heartbeat,
    AgentThinking,
    AgentResponse,
    ConversationStart,
    ConversationUpdate,
    AgentStateChange,
    /// Inbound frame of any other declared type.
    Custom(String),
    Connected,
    ConnectionLost,
    Reconnecting,
    ReconnectionFailed,
    Disconnected,
}

/// Event handler.
pub type Handler = Arc<dyn Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Handlers keyed by event kind.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `kind`.
    pub fn subscribe(&mut self, kind: EventKind, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Handlers for `kind`, in registration order.
    #[must_use]
    pub fn handlers_for(&self, kind: &EventKind) -> Vec<Handler> {
        self.handlers
            .get(kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Total number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Invoke every handler with `event`, isolating failures.
///
/// Returns the number of handlers that failed.
pub fn dispatch(handlers: &[Handler], event: &ChannelEvent) -> usize {
    let mut failures = 0;
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                tracing::warn!(kind = ?event.kind(), "Event handler failed: {e:#}");
            }
            Err(_) => {
                failures += 1;
                tracing::error!(kind = ?event.kind(), "Event handler panicked");
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Handler {
        let log = Arc::clone(log);
        handler(move |_| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriberRegistry::new();
        registry.subscribe(EventKind::Disconnected, recorder(&log, "first"));
        registry.subscribe(EventKind::Disconnected, recorder(&log, "second"));
        registry.subscribe(EventKind::Connected, recorder(&log, "other"));

        let handlers = registry.handlers_for(&EventKind::Disconnected);
        assert_eq!(dispatch(&handlers, &ChannelEvent::Disconnected), 0);
        assert_eq!(*log.lock().unwrap(), ["first", "second"]);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriberRegistry::new();
        registry.subscribe(
            EventKind::Disconnected,
            handler(|_| Err(anyhow::anyhow!("bubble renderer offline"))),
        );
        registry.subscribe(
            EventKind::Disconnected,
            handler(|_| panic!("handler blew up")),
        );
        registry.subscribe(EventKind::Disconnected, recorder(&log, "survivor"));

        let handlers = registry.handlers_for(&EventKind::Disconnected);
        assert_eq!(dispatch(&handlers, &ChannelEvent::Disconnected), 2);
        assert_eq!(*log.lock().unwrap(), ["survivor"]);
    }

    #[test]
    fn test_unsubscribe() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriberRegistry::new();
        let id = registry.subscribe(EventKind::Heartbeat, recorder(&log, "gone"));
        registry.subscribe(EventKind::Heartbeat, recorder(&log, "kept"));
        assert_eq!(registry.len(), 2);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert_eq!(registry.len(), 1);

        let handlers = registry.handlers_for(&EventKind::Heartbeat);
        dispatch(&handlers, &ChannelEvent::Inbound(InboundEvent::Heartbeat));
        assert_eq!(*log.lock().unwrap(), ["kept"]);
    }

    #[test]
    fn test_custom_kinds_are_distinct() {
        let mut registry = SubscriberRegistry::new();
        registry.subscribe(EventKind::Custom("dice-roll".into()), handler(|_| Ok(())));
        assert_eq!(registry.handlers_for(&EventKind::Custom("dice-roll".into())).len(), 1);
        assert!(registry.handlers_for(&EventKind::Custom("toast".into())).is_empty());
    }
}
