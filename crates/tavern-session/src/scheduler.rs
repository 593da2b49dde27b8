//! Conversation session scheduler.
//!
//! Admits sessions up to `max_concurrent`, queues the rest in FIFO order
//! and retires sessions when their lifetime elapses, when the server ends
//! them, when they are retired explicitly, or when the connection goes
//! away. Capacity freed by a retirement is handed to the queue head after
//! the admission cooldown.
//!
//! State sits behind a std mutex that is never held while observers run.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tavern_core::{
    AgentId, Clock, NoopObserver, ParticipantObserver, PresentationHandle, RetireReason, Session,
    SessionId, SessionMetadata, SessionObserver, SessionOrigin, SessionStatus, SystemClock,
};
use tavern_transport::{
    Channel, ChannelEvent, EventKind, InboundEvent, SubscriptionId,
    protocol::{ConversationStart, ConversationUpdate, kinds},
};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::{config::SchedulerConfig, participants::ParticipantTracker};

/// Scheduler error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid session request: {0}")]
    InvalidSessionRequest(String),
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
}

/// A live session.
struct ActiveSession {
    session: Session,
    handle: Option<Box<dyn PresentationHandle>>,
    lifetime: AbortHandle,
}

#[derive(Default)]
struct SchedulerState {
    /// In admission order.
    active: Vec<ActiveSession>,
    queue: VecDeque<Session>,
    cooldown: Option<AbortHandle>,
    /// Sessions retired between admission and mounting, with the reason.
    unmounted: HashMap<SessionId, RetireReason>,
}

impl SchedulerState {
    fn remove_active(&mut self, pos: usize, reason: RetireReason) -> ActiveSession {
        let entry = self.active.remove(pos);
        entry.lifetime.abort();
        if entry.session.status == SessionStatus::Admitted {
            self.unmounted.insert(entry.session.id, reason);
        }
        entry
    }
}

struct Inner {
    config: SchedulerConfig,
    channel: Channel,
    observer: Arc<dyn SessionObserver>,
    participants: Arc<ParticipantTracker>,
    clock: Arc<dyn Clock>,
    state: Mutex<SchedulerState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(
            self.subscriptions
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in subscriptions {
            self.channel.unsubscribe(id);
        }

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(cooldown) = state.cooldown.take() {
            cooldown.abort();
        }
        for entry in &state.active {
            entry.lifetime.abort();
        }
    }
}

/// Builder for [`SessionScheduler`].
pub struct SchedulerBuilder {
    channel: Channel,
    config: SchedulerConfig,
    observer: Arc<dyn SessionObserver>,
    participant_observer: Arc<dyn ParticipantObserver>,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the session lifecycle observer.
    #[must_use]
    pub fn session_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Set the participant state observer.
    #[must_use]
    pub fn participant_observer(mut self, observer: Arc<dyn ParticipantObserver>) -> Self {
        self.participant_observer = observer;
        self
    }

    /// Set the timestamp source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the scheduler and subscribe it to the channel.
    #[must_use]
    pub fn build(self) -> SessionScheduler {
        let participants = Arc::new(ParticipantTracker::new(
            self.participant_observer,
            Arc::clone(&self.clock),
        ));
        let inner = Arc::new(Inner {
            config: self.config,
            channel: self.channel,
            observer: self.observer,
            participants,
            clock: self.clock,
            state: Mutex::new(SchedulerState::default()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let scheduler = SessionScheduler { inner };
        scheduler.attach();
        scheduler
    }
}

/// Session scheduler. Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct SessionScheduler {
    inner: Arc<Inner>,
}

impl SessionScheduler {
    /// Start building a scheduler on top of `channel`.
    #[must_use]
    pub fn builder(channel: Channel) -> SchedulerBuilder {
        SchedulerBuilder {
            channel,
            config: SchedulerConfig::default(),
            observer: Arc::new(NoopObserver),
            participant_observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
        }
    }

    /// Scheduler with default settings and no observers.
    #[must_use]
    pub fn new(channel: Channel, config: SchedulerConfig) -> Self {
        Self::builder(channel).config(config).build()
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self) {
        let channel = &self.inner.channel;
        let mut ids = Vec::new();

        let weak = Arc::downgrade(&self.inner);
        ids.push(channel.subscribe(EventKind::ConversationStart, move |event| {
            if let (Some(scheduler), Some(InboundEvent::ConversationStart(start))) =
                (Self::from_weak(&weak), event.as_inbound())
            {
                scheduler.remote_start(start);
            }
            Ok(())
        }));

        let weak = Arc::downgrade(&self.inner);
        ids.push(channel.subscribe(EventKind::ConversationUpdate, move |event| {
            if let (Some(scheduler), Some(InboundEvent::ConversationUpdate(update))) =
                (Self::from_weak(&weak), event.as_inbound())
            {
                scheduler.remote_update(update);
            }
            Ok(())
        }));

        for kind in [EventKind::ConnectionLost, EventKind::Disconnected] {
            let weak = Arc::downgrade(&self.inner);
            ids.push(channel.subscribe(kind, move |event: &ChannelEvent| {
                if let Some(scheduler) = Self::from_weak(&weak) {
                    tracing::debug!(event = ?event.kind(), "Connection gone; closing all sessions");
                    scheduler.retire_all(RetireReason::ConnectionClosed);
                }
                Ok(())
            }));
        }

        for kind in [
            EventKind::AgentThinking,
            EventKind::AgentResponse,
            EventKind::AgentStateChange,
        ] {
            let participants = Arc::clone(&self.inner.participants);
            ids.push(channel.subscribe(kind, move |event| {
                if let Some(inbound) = event.as_inbound() {
                    participants.handle_event(inbound);
                }
                Ok(())
            }));
        }

        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(ids);
    }

    /// Request a conversation between `participants` (first is the initiator).
    ///
    /// Duplicate ids are dropped, keeping the first occurrence. The session
    /// is admitted at once when capacity is free and nothing is queued;
    /// otherwise it joins the queue.
    ///
    /// Must be called from within a tokio runtime (it starts the lifetime
    /// timer).
    ///
    /// # Errors
    /// Returns `InvalidSessionRequest` unless at least two distinct,
    /// non-blank participants remain.
    pub fn request_session<I, A>(
        &self,
        participants: I,
        metadata: SessionMetadata,
    ) -> Result<Session, SchedulerError>
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        let participants = normalize_participants(participants)?;
        let session = self.new_session(Uuid::new_v4(), participants, metadata, SessionOrigin::Local);
        Ok(self.submit(session))
    }

    /// End a session.
    ///
    /// Active sessions retire with [`RetireReason::Ended`]; queued ones are
    /// withdrawn with [`RetireReason::Cancelled`].
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the id is neither active nor queued.
    pub fn retire_session(&self, session_id: SessionId) -> Result<(), SchedulerError> {
        self.retire(session_id, RetireReason::Ended)
    }

    /// Active sessions, in admission order.
    #[must_use]
    pub fn list_active(&self) -> Vec<Session> {
        self.lock()
            .active
            .iter()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Queued sessions, head first.
    #[must_use]
    pub fn list_queued(&self) -> Vec<Session> {
        self.lock().queue.iter().cloned().collect()
    }

    /// Participant states driven by this scheduler.
    #[must_use]
    pub fn participants(&self) -> &ParticipantTracker {
        &self.inner.participants
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn new_session(
        &self,
        id: SessionId,
        participants: Vec<AgentId>,
        metadata: SessionMetadata,
        origin: SessionOrigin,
    ) -> Session {
        Session {
            id,
            participants,
            metadata,
            status: SessionStatus::Requested,
            origin,
            created_at: self.inner.clock.now_millis(),
            lifetime_ms: self.inner.config.session_lifetime_ms,
        }
    }

    fn submit(&self, mut session: Session) -> Session {
        let admitted = {
            let mut state = self.lock();
            if state.queue.is_empty() && state.active.len() < self.inner.config.max_concurrent {
                self.reserve(&mut state, &mut session);
                true
            } else {
                session.status = SessionStatus::Queued;
                state.queue.push_back(session.clone());
                false
            }
        };

        if admitted {
            self.activate(session)
        } else {
            tracing::info!(session_id = %session.id, "Session queued");
            self.inner.observer.on_session_queued(&session);
            session
        }
    }

    /// Take a capacity slot for `session` and start its lifetime timer.
    fn reserve(&self, state: &mut SchedulerState, session: &mut Session) {
        session.status = SessionStatus::Admitted;

        let weak = Arc::downgrade(&self.inner);
        let id = session.id;
        let lifetime = session.lifetime();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Some(scheduler) = Self::from_weak(&weak) {
                let _ = scheduler.retire(id, RetireReason::Expired);
            }
        });

        state.active.push(ActiveSession {
            session: session.clone(),
            handle: None,
            lifetime: timer.abort_handle(),
        });
    }

    /// Announce an admitted session and mount it.
    fn activate(&self, mut session: Session) -> Session {
        session.status = SessionStatus::Active;
        self.inner.participants.session_admitted(&session);

        if session.origin == SessionOrigin::Local {
            self.announce(&session);
        }
        tracing::info!(
            session_id = %session.id,
            participants = session.participants.len(),
            origin = ?session.origin,
            "Session active"
        );

        let handle = self.inner.observer.on_session_active(&session);

        let retired = {
            let mut state = self.lock();
            match state.active.iter_mut().find(|entry| entry.session.id == session.id) {
                Some(entry) => {
                    entry.session.status = SessionStatus::Active;
                    entry.handle = handle;
                    None
                }
                None => {
                    let reason = state
                        .unmounted
                        .remove(&session.id)
                        .unwrap_or(RetireReason::Ended);
                    Some((reason, handle))
                }
            }
        };
        // Retired while the observer was mounting it.
        if let Some((reason, handle)) = retired {
            tracing::debug!(session_id = %session.id, ?reason, "Session retired during mount");
            session.status = SessionStatus::Closed;
            if let Some(mut handle) = handle {
                handle.close(reason);
            }
        }

        session
    }

    fn announce(&self, session: &Session) {
        let start = ConversationStart {
            session_id: Some(session.id),
            participants: session.participants.clone(),
            metadata: session.metadata.clone(),
        };
        match serde_json::to_value(&start) {
            Ok(payload) => {
                if let Err(e) = self.inner.channel.emit(kinds::CONVERSATION_START, payload) {
                    tracing::warn!(session_id = %session.id, "Failed to announce session: {e}");
                }
            }
            Err(e) => tracing::error!(session_id = %session.id, "Failed to encode announcement: {e}"),
        }
    }

    fn retire(&self, session_id: SessionId, reason: RetireReason) -> Result<(), SchedulerError> {
        enum Removed {
            Active(ActiveSession),
            Queued,
        }

        let removed = {
            let mut state = self.lock();
            if let Some(pos) = state.active.iter().position(|e| e.session.id == session_id) {
                Removed::Active(state.remove_active(pos, reason))
            } else if let Some(pos) = state.queue.iter().position(|s| s.id == session_id) {
                state.queue.remove(pos);
                Removed::Queued
            } else {
                return Err(SchedulerError::SessionNotFound(session_id));
            }
        };

        match removed {
            Removed::Active(entry) => {
                tracing::info!(%session_id, ?reason, "Session retired");
                self.close_entry(entry, reason);
                self.schedule_admission();
            }
            Removed::Queued => {
                tracing::info!(%session_id, "Queued session withdrawn");
                self.inner
                    .observer
                    .on_session_retired(session_id, RetireReason::Cancelled);
            }
        }
        Ok(())
    }

    fn close_entry(&self, entry: ActiveSession, reason: RetireReason) {
        let ActiveSession {
            session, handle, ..
        } = entry;
        if let Some(mut handle) = handle {
            handle.close(reason);
        }
        self.inner.participants.session_retired(&session.participants);
        self.inner.observer.on_session_retired(session.id, reason);
    }

    /// Retire every active session and drop the queue.
    ///
    /// Queued sessions are reported retired with the same reason.
    fn retire_all(&self, reason: RetireReason) {
        let (active, discarded) = {
            let mut state = self.lock();
            if let Some(cooldown) = state.cooldown.take() {
                cooldown.abort();
            }
            let active: Vec<ActiveSession> = (0..state.active.len())
                .map(|_| state.remove_active(0, reason))
                .collect();
            let discarded: Vec<SessionId> = state.queue.drain(..).map(|s| s.id).collect();
            (active, discarded)
        };

        if !active.is_empty() || !discarded.is_empty() {
            tracing::info!(
                retired = active.len(),
                discarded = discarded.len(),
                ?reason,
                "Closing all sessions"
            );
        }
        for entry in active {
            self.close_entry(entry, reason);
        }
        for session_id in discarded {
            self.inner.observer.on_session_retired(session_id, reason);
        }
    }

    /// Start the cooldown toward admitting the queue head, if capacity allows.
    fn schedule_admission(&self) {
        let mut state = self.lock();
        if state.cooldown.is_some()
            || state.queue.is_empty()
            || state.active.len() >= self.inner.config.max_concurrent
        {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.admission_cooldown();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = Self::from_weak(&weak) {
                scheduler.admit_next();
            }
        });
        state.cooldown = Some(timer.abort_handle());
    }

    fn admit_next(&self) {
        let next = {
            let mut state = self.lock();
            state.cooldown = None;
            if state.active.len() < self.inner.config.max_concurrent {
                state.queue.pop_front().map(|mut session| {
                    self.reserve(&mut state, &mut session);
                    session
                })
            } else {
                None
            }
        };

        if let Some(session) = next {
            self.activate(session);
        }
        self.schedule_admission();
    }

    fn remote_start(&self, start: &ConversationStart) {
        if let Some(id) = start.session_id {
            let state = self.lock();
            let known = state.active.iter().any(|e| e.session.id == id)
                || state.queue.iter().any(|s| s.id == id);
            if known {
                tracing::debug!(session_id = %id, "Ignoring duplicate conversation-start");
                return;
            }
        }

        match normalize_participants(start.participants.iter().cloned()) {
            Ok(participants) => {
                let session = self.new_session(
                    start.session_id.unwrap_or_else(Uuid::new_v4),
                    participants,
                    start.metadata.clone(),
                    SessionOrigin::Remote,
                );
                self.submit(session);
            }
            Err(e) => tracing::warn!("Ignoring remote conversation-start: {e}"),
        }
    }

    fn remote_update(&self, update: &ConversationUpdate) {
        if !update.is_end() {
            return;
        }
        if let Err(e) = self.retire(update.session_id, RetireReason::Ended) {
            tracing::debug!("Ignoring conversation end: {e}");
        }
    }
}

impl std::fmt::Debug for SessionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SessionScheduler")
            .field("active", &state.active.len())
            .field("queued", &state.queue.len())
            .finish_non_exhaustive()
    }
}

fn normalize_participants<I, A>(participants: I) -> Result<Vec<AgentId>, SchedulerError>
where
    I: IntoIterator<Item = A>,
    A: Into<AgentId>,
{
    let mut unique: Vec<AgentId> = Vec::new();
    for agent in participants.into_iter().map(Into::into) {
        if agent.is_blank() {
            return Err(SchedulerError::InvalidSessionRequest(
                "participant ids must not be blank".into(),
            ));
        }
        if !unique.contains(&agent) {
            unique.push(agent);
        }
    }
    if unique.len() < 2 {
        return Err(SchedulerError::InvalidSessionRequest(format!(
            "a session needs at least two distinct participants, got {}",
            unique.len()
        )));
    }
    Ok(unique)
}
