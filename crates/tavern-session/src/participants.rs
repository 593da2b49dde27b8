//! Per-agent phase tracking.
//!
//! Read-only to collaborators: the scheduler and the channel's inbound
//! events are the only writers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tavern_core::{AgentId, Clock, ParticipantObserver, ParticipantState, Phase, Session};
use tavern_transport::InboundEvent;

/// Tracks the [`ParticipantState`] of every agent seen so far.
pub struct ParticipantTracker {
    states: Mutex<HashMap<AgentId, ParticipantState>>,
    observer: Arc<dyn ParticipantObserver>,
    clock: Arc<dyn Clock>,
}

impl ParticipantTracker {
    /// Create an empty tracker.
    pub fn new(observer: Arc<dyn ParticipantObserver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            observer,
            clock,
        }
    }

    /// State of `agent`, if it has been referenced.
    #[must_use]
    pub fn get(&self, agent: &AgentId) -> Option<ParticipantState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .cloned()
    }

    /// Phase of `agent`; unknown agents are idle.
    #[must_use]
    pub fn phase(&self, agent: &AgentId) -> Phase {
        self.get(agent).map_or(Phase::Idle, |state| state.phase)
    }

    /// Copy of every tracked state.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<AgentId, ParticipantState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move `agent` to `next`.
    ///
    /// Returns false (and changes nothing) if the transition is not allowed.
    pub(crate) fn apply(&self, agent: &AgentId, next: Phase, annotation: Option<String>) -> bool {
        if agent.is_blank() {
            return false;
        }
        let now = self.clock.now_millis();

        let updated = {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let state = states
                .entry(agent.clone())
                .or_insert_with(|| ParticipantState::idle(now));

            if !state.phase.can_transition_to(next) {
                tracing::debug!(agent = %agent, from = %state.phase, to = %next, "Ignoring participant transition");
                return false;
            }
            state.phase = next;
            state.annotation = annotation;
            state.updated_at = now;
            state.clone()
        };

        self.observer.on_participant_state_changed(agent, &updated);
        true
    }

    /// Non-initiators of a newly active session start listening.
    pub(crate) fn session_admitted(&self, session: &Session) {
        for agent in session.listeners() {
            self.apply(agent, Phase::Listening, None);
        }
    }

    /// Everyone in a retired session goes idle.
    pub(crate) fn session_retired(&self, participants: &[AgentId]) {
        for agent in participants {
            self.apply(agent, Phase::Idle, None);
        }
    }

    /// Apply an inbound agent event. Other events are ignored.
    pub(crate) fn handle_event(&self, event: &InboundEvent) {
        match event {
            InboundEvent::AgentThinking(e) => {
                self.apply(&e.agent_id, Phase::Thinking, e.thought.clone());
            }
            InboundEvent::AgentResponse(e) => {
                self.apply(&e.agent_id, Phase::Speaking, e.message.clone());
            }
            InboundEvent::AgentStateChange(e) => {
                self.apply(&e.agent_id, e.state, e.annotation.clone());
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for ParticipantTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantTracker")
            .field("states", &self.snapshot())
            .finish_non_exhaustive()
    }
}
