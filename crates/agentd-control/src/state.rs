//! Derived session state: an ordered projection of the event log.

use agentd_events::{AgentStatus, Event, EventId, EventPayload, EventSource, ObservationKind};

/// Projection of a session's events plus the control loop's scalar counters.
///
/// State is derived, never stored independently: it is recomputed with
/// `project` or updated incrementally with `apply`, and owned exclusively by
/// the session's control loop.
#[derive(Debug, Clone)]
pub struct State {
    pub status: AgentStatus,
    /// Number of agent actions emitted so far.
    pub iteration_count: u32,
    /// Cost reported by the decision collaborator, accumulated per decision.
    pub accumulated_cost: f64,
    /// Id of the newest event folded into this projection.
    pub last_event_id: Option<EventId>,
    history: Vec<Event>,
}

impl State {
    /// Empty projection of a fresh session.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: AgentStatus::Idle,
            iteration_count: 0,
            accumulated_cost: 0.0,
            last_event_id: None,
            history: Vec::new(),
        }
    }

    /// Rebuild from an ordered event slice.
    #[must_use]
    pub fn project<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut state = Self::new();
        for event in events {
            state.apply(event);
        }
        state
    }

    /// Fold one event into the projection.
    pub fn apply(&mut self, event: &Event) {
        self.last_event_id = Some(event.id);
        match &event.payload {
            EventPayload::Action(_) if event.source == EventSource::Agent => {
                self.iteration_count += 1;
            }
            EventPayload::Observation(observation) => {
                if let ObservationKind::StatusChanged { status } = observation.kind {
                    self.status = status;
                }
            }
            EventPayload::Action(_) => {}
        }
        self.history.push(event.clone());
    }

    /// Add decision cost to the running total.
    pub fn add_cost(&mut self, cost: f64) {
        self.accumulated_cost += cost;
    }

    /// The ordered event history behind this projection.
    #[must_use]
    pub fn history(&self) -> &[Event] {
        &self.history
    }

    /// Content of the most recent user message, if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|event| match &event.payload {
            EventPayload::Observation(observation) => match &observation.kind {
                ObservationKind::UserMessage { content } => Some(content.as_str()),
                _ => None,
            },
            EventPayload::Action(_) => None,
        })
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
