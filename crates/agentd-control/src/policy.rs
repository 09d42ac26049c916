//! Between-iteration policy plugins.
//!
//! Policies inspect the state projection between control-loop iterations
//! and may demand a hard stop. They are layered on top of the state machine
//! rather than embedded in it, so the core loop invariants stay policy-free.

use agentd_events::{Action, Event, EventPayload, EventSource, Observation, ObservationKind};

use crate::state::State;

/// Verdict returned by a policy inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Continue,
    /// Hard stop: the session transitions to `Stuck` and dispatches nothing
    /// further.
    Stuck { reason: String },
}

/// Policy plugin invoked between control-loop iterations.
pub trait LoopPolicy: Send + Sync {
    fn inspect(&self, state: &State) -> PolicyVerdict;
}

/// Detects the agent looping on itself.
///
/// Four scenarios, checked over the recent non-user history:
/// 1. the same action/observation pair four times running,
/// 2. the same action producing an error observation three times running,
/// 3. three identical agent messages with no observation between them,
/// 4. a two-step action/observation cycle alternating across six steps.
pub struct RepetitionPolicy;

impl RepetitionPolicy {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for RepetitionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopPolicy for RepetitionPolicy {
    fn inspect(&self, state: &State) -> PolicyVerdict {
        let filtered: Vec<&Event> = state
            .history()
            .iter()
            .filter(|event| is_relevant(event))
            .collect();

        // Three events minimum before any loop is detectable.
        if filtered.len() < 3 {
            return PolicyVerdict::Continue;
        }

        // Most-recent-first windows of actions and observations.
        let actions: Vec<&Action> = filtered
            .iter()
            .rev()
            .filter_map(|event| event.action())
            .take(6)
            .collect();
        let observations: Vec<&Observation> = filtered
            .iter()
            .rev()
            .filter_map(|event| event.observation())
            .take(6)
            .collect();

        if repeating_pair(&actions, &observations) {
            return PolicyVerdict::Stuck {
                reason: "same action and observation repeated four times".to_string(),
            };
        }
        if repeating_errors(&actions, &observations) {
            return PolicyVerdict::Stuck {
                reason: "same action failed three times running".to_string(),
            };
        }
        if monologue(&filtered) {
            return PolicyVerdict::Stuck {
                reason: "agent repeating the same message with no new observations".to_string(),
            };
        }
        if filtered.len() >= 6 && alternating_pattern(&actions, &observations) {
            return PolicyVerdict::Stuck {
                reason: "two-step action/observation cycle detected".to_string(),
            };
        }

        PolicyVerdict::Continue
    }
}

/// User messages and status transitions are excluded from the inspected
/// window; the user breaking in is exactly what un-sticks an agent.
fn is_relevant(event: &Event) -> bool {
    if event.source == EventSource::User {
        return false;
    }
    !matches!(
        &event.payload,
        EventPayload::Observation(Observation { kind: ObservationKind::StatusChanged { .. }, .. })
    )
}

/// Observation equality for loop detection. Command output text carries
/// incidental detail (pids, timestamps), so commands compare by command and
/// exit status only.
fn same_observation(a: &Observation, b: &Observation) -> bool {
    match (&a.kind, &b.kind) {
        (
            ObservationKind::CommandOutput { command: ca, exit_code: xa, error: ea, .. },
            ObservationKind::CommandOutput { command: cb, exit_code: xb, error: eb, .. },
        ) => ca == cb && xa == xb && ea == eb,
        (ka, kb) => ka == kb,
    }
}

fn repeating_pair(actions: &[&Action], observations: &[&Observation]) -> bool {
    actions.len() >= 4
        && observations.len() >= 4
        && actions[..4].iter().all(|a| *a == actions[0])
        && observations[..4].iter().all(|o| same_observation(o, observations[0]))
}

fn repeating_errors(actions: &[&Action], observations: &[&Observation]) -> bool {
    actions.len() >= 3
        && observations.len() >= 3
        && actions[..3].iter().all(|a| *a == actions[0])
        && observations[..3].iter().all(|o| o.is_error())
}

fn monologue(filtered: &[&Event]) -> bool {
    let messages: Vec<(usize, &str)> = filtered
        .iter()
        .enumerate()
        .filter_map(|(i, event)| match event.action() {
            Some(Action::Message { content }) if event.source == EventSource::Agent => {
                Some((i, content.as_str()))
            }
            _ => None,
        })
        .collect();

    let Some(window) = messages.len().checked_sub(3).map(|start| &messages[start..]) else {
        return false;
    };
    if !window.iter().all(|(_, content)| *content == window[0].1) {
        return false;
    }

    // An observation between the repeats means the agent saw something new;
    // not a monologue yet.
    let (start, end) = (window[0].0, window[window.len() - 1].0);
    !filtered[start + 1..end]
        .iter()
        .any(|event| event.observation().is_some())
}

fn alternating_pattern(actions: &[&Action], observations: &[&Observation]) -> bool {
    actions.len() >= 6
        && observations.len() >= 6
        && actions[0] == actions[2]
        && actions[0] == actions[4]
        && actions[1] == actions[3]
        && actions[1] == actions[5]
        && same_observation(observations[0], observations[2])
        && same_observation(observations[0], observations[4])
        && same_observation(observations[1], observations[3])
        && same_observation(observations[1], observations[5])
}
