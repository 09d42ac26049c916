//! The external decision collaborator interface.

use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;

use agentd_events::Action;

use crate::state::State;

/// A proposed next action, plus the cost of producing it.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    /// Cost of this decision, accumulated against the session budget.
    pub cost: f64,
}

impl Decision {
    /// A zero-cost decision.
    #[must_use]
    pub const fn free(action: Action) -> Self {
        Self { action, cost: 0.0 }
    }
}

/// Decision error. Unrecoverable failures end the control loop after its
/// bounded retry budget; everything the sandbox does is data, not an error.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("malformed decision: {0}")]
    Malformed(String),
    #[error("decision backend failed: {0}")]
    Backend(String),
    #[error("decision timed out")]
    Timeout,
}

/// Decision collaborator: given the current state projection, propose the
/// next action. The model invocation behind it is opaque to this crate.
#[async_trait]
pub trait Decider: Send + Sync {
    /// Propose the next action for `state`.
    ///
    /// # Errors
    /// Returns `DecisionError` on unrecoverable failure; the caller retries
    /// a bounded number of times with backoff before escalating.
    async fn decide(&self, state: &State) -> Result<Decision, DecisionError>;
}

/// Replays a fixed script of decisions, then finishes.
///
/// Useful for demos and for driving the control loop in tests without a
/// model behind it.
pub struct ScriptedDecider {
    script: tokio::sync::Mutex<VecDeque<Decision>>,
}

impl ScriptedDecider {
    /// Decider yielding `decisions` in order, then `Finish`.
    #[must_use]
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self { script: tokio::sync::Mutex::new(decisions.into_iter().collect()) }
    }
}

#[async_trait]
impl Decider for ScriptedDecider {
    async fn decide(&self, _state: &State) -> Result<Decision, DecisionError> {
        let mut script = self.script.lock().await;
        Ok(script
            .pop_front()
            .unwrap_or_else(|| Decision::free(Action::Finish { outcome: None })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_decider_finishes_when_exhausted() {
        let decider = ScriptedDecider::new(vec![Decision::free(Action::Think {
            thought: "first".to_string(),
        })]);
        let state = State::new();

        let first = decider.decide(&state).await.unwrap();
        assert!(matches!(first.action, Action::Think { .. }));

        let second = decider.decide(&state).await.unwrap();
        assert!(matches!(second.action, Action::Finish { .. }));
    }
}
