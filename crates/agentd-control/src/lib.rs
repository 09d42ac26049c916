//! Step-driven control loop for agent sessions.
//!
//! Provides:
//! - `State` - Derived projection of a session's event history
//! - `Decider` - The external decision collaborator trait
//! - `Controller` - Per-session task running the sense-think-act cycle
//! - `LoopPolicy` - Optional between-iteration policy plugin (stuck detection)

pub mod controller;
pub mod decider;
pub mod policy;
pub mod state;

pub use controller::{ControlError, ControlSignal, Controller, ControllerConfig, ControllerHandle, StepToken};
pub use decider::{Decider, Decision, DecisionError, ScriptedDecider};
pub use policy::{LoopPolicy, PolicyVerdict, RepetitionPolicy};
pub use state::State;
