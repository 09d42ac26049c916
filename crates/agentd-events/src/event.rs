//! Event data model: actions, observations, and the persisted record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Connection identifier.
pub type ConnectionId = Uuid;

/// Sequential event identifier. Gap-free and strictly increasing per session.
pub type EventId = u64;

/// Originator of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Emitted by the agent's control loop.
    Agent,
    /// Emitted on behalf of a human user.
    User,
    /// Emitted by the execution environment.
    Environment,
}

/// Lifecycle status of a session's control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Created, not yet started.
    Idle,
    /// Stepping through the decide/dispatch cycle.
    Running,
    /// Paused by request; resumable.
    Paused,
    /// Waiting for the user to confirm or reject an emitted action.
    AwaitingConfirmation,
    /// Terminal: the agent issued a finish action or was stopped.
    Finished,
    /// Terminal: the decision collaborator failed unrecoverably.
    Error,
    /// Terminal: iteration or budget ceiling reached, or a loop was detected.
    Stuck,
}

impl AgentStatus {
    /// Whether this status ends the control loop.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Stuck)
    }
}

/// Agent-issued request to affect the external environment.
///
/// A closed set of kinds so the step cycle and serializers can match
/// exhaustively. `RunCommand`, `ReadFile`, `WriteFile` and `Browse` are
/// dispatched to the execution gateway; the remaining kinds are handled by
/// the control loop itself and never reach the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Run a shell command in the sandbox.
    RunCommand {
        command: String,
        /// Per-action timeout override in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Read a file from the sandbox workspace.
    ReadFile { path: String },
    /// Write a file into the sandbox workspace.
    WriteFile { path: String, content: String },
    /// Fetch a URL.
    Browse { url: String },
    /// Internal reasoning step; recorded but not executed.
    Think { thought: String },
    /// Message addressed to the user.
    Message { content: String },
    /// Terminal action ending the task.
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<String>,
    },
}

impl Action {
    /// Whether this kind is dispatched to the execution gateway.
    #[must_use]
    pub const fn is_executable(&self) -> bool {
        matches!(
            self,
            Self::RunCommand { .. } | Self::ReadFile { .. } | Self::WriteFile { .. } | Self::Browse { .. }
        )
    }

    /// Stable kind name, matching the serialized tag.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::RunCommand { .. } => "run_command",
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::Browse { .. } => "browse",
            Self::Think { .. } => "think",
            Self::Message { .. } => "message",
            Self::Finish { .. } => "finish",
        }
    }
}

/// Result payload of an observation, mirroring the action kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationKind {
    /// Output of a `RunCommand` action.
    CommandOutput {
        command: String,
        output: String,
        exit_code: Option<i32>,
        error: bool,
        timeout: bool,
    },
    /// Contents read by a `ReadFile` action.
    FileContent { path: String, content: String },
    /// Acknowledgement of a `WriteFile` action.
    FileWritten { path: String, bytes_written: u64 },
    /// Result of a `Browse` action.
    BrowseResult { url: String, status: u16, content: String },
    /// Message produced by the agent for the user.
    AgentMessage { content: String },
    /// Message injected by the user.
    UserMessage { content: String },
    /// Control-loop status transition.
    StatusChanged { status: AgentStatus },
    /// Failure executing or interpreting an action. Recorded as data so the
    /// loop can continue and the agent can react.
    Error { message: String },
}

/// Result of executing an Action, or an externally-sourced event such as a
/// user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Id of the Action this observation answers. `None` for external
    /// events; otherwise strictly less than the observation's own event id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<EventId>,
    #[serde(flatten)]
    pub kind: ObservationKind,
}

impl Observation {
    /// Observation answering the action appended at `caused_by`.
    #[must_use]
    pub const fn caused(caused_by: EventId, kind: ObservationKind) -> Self {
        Self { caused_by: Some(caused_by), kind }
    }

    /// Externally-sourced observation with no causing action.
    #[must_use]
    pub const fn external(kind: ObservationKind) -> Self {
        Self { caused_by: None, kind }
    }

    /// Whether this observation records a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        match &self.kind {
            ObservationKind::Error { .. } => true,
            ObservationKind::CommandOutput { error, .. } => *error,
            _ => false,
        }
    }
}

/// The two event payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
}

/// Immutable, append-only record. Never mutated or deleted after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing id, unique and gap-free per session.
    pub id: EventId,
    /// Append time, serialized as ISO-8601.
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    /// The action payload, if this event carries one.
    #[must_use]
    pub const fn action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            EventPayload::Observation(_) => None,
        }
    }

    /// The observation payload, if this event carries one.
    #[must_use]
    pub const fn observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Observation(observation) => Some(observation),
            EventPayload::Action(_) => None,
        }
    }
}
