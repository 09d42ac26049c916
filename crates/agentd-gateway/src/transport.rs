//! Wire surface between the gateway and a sandboxed execution process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use agentd_events::{Action, ObservationKind, SessionId};

/// One action execution request. Expected failure modes (non-zero exit,
/// missing file, unreachable URL) are reported in-band in the response,
/// never as a transport error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub action: Action,
    /// Maximum-duration hint in seconds; the sandbox should abort work that
    /// outlives it.
    pub max_duration_secs: u64,
}

/// Response to a `SandboxRequest`, carrying exit/error status in-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub observation: ObservationKind,
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never reached the sandbox; no observation was produced,
    /// so the call may be re-sent after a reconnect.
    #[error("sandbox unreachable: {0}")]
    Unreachable(String),
    /// The connection dropped mid-call; the action may have run, so the
    /// call must not be re-sent.
    #[error("sandbox connection lost: {0}")]
    ConnectionLost(String),
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),
}

/// Request/response client for an isolated execution process.
#[async_trait]
pub trait SandboxTransport: Send + Sync {
    /// Re-establish the connection to the same sandbox instance.
    ///
    /// # Errors
    /// Returns error if the sandbox cannot be reached.
    async fn connect(&self) -> Result<(), TransportError>;

    /// One request/response exchange.
    ///
    /// # Errors
    /// Returns a transport error only when no usable response was obtained;
    /// expected execution failures are in-band in the response.
    async fn execute_action(&self, request: SandboxRequest)
    -> Result<SandboxResponse, TransportError>;
}

/// Provisions one sandbox transport per session. Sandbox handles are never
/// shared across sessions.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a transport bound to a fresh sandbox for `session_id`.
    ///
    /// # Errors
    /// Returns error if the sandbox cannot be provisioned.
    async fn provision(
        &self,
        session_id: SessionId,
    ) -> Result<std::sync::Arc<dyn SandboxTransport>, TransportError>;
}
