//! Execution gateway: turns an Action into an Observation via sandbox RPC.

use std::{sync::Arc, time::Duration};

use thiserror::Error;

use agentd_events::{Action, EventId, Observation, ObservationKind};

use crate::transport::{SandboxRequest, SandboxTransport, TransportError};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Reconnect attempts to the same sandbox instance after a transport
    /// failure, before reporting `SandboxUnavailable`.
    pub max_reconnects: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub reconnect_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { max_reconnects: 3, reconnect_delay: Duration::from_millis(500) }
    }
}

/// Gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The action kind cannot be executed in a sandbox. Non-retryable.
    #[error("unsupported action kind: {0}")]
    UnsupportedAction(&'static str),
    /// The sandbox stayed unreachable through the reconnect budget.
    /// Retryable by the session layer, not by the gateway itself.
    #[error("sandbox unavailable after {attempts} reconnect attempts: {reason}")]
    SandboxUnavailable { attempts: u32, reason: String },
}

/// Request/response client that executes actions in an isolated sandbox.
///
/// Timeouts are data, not control flow: an elapsed call returns an
/// Observation flagged `error=true, timeout=true` so the control loop can
/// still advance the log. The action itself is never retried; reconnect
/// retries only cover transport failures where no observation was produced.
pub struct ExecutionGateway {
    transport: Arc<dyn SandboxTransport>,
    config: GatewayConfig,
}

impl ExecutionGateway {
    /// Create a gateway over an established sandbox transport.
    #[must_use]
    pub fn new(transport: Arc<dyn SandboxTransport>, config: GatewayConfig) -> Self {
        Self { transport, config }
    }

    /// Execute `action`, blocking (without blocking other sessions) until a
    /// response or `timeout`.
    ///
    /// # Errors
    /// Returns `UnsupportedAction` for non-executable kinds and
    /// `SandboxUnavailable` when the transport stays down through the
    /// reconnect budget.
    pub async fn execute(
        &self,
        action: &Action,
        caused_by: EventId,
        timeout: Duration,
    ) -> Result<Observation, GatewayError> {
        if !action.is_executable() {
            return Err(GatewayError::UnsupportedAction(action.kind_name()));
        }

        let request = SandboxRequest {
            action: action.clone(),
            max_duration_secs: timeout.as_secs().max(1),
        };

        match tokio::time::timeout(timeout, self.call(request)).await {
            Ok(Ok(response)) => Ok(Observation::caused(caused_by, response.observation)),
            Ok(Err(unavailable)) => Err(unavailable),
            Err(_elapsed) => {
                tracing::warn!(kind = action.kind_name(), ?timeout, "sandbox call timed out");
                Ok(Observation::caused(caused_by, timeout_observation(action)))
            }
        }
    }

    /// One RPC exchange with bounded reconnection. Only an `Unreachable`
    /// failure (request never delivered) re-sends the call; a mid-call
    /// `ConnectionLost` reconnects for future calls but reports this one
    /// unavailable, since the action may already have run.
    async fn call(&self, request: SandboxRequest) -> Result<crate::transport::SandboxResponse, GatewayError> {
        let mut last_error = match self.transport.execute_action(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        let resend = matches!(last_error, TransportError::Unreachable(_));
        let mut delay = self.config.reconnect_delay;
        let mut attempts = 0;
        while attempts < self.config.max_reconnects {
            attempts += 1;
            tokio::time::sleep(delay).await;
            delay *= 2;
            tracing::debug!(attempts, "reconnecting to sandbox");

            match self.transport.connect().await {
                Ok(()) if resend => match self.transport.execute_action(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e @ TransportError::Unreachable(_)) => last_error = e,
                    Err(e) => {
                        // Delivery is no longer provably clean; stop resending.
                        return Err(GatewayError::SandboxUnavailable {
                            attempts,
                            reason: e.to_string(),
                        });
                    }
                },
                Ok(()) => {
                    // Link restored for subsequent calls; this call is lost.
                    return Err(GatewayError::SandboxUnavailable {
                        attempts,
                        reason: last_error.to_string(),
                    });
                }
                Err(e) => last_error = e,
            }
        }

        Err(GatewayError::SandboxUnavailable { attempts, reason: last_error.to_string() })
    }
}

/// Timeout observation mirroring the action's kind.
fn timeout_observation(action: &Action) -> ObservationKind {
    match action {
        Action::RunCommand { command, .. } => ObservationKind::CommandOutput {
            command: command.clone(),
            output: String::new(),
            exit_code: None,
            error: true,
            timeout: true,
        },
        _ => ObservationKind::Error {
            message: format!("{} timed out", action.kind_name()),
        },
    }
}
