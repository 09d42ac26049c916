//! Wire protocol for client-server communication.

use serde::{Deserialize, Serialize};

use agentd_events::{ConnectionId, Event, SessionId};

/// Message from client to server: action envelopes driving the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Start a new session with this intent. Only valid as the first
    /// message of a connection opened without a `session_id`.
    Start { intent: String },
    /// Inject a user message into the bound session.
    UserMessage { content: String },
    /// Pause the bound session.
    Pause,
    /// Resume the bound session.
    Resume,
    /// Stop the bound session.
    Stop,
    /// Approve or reject the action awaiting confirmation.
    Confirm { approve: bool },
    /// Liveness probe.
    Ping,
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// The connection is bound to a session; events follow.
    Connected { session_id: SessionId, connection_id: ConnectionId },
    /// One event record. Ids are integers, timestamps ISO-8601.
    Event { event: Event },
    /// The connection was refused. `retry_after_secs` is a hint for
    /// load-shed rejections; absent for terminal refusals.
    Rejected {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Non-fatal per-message error.
    Error { message: String },
    /// Liveness answer.
    Pong,
}

#[cfg(test)]
mod tests {
    use agentd_events::{EventPayload, EventSource, Observation, ObservationKind};
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn client_envelope_roundtrip() {
        let msg = ClientEnvelope::Start { intent: "fix the tests".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"start""#));

        let parsed: ClientEnvelope = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientEnvelope::Start { intent } => assert_eq!(intent, "fix the tests"),
            other => panic!("wrong envelope: {other:?}"),
        }
    }

    #[test]
    fn event_envelope_carries_integer_ids_and_iso_timestamps() {
        let event = Event {
            id: 12,
            timestamp: Utc::now(),
            source: EventSource::Environment,
            payload: EventPayload::Observation(Observation::caused(
                11,
                ObservationKind::CommandOutput {
                    command: "true".to_string(),
                    output: String::new(),
                    exit_code: Some(0),
                    error: false,
                    timeout: false,
                },
            )),
        };
        let json = serde_json::to_string(&ServerEnvelope::Event { event }).unwrap();
        assert!(json.contains(r#""id":12"#));
        assert!(json.contains(r#""caused_by":11"#));
        // chrono serializes DateTime<Utc> as RFC 3339 / ISO-8601.
        assert!(json.contains('T'));
    }

    #[test]
    fn rejection_carries_retry_hint() {
        let msg = ServerEnvelope::Rejected {
            code: "at_capacity".to_string(),
            message: "connection ceiling reached".to_string(),
            retry_after_secs: Some(5),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""retry_after_secs":5"#));

        let terminal = ServerEnvelope::Rejected {
            code: "reconnect_exhausted".to_string(),
            message: "too many attempts".to_string(),
            retry_after_secs: None,
        };
        let json = serde_json::to_string(&terminal).unwrap();
        assert!(!json.contains("retry_after_secs"));
    }

    #[test]
    fn unknown_fields_are_rejected_gracefully() {
        let parsed: Result<ClientEnvelope, _> =
            serde_json::from_str(r#"{"type":"warp_drive"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn session_ids_serialize_as_uuids() {
        let msg = ServerEnvelope::Connected {
            session_id: Uuid::nil(),
            connection_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("00000000-0000-0000-0000-000000000000"));
    }
}
