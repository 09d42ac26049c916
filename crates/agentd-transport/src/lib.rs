//! Connection management and streaming transport for agent sessions.
//!
//! Provides:
//! - Wire protocol (JSON envelopes)
//! - `ConnectionManager` - Admission control, reconnection, health sweeps
//! - Client reconnect backoff schedule
//! - WebSocket endpoint (feature: websocket)

pub mod backoff;
pub mod manager;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::{BASE_DELAY, MAX_ATTEMPTS, MAX_DELAY, ReconnectSchedule, backoff_delay};
pub use manager::{
    Attached, ConnectError, Connection, ConnectionManager, ConnectionRequest, HealthState,
    ManagerConfig,
};
pub use protocol::{ClientEnvelope, ServerEnvelope};
