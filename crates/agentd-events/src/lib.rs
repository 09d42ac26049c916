//! Append-only event log and event data model for agent sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Event` - Immutable action/observation records with sequential ids
//! - `EventLog` - Single-writer append, broadcast + durable history for replay
//! - `EventStore` - Persistence trait with memory and file-backed backends

pub mod event;
pub mod log;
pub mod store;

pub use event::{
    Action, AgentStatus, ConnectionId, Event, EventId, EventPayload, EventSource, Observation,
    ObservationKind, SessionId,
};
pub use log::{EventLog, EventLogError};
pub use store::{EventStore, FileEventStore, MemoryEventStore, StoreError};
