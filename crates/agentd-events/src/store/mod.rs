//! Durable event storage backends.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{Event, EventId, SessionId};

pub use file::FileEventStore;
pub use memory::MemoryEventStore;

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An event with this id is already persisted for the session.
    #[error("event {id} already persisted for session {session_id}")]
    Conflict { session_id: SessionId, id: EventId },
    #[error("storage error: {0}")]
    Internal(String),
}

/// Trait for per-session append-only record stores.
///
/// Records are keyed by `(session_id, event_id)`. `append` must not return
/// before the record is durable; replay after process restart reproduces
/// exactly the appended sequence.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably persist one event.
    ///
    /// # Errors
    /// Returns `Conflict` if an event with the same id already exists for
    /// the session, `Internal` on storage failure.
    async fn append(&self, session_id: SessionId, event: &Event) -> Result<(), StoreError>;

    /// Read events with `from <= id` and, when `to` is set, `id <= to`,
    /// in id order.
    async fn read_range(
        &self,
        session_id: SessionId,
        from: EventId,
        to: Option<EventId>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Highest persisted id for the session, or `None` if empty.
    async fn last_id(&self, session_id: SessionId) -> Result<Option<EventId>, StoreError>;
}
