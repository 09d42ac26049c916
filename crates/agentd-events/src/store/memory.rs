//! In-memory event storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;

use crate::event::{Event, EventId, SessionId};

use super::{EventStore, StoreError};

/// In-memory storage implementation.
///
/// Useful for tests and single-process deployments. Records are lost on
/// restart, so it provides ordering but not durability.
pub struct MemoryEventStore {
    sessions: RwLock<HashMap<SessionId, Vec<Event>>>,
}

impl MemoryEventStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, session_id: SessionId, event: &Event) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let records = sessions.entry(session_id).or_default();
        if records.iter().any(|e| e.id == event.id) {
            return Err(StoreError::Conflict { session_id, id: event.id });
        }
        records.push(event.clone());
        Ok(())
    }

    async fn read_range(
        &self,
        session_id: SessionId,
        from: EventId,
        to: Option<EventId>,
    ) -> Result<Vec<Event>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut result: Vec<Event> = sessions
            .get(&session_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|e| e.id >= from && to.is_none_or(|t| e.id <= t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        result.sort_by_key(|e| e.id);
        Ok(result)
    }

    async fn last_id(&self, session_id: SessionId) -> Result<Option<EventId>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        Ok(sessions
            .get(&session_id)
            .and_then(|records| records.iter().map(|e| e.id).max()))
    }
}
