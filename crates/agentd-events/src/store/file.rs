//! File-backed event storage: one append-only JSONL file per session.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::event::{Event, EventId, SessionId};

use super::{EventStore, StoreError};

struct SessionFile {
    file: File,
    last_id: Option<EventId>,
}

/// Append-only JSONL store, one `<session_id>.jsonl` file per session.
///
/// Every append is written and fsynced before returning, so a replay after
/// process restart reproduces exactly the committed sequence.
pub struct FileEventStore {
    root: PathBuf,
    open: Mutex<HashMap<SessionId, SessionFile>>,
}

impl FileEventStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns `Internal` if the directory cannot be created.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(Self { root, open: Mutex::new(HashMap::new()) })
    }

    fn path_for(&self, session_id: SessionId) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }

    async fn load_events(&self, session_id: SessionId) -> Result<Vec<Event>, StoreError> {
        let path = self.path_for(session_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Internal(e.to_string())),
        };

        let mut events = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let event: Event =
                serde_json::from_str(line).map_err(|e| StoreError::Internal(e.to_string()))?;
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, session_id: SessionId, event: &Event) -> Result<(), StoreError> {
        let mut open = self.open.lock().await;

        if !open.contains_key(&session_id) {
            let last_id = self.load_events(session_id).await?.last().map(|e| e.id);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(session_id))
                .await
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            open.insert(session_id, SessionFile { file, last_id });
        }

        let entry = open
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::Internal("session file handle vanished".to_string()))?;

        if entry.last_id.is_some_and(|last| event.id <= last) {
            return Err(StoreError::Conflict { session_id, id: event.id });
        }

        let mut line =
            serde_json::to_vec(event).map_err(|e| StoreError::Internal(e.to_string()))?;
        line.push(b'\n');

        entry
            .file
            .write_all(&line)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        entry
            .file
            .sync_data()
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        entry.last_id = Some(event.id);

        Ok(())
    }

    async fn read_range(
        &self,
        session_id: SessionId,
        from: EventId,
        to: Option<EventId>,
    ) -> Result<Vec<Event>, StoreError> {
        let events = self.load_events(session_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.id >= from && to.is_none_or(|t| e.id <= t))
            .collect())
    }

    async fn last_id(&self, session_id: SessionId) -> Result<Option<EventId>, StoreError> {
        {
            let open = self.open.lock().await;
            if let Some(entry) = open.get(&session_id) {
                return Ok(entry.last_id);
            }
        }
        Ok(self.load_events(session_id).await?.last().map(|e| e.id))
    }
}
