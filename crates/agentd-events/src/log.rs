//! Append-only event log with broadcast + durable history for replay.

use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;

use crate::event::{Event, EventId, EventPayload, EventSource, SessionId};
use crate::store::{EventStore, StoreError};

/// Broadcast capacity, sized so only a pathological consumer lags. A lagged
/// live subscriber logs a warning and can recover by resubscribing from its
/// last seen id, which replays from the durable store.
const CHANNEL_CAPACITY: usize = 10_000;

/// Event log error.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// The durable tail disagrees with the writer's next id. Appends go
    /// through a single-writer lock, so this only occurs when another
    /// process shares the same store.
    #[error("append would violate id monotonicity at {id}")]
    InvalidSequence { id: EventId },
    /// An observation referenced a causing action at or after its own id.
    #[error("observation cause {caused_by} does not precede event {id}")]
    InvalidCause { id: EventId, caused_by: EventId },
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

struct Writer {
    next_id: EventId,
    secrets: HashMap<String, String>,
}

/// Append-only, strictly-ordered event sequence for one session.
///
/// Essential for reconnection: subscribers receive persisted history from
/// their requested id, then seamlessly switch to live delivery. Append order
/// equals the order observed by every subscriber.
pub struct EventLog {
    session_id: SessionId,
    store: Arc<dyn EventStore>,
    sender: broadcast::Sender<Event>,
    writer: Mutex<Writer>,
}

impl EventLog {
    /// Open the log for `session_id`, resuming the id sequence from the
    /// durable tail.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn open(
        session_id: SessionId,
        store: Arc<dyn EventStore>,
    ) -> Result<Self, EventLogError> {
        let next_id = store.last_id(session_id).await?.map_or(0, |last| last + 1);
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            session_id,
            store,
            sender,
            writer: Mutex::new(Writer { next_id, secrets: HashMap::new() }),
        })
    }

    /// The session this log belongs to.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Append an event, assigning the next sequential id.
    ///
    /// The record is durably persisted before it becomes visible to any
    /// subscriber. Secret values are masked in the persisted and delivered
    /// payload.
    ///
    /// # Errors
    /// Returns `InvalidCause` if an observation references a cause at or
    /// after its own id, `InvalidSequence` if the store already holds the
    /// assigned id, or the underlying store error.
    pub async fn append(
        &self,
        source: EventSource,
        payload: EventPayload,
    ) -> Result<EventId, EventLogError> {
        let mut writer = self.writer.lock().await;
        let id = writer.next_id;

        if let EventPayload::Observation(observation) = &payload {
            if let Some(caused_by) = observation.caused_by {
                if caused_by >= id {
                    return Err(EventLogError::InvalidCause { id, caused_by });
                }
            }
        }

        let event = Event { id, timestamp: chrono::Utc::now(), source, payload };
        let event = mask_secrets(event, &writer.secrets);

        match self.store.append(self.session_id, &event).await {
            Ok(()) => {}
            Err(StoreError::Conflict { id, .. }) => {
                return Err(EventLogError::InvalidSequence { id });
            }
            Err(e) => return Err(e.into()),
        }
        writer.next_id = id + 1;

        // Broadcast while still holding the writer lock: subscriber order
        // must equal id order even when appends race. Send only fails with
        // no receivers, which is fine.
        let _ = self.sender.send(event);
        drop(writer);

        Ok(id)
    }

    /// Replace the secret map applied to future appends.
    pub async fn set_secrets(&self, secrets: HashMap<String, String>) {
        self.writer.lock().await.secrets = secrets;
    }

    /// Merge additional secrets into the map.
    pub async fn update_secrets(&self, secrets: HashMap<String, String>) {
        self.writer.lock().await.secrets.extend(secrets);
    }

    /// Highest appended id, or `None` if the log is empty.
    pub async fn last_id(&self) -> Option<EventId> {
        let writer = self.writer.lock().await;
        writer.next_id.checked_sub(1)
    }

    /// Finite slice for replay/export, `from..=to` by id.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn read_range(
        &self,
        from: EventId,
        to: Option<EventId>,
    ) -> Result<Vec<Event>, EventLogError> {
        Ok(self.store.read_range(self.session_id, from, to).await?)
    }

    /// Lazy, restartable sequence starting at `from_id` inclusive: persisted
    /// history first, then live delivery, with no gap and no duplicate at
    /// the boundary. Infinite until the returned stream is dropped.
    ///
    /// # Errors
    /// Returns error if history cannot be read.
    pub async fn subscribe(
        &self,
        from_id: EventId,
    ) -> Result<futures::stream::BoxStream<'static, Event>, EventLogError> {
        // Take the receiver before snapshotting history so nothing appended
        // in between is missed; anything covered by both is filtered below.
        let receiver = self.sender.subscribe();
        let history = self.store.read_range(self.session_id, from_id, None).await?;
        let replayed_to = history.last().map(|e| e.id);

        let session_id = self.session_id;
        let history_stream = futures::stream::iter(history);
        let live = BroadcastStream::new(receiver).filter_map(move |result| {
            let event = match result {
                Ok(event) => {
                    (event.id >= from_id && replayed_to.is_none_or(|last| event.id > last))
                        .then_some(event)
                }
                Err(e) => {
                    tracing::warn!(%session_id, "event subscriber lagged: {e}");
                    None
                }
            };
            async move { event }
        });

        Ok(Box::pin(history_stream.chain(live)))
    }
}

/// Mask configured secret values in the serialized payload. Mirrors the
/// masking applied before durable write, so replays never leak.
fn mask_secrets(event: Event, secrets: &HashMap<String, String>) -> Event {
    if secrets.is_empty() {
        return event;
    }
    let Ok(mut value) = serde_json::to_value(&event) else {
        return event;
    };
    mask_value(&mut value, secrets);
    serde_json::from_value(value).unwrap_or(event)
}

fn mask_value(value: &mut serde_json::Value, secrets: &HashMap<String, String>) {
    match value {
        serde_json::Value::String(s) => {
            for secret in secrets.values() {
                if !secret.is_empty() && s.contains(secret.as_str()) {
                    *s = s.replace(secret.as_str(), "<secret_hidden>");
                }
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values_mut() {
                mask_value(v, secrets);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items.iter_mut() {
                mask_value(v, secrets);
            }
        }
        _ => {}
    }
}
