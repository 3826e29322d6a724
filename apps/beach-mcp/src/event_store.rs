//! Append-only log of server-to-client messages, partitioned by stream.
//!
//! Every message pushed to a session is recorded here before it is offered to
//! the live SSE channel. The returned [`EventId`] is sent to the client as the
//! SSE `id:` field; a client that reconnects with `Last-Event-ID` gets every
//! later event of the same stream replayed in append order.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::session::SessionId;

const SEPARATOR: char = '_';
pub const DEFAULT_MAX_EVENTS_PER_STREAM: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&SessionId> for StreamId {
    fn from(session_id: &SessionId) -> Self {
        Self(session_id.as_str().to_string())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `{stream_id}_{sequence}` with the sequence zero padded so ids of one stream
/// sort in append order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    fn compose(stream_id: &StreamId, sequence: u64) -> Self {
        Self(format!("{}{SEPARATOR}{sequence:020}", stream_id.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the id back into its stream and sequence. `None` if the text
    /// was not produced by [`EventId::compose`].
    pub fn parse(&self) -> Option<(StreamId, u64)> {
        let (stream, sequence) = self.0.rsplit_once(SEPARATOR)?;
        if stream.is_empty() || sequence.is_empty() {
            return None;
        }
        let sequence = sequence.parse().ok()?;
        Some((StreamId(stream.to_string()), sequence))
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.parse().map(|(stream, _)| stream)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage seam for the replay log.
///
/// `replay_after` invokes `sink` while the implementation may hold internal
/// locks, so the sink must not call back into the store.
pub trait EventStore: Send + Sync {
    fn append(&self, stream_id: &StreamId, message: Value) -> EventId;

    /// Replays every event of `last_event_id`'s stream recorded after it.
    /// Returns `None` when the id is unknown (never issued or already
    /// evicted), otherwise the number of events handed to `sink`.
    fn replay_after(
        &self,
        last_event_id: &EventId,
        sink: &mut dyn FnMut(&EventId, &Value),
    ) -> Option<usize>;

    fn forget_stream(&self, stream_id: &StreamId);

    fn stream_len(&self, stream_id: &StreamId) -> usize;
}

struct StoredEvent {
    sequence: u64,
    id: EventId,
    message: Value,
}

#[derive(Default)]
struct StreamLog {
    next_sequence: u64,
    events: VecDeque<StoredEvent>,
}

/// Process-local store keeping at most `max_events_per_stream` events for each
/// stream; the oldest event is evicted first.
pub struct InMemoryEventStore {
    streams: Mutex<HashMap<StreamId, StreamLog>>,
    max_events_per_stream: usize,
}

impl InMemoryEventStore {
    pub fn new(max_events_per_stream: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            max_events_per_stream: max_events_per_stream.max(1),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS_PER_STREAM)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, stream_id: &StreamId, message: Value) -> EventId {
        let mut streams = self.streams.lock();
        let log = streams.entry(stream_id.clone()).or_default();
        let sequence = log.next_sequence;
        log.next_sequence += 1;

        let id = EventId::compose(stream_id, sequence);
        log.events.push_back(StoredEvent {
            sequence,
            id: id.clone(),
            message,
        });
        if log.events.len() > self.max_events_per_stream {
            if let Some(evicted) = log.events.pop_front() {
                trace!(stream_id = %stream_id, event_id = %evicted.id, "evicted oldest event");
            }
        }
        counter!("beach_mcp_events_appended_total", 1);
        id
    }

    fn replay_after(
        &self,
        last_event_id: &EventId,
        sink: &mut dyn FnMut(&EventId, &Value),
    ) -> Option<usize> {
        let (stream_id, sequence) = last_event_id.parse()?;
        let streams = self.streams.lock();
        let log = streams.get(&stream_id)?;
        let position = log
            .events
            .binary_search_by_key(&sequence, |event| event.sequence)
            .ok()?;
        if log.events[position].id != *last_event_id {
            return None;
        }

        let mut delivered = 0usize;
        for event in log.events.iter().skip(position + 1) {
            sink(&event.id, &event.message);
            delivered += 1;
        }
        if delivered > 0 {
            counter!("beach_mcp_events_replayed_total", delivered as u64);
        }
        Some(delivered)
    }

    fn forget_stream(&self, stream_id: &StreamId) {
        self.streams.lock().remove(stream_id);
    }

    fn stream_len(&self, stream_id: &StreamId) -> usize {
        self.streams
            .lock()
            .get(stream_id)
            .map(|log| log.events.len())
            .unwrap_or(0)
    }
}
