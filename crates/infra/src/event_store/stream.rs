//! Snapshot cursor over stored event rows.

use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;

use chronicle_core::{EventId, StreamName};
use chronicle_events::{Metadata, RawEvent};

use super::r#trait::EventStoreError;

/// Text format of `recorded_at` in stored rows (microsecond precision, UTC).
pub const RECORDED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// An event row as read from storage, before any decoding.
///
/// Payload, metadata and timestamp stay textual until the row is consumed
/// from an [`EventStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub sequence_number: u64,
    pub event_type: String,
    pub payload: String,
    pub metadata: String,
    pub stream_name: String,
    pub version: u64,
    pub id: EventId,
    pub recorded_at: String,
}

impl EventRecord {
    pub fn from_raw(event: &RawEvent) -> Self {
        Self {
            sequence_number: event.sequence_number(),
            event_type: event.event_type().to_string(),
            payload: JsonValue::Object(event.payload().clone()).to_string(),
            metadata: JsonValue::Object(event.metadata().clone()).to_string(),
            stream_name: event.stream_name().to_string(),
            version: event.version(),
            id: event.id(),
            recorded_at: event.recorded_at().format(RECORDED_AT_FORMAT).to_string(),
        }
    }

    /// Decode the row into a [`RawEvent`].
    pub fn decode(&self) -> Result<RawEvent, EventStoreError> {
        let payload = self.json_object("payload", &self.payload)?;
        let metadata = self.json_object("metadata", &self.metadata)?;
        let stream_name = StreamName::new(self.stream_name.as_str())
            .map_err(|e| self.malformed(format!("stream name: {e}")))?;
        let recorded_at = NaiveDateTime::parse_from_str(&self.recorded_at, RECORDED_AT_FORMAT)
            .map_err(|e| self.malformed(format!("recorded_at '{}': {e}", self.recorded_at)))?
            .and_utc();

        Ok(RawEvent::new(
            self.sequence_number,
            self.event_type.clone(),
            payload,
            metadata,
            stream_name,
            self.version,
            self.id,
            recorded_at,
        ))
    }

    fn json_object(&self, field: &str, text: &str) -> Result<Metadata, EventStoreError> {
        match serde_json::from_str::<JsonValue>(text) {
            Ok(JsonValue::Object(map)) => Ok(map),
            Ok(_) => Err(self.malformed(format!("{field} is not a JSON object"))),
            Err(e) => Err(self.malformed(format!("{field} is not valid JSON: {e}"))),
        }
    }

    fn malformed(&self, reason: String) -> EventStoreError {
        EventStoreError::MalformedEventRecord {
            sequence_number: self.sequence_number,
            reason,
        }
    }
}

/// Forward cursor over the rows a storage query matched.
///
/// The cursor owns a snapshot: events committed after the query ran are not
/// visible through it. Rows are decoded lazily, one at a time, as they are
/// consumed; a row that cannot be decoded yields
/// [`EventStoreError::MalformedEventRecord`] in its position instead of being
/// skipped.
///
/// Besides [`Iterator`], the cursor exposes explicit positioning:
/// `valid()`/`key()`/`current()`/`advance()`/`rewind()`.
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    records: Vec<EventRecord>,
    position: usize,
}

impl EventStream {
    pub fn from_records(records: Vec<EventRecord>) -> Self {
        Self {
            records,
            position: 0,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the cursor points at an element.
    pub fn valid(&self) -> bool {
        self.position < self.records.len()
    }

    /// Sequence number of the current element.
    pub fn key(&self) -> Option<u64> {
        self.records.get(self.position).map(|r| r.sequence_number)
    }

    pub fn current(&self) -> Option<Result<RawEvent, EventStoreError>> {
        self.records.get(self.position).map(EventRecord::decode)
    }

    pub fn advance(&mut self) {
        if self.valid() {
            self.position += 1;
        }
    }

    /// Move back to the first element of the snapshot.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Iterator for EventStream {
    type Item = Result<RawEvent, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.current()?;
        self.advance();
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.records.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}
