use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use chronicle_core::{EventId, StreamName};

/// Structured event payload, always a JSON object.
pub type Payload = Map<String, JsonValue>;

/// Structured event metadata, always a JSON object.
pub type Metadata = Map<String, JsonValue>;

/// Well-known metadata key linking events that belong to one business flow.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Well-known metadata key pointing at the message that caused an event.
pub const CAUSATION_ID_KEY: &str = "causation_id";

/// One event as persisted by the event storage.
///
/// Everything except `payload`/`metadata` content is assigned by the storage
/// inside the commit:
/// - `sequence_number`: global, strictly increasing position (the replay cursor)
/// - `version`: position within `stream_name`, starting at 1
/// - `recorded_at`: commit timestamp (microsecond precision)
///
/// A `RawEvent` is immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    sequence_number: u64,
    event_type: String,
    payload: Payload,
    metadata: Metadata,
    stream_name: StreamName,
    version: u64,
    id: EventId,
    recorded_at: DateTime<Utc>,
}

impl RawEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sequence_number: u64,
        event_type: impl Into<String>,
        payload: Payload,
        metadata: Metadata,
        stream_name: StreamName,
        version: u64,
        id: EventId,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence_number,
            event_type: event_type.into(),
            payload,
            metadata,
            stream_name,
            version,
            id,
            recorded_at,
        }
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn stream_name(&self) -> &StreamName {
        &self.stream_name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(CORRELATION_ID_KEY).and_then(JsonValue::as_str)
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.metadata.get(CAUSATION_ID_KEY).and_then(JsonValue::as_str)
    }
}
