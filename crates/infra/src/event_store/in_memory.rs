use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};

use chronicle_core::{EventId, ExpectedVersion, StreamName};
use chronicle_events::RawEvent;

use super::r#trait::{EventStorage, EventStoreError, WritableEvent};
use super::stream::{EventRecord, EventStream};

#[derive(Debug, Default)]
struct State {
    /// Rows in global sequence order; `records[i].sequence_number == i + 1`.
    records: Vec<EventRecord>,
    /// Row indices per stream, in version order.
    streams: HashMap<StreamName, Vec<usize>>,
    ids: HashSet<EventId>,
}

/// In-memory event storage.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStorage {
    state: RwLock<State>,
}

impl InMemoryEventStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events committed so far.
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStorage for InMemoryEventStorage {
    async fn commit(
        &self,
        stream: &StreamName,
        expected_version: ExpectedVersion,
        events: Vec<WritableEvent>,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        // Duplicates are reported before versions so an idempotent retry is
        // recognisable as such.
        let mut batch_ids = HashSet::with_capacity(events.len());
        for e in &events {
            if state.ids.contains(&e.id) || !batch_ids.insert(e.id) {
                return Err(EventStoreError::DuplicateEvent(format!(
                    "event id {} already exists",
                    e.id
                )));
            }
        }

        let current = state.streams.get(stream).map(|rows| rows.len() as u64).unwrap_or(0);
        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {stream}: expected {expected_version:?}, found {current}"
            )));
        }

        let recorded_at = Utc::now().trunc_subsecs(6);
        let mut committed = Vec::with_capacity(events.len());
        for (offset, e) in events.into_iter().enumerate() {
            let index = state.records.len();
            let event = RawEvent::new(
                index as u64 + 1,
                e.event_type,
                e.payload,
                e.metadata,
                stream.clone(),
                current + offset as u64 + 1,
                e.id,
                recorded_at,
            );

            state.records.push(EventRecord::from_raw(&event));
            state.streams.entry(stream.clone()).or_default().push(index);
            state.ids.insert(e.id);
            committed.push(event);
        }

        Ok(committed)
    }

    async fn load(
        &self,
        stream: &StreamName,
        minimum_version: u64,
    ) -> Result<EventStream, EventStoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let records = state
            .streams
            .get(stream)
            .map(|rows| {
                rows.iter()
                    .map(|&i| &state.records[i])
                    .filter(|r| r.version >= minimum_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(EventStream::from_records(records))
    }

    async fn load_all(&self, minimum_sequence_number: u64) -> Result<EventStream, EventStoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let start = minimum_sequence_number.saturating_sub(1) as usize;
        let records = state.records.get(start..).map(<[EventRecord]>::to_vec).unwrap_or_default();

        Ok(EventStream::from_records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_events::Payload;
    use serde_json::json;

    fn writable(n: u64) -> WritableEvent {
        let mut payload = Payload::new();
        payload.insert("n".into(), json!(n));
        WritableEvent {
            id: EventId::new(),
            event_type: "counter.incremented".into(),
            payload,
            metadata: Default::default(),
        }
    }

    fn stream(name: &str) -> StreamName {
        StreamName::new(name).unwrap()
    }

    #[tokio::test]
    async fn commit_assigns_versions_and_global_sequence_numbers() {
        let storage = InMemoryEventStorage::new();
        let a = stream("Counter:a");
        let b = stream("Counter:b");

        let first = storage
            .commit(&a, ExpectedVersion::NoStream, vec![writable(1), writable(2)])
            .await
            .unwrap();
        let second = storage
            .commit(&b, ExpectedVersion::NoStream, vec![writable(3)])
            .await
            .unwrap();

        assert_eq!(first.iter().map(RawEvent::version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(first.iter().map(RawEvent::sequence_number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(first[0].recorded_at(), first[1].recorded_at());
        assert_eq!(second[0].version(), 1);
        assert_eq!(second[0].sequence_number(), 3);
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict_and_leaves_stream_untouched() {
        let storage = InMemoryEventStorage::new();
        let a = stream("Counter:a");
        storage
            .commit(&a, ExpectedVersion::NoStream, vec![writable(1)])
            .await
            .unwrap();

        let err = storage
            .commit(&a, ExpectedVersion::NoStream, vec![writable(2)])
            .await
            .unwrap_err();

        assert!(err.is_concurrency());
        assert_eq!(storage.load(&a, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_is_reported_before_version_conflict() {
        let storage = InMemoryEventStorage::new();
        let a = stream("Counter:a");
        let event = writable(1);
        storage
            .commit(&a, ExpectedVersion::NoStream, vec![event.clone()])
            .await
            .unwrap();

        // Same id and same (now stale) expectation: an idempotent retry.
        let err = storage
            .commit(&a, ExpectedVersion::NoStream, vec![event])
            .await
            .unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let storage = InMemoryEventStorage::new();
        let committed = storage
            .commit(&stream("Counter:a"), ExpectedVersion::Exact(42), vec![])
            .await
            .unwrap();

        assert!(committed.is_empty());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn load_filters_by_version_and_load_all_by_sequence() {
        let storage = InMemoryEventStorage::new();
        let a = stream("Counter:a");
        let b = stream("Counter:b");
        for n in 0..3 {
            storage.commit(&a, ExpectedVersion::Any, vec![writable(n)]).await.unwrap();
            storage.commit(&b, ExpectedVersion::Any, vec![writable(n)]).await.unwrap();
        }

        let versions: Vec<u64> = storage
            .load(&a, 2)
            .await
            .unwrap()
            .map(|e| e.unwrap().version())
            .collect();
        assert_eq!(versions, vec![2, 3]);

        let sequence: Vec<u64> = storage
            .load_all(5)
            .await
            .unwrap()
            .map(|e| e.unwrap().sequence_number())
            .collect();
        assert_eq!(sequence, vec![5, 6]);

        assert!(storage.load_all(7).await.unwrap().is_empty());
        assert!(storage.load(&stream("Counter:c"), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_is_a_snapshot() {
        let storage = InMemoryEventStorage::new();
        let a = stream("Counter:a");
        storage.commit(&a, ExpectedVersion::Any, vec![writable(1)]).await.unwrap();

        let cursor = storage.load_all(1).await.unwrap();
        storage.commit(&a, ExpectedVersion::Any, vec![writable(2)]).await.unwrap();

        assert_eq!(cursor.count(), 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sequence_numbers_are_gap_free(batches in proptest::collection::vec((0usize..3, 0usize..4), 1..20)) {
                let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
                runtime.block_on(async {
                    let storage = InMemoryEventStorage::new();
                    let streams = [stream("Counter:a"), stream("Counter:b"), stream("Counter:c")];
                    let mut expected_total = 0u64;

                    for (stream_index, size) in batches {
                        let events = (0..size).map(|n| writable(n as u64)).collect();
                        let committed = storage
                            .commit(&streams[stream_index], ExpectedVersion::Any, events)
                            .await
                            .unwrap();
                        expected_total += committed.len() as u64;
                    }

                    let sequence: Vec<u64> = storage
                        .load_all(1)
                        .await
                        .unwrap()
                        .map(|e| e.unwrap().sequence_number())
                        .collect();
                    let expected: Vec<u64> = (1..=expected_total).collect();
                    assert_eq!(sequence, expected);

                    for s in &streams {
                        let versions: Vec<u64> = storage.load(s, 0).await.unwrap().map(|e| e.unwrap().version()).collect();
                        let expected: Vec<u64> = (1..=versions.len() as u64).collect();
                        assert_eq!(versions, expected);
                    }
                });
            }
        }
    }
}
