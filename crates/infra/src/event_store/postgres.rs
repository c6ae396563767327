//! Postgres-backed event storage.
//!
//! Persists events in a single append-only table with a global order.
//!
//! ## Schema
//!
//! | Column | Type | Notes |
//! |--------|------|-------|
//! | `sequencenumber` | `BIGINT` | primary key, assigned inside the commit |
//! | `stream` | `VARCHAR(255)` | |
//! | `version` | `BIGINT` | unique together with `stream` |
//! | `type` | `VARCHAR(255)` | |
//! | `payload` | `TEXT` | JSON object |
//! | `metadata` | `TEXT` | JSON object |
//! | `id` | `UUID` | unique |
//! | `recordedat` | `TIMESTAMP(6)` | UTC |
//!
//! ## Sequence Assignment
//!
//! Commits take a transaction-scoped advisory lock before reading
//! `MAX(sequencenumber)`, so sequence numbers are gap-free and become visible
//! in increasing order. Stream versions are still protected by the
//! `(stream, version)` unique constraint.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation on `id`) | `23505` | `DuplicateEvent` |
//! | Database (unique violation on `(stream, version)`) | `23505` | `Concurrency` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use chronicle_core::{EventId, ExpectedVersion, StreamName};
use chronicle_events::RawEvent;

use super::r#trait::{EventStorage, EventStoreError, WritableEvent};
use super::stream::{EventRecord, EventStream};
use crate::config::{ChronicleConfig, TableName};

/// PostgreSQL truncates longer identifiers.
const MAX_IDENTIFIER_LENGTH: usize = 63;
const ID_KEY_SUFFIX: &str = "id_key";
const STREAM_VERSION_KEY_SUFFIX: &str = "stream_version_key";

/// Postgres-backed append-only event storage.
///
/// `PostgresEventStorage` is `Send + Sync` and cheap to clone; all operations
/// go through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStorage {
    pool: PgPool,
    table: TableName,
}

impl PostgresEventStorage {
    pub fn new(pool: PgPool, table: TableName) -> Self {
        Self { pool, table }
    }

    pub fn from_config(pool: PgPool, config: &ChronicleConfig) -> Self {
        Self::new(pool, config.events_table.clone())
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Create the events table and its constraints if they do not exist.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn create_schema(&self) -> Result<(), EventStoreError> {
        let table = &self.table;
        let id_key = constraint_name(table, ID_KEY_SUFFIX);
        let stream_version_key = constraint_name(table, STREAM_VERSION_KEY_SUFFIX);
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                sequencenumber BIGINT PRIMARY KEY,
                stream VARCHAR(255) NOT NULL,
                version BIGINT NOT NULL,
                type VARCHAR(255) NOT NULL,
                payload TEXT NOT NULL,
                metadata TEXT NOT NULL,
                id UUID NOT NULL,
                recordedat TIMESTAMP(6) NOT NULL,
                CONSTRAINT {id_key} UNIQUE (id),
                CONSTRAINT {stream_version_key} UNIQUE (stream, version)
            )
            "#
        );

        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        Ok(())
    }

    /// Commit a batch to one stream.
    ///
    /// This method:
    /// 1. Starts a transaction and takes the sequence advisory lock
    /// 2. Rejects ids that already exist
    /// 3. Checks the stream version against `expected_version`
    /// 4. Inserts the batch with consecutive versions and sequence numbers
    /// 5. Commits the transaction
    #[instrument(
        skip(self, events),
        fields(
            table = %self.table,
            stream = %stream,
            event_count = events.len(),
            expected_version = ?expected_version,
            first_sequence_number = tracing::field::Empty
        ),
        err
    )]
    pub async fn commit_events(
        &self,
        stream: &StreamName,
        expected_version: ExpectedVersion,
        events: Vec<WritableEvent>,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(self.table.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("sequence_lock", e))?;

        let ids: Vec<Uuid> = events.iter().map(|e| *e.id.as_uuid()).collect();
        if let Some(existing) = self.find_existing_id(&mut tx, &ids).await? {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::DuplicateEvent(format!(
                "event id {existing} already exists"
            )));
        }
        if let Some(repeated) = first_repeated(&ids) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::DuplicateEvent(format!(
                "event id {repeated} appears twice in the batch"
            )));
        }

        let (current_version, last_sequence) = self.stream_position(&mut tx, stream).await?;
        if !expected_version.matches(current_version) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::Concurrency(format!(
                "stream {stream}: expected {expected_version:?}, found {current_version}"
            )));
        }

        let recorded_at = Utc::now().trunc_subsecs(6);
        let insert = format!(
            r#"
            INSERT INTO {} (sequencenumber, stream, version, type, payload, metadata, id, recordedat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.table
        );

        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let sequence_number = last_sequence + offset as u64 + 1;
            let version = current_version + offset as u64 + 1;
            let raw = RawEvent::new(
                sequence_number,
                event.event_type,
                event.payload,
                event.metadata,
                stream.clone(),
                version,
                event.id,
                recorded_at,
            );
            let record = EventRecord::from_raw(&raw);

            sqlx::query(&insert)
                .bind(sequence_number as i64)
                .bind(stream.as_str())
                .bind(version as i64)
                .bind(&record.event_type)
                .bind(&record.payload)
                .bind(&record.metadata)
                .bind(raw.id().as_uuid())
                .bind(recorded_at.naive_utc())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_event", e))?;

            committed.push(raw);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("first_sequence_number", last_sequence + 1);
        Ok(committed)
    }

    /// Load one stream's events with `version >= minimum_version`.
    #[instrument(skip(self), fields(table = %self.table, stream = %stream), err)]
    pub async fn load_stream(
        &self,
        stream: &StreamName,
        minimum_version: u64,
    ) -> Result<EventStream, EventStoreError> {
        let query = format!(
            "{} WHERE stream = $1 AND version >= $2 ORDER BY version ASC",
            self.select_records()
        );

        let rows = sqlx::query(&query)
            .bind(stream.as_str())
            .bind(minimum_version as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_stream", e))?;

        records_to_stream(rows)
    }

    /// Load every event with `sequencenumber >= minimum_sequence_number`.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn load_from_sequence(
        &self,
        minimum_sequence_number: u64,
    ) -> Result<EventStream, EventStoreError> {
        let query = format!(
            "{} WHERE sequencenumber >= $1 ORDER BY sequencenumber ASC",
            self.select_records()
        );

        let rows = sqlx::query(&query)
            .bind(minimum_sequence_number as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_all", e))?;

        records_to_stream(rows)
    }

    fn select_records(&self) -> String {
        format!(
            r#"
            SELECT
                sequencenumber,
                stream,
                version,
                type,
                payload,
                metadata,
                id,
                to_char(recordedat, 'YYYY-MM-DD HH24:MI:SS.US') AS recordedat
            FROM {}
            "#,
            self.table
        )
    }

    async fn find_existing_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[Uuid],
    ) -> Result<Option<Uuid>, EventStoreError> {
        let query = format!("SELECT id FROM {} WHERE id = ANY($1) LIMIT 1", self.table);
        let row = sqlx::query(&query)
            .bind(ids)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("check_duplicates", e))?;

        row.map(|r| r.try_get::<Uuid, _>("id"))
            .transpose()
            .map_err(|e| map_sqlx_error("check_duplicates", e))
    }

    /// Returns `(current stream version, last global sequence number)`, both 0 when absent.
    async fn stream_position(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        stream: &StreamName,
    ) -> Result<(u64, u64), EventStoreError> {
        let query = format!(
            r#"
            SELECT
                (SELECT COALESCE(MAX(version), 0) FROM {table} WHERE stream = $1) AS current_version,
                (SELECT COALESCE(MAX(sequencenumber), 0) FROM {table}) AS last_sequence
            "#,
            table = self.table
        );

        let row = sqlx::query(&query)
            .bind(stream.as_str())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("stream_position", e))?;

        let current_version: i64 = row
            .try_get("current_version")
            .map_err(|e| map_sqlx_error("stream_position", e))?;
        let last_sequence: i64 = row
            .try_get("last_sequence")
            .map_err(|e| map_sqlx_error("stream_position", e))?;

        Ok((current_version as u64, last_sequence as u64))
    }
}

/// `{schema}_{table}_{suffix}`, or, when that is too long, a cut prefix
/// followed by a checksum of the full table name so the name stays unique
/// and keeps its suffix.
fn constraint_name(table: &TableName, suffix: &str) -> String {
    let prefix = table.as_str().replace('.', "_");
    let name = format!("{prefix}_{suffix}");
    if name.len() <= MAX_IDENTIFIER_LENGTH {
        return name;
    }

    let checksum = crc32fast::hash(table.as_str().as_bytes());
    let keep = MAX_IDENTIFIER_LENGTH - suffix.len() - 10;
    format!("{}_{checksum:08x}_{suffix}", &prefix[..keep])
}

fn first_repeated(ids: &[Uuid]) -> Option<Uuid> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().copied().find(|id| !seen.insert(*id))
}

fn records_to_stream(rows: Vec<PgRow>) -> Result<EventStream, EventStoreError> {
    let records = rows
        .iter()
        .map(EventRecord::from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    Ok(EventStream::from_records(records))
}

impl<'r> FromRow<'r, PgRow> for EventRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let sequence_number: i64 = row.try_get("sequencenumber")?;
        let version: i64 = row.try_get("version")?;
        let id: Uuid = row.try_get("id")?;

        Ok(EventRecord {
            sequence_number: sequence_number as u64,
            event_type: row.try_get("type")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
            stream_name: row.try_get("stream")?,
            version: version as u64,
            id: EventId::from_uuid(id),
            recorded_at: row.try_get("recordedat")?,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            if db_err.code().as_deref() == Some("23505") {
                // Unique violation: the constraint name tells an id collision
                // apart from a lost race on (stream, version).
                match db_err.constraint() {
                    Some(name) if name.ends_with(&format!("_{ID_KEY_SUFFIX}")) => {
                        EventStoreError::DuplicateEvent(msg)
                    }
                    _ => EventStoreError::Concurrency(msg),
                }
            } else {
                EventStoreError::Storage(msg)
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => EventStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[async_trait]
impl EventStorage for PostgresEventStorage {
    async fn commit(
        &self,
        stream: &StreamName,
        expected_version: ExpectedVersion,
        events: Vec<WritableEvent>,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        self.commit_events(stream, expected_version, events).await
    }

    async fn load(
        &self,
        stream: &StreamName,
        minimum_version: u64,
    ) -> Result<EventStream, EventStoreError> {
        self.load_stream(stream, minimum_version).await
    }

    async fn load_all(&self, minimum_sequence_number: u64) -> Result<EventStream, EventStoreError> {
        self.load_from_sequence(minimum_sequence_number).await
    }

    async fn setup(&self) -> Result<(), EventStoreError> {
        self.create_schema().await
    }
}
