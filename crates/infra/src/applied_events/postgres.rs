//! Postgres-backed applied-events log.
//!
//! ## Schema
//!
//! | Column | Type | Notes |
//! |--------|------|-------|
//! | `eventlisteneridentifier` | `VARCHAR(255)` | primary key |
//! | `highestappliedsequencenumber` | `BIGINT` | `-1` until the first event is applied |
//!
//! ## Reservations
//!
//! A reservation is a session-level advisory lock keyed by
//! `(hashtext(table), hashtext(listener id))`, taken on a connection that the
//! reservation keeps for its whole lifetime. Marks are saved on that same
//! connection in autocommit mode, so every save is durable on its own.
//!
//! Waiting is bounded with `lock_timeout`; a timeout (`55P03`) is reported as
//! `ReservationNotAcquired`. If a reservation is dropped without `release()`,
//! its connection is detached from the pool and closed, which ends the
//! session and with it the lock.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, instrument, warn};

use super::{AppliedEventsLog, AppliedEventsLogError, Reservation, check_monotonic};
use crate::config::{ChronicleConfig, TableName};

const NEVER_APPLIED: i64 = -1;
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Postgres-backed applied-events log.
#[derive(Debug, Clone)]
pub struct PostgresAppliedEventsLog {
    pool: PgPool,
    table: TableName,
    reservation_timeout: Duration,
}

impl PostgresAppliedEventsLog {
    pub fn new(pool: PgPool, table: TableName, reservation_timeout: Duration) -> Self {
        Self {
            pool,
            table,
            reservation_timeout,
        }
    }

    pub fn from_config(pool: PgPool, config: &ChronicleConfig) -> Self {
        Self::new(
            pool,
            config.applied_events_table.clone(),
            config.reservation_timeout,
        )
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn create_schema(&self) -> Result<(), AppliedEventsLogError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                eventlisteneridentifier VARCHAR(255) PRIMARY KEY,
                highestappliedsequencenumber BIGINT NOT NULL DEFAULT {NEVER_APPLIED}
            )
            "#,
            self.table
        );

        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        Ok(())
    }

    async fn read_mark<'e, E>(
        &self,
        executor: E,
        listener_id: &str,
    ) -> Result<Option<Option<u64>>, AppliedEventsLogError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let query = format!(
            "SELECT highestappliedsequencenumber FROM {} WHERE eventlisteneridentifier = $1",
            self.table
        );
        let row = sqlx::query(&query)
            .bind(listener_id)
            .fetch_optional(executor)
            .await
            .map_err(|e| map_sqlx_error("read_mark", e))?;

        row.map(|r| {
            r.try_get::<i64, _>("highestappliedsequencenumber")
                .map(mark_from_db)
                .map_err(|e| map_sqlx_error("read_mark", e))
        })
        .transpose()
    }

    /// Try the advisory lock under `lock_timeout`, then restore the session
    /// default. Returns the connection only while it holds the lock.
    async fn lock(
        &self,
        mut conn: PoolConnection<Postgres>,
        listener_id: &str,
    ) -> Result<PoolConnection<Postgres>, AppliedEventsLogError> {
        let timeout_ms = self.reservation_timeout.as_millis().max(1);
        sqlx::query("SELECT set_config('lock_timeout', $1, false)")
            .bind(format!("{timeout_ms}ms"))
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        let locked = sqlx::query("SELECT pg_advisory_lock(hashtext($1), hashtext($2))")
            .bind(self.table.as_str())
            .bind(listener_id)
            .execute(&mut *conn)
            .await;

        let restored = sqlx::query("SELECT set_config('lock_timeout', '0', false)")
            .execute(&mut *conn)
            .await;

        match locked {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                return Err(AppliedEventsLogError::not_acquired(
                    listener_id,
                    format!("still reserved after {:?}", self.reservation_timeout),
                ));
            }
            Err(e) => return Err(map_sqlx_error("advisory_lock", e)),
        }

        if let Err(e) = restored {
            discard(conn);
            return Err(map_sqlx_error("reset_lock_timeout", e));
        }
        Ok(conn)
    }
}

#[async_trait]
impl AppliedEventsLog for PostgresAppliedEventsLog {
    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn initialize(&self, listener_id: &str) -> Result<(), AppliedEventsLogError> {
        let query = format!(
            r#"
            INSERT INTO {} (eventlisteneridentifier, highestappliedsequencenumber)
            VALUES ($1, $2)
            ON CONFLICT (eventlisteneridentifier) DO NOTHING
            "#,
            self.table
        );

        sqlx::query(&query)
            .bind(listener_id)
            .bind(NEVER_APPLIED)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("initialize", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.table), err(level = "debug"))]
    async fn reserve(&self, listener_id: &str) -> Result<Box<dyn Reservation>, AppliedEventsLogError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;

        if self.read_mark(&mut *conn, listener_id).await?.is_none() {
            return Err(AppliedEventsLogError::not_acquired(
                listener_id,
                "listener is not initialized",
            ));
        }

        let mut conn = self.lock(conn, listener_id).await?;

        // The mark may have moved while this session was waiting for the lock.
        let mark = match self.read_mark(&mut *conn, listener_id).await {
            Ok(mark) => mark.flatten(),
            Err(err) => {
                discard(conn);
                return Err(err);
            }
        };
        debug!(listener_id, highest_applied = ?mark, "reservation acquired");

        Ok(Box::new(PostgresReservation {
            listener_id: listener_id.to_string(),
            table: self.table.clone(),
            conn: Some(conn),
            mark,
        }))
    }

    async fn highest_applied(&self, listener_id: &str) -> Result<Option<u64>, AppliedEventsLogError> {
        Ok(self.read_mark(&self.pool, listener_id).await?.flatten())
    }

    async fn setup(&self) -> Result<(), AppliedEventsLogError> {
        self.create_schema().await
    }
}

struct PostgresReservation {
    listener_id: String,
    table: TableName,
    /// Session holding the advisory lock; `None` once released.
    conn: Option<PoolConnection<Postgres>>,
    mark: Option<u64>,
}

impl PostgresReservation {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>, AppliedEventsLogError> {
        let listener_id = &self.listener_id;
        self.conn
            .as_mut()
            .ok_or_else(|| AppliedEventsLogError::not_acquired(listener_id, "reservation already released"))
    }

    async fn write_mark(&mut self, value: i64) -> Result<(), AppliedEventsLogError> {
        let query = format!(
            "UPDATE {} SET highestappliedsequencenumber = $2 WHERE eventlisteneridentifier = $1",
            self.table
        );
        let listener_id = self.listener_id.clone();
        let conn = self.conn()?;

        sqlx::query(&query)
            .bind(listener_id)
            .bind(value)
            .execute(&mut **conn)
            .await
            .map_err(|e| map_sqlx_error("save_mark", e))?;
        Ok(())
    }
}

#[async_trait]
impl Reservation for PostgresReservation {
    fn listener_id(&self) -> &str {
        &self.listener_id
    }

    fn highest_applied(&self) -> Option<u64> {
        self.mark
    }

    async fn save(&mut self, sequence_number: u64) -> Result<(), AppliedEventsLogError> {
        check_monotonic(&self.listener_id, self.mark, sequence_number)?;
        self.write_mark(sequence_number as i64).await?;
        self.mark = Some(sequence_number);
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), AppliedEventsLogError> {
        self.write_mark(NEVER_APPLIED).await?;
        self.mark = None;
        Ok(())
    }

    async fn release(&mut self) -> Result<(), AppliedEventsLogError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtext($1), hashtext($2))")
            .bind(self.table.as_str())
            .bind(&self.listener_id)
            .execute(&mut *conn)
            .await;

        if let Err(e) = unlocked {
            discard(conn);
            return Err(map_sqlx_error("advisory_unlock", e));
        }
        Ok(())
    }
}

impl Drop for PostgresReservation {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                listener_id = %self.listener_id,
                "reservation dropped without release; closing its connection"
            );
            discard(conn);
        }
    }
}

/// Close a session that may still hold an advisory lock instead of handing
/// it back to the pool. Ending the session releases the lock.
fn discard(conn: PoolConnection<Postgres>) {
    drop(conn.detach());
}

fn mark_from_db(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> AppliedEventsLogError {
    match err {
        sqlx::Error::Database(db_err) => AppliedEventsLogError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            AppliedEventsLogError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => AppliedEventsLogError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
