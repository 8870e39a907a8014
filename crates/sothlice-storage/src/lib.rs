//! Record stores for reconciled tickets: Postgres for real runs, memory for tests and dry runs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sothlice_core::{ConflictKind, Snapshot, TicketRecord, WriteOutcome};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "sothlice-storage";

/// Table the reconciled tickets live in.
pub const TICKETS_TABLE: &str = "jira";

/// Store failures. Every variant is fatal to a run; recoverable write races are
/// reported through [`WriteOutcome::Conflict`] instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("{operation} failed: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

fn classify_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection(format!("{operation}: {err}")),
        other => StoreError::Database {
            operation,
            source: other,
        },
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Current key -> `updated` mapping. Never mutates the store.
    async fn read_snapshot(&self) -> Result<Snapshot, StoreError>;

    /// Insert one record in its own transaction. A duplicate key is a
    /// `Conflict(DuplicateKey)`, not an error.
    async fn insert(&self, record: &TicketRecord) -> Result<WriteOutcome, StoreError>;

    /// Update one record in its own transaction. Zero affected rows is a
    /// `Conflict(RowMissing)`. `created` is never rewritten.
    async fn update(&self, record: &TicketRecord) -> Result<WriteOutcome, StoreError>;

    async fn list_records(&self) -> Result<Vec<TicketRecord>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 2,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS jira (
        jkey        TEXT PRIMARY KEY,
        jtype       TEXT NOT NULL,
        status      TEXT NOT NULL,
        summary     TEXT NOT NULL,
        description TEXT,
        created     TIMESTAMPTZ NOT NULL,
        updated     TIMESTAMPTZ NOT NULL,
        assignee    TEXT,
        processed   TIMESTAMPTZ NOT NULL
    )
"#;

const INSERT_SQL: &str = r#"
    INSERT INTO jira (jkey, jtype, status, summary, description, created, updated, assignee, processed)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#;

const UPDATE_SQL: &str = r#"
    UPDATE jira
       SET jtype = $2,
           status = $3,
           summary = $4,
           description = $5,
           updated = $6,
           assignee = $7,
           processed = $8
     WHERE jkey = $1
"#;

impl PgRecordStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tickets table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(|err| classify_sqlx_error("creating jira table", err))?;
        info!(table = TICKETS_TABLE, "ensured tickets table");
        Ok(())
    }
}

/// Logs a failed rollback after a failed write; the write error is the one
/// returned to the caller. Returns whether the rollback failed.
fn note_rollback(key: &str, rollback: Result<(), sqlx::Error>) -> bool {
    match rollback {
        Ok(()) => false,
        Err(err) => {
            warn!(key, error = %err, "rollback after failed write also failed");
            true
        }
    }
}

fn row_to_record(row: &PgRow) -> Result<TicketRecord, sqlx::Error> {
    let created: DateTime<Utc> = row.try_get("created")?;
    let updated: DateTime<Utc> = row.try_get("updated")?;
    let processed: DateTime<Utc> = row.try_get("processed")?;
    Ok(TicketRecord {
        key: row.try_get("jkey")?,
        issue_type: row.try_get("jtype")?,
        status: row.try_get("status")?,
        summary: row.try_get("summary")?,
        description: row.try_get("description")?,
        created: created.into(),
        updated: updated.into(),
        assignee: row.try_get("assignee")?,
        processed: processed.into(),
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn read_snapshot(&self) -> Result<Snapshot, StoreError> {
        let rows = sqlx::query("SELECT jkey, updated FROM jira")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| classify_sqlx_error("reading snapshot", err))?;

        let mut snapshot = Snapshot::new();
        for row in rows {
            let key: String = row
                .try_get("jkey")
                .map_err(|err| classify_sqlx_error("decoding snapshot row", err))?;
            let updated: DateTime<Utc> = row
                .try_get("updated")
                .map_err(|err| classify_sqlx_error("decoding snapshot row", err))?;
            snapshot.insert(key, updated.into());
        }
        debug!(entries = snapshot.len(), "read snapshot from postgres");
        Ok(snapshot)
    }

    async fn insert(&self, record: &TicketRecord) -> Result<WriteOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| classify_sqlx_error("beginning insert transaction", err))?;

        let result = sqlx::query(INSERT_SQL)
            .bind(&record.key)
            .bind(&record.issue_type)
            .bind(&record.status)
            .bind(&record.summary)
            .bind(&record.description)
            .bind(record.created.with_timezone(&Utc))
            .bind(record.updated.with_timezone(&Utc))
            .bind(&record.assignee)
            .bind(record.processed.with_timezone(&Utc))
            .execute(&mut *tx)
            .await;

        match result {
            Ok(_) => {
                tx.commit()
                    .await
                    .map_err(|err| classify_sqlx_error("committing insert", err))?;
                Ok(WriteOutcome::Applied)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback()
                    .await
                    .map_err(|err| classify_sqlx_error("rolling back insert", err))?;
                Ok(WriteOutcome::Conflict(ConflictKind::DuplicateKey))
            }
            Err(err) => {
                note_rollback(&record.key, tx.rollback().await);
                Err(classify_sqlx_error("inserting ticket", err))
            }
        }
    }

    async fn update(&self, record: &TicketRecord) -> Result<WriteOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| classify_sqlx_error("beginning update transaction", err))?;

        let result = sqlx::query(UPDATE_SQL)
            .bind(&record.key)
            .bind(&record.issue_type)
            .bind(&record.status)
            .bind(&record.summary)
            .bind(&record.description)
            .bind(record.updated.with_timezone(&Utc))
            .bind(&record.assignee)
            .bind(record.processed.with_timezone(&Utc))
            .execute(&mut *tx)
            .await;

        match result {
            Ok(done) => {
                tx.commit()
                    .await
                    .map_err(|err| classify_sqlx_error("committing update", err))?;
                if done.rows_affected() == 0 {
                    Ok(WriteOutcome::Conflict(ConflictKind::RowMissing))
                } else {
                    Ok(WriteOutcome::Applied)
                }
            }
            Err(err) => {
                note_rollback(&record.key, tx.rollback().await);
                Err(classify_sqlx_error("updating ticket", err))
            }
        }
    }

    async fn list_records(&self) -> Result<Vec<TicketRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT jkey, jtype, status, summary, description, created, updated, assignee, processed
              FROM jira
             ORDER BY jkey
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| classify_sqlx_error("listing tickets", err))?;

        rows.iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| classify_sqlx_error("decoding ticket row", err))
    }
}

/// In-process store with the same write semantics as [`PgRecordStore`].
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: Mutex<BTreeMap<String, TicketRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = TicketRecord>) -> Self {
        Self {
            rows: Mutex::new(records.into_iter().map(|r| (r.key.clone(), r)).collect()),
        }
    }

    /// Write a row directly, bypassing conflict checks (an external writer).
    pub async fn put(&self, record: TicketRecord) {
        self.rows.lock().await.insert(record.key.clone(), record);
    }

    pub async fn remove(&self, key: &str) -> Option<TicketRecord> {
        self.rows.lock().await.remove(key)
    }

    pub async fn get(&self, key: &str) -> Option<TicketRecord> {
        self.rows.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn read_snapshot(&self) -> Result<Snapshot, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.values().map(|r| (r.key.clone(), r.updated)).collect())
    }

    async fn insert(&self, record: &TicketRecord) -> Result<WriteOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&record.key) {
            return Ok(WriteOutcome::Conflict(ConflictKind::DuplicateKey));
        }
        rows.insert(record.key.clone(), record.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn update(&self, record: &TicketRecord) -> Result<WriteOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(existing) = rows.get_mut(&record.key) else {
            return Ok(WriteOutcome::Conflict(ConflictKind::RowMissing));
        };
        let created = existing.created;
        *existing = TicketRecord {
            created,
            ..record.clone()
        };
        Ok(WriteOutcome::Applied)
    }

    async fn list_records(&self) -> Result<Vec<TicketRecord>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset};

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).expect("ts")
    }

    fn record(key: &str, updated: &str) -> TicketRecord {
        TicketRecord {
            key: key.to_string(),
            issue_type: "Bug".into(),
            status: "In Progress".into(),
            summary: format!("summary for {key}"),
            description: Some("details".into()),
            created: ts("2024-01-01T08:00:00Z"),
            updated: ts(updated),
            assignee: Some("Ada".into()),
            processed: ts("2024-01-05T08:00:00Z"),
        }
    }

    #[tokio::test]
    async fn memory_snapshot_maps_keys_to_watermarks() {
        let store = MemoryRecordStore::with_records([
            record("A", "2024-01-02T00:00:00Z"),
            record("B", "2024-01-03T00:00:00Z"),
        ]);
        let snapshot = store.read_snapshot().await.expect("snapshot");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("B"), Some(&ts("2024-01-03T00:00:00Z")));
    }

    #[tokio::test]
    async fn memory_insert_reports_duplicate_key_as_conflict() {
        let store = MemoryRecordStore::new();
        let rec = record("A", "2024-01-02T00:00:00Z");
        assert_eq!(store.insert(&rec).await.expect("insert"), WriteOutcome::Applied);
        assert_eq!(
            store.insert(&rec).await.expect("insert"),
            WriteOutcome::Conflict(ConflictKind::DuplicateKey)
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn memory_update_keeps_created_and_flags_missing_rows() {
        let store = MemoryRecordStore::with_records([record("A", "2024-01-02T00:00:00Z")]);
        let mut newer = record("A", "2024-02-02T00:00:00Z");
        newer.created = ts("2030-01-01T00:00:00Z");
        newer.status = "Done".into();

        assert_eq!(store.update(&newer).await.expect("update"), WriteOutcome::Applied);
        let stored = store.get("A").await.expect("row");
        assert_eq!(stored.status, "Done");
        assert_eq!(stored.created, ts("2024-01-01T08:00:00Z"));

        let ghost = record("Z", "2024-02-02T00:00:00Z");
        assert_eq!(
            store.update(&ghost).await.expect("update"),
            WriteOutcome::Conflict(ConflictKind::RowMissing)
        );
    }

    #[test]
    fn rollback_failures_are_reported_not_swallowed() {
        assert!(!note_rollback("SSP-1", Ok(())));
        assert!(note_rollback("SSP-1", Err(sqlx::Error::PoolClosed)));
    }

    #[test]
    fn pool_failures_classify_as_connection_errors() {
        assert!(classify_sqlx_error("reading snapshot", sqlx::Error::PoolTimedOut).is_connection());
        assert!(!classify_sqlx_error("inserting ticket", sqlx::Error::RowNotFound).is_connection());
    }
}
