//! SQLite table client.
//!
//! Rows live in a table keyed by `(partition_key, row_key)`; replaces are
//! made conditional with `UPDATE ... WHERE version = ?`, so the version
//! check runs inside the database. Each row write and its revision insert
//! share one immediate transaction. All statements run on the blocking pool.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE entities (
//!     partition_key TEXT NOT NULL,
//!     row_key TEXT NOT NULL,
//!     version INTEGER NOT NULL,
//!     deleted INTEGER NOT NULL DEFAULT 0,
//!     data TEXT NOT NULL,          -- EntityRecord JSON
//!     updated_at TEXT NOT NULL,
//!     PRIMARY KEY (partition_key, row_key)
//! );
//!
//! CREATE TABLE entities_revisions (
//!     partition_key TEXT NOT NULL,
//!     row_key TEXT NOT NULL,
//!     version INTEGER NOT NULL,
//!     data TEXT NOT NULL,          -- Revision JSON
//!     PRIMARY KEY (partition_key, row_key, version)
//! );
//! ```

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, ffi, params};
use serde::{Deserialize, Serialize};

use crate::types::{EntityRecord, Revision};

use super::client::{RowStream, TableApi, TableClientError, TableRow};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Tuning for the SQLite table client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteTableConfig {
    /// Maximum number of pooled connections (forced to 1 in memory).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Pool checkout timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,

    /// Rows fetched per statement while scanning.
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: u32,
}

fn default_max_connections() -> u32 {
    8
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_scan_page_size() -> u32 {
    256
}

impl Default for SqliteTableConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
            scan_page_size: default_scan_page_size(),
        }
    }
}

/// A [`TableApi`] backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteTableClient {
    pool: Pool<SqliteConnectionManager>,
    table: String,
    config: SqliteTableConfig,
    is_memory: bool,
}

impl Debug for SqliteTableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTableClient")
            .field("table", &self.table)
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .finish_non_exhaustive()
    }
}

impl SqliteTableClient {
    /// Creates a private in-memory database.
    pub fn in_memory(table: &str) -> Result<Self, TableClientError> {
        Self::with_config(":memory:", table, SqliteTableConfig::default())
    }

    /// Opens or creates a file database.
    pub fn open<P: AsRef<Path>>(path: P, table: &str) -> Result<Self, TableClientError> {
        Self::with_config(path, table, SqliteTableConfig::default())
    }

    /// Opens a database with custom tuning and initializes the schema.
    pub fn with_config<P: AsRef<Path>>(
        path: P,
        table: &str,
        config: SqliteTableConfig,
    ) -> Result<Self, TableClientError> {
        validate_table_name(table)?;
        let is_memory = path.as_ref().as_os_str() == ":memory:";

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let enable_wal = config.enable_wal && !is_memory;
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        }
        .with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if enable_wal {
                conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            }
            Ok(())
        });

        // Every connection to ":memory:" is a separate database, so the pool
        // keeps exactly one connection alive for the client's lifetime.
        let builder = if is_memory {
            Pool::builder()
                .max_size(1)
                .min_idle(Some(1))
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            Pool::builder().max_size(config.max_connections.max(1))
        };
        let pool = builder
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
            .build(manager)
            .map_err(|e| TableClientError::Unavailable(format!("failed to open pool: {}", e)))?;

        let client = Self {
            pool,
            table: table.to_string(),
            config,
            is_memory,
        };
        client.init_schema()?;
        Ok(client)
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    fn init_schema(&self) -> Result<(), TableClientError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| TableClientError::Unavailable(e.to_string()))?;
        initialize_schema(&conn, &self.table)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, TableClientError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, TableClientError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| TableClientError::Unavailable(e.to_string()))?;
            f(&mut conn, &table)
        })
        .await
        .map_err(|e| TableClientError::Internal(format!("blocking task failed: {}", e)))?
    }

    async fn scan_page(
        &self,
        partition_key: Option<String>,
        after: (String, String),
    ) -> Result<Vec<TableRow>, TableClientError> {
        let limit = i64::from(self.config.scan_page_size.max(1));
        self.with_conn(move |conn, table| {
            let raw = match partition_key {
                Some(pk) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT partition_key, row_key, version, deleted, data FROM {table}
                             WHERE partition_key = ?1 AND row_key > ?2
                             ORDER BY row_key LIMIT ?3"
                        ))
                        .map_err(map_sqlite_error)?;
                    stmt.query_map(params![pk, after.1, limit], read_raw_row)
                        .map_err(map_sqlite_error)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(map_sqlite_error)?
                }
                None => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT partition_key, row_key, version, deleted, data FROM {table}
                             WHERE (partition_key, row_key) > (?1, ?2)
                             ORDER BY partition_key, row_key LIMIT ?3"
                        ))
                        .map_err(map_sqlite_error)?;
                    stmt.query_map(params![after.0, after.1, limit], read_raw_row)
                        .map_err(map_sqlite_error)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(map_sqlite_error)?
                }
            };
            raw.into_iter().map(RawRow::decode).collect()
        })
        .await
    }
}

/// Initializes the schema, recording its version.
fn initialize_schema(conn: &Connection, table: &str) -> Result<(), TableClientError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table}_schema_version (version INTEGER NOT NULL);
         CREATE TABLE IF NOT EXISTS {table} (
             partition_key TEXT NOT NULL,
             row_key TEXT NOT NULL,
             version INTEGER NOT NULL,
             deleted INTEGER NOT NULL DEFAULT 0,
             data TEXT NOT NULL,
             updated_at TEXT NOT NULL,
             PRIMARY KEY (partition_key, row_key)
         );
         CREATE TABLE IF NOT EXISTS {table}_revisions (
             partition_key TEXT NOT NULL,
             row_key TEXT NOT NULL,
             version INTEGER NOT NULL,
             data TEXT NOT NULL,
             PRIMARY KEY (partition_key, row_key, version)
         );"
    ))
    .map_err(map_sqlite_error)?;

    let current: Option<i32> = conn
        .query_row(
            &format!("SELECT version FROM {table}_schema_version LIMIT 1"),
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite_error)?;
    match current {
        None => {
            conn.execute(
                &format!("INSERT INTO {table}_schema_version (version) VALUES (?1)"),
                [SCHEMA_VERSION],
            )
            .map_err(map_sqlite_error)?;
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(TableClientError::Corrupt(format!(
                "schema version {} is newer than supported version {}",
                v, SCHEMA_VERSION
            )));
        }
        Some(_) => {}
    }
    Ok(())
}

pub(crate) fn validate_table_name(table: &str) -> Result<(), TableClientError> {
    let valid = !table.is_empty()
        && table.len() <= 64
        && table.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(TableClientError::Internal(format!(
            "invalid table name '{}'",
            table
        )));
    }
    Ok(())
}

struct RawRow {
    partition_key: String,
    row_key: String,
    version: i64,
    deleted: bool,
    data: String,
}

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        partition_key: row.get(0)?,
        row_key: row.get(1)?,
        version: row.get(2)?,
        deleted: row.get(3)?,
        data: row.get(4)?,
    })
}

impl RawRow {
    fn decode(self) -> Result<TableRow, TableClientError> {
        let version = u64::try_from(self.version).map_err(|_| {
            TableClientError::Corrupt(format!("negative version {}", self.version))
        })?;
        let record: EntityRecord = serde_json::from_str(&self.data).map_err(|e| {
            TableClientError::Corrupt(format!(
                "row {}/{} is not a valid record: {}",
                self.partition_key, self.row_key, e
            ))
        })?;
        Ok(TableRow {
            partition_key: self.partition_key,
            row_key: self.row_key,
            version,
            deleted: self.deleted,
            record,
        })
    }
}

struct EncodedRow {
    partition_key: String,
    row_key: String,
    version: i64,
    deleted: bool,
    data: String,
    updated_at: String,
}

impl EncodedRow {
    fn encode(row: &TableRow) -> Result<Self, TableClientError> {
        Ok(Self {
            partition_key: row.partition_key.clone(),
            row_key: row.row_key.clone(),
            version: to_i64(row.version)?,
            deleted: row.deleted,
            data: serde_json::to_string(&row.record)
                .map_err(|e| TableClientError::Internal(e.to_string()))?,
            updated_at: row.record.updated_at().to_rfc3339(),
        })
    }
}

struct EncodedRevision {
    partition_key: String,
    row_key: String,
    version: i64,
    data: String,
}

impl EncodedRevision {
    fn encode(revision: &Revision) -> Result<Self, TableClientError> {
        Ok(Self {
            partition_key: revision.partition_key.as_str().to_string(),
            row_key: revision.entity_id.as_str().to_string(),
            version: to_i64(revision.version)?,
            data: serde_json::to_string(revision)
                .map_err(|e| TableClientError::Internal(e.to_string()))?,
        })
    }
}

/// Runs `write` and stores `revision` in one transaction.
///
/// Nothing is kept if either statement fails.
fn commit_with_revision<F>(
    conn: &mut Connection,
    table: &str,
    revision: &EncodedRevision,
    write: F,
) -> Result<(), TableClientError>
where
    F: FnOnce(&Transaction<'_>) -> Result<(), TableClientError>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(map_sqlite_error)?;
    write(&tx)?;
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {table}_revisions (partition_key, row_key, version, data)
             VALUES (?1, ?2, ?3, ?4)"
        ),
        params![
            revision.partition_key,
            revision.row_key,
            revision.version,
            revision.data
        ],
    )
    .map_err(map_sqlite_error)?;
    tx.commit().map_err(map_sqlite_error)
}

fn to_i64(version: u64) -> Result<i64, TableClientError> {
    i64::try_from(version)
        .map_err(|_| TableClientError::Internal(format!("version {} exceeds i64", version)))
}

fn map_sqlite_error(err: rusqlite::Error) -> TableClientError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if matches!(
            e.extended_code,
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
        ) {
            return TableClientError::AlreadyExists;
        }
    }
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
            TableClientError::Unavailable(err.to_string())
        }
        _ => TableClientError::Internal(err.to_string()),
    }
}

#[async_trait]
impl TableApi for SqliteTableClient {
    fn client_name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_conditional_replace(&self) -> bool {
        true
    }

    async fn ping(&self) -> Result<(), TableClientError> {
        self.with_conn(|conn, _| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(map_sqlite_error)
        })
        .await
    }

    async fn insert(&self, row: &TableRow, revision: &Revision) -> Result<(), TableClientError> {
        let row = EncodedRow::encode(row)?;
        let revision = EncodedRevision::encode(revision)?;
        self.with_conn(move |conn, table| {
            commit_with_revision(conn, table, &revision, |tx| {
                tx.execute(
                    &format!(
                        "INSERT INTO {table} (partition_key, row_key, version, deleted, data, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                    params![
                        row.partition_key,
                        row.row_key,
                        row.version,
                        row.deleted,
                        row.data,
                        row.updated_at
                    ],
                )
                .map_err(map_sqlite_error)?;
                Ok(())
            })
        })
        .await
    }

    async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableRow>, TableClientError> {
        let (pk, rk) = (partition_key.to_string(), row_key.to_string());
        self.with_conn(move |conn, table| {
            conn.query_row(
                &format!(
                    "SELECT partition_key, row_key, version, deleted, data FROM {table}
                     WHERE partition_key = ?1 AND row_key = ?2"
                ),
                params![pk, rk],
                read_raw_row,
            )
            .optional()
            .map_err(map_sqlite_error)?
            .map(RawRow::decode)
            .transpose()
        })
        .await
    }

    async fn upsert(&self, row: &TableRow, revision: &Revision) -> Result<(), TableClientError> {
        let row = EncodedRow::encode(row)?;
        let revision = EncodedRevision::encode(revision)?;
        self.with_conn(move |conn, table| {
            commit_with_revision(conn, table, &revision, |tx| {
                tx.execute(
                    &format!(
                        "INSERT INTO {table} (partition_key, row_key, version, deleted, data, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT (partition_key, row_key) DO UPDATE SET
                             version = excluded.version,
                             deleted = excluded.deleted,
                             data = excluded.data,
                             updated_at = excluded.updated_at"
                    ),
                    params![
                        row.partition_key,
                        row.row_key,
                        row.version,
                        row.deleted,
                        row.data,
                        row.updated_at
                    ],
                )
                .map_err(map_sqlite_error)?;
                Ok(())
            })
        })
        .await
    }

    async fn replace_if_version(
        &self,
        row: &TableRow,
        expected_version: u64,
        revision: &Revision,
    ) -> Result<(), TableClientError> {
        let row = EncodedRow::encode(row)?;
        let revision = EncodedRevision::encode(revision)?;
        let expected = to_i64(expected_version)?;
        self.with_conn(move |conn, table| {
            commit_with_revision(conn, table, &revision, |tx| {
                let changed = tx
                    .execute(
                        &format!(
                            "UPDATE {table}
                             SET version = ?3, deleted = ?4, data = ?5, updated_at = ?6
                             WHERE partition_key = ?1 AND row_key = ?2 AND version = ?7"
                        ),
                        params![
                            row.partition_key,
                            row.row_key,
                            row.version,
                            row.deleted,
                            row.data,
                            row.updated_at,
                            expected
                        ],
                    )
                    .map_err(map_sqlite_error)?;
                if changed == 0 {
                    return Err(TableClientError::PreconditionFailed);
                }
                Ok(())
            })
        })
        .await
    }

    async fn scan(&self, partition_key: Option<&str>) -> Result<RowStream, TableClientError> {
        let client = self.clone();
        let partition = partition_key.map(str::to_string);
        let page_size = self.config.scan_page_size.max(1) as usize;

        // State: the key to resume after, or None once the last page is read.
        let start = Some((String::new(), String::new()));
        let pages = stream::unfold(start, move |state| {
            let client = client.clone();
            let partition = partition.clone();
            async move {
                let after = state?;
                match client.scan_page(partition, after).await {
                    Ok(rows) => {
                        let next = if rows.len() < page_size {
                            None
                        } else {
                            rows.last()
                                .map(|r| (r.partition_key.clone(), r.row_key.clone()))
                        };
                        Some((rows.into_iter().map(Ok).collect::<Vec<_>>(), next))
                    }
                    Err(e) => Some((vec![Err(e)], None)),
                }
            }
        });
        Ok(pages.flat_map(stream::iter).boxed())
    }

    async fn revisions(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Vec<Revision>, TableClientError> {
        let (pk, rk) = (partition_key.to_string(), row_key.to_string());
        self.with_conn(move |conn, table| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT data FROM {table}_revisions
                     WHERE partition_key = ?1 AND row_key = ?2
                     ORDER BY version ASC"
                ))
                .map_err(map_sqlite_error)?;
            let rows = stmt
                .query_map(params![pk, rk], |row| row.get::<_, String>(0))
                .map_err(map_sqlite_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sqlite_error)?;
            rows.iter()
                .map(|data| {
                    serde_json::from_str(data).map_err(|e| {
                        TableClientError::Corrupt(format!("invalid revision: {}", e))
                    })
                })
                .collect()
        })
        .await
    }
}
