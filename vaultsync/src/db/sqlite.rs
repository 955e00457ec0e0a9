use crate::db::{SourceDb, TargetDb};
use crate::errors::{MigrationError, Result};
use crate::models::{MergeRequest, MergeSummary, PageRequest, Row, SqlValue, Statement, TargetType};
use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Integer(v) => SqlValue::Integer(v),
            Value::Real(v) => SqlValue::Real(v),
            Value::Text(v) => SqlValue::Text(v),
            Value::Blob(v) => SqlValue::Blob(v),
        }
    }
}

pub type ConnectionInit = fn(&Connection) -> rusqlite::Result<()>;

/// A bounded pool of SQLite connections to one database file.
///
/// Connections are opened lazily, so an unreachable file only surfaces on
/// first use (which is what the connection gate probes). Callers beyond
/// `size` wait for a permit instead of failing. Every call runs on the
/// blocking thread pool.
pub struct SqlitePool {
    path: PathBuf,
    flags: OpenFlags,
    init: ConnectionInit,
    idle: Mutex<Vec<Connection>>,
    permits: Semaphore,
}

impl SqlitePool {
    pub fn new(path: impl Into<PathBuf>, size: usize, flags: OpenFlags, init: ConnectionInit) -> Self {
        Self {
            path: path.into(),
            flags,
            init,
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(size.max(1)),
        }
    }

    fn open(path: &Path, flags: OpenFlags, init: ConnectionInit) -> Result<Connection> {
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init(&conn)?;
        Ok(conn)
    }

    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MigrationError::Connectivity("connection pool closed".to_string()))?;

        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let path = self.path.clone();
        let flags = self.flags;
        let init = self.init;

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let mut conn = match idle {
                Some(conn) => conn,
                None => match Self::open(&path, flags, init) {
                    Ok(conn) => conn,
                    Err(err) => return (None, Err(err)),
                },
            };
            let result = f(&mut conn);
            (Some(conn), result)
        })
        .await
        .map_err(|err| MigrationError::Other(anyhow::anyhow!("database worker failed: {err}")))?;

        if let Some(conn) = conn {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(conn);
        }
        result
    }
}

fn read_rows(conn: &Connection, sql: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let width = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|idx| row.get::<_, Value>(idx).map(SqlValue::from))
                .collect::<rusqlite::Result<Row>>()
        })?
        .collect::<rusqlite::Result<Vec<Row>>>()?;
    Ok(rows)
}

fn ping(conn: &mut Connection) -> Result<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

/// Legacy source database opened read-only.
pub struct SqliteSource {
    pool: Arc<SqlitePool>,
}

impl SqliteSource {
    pub fn open(path: impl Into<PathBuf>, pool_size: usize) -> Self {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Self {
            pool: Arc::new(SqlitePool::new(path, pool_size, flags, |_| Ok(()))),
        }
    }
}

#[async_trait]
impl SourceDb for SqliteSource {
    async fn ping(&self) -> Result<()> {
        self.pool.with_connection(ping).await
    }

    async fn fetch_page(&self, page: &PageRequest) -> Result<Vec<Row>> {
        let sql = page.sql.clone();
        self.pool
            .with_connection(move |conn| {
                read_rows(conn, &sql).map_err(|err| MigrationError::query(&sql, err))
            })
            .await
    }
}

const UNIVERSAL_SCHEMA: &str = "
    BEGIN;
    CREATE TABLE IF NOT EXISTS organization (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT,
        external_reference TEXT,
        source_id TEXT NOT NULL UNIQUE,
        source_reference TEXT
    );
    CREATE TABLE IF NOT EXISTS practitioner (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        organization_id INTEGER REFERENCES organization(id),
        name TEXT,
        identifier TEXT,
        identifier_type TEXT,
        source_id TEXT NOT NULL UNIQUE,
        source_reference TEXT
    );
    CREATE TABLE IF NOT EXISTS patient (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        organization_id INTEGER REFERENCES organization(id),
        source_id TEXT NOT NULL UNIQUE,
        source_reference TEXT
    );
    CREATE TABLE IF NOT EXISTS patient_practitioner (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        patient_id INTEGER REFERENCES patient(id),
        practitioner_id INTEGER REFERENCES practitioner(id),
        source_id TEXT NOT NULL UNIQUE,
        source_reference TEXT
    );
    CREATE TABLE IF NOT EXISTS entry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        patient_id INTEGER REFERENCES patient(id),
        source_table TEXT NOT NULL,
        source_id TEXT NOT NULL,
        UNIQUE (source_table, source_id)
    );
    CREATE TABLE IF NOT EXISTS entry_attribute (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id INTEGER NOT NULL REFERENCES entry(id),
        attribute_id TEXT NOT NULL,
        code_system TEXT,
        code_value TEXT,
        text_value TEXT,
        date_value TEXT,
        source_id TEXT NOT NULL,
        effective_date TEXT,
        source_reference TEXT,
        UNIQUE (entry_id, attribute_id, source_id)
    );
    CREATE TABLE IF NOT EXISTS entry_state (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id INTEGER NOT NULL REFERENCES entry(id),
        state TEXT NOT NULL,
        effective_date TEXT NOT NULL,
        source_reference TEXT,
        UNIQUE (entry_id, state, effective_date)
    );
    COMMIT;";

/// Tables of the universal schema, in hierarchy order.
pub const UNIVERSAL_TABLES: [&str; 7] = [
    "organization",
    "practitioner",
    "patient",
    "patient_practitioner",
    "entry",
    "entry_attribute",
    "entry_state",
];

/// The upsert promoting `staging` into the universal table of `target_type`.
///
/// Each statement is keyed on the table's natural key, so replaying it over
/// the same staging content updates rows in place instead of adding new
/// ones. Numbered parameters: `?1` source table, `?2` attribute code.
fn merge_sql(target_type: TargetType, staging: &str) -> String {
    match target_type {
        TargetType::Organization => format!(
            "INSERT INTO organization (name, external_reference, source_id, source_reference)
             SELECT s.name, s.external_reference, CAST(s.source_id AS TEXT), s.source_reference
             FROM {staging} AS s
             WHERE s.source_id IS NOT NULL
             ON CONFLICT (source_id) DO UPDATE SET
                name = excluded.name,
                external_reference = excluded.external_reference,
                source_reference = excluded.source_reference"
        ),
        TargetType::Practitioner => format!(
            "INSERT INTO practitioner
                (organization_id, name, identifier, identifier_type, source_id, source_reference)
             SELECT o.id, s.name, s.identifier, s.identifier_type,
                    CAST(s.source_id AS TEXT), s.source_reference
             FROM {staging} AS s
             LEFT JOIN organization AS o ON o.source_id = CAST(s.organization_id AS TEXT)
             WHERE s.source_id IS NOT NULL
             ON CONFLICT (source_id) DO UPDATE SET
                organization_id = excluded.organization_id,
                name = excluded.name,
                identifier = excluded.identifier,
                identifier_type = excluded.identifier_type,
                source_reference = excluded.source_reference"
        ),
        TargetType::Patient => format!(
            "INSERT INTO patient (organization_id, source_id, source_reference)
             SELECT o.id, CAST(s.source_id AS TEXT), s.source_reference
             FROM {staging} AS s
             LEFT JOIN organization AS o ON o.source_id = CAST(s.organization_id AS TEXT)
             WHERE s.source_id IS NOT NULL
             ON CONFLICT (source_id) DO UPDATE SET
                organization_id = excluded.organization_id,
                source_reference = excluded.source_reference"
        ),
        TargetType::PatientPractitionerLink => format!(
            "INSERT INTO patient_practitioner (patient_id, practitioner_id, source_id, source_reference)
             SELECT p.id, pr.id, CAST(s.source_id AS TEXT), s.source_reference
             FROM {staging} AS s
             LEFT JOIN patient AS p ON p.source_id = CAST(s.patient_id AS TEXT)
             LEFT JOIN practitioner AS pr ON pr.source_id = CAST(s.practitioner_id AS TEXT)
             WHERE s.source_id IS NOT NULL
             ON CONFLICT (source_id) DO UPDATE SET
                patient_id = excluded.patient_id,
                practitioner_id = excluded.practitioner_id,
                source_reference = excluded.source_reference"
        ),
        TargetType::ClinicalEntry => format!(
            "INSERT INTO entry (patient_id, source_table, source_id)
             SELECT p.id, ?1, CAST(s.source_id AS TEXT)
             FROM {staging} AS s
             LEFT JOIN patient AS p ON p.source_id = CAST(s.patient_id AS TEXT)
             WHERE s.source_id IS NOT NULL
             ON CONFLICT (source_table, source_id) DO UPDATE SET
                patient_id = excluded.patient_id"
        ),
        TargetType::EntryAttribute => format!(
            "INSERT INTO entry_attribute
                (entry_id, attribute_id, code_system, code_value, text_value, date_value,
                 source_id, effective_date, source_reference)
             SELECT e.id, ?2, s.code_system, s.code_value, s.text_value, s.date_value,
                    COALESCE(CAST(s.source_id AS TEXT), ''), s.effective_date, s.source_reference
             FROM {staging} AS s
             JOIN entry AS e ON e.source_table = ?1 AND e.source_id = CAST(s.entry_id AS TEXT)
             WHERE true
             ON CONFLICT (entry_id, attribute_id, source_id) DO UPDATE SET
                code_system = excluded.code_system,
                code_value = excluded.code_value,
                text_value = excluded.text_value,
                date_value = excluded.date_value,
                effective_date = excluded.effective_date,
                source_reference = excluded.source_reference"
        ),
        TargetType::EntryState => format!(
            "INSERT INTO entry_state (entry_id, state, effective_date, source_reference)
             SELECT e.id, COALESCE(CAST(s.state AS TEXT), ''),
                    COALESCE(CAST(s.effective_date AS TEXT), ''), s.source_reference
             FROM {staging} AS s
             JOIN entry AS e ON e.source_table = ?1 AND e.source_id = CAST(s.entry_id AS TEXT)
             WHERE true
             ON CONFLICT (entry_id, state, effective_date) DO UPDATE SET
                source_reference = excluded.source_reference"
        ),
    }
}

fn merge(conn: &mut Connection, request: &MergeRequest) -> Result<MergeSummary> {
    let sql = merge_sql(request.target_type, &request.staging_table);
    let source_table = request.source_table.clone().unwrap_or_default();
    let attribute_code = request.attribute_code.clone().unwrap_or_default();

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let affected = match request.target_type {
        TargetType::ClinicalEntry | TargetType::EntryState => {
            tx.execute(&sql, params![source_table])
        }
        TargetType::EntryAttribute => tx.execute(&sql, params![source_table, attribute_code]),
        _ => tx.execute(&sql, []),
    }
    .map_err(|err| MigrationError::query(&sql, err.into()))?;
    tx.commit()?;

    Ok(MergeSummary {
        affected_rows: affected,
    })
}

fn target_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
}

/// Target database holding staging tables and the universal schema.
pub struct SqliteTarget {
    pool: Arc<SqlitePool>,
}

impl SqliteTarget {
    pub fn open(path: impl Into<PathBuf>, pool_size: usize) -> Self {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Self {
            pool: Arc::new(SqlitePool::new(path, pool_size, flags, target_init)),
        }
    }

    /// Row counts of every universal-schema table.
    pub async fn universal_counts(&self) -> Result<BTreeMap<&'static str, i64>> {
        self.pool
            .with_connection(|conn| {
                let mut counts = BTreeMap::new();
                for table in UNIVERSAL_TABLES {
                    let count: i64 =
                        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                            row.get(0)
                        })?;
                    counts.insert(table, count);
                }
                Ok(counts)
            })
            .await
    }
}

#[async_trait]
impl TargetDb for SqliteTarget {
    async fn ping(&self) -> Result<()> {
        self.pool.with_connection(ping).await
    }

    async fn initialize(&self) -> Result<()> {
        self.pool
            .with_connection(|conn| {
                conn.execute_batch(UNIVERSAL_SCHEMA)?;
                Ok(())
            })
            .await
    }

    async fn execute(&self, statement: Statement) -> Result<usize> {
        self.pool
            .with_connection(move |conn| {
                conn.execute(&statement.text, params_from_iter(statement.params.iter()))
                    .map_err(|err| MigrationError::query(&statement.text, err.into()))
            })
            .await
    }

    async fn merge(&self, request: &MergeRequest) -> Result<MergeSummary> {
        let request = request.clone();
        self.pool
            .with_connection(move |conn| merge(conn, &request))
            .await
    }
}
