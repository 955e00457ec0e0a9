use thiserror::Error;

const QUERY_PREVIEW_LEN: usize = 120;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("SQLite operation failed: {0}")]
    SQLite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connectivity(String),

    #[error("{label} unreachable after {attempts} attempt(s): {source}")]
    ConnectionUnavailable {
        label: String,
        attempts: u32,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Query failed ({sql}): {source}")]
    Query {
        sql: String,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Row for '{table}' has {found} column(s), expected {expected}")]
    RowShape {
        table: String,
        expected: usize,
        found: usize,
    },

    #[error("Reconciliation of '{staging_table}' failed: {source}")]
    Reconcile {
        staging_table: String,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Task '{task}' failed: {source}")]
    Task {
        task: String,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Task '{0}' panicked")]
    TaskPanicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MigrationError {
    /// Wraps `source` with an abbreviated form of the SQL that produced it.
    pub fn query(sql: &str, source: MigrationError) -> Self {
        let mut sql = sql.split_whitespace().collect::<Vec<_>>().join(" ");
        if sql.len() > QUERY_PREVIEW_LEN {
            let mut cut = QUERY_PREVIEW_LEN;
            while !sql.is_char_boundary(cut) {
                cut -= 1;
            }
            sql.truncate(cut);
            sql.push_str("...");
        }
        MigrationError::Query {
            sql,
            source: Box::new(source),
        }
    }

    /// Whether the error is a connection-refused style failure worth retrying.
    pub fn is_transient(&self) -> bool {
        use rusqlite::ErrorCode;

        match self {
            MigrationError::Connectivity(_) => true,
            MigrationError::SQLite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            MigrationError::Query { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// The innermost error, skipping task/query/reconcile wrappers.
    pub fn root_cause(&self) -> &MigrationError {
        match self {
            MigrationError::Task { source, .. }
            | MigrationError::Query { source, .. }
            | MigrationError::Reconcile { source, .. }
            | MigrationError::ConnectionUnavailable { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
