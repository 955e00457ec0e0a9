//! Source and target database seams.
//!
//! The engine only talks to databases through these two traits. The
//! SQLite implementations in [`sqlite`] back the CLI and the tests; other
//! dialects plug in by implementing the same traits.

pub mod sqlite;

use crate::errors::Result;
use crate::models::{MergeRequest, MergeSummary, PageRequest, Row, Statement};
use async_trait::async_trait;

/// The legacy database rows are extracted from.
#[async_trait]
pub trait SourceDb: Send + Sync {
    /// Trivial round trip used by the connection gate.
    async fn ping(&self) -> Result<()>;

    /// Runs one rendered page of an extraction query.
    async fn fetch_page(&self, page: &PageRequest) -> Result<Vec<Row>>;
}

/// The database holding staging tables and the universal schema.
#[async_trait]
pub trait TargetDb: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Prepares the universal schema before any task runs.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Executes a statement, returning the number of affected rows.
    async fn execute(&self, statement: Statement) -> Result<usize>;

    /// Idempotently promotes a staging table into the universal schema.
    async fn merge(&self, request: &MergeRequest) -> Result<MergeSummary>;
}

pub use sqlite::{SqlitePool, SqliteSource, SqliteTarget};
