use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use tempfile::TempDir;
use vaultsync::catalog::{EntityCatalog, EntityDescriptor};
use vaultsync::config::MigrationConfig;
use vaultsync::db::{SqliteSource, SqliteTarget};
use vaultsync::models::TargetType;
use vaultsync::Migration;

pub const ORGANIZATION_QUERY: &str = "SELECT clinic_name, NULL, clinic_no, 'clinic' \
     FROM clinic ORDER BY clinic_no LIMIT {offset}, {limit}";

pub const PRACTITIONER_QUERY: &str = "SELECT clinic_no, first_name || ' ' || last_name, ohip_no, \
     'OHIP', provider_no, 'provider' FROM provider ORDER BY provider_no LIMIT {offset}, {limit}";

pub const PATIENT_QUERY: &str = "SELECT clinic_no, demographic_no, 'demographic' \
     FROM demographic ORDER BY demographic_no LIMIT {offset}, {limit}";

#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub target: Arc<SqliteTarget>,
}

/// Legacy database with three clinics, five providers and no patients.
pub fn init_test_context() -> anyhow::Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;
    let source_path = temp_dir.path().join("legacy.sqlite");
    let target_path = temp_dir.path().join("universal.sqlite");

    let conn = Connection::open(&source_path)?;
    conn.execute_batch(
        "CREATE TABLE clinic (clinic_no INTEGER PRIMARY KEY, clinic_name TEXT);
         INSERT INTO clinic VALUES (1, 'North'), (2, 'South'), (3, 'East');
         CREATE TABLE provider (
             provider_no INTEGER PRIMARY KEY,
             clinic_no INTEGER,
             first_name TEXT,
             last_name TEXT,
             ohip_no TEXT
         );
         INSERT INTO provider VALUES
             (10, 1, 'Ada', 'Lovelace', 'A1'),
             (11, 1, 'Alan', 'Turing', 'A2'),
             (12, 2, 'Grace', 'Hopper', 'A3'),
             (13, 3, 'Edsger', 'Dijkstra', 'A4'),
             (14, 3, 'Barbara', 'Liskov', 'A5');
         CREATE TABLE demographic (demographic_no INTEGER PRIMARY KEY, clinic_no INTEGER);",
    )?;

    let target = Arc::new(SqliteTarget::open(&target_path, 4));

    Ok(TestContext {
        temp_dir,
        source_path,
        target_path,
        target,
    })
}

/// Small pages so every transfer spans several cursors and batches.
pub fn small_config() -> MigrationConfig {
    MigrationConfig {
        parallel_tasks: 4,
        transfer_workers: 3,
        page_size: 2,
        insert_batch: 1,
        connection_attempts: 2,
        connection_interval_ms: 5,
        source_pool_size: 3,
        target_pool_size: 4,
    }
}

pub fn top_level_catalog() -> EntityCatalog {
    EntityCatalog::new(vec![
        EntityDescriptor::new(TargetType::Organization, ORGANIZATION_QUERY)
            .with_source_table("clinic"),
        EntityDescriptor::new(TargetType::Practitioner, PRACTITIONER_QUERY)
            .with_source_table("provider"),
    ])
}

#[allow(dead_code)]
pub fn migration(ctx: &TestContext, catalog: EntityCatalog) -> anyhow::Result<Migration> {
    let config = small_config();
    let source = Arc::new(SqliteSource::open(&ctx.source_path, config.source_pool_size));
    Ok(Migration::new(config, catalog, source, ctx.target.clone())?)
}
