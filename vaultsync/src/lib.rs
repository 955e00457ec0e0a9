pub mod catalog;
pub mod config;
pub mod db;
pub mod errors;
pub mod export;
pub mod gate;
pub mod graph;
pub mod import;
pub mod models;
pub mod reporter;
pub mod scheduler;
pub mod staging;
pub mod sync;
pub mod transfer;

use crate::catalog::EntityCatalog;
use crate::config::MigrationConfig;
use crate::db::{SourceDb, TargetDb};
use crate::errors::Result;
use crate::gate::ConnectionGate;
use crate::graph::{build_export_graph, build_import_graph, build_migration_graph, MigrationContext};
use crate::import::scan_csv_files;
use crate::models::TaskKey;
use crate::reporter::Reporter;
use crate::scheduler::{RunReport, Scheduler};
use crate::transfer::TransferSettings;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Entry point for running a catalog-driven migration.
///
/// `Migration` wires the entity catalog, tuning config and both databases
/// together:
/// - `run` gates on both connections, prepares the universal schema, then
///   schedules create, transfer and sync tasks for every entity.
/// - `export` writes every entity of the catalog to CSV files instead.
/// - `import` loads such a directory of CSV files into the target, with the
///   same staging and sync steps as `run`.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use vaultsync::{catalog::EntityCatalog, config::MigrationConfig, Migration};
/// use vaultsync::db::{SqliteSource, SqliteTarget};
///
/// #[tokio::main]
/// async fn main() -> vaultsync::errors::Result<()> {
///     let config = MigrationConfig::default();
///     let catalog = EntityCatalog::from_path("mapping.json")?;
///     let migration = Migration::new(
///         config,
///         catalog,
///         Arc::new(SqliteSource::open("legacy.sqlite", 10)),
///         Arc::new(SqliteTarget::open("universal.sqlite", 10)),
///     )?;
///     let report = migration.run().await?;
///     println!("{} rows moved", report.rows_transferred());
///     Ok(())
/// }
/// ```
pub struct Migration {
    config: MigrationConfig,
    catalog: EntityCatalog,
    source: Arc<dyn SourceDb>,
    target: Arc<dyn TargetDb>,
    reporter: Reporter,
}

impl Migration {
    pub fn new(
        config: MigrationConfig,
        catalog: EntityCatalog,
        source: Arc<dyn SourceDb>,
        target: Arc<dyn TargetDb>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            source,
            target,
            reporter: Reporter::new(),
        })
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    /// Progress board shared with every task of this migration.
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    fn gate(&self) -> ConnectionGate {
        ConnectionGate::new(
            self.config.connection_attempts,
            self.config.connection_interval(),
        )
    }

    fn context(&self) -> MigrationContext {
        MigrationContext {
            source: Arc::clone(&self.source),
            target: Arc::clone(&self.target),
            settings: TransferSettings::from(&self.config),
            reporter: self.reporter.clone(),
        }
    }

    async fn wait_for_source(&self) -> Result<()> {
        let source = Arc::clone(&self.source);
        self.gate()
            .wait("source database", || {
                let source = Arc::clone(&source);
                async move { source.ping().await }
            })
            .await?;
        Ok(())
    }

    async fn wait_for_target(&self) -> Result<()> {
        let target = Arc::clone(&self.target);
        self.gate()
            .wait("target database", || {
                let target = Arc::clone(&target);
                async move { target.ping().await }
            })
            .await?;
        Ok(())
    }

    /// Blocks until both databases answer, retrying transient failures.
    pub async fn wait_for_connections(&self) -> Result<()> {
        log::info!("Waiting for database connections");
        let started = Instant::now();

        self.wait_for_source().await?;
        self.wait_for_target().await?;

        log::info!(
            "Database connections ready ({:.3}s)",
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Builds and validates the migration graph without touching either
    /// database. Returns the task names in a valid execution order.
    pub fn plan(&self) -> Result<Vec<TaskKey>> {
        build_migration_graph(&self.catalog, &self.context())?.validate()
    }

    pub async fn run(&self) -> Result<RunReport> {
        log::info!("Migration started ({} entities)", self.catalog.len());
        let started = Instant::now();

        self.wait_for_connections().await?;
        self.target.initialize().await?;

        let graph = build_migration_graph(&self.catalog, &self.context())?;
        let report = Scheduler::new(self.config.parallel_tasks).run(graph).await?;

        log::info!(
            "Migration completed ({} rows in {:.3}s)",
            report.rows_transferred(),
            started.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    /// Writes every entity to `<dir>/<entity>.csv`.
    pub async fn export(&self, dir: impl AsRef<Path>) -> Result<RunReport> {
        let dir = dir.as_ref();
        log::info!("Export to '{}' started", dir.display());
        let started = Instant::now();

        self.wait_for_source().await?;
        tokio::fs::create_dir_all(dir).await?;

        let graph = build_export_graph(
            &self.catalog,
            Arc::clone(&self.source),
            dir,
            TransferSettings::from(&self.config),
            self.reporter.clone(),
        )?;
        let report = Scheduler::new(self.config.parallel_tasks).run(graph).await?;

        log::info!(
            "Export completed ({} rows in {:.3}s)",
            report.rows_transferred(),
            started.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    /// Loads `<dir>/<entity>.csv` files written by [`Migration::export`]
    /// into the target. The source database is not touched.
    pub async fn import(&self, dir: impl AsRef<Path>) -> Result<RunReport> {
        let dir = dir.as_ref();
        log::info!("Import from '{}' started", dir.display());
        let started = Instant::now();

        let files = scan_csv_files(dir).await?;
        let graph = build_import_graph(&self.catalog, &files, dir, &self.context())?;
        self.wait_for_target().await?;
        self.target.initialize().await?;

        let report = Scheduler::new(self.config.parallel_tasks).run(graph).await?;

        log::info!(
            "Import completed ({} rows in {:.3}s)",
            report.rows_transferred(),
            started.elapsed().as_secs_f64()
        );
        Ok(report)
    }
}
