use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};
use vaultsync::catalog::EntityCatalog;
use vaultsync::config::MigrationConfig;
use vaultsync::db::{SourceDb, SqliteSource, SqliteTarget, TargetDb};
use vaultsync::gate::ConnectionGate;
use vaultsync::reporter::Reporter;
use vaultsync::scheduler::RunReport;
use vaultsync::Migration;

/// Runs the command line interface for vaultetl.
pub async fn run_cli() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_level);

    let json = cli.command.json();
    let summary = execute(cli).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

/// Parses `args` as a command line and runs it without touching logging.
pub async fn run_from_args<I, T>(args: I) -> Result<CommandSummary>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(args)?;
    execute(cli).await
}

#[derive(Parser, Debug)]
#[command(
    name = "vaultetl",
    version,
    about = "Migrate legacy clinical records into the universal schema."
)]
pub struct Cli {
    /// Minimum log level to display. Overrides RUST_LOG when given.
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy every catalog entity from the source into the target database.
    Migrate(MigrateArgs),
    /// Write every catalog entity to CSV files.
    Export(ExportArgs),
    /// Load CSV files written by `export` into the target database.
    Import(ImportArgs),
    /// Validate the catalog and config, optionally probing the databases.
    Check(CheckArgs),
}

impl Command {
    fn json(&self) -> bool {
        match self {
            Command::Migrate(args) => args.common.json,
            Command::Export(args) => args.common.json,
            Command::Import(args) => args.common.json,
            Command::Check(args) => args.common.json,
        }
    }
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON entity catalog (mapping) file.
    #[arg(long, env = "VAULTETL_CATALOG", value_hint = clap::ValueHint::FilePath)]
    catalog: PathBuf,
    /// JSON tuning file; flags below override its values.
    #[arg(long, env = "VAULTETL_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    parallel_tasks: Option<usize>,
    #[arg(long)]
    transfer_workers: Option<usize>,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    insert_batch: Option<usize>,
    #[arg(long)]
    connection_attempts: Option<u32>,
    #[arg(long)]
    connection_interval_ms: Option<u64>,
    /// Seconds between progress tables in the log; 0 disables them.
    #[arg(long, default_value_t = 10)]
    progress_interval: u64,
    /// Emit the summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Legacy source database file.
    #[arg(long, env = "VAULTETL_SOURCE", value_hint = clap::ValueHint::FilePath)]
    source: PathBuf,
    /// Universal-schema target database file; created if missing.
    #[arg(long, env = "VAULTETL_TARGET", value_hint = clap::ValueHint::FilePath)]
    target: PathBuf,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Legacy source database file.
    #[arg(long, env = "VAULTETL_SOURCE", value_hint = clap::ValueHint::FilePath)]
    source: PathBuf,
    /// Directory receiving one CSV file per entity.
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    out_dir: PathBuf,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Legacy source database file.
    #[arg(long, env = "VAULTETL_SOURCE", value_hint = clap::ValueHint::FilePath)]
    source: PathBuf,
    #[arg(long, env = "VAULTETL_TARGET")]
    target: Option<PathBuf>,
    /// Also wait for the databases to answer.
    #[arg(long)]
    probe: bool,
}

#[derive(Args, Debug)]
struct ImportArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Universal-schema target database file; created if missing.
    #[arg(long, env = "VAULTETL_TARGET", value_hint = clap::ValueHint::FilePath)]
    target: PathBuf,
    /// Directory holding the `<entity>.csv` files.
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    in_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LevelFilter {
    fn from(value: LogLevelArg) -> Self {
        match value {
            LogLevelArg::Error => LevelFilter::ERROR,
            LogLevelArg::Warn => LevelFilter::WARN,
            LogLevelArg::Info => LevelFilter::INFO,
            LogLevelArg::Debug => LevelFilter::DEBUG,
            LogLevelArg::Trace => LevelFilter::TRACE,
        }
    }
}

fn init_tracing(level: Option<LogLevelArg>) {
    let filter = match level {
        Some(level) => EnvFilter::default().add_directive(LevelFilter::from(level).into()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = fmt().with_env_filter(filter).try_init();
}

/// What a command produced, printed as text or JSON.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandSummary {
    Migrate {
        report: RunReport,
        counts: BTreeMap<&'static str, i64>,
    },
    Export {
        out_dir: PathBuf,
        report: RunReport,
    },
    Import {
        in_dir: PathBuf,
        report: RunReport,
        counts: BTreeMap<&'static str, i64>,
    },
    Check {
        entities: usize,
        tasks: Vec<String>,
        probed: bool,
    },
}

impl CommandSummary {
    fn render(&self) -> String {
        match self {
            CommandSummary::Migrate { report, counts } => {
                let mut out = format!(
                    "Migration {} finished: {} task(s), {} row(s) transferred in {:.3}s\n",
                    report.run_id,
                    report.tasks.len(),
                    report.rows_transferred(),
                    report.elapsed_secs()
                );
                out.push_str(&render_counts(counts));
                out
            }
            CommandSummary::Export { out_dir, report } => format!(
                "Export {} finished: {} row(s) written to '{}' in {:.3}s\n",
                report.run_id,
                report.rows_transferred(),
                out_dir.display(),
                report.elapsed_secs()
            ),
            CommandSummary::Import {
                in_dir,
                report,
                counts,
            } => {
                let mut out = format!(
                    "Import {} finished: {} row(s) loaded from '{}' in {:.3}s\n",
                    report.run_id,
                    report.rows_transferred(),
                    in_dir.display(),
                    report.elapsed_secs()
                );
                out.push_str(&render_counts(counts));
                out
            }
            CommandSummary::Check {
                entities,
                tasks,
                probed,
            } => {
                let mut out = format!(
                    "Catalog OK: {entities} entit(ies), {} task(s){}\n",
                    tasks.len(),
                    if *probed { ", databases reachable" } else { "" }
                );
                for task in tasks {
                    out.push_str(&format!("  {task}\n"));
                }
                out
            }
        }
    }
}

fn render_counts(counts: &BTreeMap<&'static str, i64>) -> String {
    counts
        .iter()
        .map(|(table, count)| format!("  {table:<22} {count:>10}\n"))
        .collect()
}

async fn execute(cli: Cli) -> Result<CommandSummary> {
    match cli.command {
        Command::Migrate(args) => migrate(args).await,
        Command::Export(args) => export(args).await,
        Command::Import(args) => import(args).await,
        Command::Check(args) => check(args).await,
    }
}

fn load_config(args: &CommonArgs) -> Result<MigrationConfig> {
    let mut config = match &args.config {
        Some(path) => MigrationConfig::from_path(path)
            .with_context(|| format!("failed to load config '{}'", path.display()))?,
        None => MigrationConfig::default(),
    };

    let overrides = [
        (&mut config.parallel_tasks, args.parallel_tasks),
        (&mut config.transfer_workers, args.transfer_workers),
        (&mut config.page_size, args.page_size),
        (&mut config.insert_batch, args.insert_batch),
    ];
    for (field, value) in overrides {
        if let Some(value) = value {
            *field = value;
        }
    }
    if let Some(attempts) = args.connection_attempts {
        config.connection_attempts = attempts;
    }
    if let Some(interval) = args.connection_interval_ms {
        config.connection_interval_ms = interval;
    }

    config.validate().context("invalid migration config")?;
    Ok(config)
}

fn load_catalog(path: &Path) -> Result<EntityCatalog> {
    let catalog = EntityCatalog::from_path(path)
        .with_context(|| format!("failed to load catalog '{}'", path.display()))?;
    if catalog.is_empty() {
        bail!("catalog '{}' lists no entities", path.display());
    }
    Ok(catalog)
}

fn open_migration(
    args: &CommonArgs,
    config: MigrationConfig,
    source: Arc<dyn SourceDb>,
    target: Arc<dyn TargetDb>,
) -> Result<Migration> {
    let catalog = load_catalog(&args.catalog)?;
    Ok(Migration::new(config, catalog, source, target)?)
}

fn open_source(path: &Path, config: &MigrationConfig) -> Arc<dyn SourceDb> {
    Arc::new(SqliteSource::open(path, config.source_pool_size))
}

/// Placeholders for commands that never use one side. Pools open
/// connections lazily, so nothing is ever opened here.
fn detached_target() -> Arc<dyn TargetDb> {
    Arc::new(SqliteTarget::open(":memory:", 1))
}

fn detached_source() -> Arc<dyn SourceDb> {
    Arc::new(SqliteSource::open(":memory:", 1))
}

/// Logs the progress table every `interval_secs` until dropped.
struct ProgressTicker(Option<tokio::task::JoinHandle<()>>);

impl ProgressTicker {
    fn spawn(reporter: Reporter, interval_secs: u64) -> Self {
        if interval_secs == 0 {
            return Self(None);
        }
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("Progress\n{}", reporter.render_table());
            }
        });
        Self(Some(handle))
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Runs `work` unless Ctrl-C arrives first.
async fn until_interrupted<T>(
    work: impl std::future::Future<Output = vaultsync::errors::Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = work => Ok(result?),
        _ = signal::ctrl_c() => {
            warn!("Interrupted; staging tables may be partially filled");
            bail!("interrupted")
        }
    }
}

async fn migrate(args: MigrateArgs) -> Result<CommandSummary> {
    let config = load_config(&args.common)?;
    let target = Arc::new(SqliteTarget::open(&args.target, config.target_pool_size));
    let source = open_source(&args.source, &config);
    let migration = open_migration(&args.common, config, source, target.clone())?;

    info!(
        source = %args.source.display(),
        target = %args.target.display(),
        entities = migration.catalog().len(),
        "Starting migration"
    );

    let ticker = ProgressTicker::spawn(migration.reporter().clone(), args.common.progress_interval);
    let outcome = until_interrupted(migration.run()).await;
    drop(ticker);
    info!("Final progress\n{}", migration.reporter().render_table());

    let report = outcome.context("migration failed")?;
    let counts = target
        .universal_counts()
        .await
        .context("failed to count universal-schema rows")?;
    Ok(CommandSummary::Migrate { report, counts })
}

async fn export(args: ExportArgs) -> Result<CommandSummary> {
    let config = load_config(&args.common)?;
    let source = open_source(&args.source, &config);
    let migration = open_migration(&args.common, config, source, detached_target())?;
    info!(
        source = %args.source.display(),
        out_dir = %args.out_dir.display(),
        "Starting export"
    );

    let ticker = ProgressTicker::spawn(migration.reporter().clone(), args.common.progress_interval);
    let outcome = until_interrupted(migration.export(&args.out_dir)).await;
    drop(ticker);

    let report = outcome.context("export failed")?;
    Ok(CommandSummary::Export {
        out_dir: args.out_dir,
        report,
    })
}

async fn import(args: ImportArgs) -> Result<CommandSummary> {
    let config = load_config(&args.common)?;
    let target = Arc::new(SqliteTarget::open(&args.target, config.target_pool_size));
    let migration = open_migration(&args.common, config, detached_source(), target.clone())?;
    info!(
        in_dir = %args.in_dir.display(),
        target = %args.target.display(),
        "Starting import"
    );

    let ticker = ProgressTicker::spawn(migration.reporter().clone(), args.common.progress_interval);
    let outcome = until_interrupted(migration.import(&args.in_dir)).await;
    drop(ticker);
    info!("Final progress\n{}", migration.reporter().render_table());

    let report = outcome.context("import failed")?;
    let counts = target
        .universal_counts()
        .await
        .context("failed to count universal-schema rows")?;
    Ok(CommandSummary::Import {
        in_dir: args.in_dir,
        report,
        counts,
    })
}

async fn check(args: CheckArgs) -> Result<CommandSummary> {
    let config = load_config(&args.common)?;
    let gate = ConnectionGate::new(config.connection_attempts, config.connection_interval());
    let target = args
        .target
        .as_ref()
        .map(|path| Arc::new(SqliteTarget::open(path, config.target_pool_size)));
    let source = open_source(&args.source, &config);
    let migration = open_migration(
        &args.common,
        config,
        source,
        match &target {
            Some(target) => Arc::clone(target) as Arc<dyn TargetDb>,
            None => detached_target(),
        },
    )?;

    let tasks = migration
        .plan()
        .context("catalog does not form a valid task graph")?
        .iter()
        .map(ToString::to_string)
        .collect();

    if args.probe {
        let source = SqliteSource::open(&args.source, 1);
        gate.wait("source database", || source.ping())
            .await
            .context("source database unreachable")?;
        if let Some(target) = &target {
            gate.wait("target database", || target.ping())
                .await
                .context("target database unreachable")?;
        }
    }

    Ok(CommandSummary::Check {
        entities: migration.catalog().len(),
        tasks,
        probed: args.probe,
    })
}
