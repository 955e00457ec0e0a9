//! Task graph construction.
//!
//! Every entity of a catalog expands into three tasks:
//!
//! ```text
//! start ─► create-X ─► transfer-X ─► sync-X
//!                                      ▲
//!              sync-<predecessor of X> ┘
//! ```
//!
//! Staging creation and transfer of every entity may run as soon as the
//! run starts; only the sync steps follow the entity hierarchy
//! (organizations, practitioners, patients, links, entries, entry details).

use crate::catalog::{EntityCatalog, ResolvedEntity};
use crate::db::{SourceDb, TargetDb};
use crate::errors::{MigrationError, Result};
use crate::export::{export_path, CsvSink};
use crate::import::load_csv;
use crate::models::{EntityKey, MergeRequest, TaskKey, TaskOutcome};
use crate::reporter::{EntityStatus, ProgressEvent, Reporter};
use crate::staging::StagingLayout;
use crate::sync::SyncReconciler;
use crate::transfer::{ChunkedTransfer, StagingSink, TransferSettings};
use async_trait::async_trait;
use rustworkx_core::petgraph::algo::toposort;
use rustworkx_core::petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// The unit of work a graph node performs.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self) -> Result<TaskOutcome>;
}

pub struct Task {
    pub key: TaskKey,
    pub dependencies: BTreeSet<TaskKey>,
    pub action: Arc<dyn TaskAction>,
}

impl Task {
    pub fn new(
        key: TaskKey,
        dependencies: impl IntoIterator<Item = TaskKey>,
        action: Arc<dyn TaskAction>,
    ) -> Self {
        Self {
            key,
            dependencies: dependencies.into_iter().collect(),
            action,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Named tasks plus their dependency edges, in insertion order.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<TaskKey, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.key) {
            return Err(MigrationError::Config(format!(
                "task '{}' is defined more than once",
                task.key
            )));
        }
        self.index.insert(task.key.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn get(&self, key: &TaskKey) -> Option<&Task> {
        self.index.get(key).map(|&idx| &self.tasks[idx])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    /// Checks that every dependency names a task of the graph and that the
    /// graph has no cycle. Returns the keys in a topological order.
    pub fn validate(&self) -> Result<Vec<TaskKey>> {
        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(self.tasks.len(), 0);
        let nodes: Vec<NodeIndex> = (0..self.tasks.len()).map(|i| graph.add_node(i)).collect();

        for (idx, task) in self.tasks.iter().enumerate() {
            for dependency in &task.dependencies {
                let Some(&dep_idx) = self.index.get(dependency) else {
                    return Err(MigrationError::Config(format!(
                        "task '{}' depends on unknown task '{dependency}'",
                        task.key
                    )));
                };
                graph.add_edge(nodes[dep_idx], nodes[idx], ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let key = &self.tasks[graph[cycle.node_id()]].key;
            MigrationError::Config(format!("dependency cycle detected at task '{key}'"))
        })?;
        Ok(order
            .into_iter()
            .map(|node| self.tasks[graph[node]].key.clone())
            .collect())
    }
}

/// Top-level hierarchy, deepest first.
static TOP_LEVEL: [EntityKey; 4] = [
    EntityKey::PatientPractitionerLink,
    EntityKey::Patient,
    EntityKey::Practitioner,
    EntityKey::Organization,
];

/// Top-level ancestors of `entity`, nearest first.
fn ancestors(entity: &EntityKey) -> &'static [EntityKey] {
    match entity {
        EntityKey::Organization => &TOP_LEVEL[4..],
        EntityKey::Practitioner => &TOP_LEVEL[3..],
        EntityKey::Patient => &TOP_LEVEL[2..],
        EntityKey::PatientPractitionerLink => &TOP_LEVEL[1..],
        _ => &TOP_LEVEL[..],
    }
}

/// The entity whose sync must finish before `entity` syncs, if any.
///
/// A missing top-level ancestor is skipped in favour of the next one up.
/// Entry details always need their entry in the catalog.
fn parent_of(entity: &EntityKey, present: &BTreeSet<EntityKey>) -> Result<Option<EntityKey>> {
    let required_entry = match entity {
        EntityKey::EntryAttribute(code) => Some(EntityKey::attribute_entry_code(code)),
        EntityKey::EntryState(code) => Some(code.as_str()),
        _ => None,
    };
    if let Some(entry_code) = required_entry {
        let entry = EntityKey::ClinicalEntry(entry_code.to_string());
        if !present.contains(&entry) {
            return Err(MigrationError::Config(format!(
                "'{entity}' requires entry '{entry_code}', which is not in the catalog"
            )));
        }
        return Ok(Some(entry));
    }

    Ok(ancestors(entity)
        .iter()
        .find(|ancestor| present.contains(*ancestor))
        .cloned())
}

/// Pairs every resolved entity with its parent.
fn plan(resolved: Vec<ResolvedEntity>) -> Result<Vec<(ResolvedEntity, Option<EntityKey>)>> {
    let present: BTreeSet<EntityKey> = resolved.iter().map(|r| r.key.clone()).collect();
    resolved
        .into_iter()
        .map(|entity| {
            let parent = parent_of(&entity.key, &present)?;
            Ok((entity, parent))
        })
        .collect()
}

fn start_task(label: &'static str) -> Task {
    Task::new(TaskKey::Start, [], Arc::new(StartAction { label }))
}

/// Collaborators shared by every task of a migration run.
#[derive(Clone)]
pub struct MigrationContext {
    pub source: Arc<dyn SourceDb>,
    pub target: Arc<dyn TargetDb>,
    pub settings: TransferSettings,
    pub reporter: Reporter,
}

impl MigrationContext {
    fn transfer(&self) -> Arc<ChunkedTransfer> {
        Arc::new(ChunkedTransfer::new(
            Arc::clone(&self.source),
            self.settings,
            self.reporter.clone(),
        ))
    }

    fn staging_sink(&self, layout: &StagingLayout) -> Arc<StagingSink> {
        Arc::new(StagingSink::new(Arc::clone(&self.target), layout.clone()))
    }
}

/// Inserts `create-X`, the step filling X's staging table, and `sync-X`.
fn insert_staged_entity(
    graph: &mut TaskGraph,
    ctx: &MigrationContext,
    entity: ResolvedEntity,
    parent: Option<EntityKey>,
    fill_key: TaskKey,
    fill: impl FnOnce(&StagingLayout) -> Arc<dyn TaskAction>,
) -> Result<()> {
    let key = entity.key;
    let layout = StagingLayout::for_entity(&key);
    ctx.reporter.register(&key);

    let create = TaskKey::Create(key.clone());
    let sync = TaskKey::Sync(key.clone());
    let sync_after = parent.map_or(TaskKey::Start, TaskKey::Sync);

    log::debug!("Task {sync} depends on {fill_key} and {sync_after}");

    graph.insert(Task::new(
        create.clone(),
        [TaskKey::Start],
        Arc::new(CreateStagingAction {
            entity: key.clone(),
            target: Arc::clone(&ctx.target),
            layout: layout.clone(),
            reporter: ctx.reporter.clone(),
        }),
    ))?;
    graph.insert(Task::new(fill_key.clone(), [create], fill(&layout)))?;
    graph.insert(Task::new(
        sync,
        [fill_key, sync_after],
        Arc::new(SyncAction {
            request: MergeRequest {
                target_type: key.target_type(),
                staging_table: layout.table,
                source_table: entity.descriptor.source_table,
                attribute_code: match &key {
                    EntityKey::EntryAttribute(code) => Some(code.clone()),
                    _ => None,
                },
            },
            entity: key,
            reconciler: SyncReconciler::new(Arc::clone(&ctx.target)),
            reporter: ctx.reporter.clone(),
        }),
    ))?;
    Ok(())
}

pub fn build_migration_graph(catalog: &EntityCatalog, ctx: &MigrationContext) -> Result<TaskGraph> {
    let planned = plan(catalog.resolve()?)?;
    let mut graph = TaskGraph::new();
    graph.insert(start_task("migration"))?;

    for (entity, parent) in planned {
        let key = entity.key.clone();
        let query = entity.descriptor.query.clone();
        insert_staged_entity(
            &mut graph,
            ctx,
            entity,
            parent,
            TaskKey::Transfer(key.clone()),
            |layout| {
                Arc::new(TransferAction {
                    entity: key,
                    query,
                    transfer: ctx.transfer(),
                    sink: ctx.staging_sink(layout),
                    reporter: ctx.reporter.clone(),
                })
            },
        )?;
    }

    log::info!("Populated {} task(s) for {} entit(ies)", graph.len(), catalog.len());
    Ok(graph)
}

/// Import counterpart of [`build_migration_graph`]: every catalog entity
/// with a `<dir>/<entity>.csv` among `files` is loaded from that file
/// instead of the source database.
///
/// A file that matches no catalog entity, or no file at all, is a
/// configuration error.
pub fn build_import_graph(
    catalog: &EntityCatalog,
    files: &BTreeSet<PathBuf>,
    dir: &Path,
    ctx: &MigrationContext,
) -> Result<TaskGraph> {
    let mut unclaimed = files.clone();
    let present: Vec<ResolvedEntity> = catalog
        .resolve()?
        .into_iter()
        .filter(|entity| unclaimed.remove(&export_path(dir, &entity.key)))
        .collect();
    if let Some(stray) = unclaimed.first() {
        return Err(MigrationError::Config(format!(
            "'{}' does not match any catalog entity",
            stray.display()
        )));
    }
    if present.is_empty() {
        return Err(MigrationError::Config(format!(
            "no CSV files found in '{}'",
            dir.display()
        )));
    }

    let entities = present.len();
    let mut graph = TaskGraph::new();
    graph.insert(start_task("import"))?;

    for (entity, parent) in plan(present)? {
        let key = entity.key.clone();
        insert_staged_entity(
            &mut graph,
            ctx,
            entity,
            parent,
            TaskKey::Load(key.clone()),
            |layout| {
                Arc::new(LoadAction {
                    path: export_path(dir, &key),
                    entity: key,
                    sink: ctx.staging_sink(layout),
                    batch_size: ctx.settings.insert_batch,
                    reporter: ctx.reporter.clone(),
                })
            },
        )?;
    }

    log::info!("Populated {} task(s) from {entities} file(s)", graph.len());
    Ok(graph)
}

/// One `export-X` task per entity, writing `<dir>/<entity>.csv`, with the
/// same hierarchy edges as the migration sync steps.
pub fn build_export_graph(
    catalog: &EntityCatalog,
    source: Arc<dyn SourceDb>,
    dir: &Path,
    settings: TransferSettings,
    reporter: Reporter,
) -> Result<TaskGraph> {
    let planned = plan(catalog.resolve()?)?;
    let mut graph = TaskGraph::new();
    graph.insert(start_task("export"))?;

    for (entity, parent) in planned {
        let key = entity.key.clone();
        reporter.register(&key);
        let after = parent.map_or(TaskKey::Start, TaskKey::Export);

        graph.insert(Task::new(
            TaskKey::Export(key.clone()),
            [after],
            Arc::new(ExportAction {
                path: export_path(dir, &key),
                entity: key,
                query: entity.descriptor.query.clone(),
                transfer: Arc::new(ChunkedTransfer::new(
                    Arc::clone(&source),
                    settings,
                    reporter.clone(),
                )),
                reporter: reporter.clone(),
            }),
        ))?;
    }

    log::info!("Populated {} export task(s)", graph.len());
    Ok(graph)
}

fn track<T>(reporter: &Reporter, entity: &EntityKey, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        reporter.record(ProgressEvent::Failed {
            entity: entity.clone(),
            error: err.to_string(),
        });
    }
    result
}

struct StartAction {
    label: &'static str,
}

#[async_trait]
impl TaskAction for StartAction {
    async fn run(&self) -> Result<TaskOutcome> {
        log::info!("Starting {} tasks", self.label);
        Ok(TaskOutcome::Started)
    }
}

struct CreateStagingAction {
    entity: EntityKey,
    target: Arc<dyn TargetDb>,
    layout: StagingLayout,
    reporter: Reporter,
}

#[async_trait]
impl TaskAction for CreateStagingAction {
    async fn run(&self) -> Result<TaskOutcome> {
        self.reporter.record(ProgressEvent::Status {
            entity: self.entity.clone(),
            status: EntityStatus::Creating,
        });
        let result = async {
            for statement in self.layout.create_statements() {
                self.target.execute(statement).await?;
            }
            Ok::<_, MigrationError>(TaskOutcome::Created {
                table: self.layout.table.clone(),
            })
        }
        .await;
        track(&self.reporter, &self.entity, result)
    }
}

struct TransferAction {
    entity: EntityKey,
    query: String,
    transfer: Arc<ChunkedTransfer>,
    sink: Arc<StagingSink>,
    reporter: Reporter,
}

#[async_trait]
impl TaskAction for TransferAction {
    async fn run(&self) -> Result<TaskOutcome> {
        self.reporter.record(ProgressEvent::Status {
            entity: self.entity.clone(),
            status: EntityStatus::Transferring,
        });
        let result = self
            .transfer
            .run(&self.entity, &self.query, self.sink.clone())
            .await
            .map(TaskOutcome::Transferred);
        track(&self.reporter, &self.entity, result)
    }
}

struct SyncAction {
    entity: EntityKey,
    request: MergeRequest,
    reconciler: SyncReconciler,
    reporter: Reporter,
}

#[async_trait]
impl TaskAction for SyncAction {
    async fn run(&self) -> Result<TaskOutcome> {
        self.reporter.record(ProgressEvent::Status {
            entity: self.entity.clone(),
            status: EntityStatus::Syncing,
        });
        let started = Instant::now();
        let result = self.reconciler.reconcile(&self.request).await;
        let summary = track(&self.reporter, &self.entity, result)?;

        self.reporter.record(ProgressEvent::Synced {
            entity: self.entity.clone(),
            rows: summary.affected_rows,
            elapsed: started.elapsed(),
        });
        self.reporter.record(ProgressEvent::Status {
            entity: self.entity.clone(),
            status: EntityStatus::Done,
        });
        Ok(TaskOutcome::Synced(summary))
    }
}

struct LoadAction {
    entity: EntityKey,
    path: PathBuf,
    sink: Arc<StagingSink>,
    batch_size: usize,
    reporter: Reporter,
}

#[async_trait]
impl TaskAction for LoadAction {
    async fn run(&self) -> Result<TaskOutcome> {
        self.reporter.record(ProgressEvent::Status {
            entity: self.entity.clone(),
            status: EntityStatus::Loading,
        });
        let result = load_csv(
            &self.entity,
            &self.path,
            self.sink.as_ref(),
            self.batch_size,
            &self.reporter,
        )
        .await
        .map(|stats| TaskOutcome::Loaded {
            path: self.path.display().to_string(),
            stats,
        });
        track(&self.reporter, &self.entity, result)
    }
}

struct ExportAction {
    entity: EntityKey,
    query: String,
    path: PathBuf,
    transfer: Arc<ChunkedTransfer>,
    reporter: Reporter,
}

#[async_trait]
impl TaskAction for ExportAction {
    async fn run(&self) -> Result<TaskOutcome> {
        self.reporter.record(ProgressEvent::Status {
            entity: self.entity.clone(),
            status: EntityStatus::Exporting,
        });
        let result = async {
            let sink = Arc::new(CsvSink::create(&self.path).await?);
            let stats = self
                .transfer
                .run(&self.entity, &self.query, sink.clone())
                .await?;
            sink.finish().await?;
            log::info!(
                "CSV written {} ({} rows)",
                sink.path().display(),
                stats.rows_written
            );
            Ok::<_, MigrationError>(TaskOutcome::Exported {
                path: sink.path().display().to_string(),
                stats,
            })
        }
        .await;
        let outcome = track(&self.reporter, &self.entity, result)?;

        self.reporter.record(ProgressEvent::Status {
            entity: self.entity.clone(),
            status: EntityStatus::Done,
        });
        Ok(outcome)
    }
}
