//! Per-entity progress aggregation.

use crate::models::{elapsed_secs, EntityKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Pending,
    Creating,
    Transferring,
    Loading,
    Syncing,
    Exporting,
    Done,
    Failed,
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityStatus::Pending => "pending",
            EntityStatus::Creating => "creating",
            EntityStatus::Transferring => "transferring",
            EntityStatus::Loading => "loading",
            EntityStatus::Syncing => "syncing",
            EntityStatus::Exporting => "exporting",
            EntityStatus::Done => "done",
            EntityStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Status {
        entity: EntityKey,
        status: EntityStatus,
    },
    /// One page came back from the source.
    Fetched {
        entity: EntityKey,
        rows: usize,
        elapsed: Duration,
    },
    /// One batch landed in the sink.
    Inserted {
        entity: EntityKey,
        rows: usize,
        elapsed: Duration,
    },
    Synced {
        entity: EntityKey,
        rows: usize,
        elapsed: Duration,
    },
    Failed {
        entity: EntityKey,
        error: String,
    },
}

impl ProgressEvent {
    fn entity(&self) -> &EntityKey {
        match self {
            ProgressEvent::Status { entity, .. }
            | ProgressEvent::Fetched { entity, .. }
            | ProgressEvent::Inserted { entity, .. }
            | ProgressEvent::Synced { entity, .. }
            | ProgressEvent::Failed { entity, .. } => entity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityProgress {
    pub status: EntityStatus,
    pub rows_fetched: usize,
    pub fetch_secs: f64,
    pub rows_inserted: usize,
    pub insert_secs: f64,
    pub rows_synced: usize,
    pub sync_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared progress board, updated concurrently by tasks and cursors.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    entities: Arc<Mutex<BTreeMap<String, EntityProgress>>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pending row for `entity` so it shows up before its first event.
    pub fn register(&self, entity: &EntityKey) {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity.to_string())
            .or_default();
    }

    pub fn record(&self, event: ProgressEvent) {
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        let progress = entities.entry(event.entity().to_string()).or_default();

        match event {
            ProgressEvent::Status { status, .. } => {
                if progress.status != EntityStatus::Failed {
                    progress.status = status;
                }
            }
            ProgressEvent::Fetched { rows, elapsed, .. } => {
                progress.rows_fetched += rows;
                progress.fetch_secs += elapsed_secs(elapsed);
            }
            ProgressEvent::Inserted { rows, elapsed, .. } => {
                progress.rows_inserted += rows;
                progress.insert_secs += elapsed_secs(elapsed);
            }
            ProgressEvent::Synced { rows, elapsed, .. } => {
                progress.rows_synced += rows;
                progress.sync_secs += elapsed_secs(elapsed);
            }
            ProgressEvent::Failed { error, .. } => {
                progress.status = EntityStatus::Failed;
                progress.error.get_or_insert(error);
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, EntityProgress> {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn render_table(&self) -> String {
        let snapshot = self.snapshot();
        let width = snapshot
            .keys()
            .map(String::len)
            .chain(std::iter::once("entity".len()))
            .max()
            .unwrap_or(6);

        let mut out = format!(
            "{:<width$}  {:<12}  {:>10}  {:>9}  {:>10}  {:>9}  {:>10}  {:>9}\n",
            "entity", "status", "fetched", "fetch s", "inserted", "insert s", "synced", "sync s"
        );
        for (entity, p) in &snapshot {
            out.push_str(&format!(
                "{:<width$}  {:<12}  {:>10}  {:>9.3}  {:>10}  {:>9.3}  {:>10}  {:>9.3}\n",
                entity,
                p.status.to_string(),
                p.rows_fetched,
                p.fetch_secs,
                p.rows_inserted,
                p.insert_secs,
                p.rows_synced,
                p.sync_secs
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_updates_are_aggregated() {
        let reporter = Reporter::new();
        let entity = EntityKey::Patient;
        reporter.register(&entity);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reporter = reporter.clone();
            let entity = entity.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    reporter.record(ProgressEvent::Inserted {
                        entity: entity.clone(),
                        rows: 5,
                        elapsed: Duration::from_millis(1),
                    });
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot["patient"].rows_inserted, 4_000);
        assert_eq!(snapshot["patient"].status, EntityStatus::Pending);
    }

    #[test]
    fn test_failure_is_sticky() {
        let reporter = Reporter::new();
        let entity = EntityKey::ClinicalEntry("001".into());
        reporter.record(ProgressEvent::Failed {
            entity: entity.clone(),
            error: "boom".into(),
        });
        reporter.record(ProgressEvent::Status {
            entity: entity.clone(),
            status: EntityStatus::Done,
        });

        let progress = &reporter.snapshot()["entry-001"];
        assert_eq!(progress.status, EntityStatus::Failed);
        assert_eq!(progress.error.as_deref(), Some("boom"));
        assert!(reporter.render_table().contains("entry-001"));
    }
}
