use crate::db::TargetDb;
use crate::errors::{MigrationError, Result};
use crate::models::{MergeRequest, MergeSummary};
use std::sync::Arc;
use std::time::Instant;

/// Promotes staging content into the universal schema.
pub struct SyncReconciler {
    target: Arc<dyn TargetDb>,
}

impl SyncReconciler {
    pub fn new(target: Arc<dyn TargetDb>) -> Self {
        Self { target }
    }

    pub async fn reconcile(&self, request: &MergeRequest) -> Result<MergeSummary> {
        let started = Instant::now();
        log::debug!(
            "Merging '{}' into {}",
            request.staging_table,
            request.target_type
        );

        let summary = self
            .target
            .merge(request)
            .await
            .map_err(|source| MigrationError::Reconcile {
                staging_table: request.staging_table.clone(),
                source: Box::new(source),
            })?;

        log::info!(
            "Merged '{}' into {}: {} row(s) affected ({:.3}s)",
            request.staging_table,
            request.target_type,
            summary.affected_rows,
            started.elapsed().as_secs_f64()
        );
        Ok(summary)
    }
}
