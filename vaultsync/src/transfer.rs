//! Parallel paginated extraction into a row sink.
//!
//! A transfer runs `workers` cursors over the same query template. Cursor
//! `i` starts at `i * page_size` and strides by `workers * page_size`, so
//! together the cursors cover every offset exactly once. A cursor stops at
//! the first empty or short page.

use crate::catalog::{LIMIT_PLACEHOLDER, OFFSET_PLACEHOLDER};
use crate::config::MigrationConfig;
use crate::db::{SourceDb, TargetDb};
use crate::errors::{MigrationError, Result};
use crate::models::{EntityKey, PageRequest, Row, TransferStats};
use crate::reporter::{ProgressEvent, Reporter};
use crate::staging::StagingLayout;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub workers: usize,
    pub page_size: usize,
    pub insert_batch: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&MigrationConfig::default())
    }
}

impl From<&MigrationConfig> for TransferSettings {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            workers: config.transfer_workers,
            page_size: config.page_size,
            insert_batch: config.insert_batch,
        }
    }
}

/// Destination of extracted rows.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Writes one batch, returning the number of rows stored.
    async fn write_batch(&self, rows: &[Row]) -> Result<usize>;
}

/// Writes batches into a staging table with multi-row inserts. A batch
/// wider than the statement parameter limit is split across several.
pub struct StagingSink {
    target: Arc<dyn TargetDb>,
    layout: StagingLayout,
}

impl StagingSink {
    pub fn new(target: Arc<dyn TargetDb>, layout: StagingLayout) -> Self {
        Self { target, layout }
    }
}

#[async_trait]
impl RowSink for StagingSink {
    async fn write_batch(&self, rows: &[Row]) -> Result<usize> {
        let mut written = 0;
        for chunk in rows.chunks(self.layout.rows_per_statement()) {
            let statement = self.layout.insert_statement(chunk)?;
            written += self.target.execute(statement).await?;
        }
        Ok(written)
    }
}

pub fn render_page_query(template: &str, cursor: usize, offset: usize, limit: usize) -> PageRequest {
    PageRequest {
        sql: template
            .replace(OFFSET_PLACEHOLDER, &offset.to_string())
            .replace(LIMIT_PLACEHOLDER, &limit.to_string()),
        cursor,
        offset,
        limit,
    }
}

pub struct ChunkedTransfer {
    source: Arc<dyn SourceDb>,
    settings: TransferSettings,
    reporter: Reporter,
}

impl ChunkedTransfer {
    pub fn new(source: Arc<dyn SourceDb>, settings: TransferSettings, reporter: Reporter) -> Self {
        Self {
            source,
            settings,
            reporter,
        }
    }

    pub async fn run(
        &self,
        entity: &EntityKey,
        query: &str,
        sink: Arc<dyn RowSink>,
    ) -> Result<TransferStats> {
        let workers = self.settings.workers.max(1);
        let started = Instant::now();
        let mut cursors = JoinSet::new();

        for index in 0..workers {
            let cursor = Cursor {
                index,
                entity: entity.clone(),
                template: query.to_string(),
                source: Arc::clone(&self.source),
                sink: Arc::clone(&sink),
                settings: TransferSettings {
                    workers,
                    ..self.settings
                },
                reporter: self.reporter.clone(),
            };
            cursors.spawn(cursor.run());
        }

        let mut stats = TransferStats::default();
        while let Some(joined) = cursors.join_next().await {
            let outcome = joined.map_err(|err| {
                MigrationError::Other(anyhow::anyhow!("transfer cursor for {entity} failed: {err}"))
            });
            match outcome.and_then(|result| result) {
                Ok(cursor_stats) => stats.absorb(cursor_stats),
                Err(err) => {
                    cursors.abort_all();
                    log::warn!("Transfer of {entity} aborted: {err}");
                    return Err(err);
                }
            }
        }

        log::info!(
            "Transferred {} row(s) of {entity} in {} page(s) ({:.3}s)",
            stats.rows_written,
            stats.pages,
            started.elapsed().as_secs_f64()
        );
        Ok(stats)
    }
}

struct Cursor {
    index: usize,
    entity: EntityKey,
    template: String,
    source: Arc<dyn SourceDb>,
    sink: Arc<dyn RowSink>,
    settings: TransferSettings,
    reporter: Reporter,
}

impl Cursor {
    async fn run(self) -> Result<TransferStats> {
        let TransferSettings {
            workers,
            page_size,
            insert_batch,
        } = self.settings;
        let stride = workers * page_size;
        let mut offset = self.index * page_size;
        let mut stats = TransferStats::default();

        loop {
            let page = render_page_query(&self.template, self.index, offset, page_size);
            let fetch_started = Instant::now();
            let rows = self.source.fetch_page(&page).await?;
            self.reporter.record(ProgressEvent::Fetched {
                entity: self.entity.clone(),
                rows: rows.len(),
                elapsed: fetch_started.elapsed(),
            });
            log::debug!(
                "{} cursor {}: {} row(s) at offset {offset}",
                self.entity,
                self.index,
                rows.len()
            );

            if rows.is_empty() {
                break;
            }
            stats.pages += 1;
            stats.rows_fetched += rows.len();

            for batch in rows.chunks(insert_batch.max(1)) {
                let insert_started = Instant::now();
                let written = self.sink.write_batch(batch).await?;
                self.reporter.record(ProgressEvent::Inserted {
                    entity: self.entity.clone(),
                    rows: written,
                    elapsed: insert_started.elapsed(),
                });
                stats.rows_written += written;
                stats.batches += 1;
            }

            if rows.len() < page_size {
                break;
            }
            offset += stride;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SqlValue;
    use std::sync::Mutex;

    /// Source backed by `total` synthetic rows, recording every request.
    struct CountingSource {
        total: usize,
        requests: Mutex<Vec<PageRequest>>,
        fail_at: Option<usize>,
    }

    impl CountingSource {
        fn new(total: usize) -> Self {
            Self {
                total,
                requests: Mutex::new(Vec::new()),
                fail_at: None,
            }
        }
    }

    #[async_trait]
    impl SourceDb for CountingSource {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn fetch_page(&self, page: &PageRequest) -> Result<Vec<Row>> {
            self.requests.lock().unwrap().push(page.clone());
            if self.fail_at == Some(page.offset) {
                return Err(MigrationError::Connectivity("connection reset".into()));
            }
            let end = (page.offset + page.limit).min(self.total);
            Ok((page.offset.min(end)..end)
                .map(|i| vec![SqlValue::Integer(i as i64)])
                .collect())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<usize>>,
        ids: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl RowSink for CollectingSink {
        async fn write_batch(&self, rows: &[Row]) -> Result<usize> {
            self.batches.lock().unwrap().push(rows.len());
            let mut ids = self.ids.lock().unwrap();
            for row in rows {
                if let SqlValue::Integer(id) = row[0] {
                    ids.push(id);
                }
            }
            Ok(rows.len())
        }
    }

    fn settings(workers: usize, page_size: usize, insert_batch: usize) -> TransferSettings {
        TransferSettings {
            workers,
            page_size,
            insert_batch,
        }
    }

    #[test]
    fn test_render_page_query() {
        let page = render_page_query("SELECT * FROM t LIMIT {offset}, {limit}", 2, 100, 50);
        assert_eq!(page.sql, "SELECT * FROM t LIMIT 100, 50");
        assert_eq!((page.cursor, page.offset, page.limit), (2, 100, 50));
    }

    #[tokio::test]
    async fn test_cursors_stride_and_cover_all_rows() {
        let source = Arc::new(CountingSource::new(320_000));
        let sink = Arc::new(CollectingSink::default());
        let transfer = ChunkedTransfer::new(
            source.clone(),
            settings(3, 50_000, 2_500),
            Reporter::new(),
        );

        let stats = transfer
            .run(&EntityKey::Patient, "q {offset} {limit}", sink.clone())
            .await
            .unwrap();

        assert_eq!(stats.rows_written, 320_000);
        assert_eq!(stats.pages, 7);

        let mut offsets: Vec<usize> = source
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect();
        offsets.sort_unstable();
        // Cursor 0: 0, 150k, 300k. Cursor 1: 50k, 200k, 350k (empty).
        // Cursor 2: 100k, 250k (full), 400k (empty).
        assert_eq!(
            offsets,
            vec![0, 50_000, 100_000, 150_000, 200_000, 250_000, 300_000, 350_000, 400_000]
        );

        let mut ids = sink.ids.lock().unwrap().clone();
        ids.sort_unstable();
        assert_eq!(ids, (0..320_000).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_each_cursor_stays_on_its_stride() {
        let (workers, page_size) = (3, 50_000);
        let source = Arc::new(CountingSource::new(320_000));
        let transfer = ChunkedTransfer::new(
            source.clone(),
            settings(workers, page_size, 2_500),
            Reporter::new(),
        );
        transfer
            .run(
                &EntityKey::Patient,
                "q {offset} {limit}",
                Arc::new(CollectingSink::default()),
            )
            .await
            .unwrap();

        let requests = source.requests.lock().unwrap().clone();
        let mut per_cursor = vec![Vec::new(); workers];
        for request in &requests {
            assert!(request.cursor < workers);
            assert_eq!(
                request.offset % (workers * page_size),
                request.cursor * page_size,
                "cursor {} requested offset {}",
                request.cursor,
                request.offset
            );
            per_cursor[request.cursor].push(request.offset);
        }
        for offsets in &mut per_cursor {
            offsets.sort_unstable();
        }
        assert_eq!(per_cursor[0], vec![0, 150_000, 300_000]);
        assert_eq!(per_cursor[1], vec![50_000, 200_000, 350_000]);
        assert_eq!(per_cursor[2], vec![100_000, 250_000, 400_000]);
    }

    #[tokio::test]
    async fn test_batches_never_exceed_insert_batch() {
        let source = Arc::new(CountingSource::new(1_234));
        let sink = Arc::new(CollectingSink::default());
        let transfer = ChunkedTransfer::new(source, settings(2, 500, 200), Reporter::new());

        let stats = transfer
            .run(&EntityKey::Organization, "{offset}{limit}", sink.clone())
            .await
            .unwrap();

        let batches = sink.batches.lock().unwrap().clone();
        assert!(batches.iter().all(|&n| n > 0 && n <= 200));
        assert_eq!(batches.iter().sum::<usize>(), 1_234);
        assert_eq!(stats.batches, batches.len());
    }

    #[tokio::test]
    async fn test_empty_source_writes_nothing() {
        let source = Arc::new(CountingSource::new(0));
        let sink = Arc::new(CollectingSink::default());
        let transfer = ChunkedTransfer::new(source.clone(), settings(3, 10, 5), Reporter::new());

        let stats = transfer
            .run(&EntityKey::Practitioner, "{offset}{limit}", sink.clone())
            .await
            .unwrap();

        assert_eq!(stats, TransferStats::default());
        assert_eq!(source.requests.lock().unwrap().len(), 3);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_error_fails_transfer() {
        let source = Arc::new(CountingSource {
            fail_at: Some(10),
            ..CountingSource::new(100)
        });
        let sink = Arc::new(CollectingSink::default());
        let transfer = ChunkedTransfer::new(source, settings(2, 10, 10), Reporter::new());

        let err = transfer
            .run(&EntityKey::Patient, "{offset}{limit}", sink)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Connectivity(_)));
    }
}
