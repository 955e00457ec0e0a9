//! Loading exported CSV files back into staging tables.

use crate::errors::{MigrationError, Result};
use crate::export::spawn_file_io;
use crate::models::{EntityKey, Row, SqlValue, TransferStats};
use crate::reporter::{ProgressEvent, Reporter};
use crate::transfer::RowSink;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Every `*.csv` file directly under `dir`.
pub async fn scan_csv_files(dir: &Path) -> Result<BTreeSet<PathBuf>> {
    let dir = dir.to_path_buf();
    spawn_file_io(move || {
        let entries = std::fs::read_dir(&dir).map_err(|err| {
            MigrationError::Config(format!(
                "cannot read import directory '{}': {err}",
                dir.display()
            ))
        })?;
        let mut files = BTreeSet::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
                files.insert(path);
            }
        }
        Ok(files)
    })
    .await
}

/// Reads a headerless CSV file in fixed-size batches of rows.
///
/// The reader moves onto the blocking pool for every batch and back, the
/// same way pooled database connections do.
pub struct CsvBatchReader {
    reader: Option<csv::Reader<File>>,
}

impl CsvBatchReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let reader = spawn_file_io(move || {
            Ok(csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(&path)?)
        })
        .await?;
        Ok(Self {
            reader: Some(reader),
        })
    }

    /// Up to `size` rows; empty once the file is exhausted.
    pub async fn next_batch(&mut self, size: usize) -> Result<Vec<Row>> {
        let Some(mut reader) = self.reader.take() else {
            return Ok(Vec::new());
        };
        let size = size.max(1);
        let (reader, rows) = spawn_file_io(move || {
            let mut rows: Vec<Row> = Vec::with_capacity(size);
            let mut record = csv::StringRecord::new();
            while rows.len() < size && reader.read_record(&mut record)? {
                rows.push(record.iter().map(SqlValue::from_csv_field).collect());
            }
            Ok((reader, rows))
        })
        .await?;

        if rows.len() == size {
            self.reader = Some(reader);
        }
        Ok(rows)
    }
}

/// Streams `path` into `sink` in batches of `batch_size` rows.
pub async fn load_csv(
    entity: &EntityKey,
    path: &Path,
    sink: &dyn RowSink,
    batch_size: usize,
    reporter: &Reporter,
) -> Result<TransferStats> {
    let started = Instant::now();
    let mut reader = CsvBatchReader::open(path).await?;
    let mut stats = TransferStats::default();

    loop {
        let read_started = Instant::now();
        let rows = reader.next_batch(batch_size).await?;
        if rows.is_empty() {
            break;
        }
        reporter.record(ProgressEvent::Fetched {
            entity: entity.clone(),
            rows: rows.len(),
            elapsed: read_started.elapsed(),
        });

        let insert_started = Instant::now();
        let written = sink.write_batch(&rows).await?;
        reporter.record(ProgressEvent::Inserted {
            entity: entity.clone(),
            rows: written,
            elapsed: insert_started.elapsed(),
        });

        stats.pages += 1;
        stats.batches += 1;
        stats.rows_fetched += rows.len();
        stats.rows_written += written;
    }

    log::info!(
        "CSV loaded {} ({} rows in {:.3}s)",
        path.display(),
        stats.rows_written,
        started.elapsed().as_secs_f64()
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct BatchLog {
        batches: Mutex<Vec<Vec<Row>>>,
    }

    #[async_trait]
    impl RowSink for BatchLog {
        async fn write_batch(&self, rows: &[Row]) -> Result<usize> {
            self.batches.lock().unwrap().push(rows.to_vec());
            Ok(rows.len())
        }
    }

    #[tokio::test]
    async fn test_load_splits_file_into_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("organization.csv");
        std::fs::write(
            &path,
            "North,\\N,1,clinic\n\"South, Annex\",\\N,2,clinic\nEast,ref,3,\\N\n",
        )
        .unwrap();

        let sink = BatchLog::default();
        let reporter = Reporter::new();
        reporter.register(&EntityKey::Organization);
        let stats = load_csv(&EntityKey::Organization, &path, &sink, 2, &reporter)
            .await
            .unwrap();

        assert_eq!(stats.rows_written, 3);
        assert_eq!(stats.batches, 2);
        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(
            batches[0][1],
            vec![
                SqlValue::Text("South, Annex".into()),
                SqlValue::Null,
                SqlValue::Text("2".into()),
                SqlValue::Text("clinic".into()),
            ]
        );
        assert_eq!(batches[1][0][3], SqlValue::Null);
        assert_eq!(reporter.snapshot()["organization"].rows_inserted, 3);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patient.csv");
        std::fs::write(&path, "1,100,\\N\n1,101,\\N\n").unwrap();

        let mut reader = CsvBatchReader::open(&path).await.unwrap();
        assert_eq!(reader.next_batch(2).await.unwrap().len(), 2);
        assert!(reader.next_batch(2).await.unwrap().is_empty());
        assert!(reader.next_batch(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_lists_only_csv_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("patient.csv"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("nested.csv")).unwrap();

        let files = scan_csv_files(dir.path()).await.unwrap();
        assert_eq!(
            files.into_iter().collect::<Vec<_>>(),
            vec![dir.path().join("patient.csv")]
        );

        let missing = scan_csv_files(&dir.path().join("absent")).await.unwrap_err();
        assert!(matches!(missing, MigrationError::Config(_)));
    }
}
