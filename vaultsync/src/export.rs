//! CSV export of extracted rows.
//!
//! Files carry no header row and write NULL as `\N`, the layout the import
//! side reads back.

use crate::errors::{MigrationError, Result};
use crate::models::{EntityKey, Row};
use crate::transfer::RowSink;
use async_trait::async_trait;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub fn export_path(dir: &Path, entity: &EntityKey) -> PathBuf {
    dir.join(format!("{entity}.csv"))
}

/// Runs file I/O on the blocking thread pool.
pub(crate) async fn spawn_file_io<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| MigrationError::Other(anyhow::anyhow!("file worker failed: {err}")))?
}

type CsvFileWriter = csv::Writer<BufWriter<File>>;

/// Appends batches to one CSV file. Batches from concurrent cursors are
/// serialized through the writer lock, so rows never interleave.
pub struct CsvSink {
    path: PathBuf,
    writer: Arc<Mutex<CsvFileWriter>>,
}

impl CsvSink {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_path = path.clone();
        let writer = spawn_file_io(move || {
            let file = File::create(&file_path)?;
            Ok(csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(BufWriter::new(file)))
        })
        .await?;
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn finish(&self) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        spawn_file_io(move || {
            writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .flush()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RowSink for CsvSink {
    async fn write_batch(&self, rows: &[Row]) -> Result<usize> {
        let writer = Arc::clone(&self.writer);
        let rows = rows.to_vec();
        spawn_file_io(move || {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            for row in &rows {
                writer.write_record(row.iter().map(|value| value.csv_field().into_owned()))?;
            }
            Ok(rows.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SqlValue;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rows_are_written_with_null_marker() {
        let dir = tempdir().unwrap();
        let path = export_path(dir.path(), &EntityKey::EntryState("001".into()));
        let sink = CsvSink::create(&path).await.unwrap();

        let written = sink
            .write_batch(&[
                vec![SqlValue::Integer(1), "active, pending".into(), SqlValue::Null],
                vec![SqlValue::Integer(2), "closed".into(), "2020-01-01".into()],
            ])
            .await
            .unwrap();
        sink.finish().await.unwrap();

        assert_eq!(written, 2);
        assert!(path.ends_with("entry-state-001.csv"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1,\"active, pending\",\\N\n2,closed,2020-01-01\n");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_sink_works_on_current_thread_runtime() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::create(dir.path().join("patient.csv")).await.unwrap();

        let rows: Vec<Row> = (0..1_000)
            .map(|i| vec![SqlValue::Integer(i), SqlValue::Null, "demographic".into()])
            .collect();
        let (first, second) = tokio::join!(
            sink.write_batch(&rows[..500]),
            sink.write_batch(&rows[500..])
        );
        assert_eq!(first.unwrap() + second.unwrap(), 1_000);
        sink.finish().await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.lines().count(), 1_000);
        assert!(content.lines().all(|line| line.ends_with(",\\N,demographic")));
    }
}
