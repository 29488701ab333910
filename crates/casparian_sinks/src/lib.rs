//! Sink interface for the dispatch core's output side.
//!
//! Sink implementations (columnar file writers, relational writers) are
//! external collaborators: this crate specifies the interface a sink
//! satisfies and carries one reference implementation (Parquet) to exercise
//! it, not a catalog of production writers.

use anyhow::{bail, Context, Result};
use arrow::array::RecordBatch;
use arrow::datatypes::Schema;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use casparian_protocol::types::{ParsedSinkUri, SinkScheme};
use casparian_protocol::SinkMode;

fn job_prefix(job_id: &str) -> String {
    // Stable 16-hex blake3 digest prefix; avoids collisions that an 8-char
    // truncation of the raw job_id would produce on shared prefixes.
    blake3::hash(job_id.as_bytes()).to_hex()[..16].to_string()
}

pub fn output_filename(output_name: &str, job_id: &str, extension: &str) -> String {
    format!("{}_{}.{}", output_name, job_prefix(job_id), extension)
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{message}")]
    Message { message: String },
    #[error("{message}")]
    Source {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

impl SinkError {
    fn message(message: impl Into<String>) -> Self {
        SinkError::Message {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for SinkError {
    fn from(err: anyhow::Error) -> Self {
        SinkError::Source {
            message: err.to_string(),
            source: err,
        }
    }
}

/// A batch handed to a sink. Wraps Arrow's `RecordBatch` to keep Arrow types
/// out of the worker-facing surface.
#[derive(Debug, Clone)]
pub struct OutputBatch {
    batch: Arc<RecordBatch>,
}

impl OutputBatch {
    pub fn from_record_batch(batch: RecordBatch) -> Self {
        Self {
            batch: Arc::new(batch),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.batch.schema()
    }
}

/// The interface every sink implementation satisfies: open against a
/// declared schema, accept batches, then commit or abort as a unit.
///
/// `open`/`write`/`commit`/`abort` map directly onto the environment
/// manager's write-to-temp-then-rename pattern: a sink stages its output
/// under `write` and only makes it visible on `commit`.
pub trait Sink {
    fn open(&mut self, schema: &Schema) -> Result<()>;
    fn write(&mut self, batch: &RecordBatch) -> Result<u64>;
    fn commit(&mut self) -> Result<()>;
    fn abort(&mut self) -> Result<()>;
}

/// Reference sink: writes one partitioned Parquet file per (output, job),
/// staged in a temp file and promoted by rename on commit.
pub struct ParquetSink {
    output_dir: PathBuf,
    output_name: String,
    job_id: String,
    writer: Option<parquet::arrow::arrow_writer::ArrowWriter<std::fs::File>>,
    rows_written: u64,
    temp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
    committed: bool,
}

impl ParquetSink {
    pub fn new(output_dir: PathBuf, output_name: &str, job_id: &str) -> Result<Self> {
        std::fs::create_dir_all(&output_dir).with_context(|| {
            format!(
                "Failed to create output directory: {}",
                output_dir.display()
            )
        })?;

        Ok(Self {
            output_dir,
            output_name: output_name.to_string(),
            job_id: job_id.to_string(),
            writer: None,
            rows_written: 0,
            temp_path: None,
            final_path: None,
            committed: false,
        })
    }
}

impl Sink for ParquetSink {
    fn open(&mut self, schema: &Schema) -> Result<()> {
        let filename = output_filename(&self.output_name, &self.job_id, "parquet");
        let final_path = self.output_dir.join(&filename);
        let temp_path = self.output_dir.join(format!(".{}.tmp", filename));

        info!(
            "Opening Parquet sink: {} (temp: {})",
            final_path.display(),
            temp_path.display()
        );

        let file = std::fs::File::create(&temp_path).with_context(|| {
            format!(
                "Failed to create temp parquet file: {}",
                temp_path.display()
            )
        })?;

        let props = parquet::file::properties::WriterProperties::builder()
            .set_compression(parquet::basic::Compression::SNAPPY)
            .build();

        let arrow_schema = Arc::new(schema.clone());
        let writer =
            parquet::arrow::arrow_writer::ArrowWriter::try_new(file, arrow_schema, Some(props))
                .context("Failed to create Parquet writer")?;

        self.writer = Some(writer);
        self.temp_path = Some(temp_path);
        self.final_path = Some(final_path);
        Ok(())
    }

    fn write(&mut self, batch: &RecordBatch) -> Result<u64> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Parquet sink not open"))?;

        writer
            .write(batch)
            .context("Failed to write batch to Parquet")?;

        let rows = batch.num_rows() as u64;
        self.rows_written += rows;
        debug!(
            "Wrote {} rows to Parquet (total: {})",
            rows, self.rows_written
        );
        Ok(rows)
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.close().context("Failed to close Parquet writer")?;
        }
        if let (Some(temp_path), Some(final_path)) = (&self.temp_path, &self.final_path) {
            std::fs::rename(temp_path, final_path).with_context(|| {
                format!(
                    "Failed to rename {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            })?;
            info!(
                "Committed Parquet sink: {} ({} rows)",
                final_path.display(),
                self.rows_written
            );
            self.committed = true;
        }
        self.temp_path = None;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.writer = None;
        if self.committed {
            if let Some(final_path) = &self.final_path {
                if final_path.exists() {
                    let _ = std::fs::remove_file(final_path);
                    warn!("Rolled back committed file: {}", final_path.display());
                }
            }
        }
        if let Some(temp_path) = &self.temp_path {
            if temp_path.exists() {
                let _ = std::fs::remove_file(temp_path);
                warn!("Rolled back temp file: {}", temp_path.display());
            }
        }
        self.temp_path = None;
        self.final_path = None;
        self.committed = false;
        Ok(())
    }
}

impl Drop for ParquetSink {
    fn drop(&mut self) {
        if let Some(temp_path) = &self.temp_path {
            if temp_path.exists() {
                let _ = std::fs::remove_file(temp_path);
                warn!("Cleaned up orphaned temp file: {}", temp_path.display());
            }
        }
    }
}

/// Resolve a sink URI to its concrete implementation. Only `parquet://` and
/// `file://*.parquet` are backed today; other schemes are the external
/// collaborators this crate specifies the interface for.
pub fn open_sink(uri: &str, sink_mode: SinkMode, output_name: &str, job_id: &str) -> SinkResult<Box<dyn Sink>> {
    let parsed = ParsedSinkUri::parse(uri)
        .map_err(|e| SinkError::message(format!("Failed to parse sink URI: {}", e)))?;

    if sink_mode != SinkMode::Append {
        return Err(SinkError::message(format!(
            "Parquet sink does not support {:?} mode (only Append)",
            sink_mode
        )));
    }

    let output_dir = match parsed.scheme {
        SinkScheme::Parquet => parsed.path,
        SinkScheme::File => parsed
            .path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .to_path_buf(),
        other => {
            return Err(SinkError::message(format!(
                "sink scheme {:?} has no in-tree implementation; provide an external writer",
                other
            )))
        }
    };

    Ok(Box::new(ParquetSink::new(output_dir, output_name, job_id)?))
}

/// Validate that a batch conforms to a declared schema.
pub fn validate_batch_schema(batch: &RecordBatch, declared_schema: &Schema, sink_name: &str) -> Result<()> {
    let batch_schema = batch.schema();

    if batch_schema.fields().len() != declared_schema.fields().len() {
        bail!(
            "Schema mismatch for sink '{}': expected {} columns, got {}",
            sink_name,
            declared_schema.fields().len(),
            batch_schema.fields().len()
        );
    }

    for (i, (batch_field, declared_field)) in batch_schema
        .fields()
        .iter()
        .zip(declared_schema.fields().iter())
        .enumerate()
    {
        if batch_field.name() != declared_field.name() {
            bail!(
                "Schema mismatch for sink '{}' column {}: expected name '{}', got '{}'",
                sink_name,
                i,
                declared_field.name(),
                batch_field.name()
            );
        }
        if batch_field.data_type() != declared_field.data_type() {
            bail!(
                "Schema mismatch for sink '{}' column '{}': expected type {:?}, got {:?}",
                sink_name,
                declared_field.name(),
                declared_field.data_type(),
                batch_field.data_type()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use tempfile::tempdir;

    fn create_test_batch() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]);

        let id_array = Int64Array::from(vec![1, 2, 3]);
        let name_array = StringArray::from(vec![Some("Alice"), Some("Bob"), None]);

        RecordBatch::try_new(
            Arc::new(schema),
            vec![Arc::new(id_array), Arc::new(name_array)],
        )
        .unwrap()
    }

    #[test]
    fn parquet_sink_writes_and_commits() {
        let dir = tempdir().unwrap();
        let job_id = "12345678-abcd-1234-abcd-123456789abc";
        let mut sink = ParquetSink::new(dir.path().to_path_buf(), "test", job_id).unwrap();

        let batch = create_test_batch();
        sink.open(batch.schema().as_ref()).unwrap();
        let rows = sink.write(&batch).unwrap();
        assert_eq!(rows, 3);
        sink.commit().unwrap();

        let output_path = dir.path().join(output_filename("test", job_id, "parquet"));
        assert!(output_path.exists());

        let temp_path = dir.path().join(format!(
            ".{}.tmp",
            output_filename("test", job_id, "parquet")
        ));
        assert!(!temp_path.exists());
    }

    #[test]
    fn parquet_sink_abort_removes_staged_file() {
        let dir = tempdir().unwrap();
        let job_id = "abort-job";
        let mut sink = ParquetSink::new(dir.path().to_path_buf(), "test", job_id).unwrap();
        let batch = create_test_batch();
        sink.open(batch.schema().as_ref()).unwrap();
        sink.write(&batch).unwrap();
        sink.abort().unwrap();

        let output_path = dir.path().join(output_filename("test", job_id, "parquet"));
        assert!(!output_path.exists());
    }

    #[test]
    fn validate_batch_schema_rejects_column_count_mismatch() {
        let batch = create_test_batch();
        let declared = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let result = validate_batch_schema(&batch, &declared, "test");
        assert!(result.is_err());
    }

    #[test]
    fn open_sink_rejects_unimplemented_scheme() {
        let result = open_sink("relational://db/table", SinkMode::Append, "out", "job-1");
        assert!(result.is_err());
    }
}
