//! JSONL page adapter.
//!
//! Writes one JSON object per line to a per-dataset file: a `schema` object
//! at open, then for every capture a `page` header object (page index plus
//! the trigger-metadata parameters) followed by its `row` objects in
//! chronological order. The whole page is serialized to a single buffer and
//! appended in one write, so a page is never left truncated mid-row by a
//! shutdown between rows. `touch()` rewrites a marker file so downstream
//! consumers see liveness without new data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{ColumnValue, PageSchema, TabularSink};
use crate::error::{GlitchLoggerError, Result};

#[derive(Debug, Default)]
struct PageBuffer {
    rows: Vec<Vec<ColumnValue>>,
    parameters: BTreeMap<String, ColumnValue>,
}

/// Tabular sink writing JSONL pages for one dataset.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    marker_path: PathBuf,
    schema: Option<PageSchema>,
    current: PageBuffer,
    pages_written: u64,
}

impl JsonlSink {
    /// Creates a sink writing `<directory>/<prefix>-<dataset>.jsonl` with a
    /// shared marker file `<directory>/<marker>`.
    #[must_use]
    pub fn new(
        directory: impl AsRef<Path>,
        file_prefix: &str,
        dataset: &str,
        marker_file: &str,
    ) -> Self {
        let directory = directory.as_ref();
        Self {
            path: directory.join(format!("{}-{}.jsonl", file_prefix, dataset)),
            marker_path: directory.join(marker_file),
            schema: None,
            current: PageBuffer::default(),
            pages_written: 0,
        }
    }

    /// Output file path for this dataset.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn pages_written(&self) -> u64 {
        self.pages_written
    }

    fn sink_err(context: &str, err: std::io::Error) -> GlitchLoggerError {
        GlitchLoggerError::Sink(format!("{}: {}", context, err))
    }

    async fn append(&self, payload: String) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Self::sink_err("failed to open page file", e))?;

        file.write_all(payload.as_bytes())
            .await
            .map_err(|e| Self::sink_err("failed to write page", e))?;
        file.flush()
            .await
            .map_err(|e| Self::sink_err("failed to flush page file", e))?;
        Ok(())
    }
}

#[async_trait]
impl TabularSink for JsonlSink {
    async fn open(&mut self, schema: PageSchema) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::sink_err("failed to create sink directory", e))?;
        }

        let columns: Vec<serde_json::Value> = schema
            .columns
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "units": c.units,
                })
            })
            .collect();
        let header = serde_json::json!({
            "type": "schema",
            "dataset": schema.dataset,
            "columns": columns,
        });

        self.append(format!("{}\n", header)).await?;
        info!("Opened JSONL sink at {}", self.path.display());
        self.schema = Some(schema);
        Ok(())
    }

    fn start_page(&mut self, row_capacity_hint: usize) {
        self.current = PageBuffer {
            rows: Vec::with_capacity(row_capacity_hint),
            parameters: BTreeMap::new(),
        };
    }

    fn set_row(&mut self, row_index: usize, values: Vec<ColumnValue>) -> Result<()> {
        if row_index != self.current.rows.len() {
            return Err(GlitchLoggerError::Sink(format!(
                "non-sequential row index {} (expected {})",
                row_index,
                self.current.rows.len()
            )));
        }
        if let Some(schema) = &self.schema {
            if values.len() != schema.columns.len() {
                return Err(GlitchLoggerError::Sink(format!(
                    "row has {} values, schema defines {} columns",
                    values.len(),
                    schema.columns.len()
                )));
            }
        }
        self.current.rows.push(values);
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: ColumnValue) {
        self.current.parameters.insert(name.to_string(), value);
    }

    async fn write_page(&mut self) -> Result<()> {
        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| GlitchLoggerError::Sink("write_page before open".to_string()))?;

        let page_index = self.pages_written;
        let parameters: serde_json::Map<String, serde_json::Value> = self
            .current
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        let mut payload = String::new();
        let header = serde_json::json!({
            "type": "page",
            "dataset": schema.dataset,
            "page": page_index,
            "rows": self.current.rows.len(),
            "parameters": parameters,
        });
        payload.push_str(&header.to_string());
        payload.push('\n');

        for row in &self.current.rows {
            let values: serde_json::Map<String, serde_json::Value> = schema
                .columns
                .iter()
                .zip(row)
                .map(|(column, value)| (column.name.clone(), value.to_json()))
                .collect();
            let line = serde_json::json!({
                "type": "row",
                "page": page_index,
                "values": values,
            });
            payload.push_str(&line.to_string());
            payload.push('\n');
        }

        let row_count = self.current.rows.len();
        self.append(payload).await?;
        self.pages_written += 1;
        self.current = PageBuffer::default();
        debug!(
            "Wrote page {} ({} rows) to {}",
            page_index,
            row_count,
            self.path.display()
        );
        Ok(())
    }

    async fn touch(&mut self) -> Result<()> {
        tokio::fs::write(&self.marker_path, format!("{}\n", Utc::now().to_rfc3339()))
            .await
            .map_err(|e| Self::sink_err("failed to touch marker file", e))
    }

    async fn close(&mut self) -> Result<()> {
        // Pages are appended and flushed eagerly; nothing buffered remains.
        debug!(
            "Closed JSONL sink {} after {} pages",
            self.path.display(),
            self.pages_written
        );
        Ok(())
    }
}
