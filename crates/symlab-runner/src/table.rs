use anyhow::{Context, Result};
use indexmap::IndexMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::atomic_write_bytes;
use crate::error::SymlabError;

pub type Record = IndexMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Record>,
}

impl Table {
    pub fn read(path: &Path) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.with_context(|| format!("malformed row in {}", path.display()))?;
            let row: Record = headers
                .iter()
                .cloned()
                .zip(record.iter().map(|v| v.to_string()))
                .collect();
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn time_indices(&self, column: &str) -> Result<Vec<i64>> {
        self.rows.iter().map(|row| time_index(row, column)).collect()
    }
}

pub fn time_index(row: &Record, column: &str) -> Result<i64> {
    let raw = row
        .get(column)
        .with_context(|| format!("row has no '{}' column", column))?;
    raw.trim()
        .parse::<i64>()
        .with_context(|| format!("invalid time index '{}' in column '{}'", raw, column))
}

pub fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if let Some(first) = records.first() {
        let header: Vec<&str> = first.keys().map(|k| k.as_str()).collect();
        wtr.write_record(&header)?;
        for (i, record) in records.iter().enumerate() {
            if record.len() != header.len() || !header.iter().all(|k| record.contains_key(*k)) {
                warn!(
                    row = i,
                    path = %path.display(),
                    "record fields differ from header; writing header columns only"
                );
            }
            wtr.write_record(
                header
                    .iter()
                    .map(|k| record.get(*k).map(|v| v.as_str()).unwrap_or("")),
            )?;
        }
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush csv buffer: {}", e))?;
    atomic_write_bytes(path, &bytes)
}

#[derive(Debug)]
pub struct AppendTable {
    path: PathBuf,
    header: Option<Vec<String>>,
    rows_written: usize,
}

impl AppendTable {
    pub fn create(path: &Path) -> Result<Self> {
        atomic_write_bytes(path, b"")?;
        Ok(Self {
            path: path.to_path_buf(),
            header: None,
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    /// Appends one run's records. Fails with
    /// [`SymlabError::TimeSeriesHeaderMismatch`] before writing anything if
    /// any record's fields differ from the established header.
    pub fn append(&mut self, run: &str, records: &[Record]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let mut fields: Vec<String> = first.keys().cloned().collect();
        fields.sort();

        let write_header = self.header.is_none();
        let header = self.header.get_or_insert_with(|| fields.clone());
        for record in records {
            let mut found: Vec<&String> = record.keys().collect();
            found.sort();
            if found.len() != header.len() || found.iter().zip(header.iter()).any(|(a, b)| *a != b)
            {
                return Err(SymlabError::TimeSeriesHeaderMismatch {
                    run: run.to_string(),
                    expected: header.join(","),
                    found: found
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                }
                .into());
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {} for append", self.path.display()))?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            wtr.write_record(header.iter())?;
        }
        for record in records {
            wtr.write_record(header.iter().map(|k| record[k.as_str()].as_str()))?;
        }
        wtr.flush()?;
        self.rows_written += records.len();
        Ok(())
    }
}
