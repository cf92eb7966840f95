//! Append-only row stores for analysis results, CRM records, and call
//! summaries. The durable backend is a tab-delimited table file; tests and
//! dry runs use the in-memory variant.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Column layout for the primary results table.
pub const RESULT_HEADERS: [&str; 5] =
    ["Timestamp", "Transcript", "Sentiment", "Emotion", "StopReason"];

/// Row store with insertion-order retrieval. `ensure_header_row` is idempotent
/// and repairs a missing or mismatched first row; `append_row` adds one data
/// row after the header.
pub trait ResultSink: Send {
    fn ensure_header_row(&self, columns: &[&str]) -> Result<()>;
    fn append_row(&self, values: &[String]) -> Result<()>;
    /// All rows including the header, in insertion order.
    fn rows(&self) -> Result<Vec<Vec<String>>>;
}

/// In-memory sink used by tests and by the dashboard when no file path is
/// configured.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultSink for MemorySink {
    fn ensure_header_row(&self, columns: &[&str]) -> Result<()> {
        let header: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        if rows.is_empty() {
            rows.push(header);
        } else if rows[0] != header {
            rows[0] = header;
        }
        Ok(())
    }

    fn append_row(&self, values: &[String]) -> Result<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.push(values.to_vec());
        Ok(())
    }

    fn rows(&self) -> Result<Vec<Vec<String>>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Tab-delimited append-only table file. Cells are sanitized on write so the
/// delimiter and line breaks cannot corrupt the table shape.
pub struct TableFileSink {
    path: PathBuf,
}

impl TableFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read table file '{}'", self.path.display()))?;
        Ok(raw.lines().map(str::to_string).collect())
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create table directory '{}'", parent.display())
                })?;
            }
        }
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs::write(&self.path, body)
            .with_context(|| format!("failed to write table file '{}'", self.path.display()))
    }
}

fn encode_row(values: &[String]) -> String {
    values
        .iter()
        .map(|cell| cell.replace(['\t', '\n', '\r'], " "))
        .collect::<Vec<_>>()
        .join("\t")
}

fn decode_row(line: &str) -> Vec<String> {
    line.split('\t').map(str::to_string).collect()
}

impl ResultSink for TableFileSink {
    fn ensure_header_row(&self, columns: &[&str]) -> Result<()> {
        let header = encode_row(&columns.iter().map(|c| c.to_string()).collect::<Vec<_>>());
        let mut lines = self.read_lines()?;
        if lines.is_empty() {
            lines.push(header);
        } else if lines[0] != header {
            lines[0] = header;
        } else {
            return Ok(());
        }
        self.write_lines(&lines)
    }

    fn append_row(&self, values: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create table directory '{}'", parent.display())
                })?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open table file '{}'", self.path.display()))?;
        writeln!(file, "{}", encode_row(values))
            .with_context(|| format!("failed to append to '{}'", self.path.display()))
    }

    fn rows(&self) -> Result<Vec<Vec<String>>> {
        Ok(self
            .read_lines()?
            .iter()
            .map(|line| decode_row(line))
            .collect())
    }
}

/// Data rows (header stripped) in insertion order.
pub fn data_rows(sink: &dyn ResultSink) -> Result<Vec<Vec<String>>> {
    let mut rows = sink.rows()?;
    if !rows.is_empty() {
        rows.remove(0);
    }
    Ok(rows)
}
