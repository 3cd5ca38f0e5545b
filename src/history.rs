//! Append-only experiment history.
//!
//! The search pipeline records one row per proposed candidate (learner
//! space) and one row per dispatched duplicate (sequencer space). The sink
//! is an injected collaborator (never process-wide state), so tests can
//! capture records in memory while the binaries append tab-separated files.

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::LinkResult;

/// One history row: ordered column names with already-formatted values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    columns: Vec<String>,
    values: Vec<String>,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl ToString) {
        self.columns.push(column.into());
        self.values.push(value.to_string());
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// Destination for history rows.
pub trait HistorySink: Send + Sync {
    fn append(&self, record: &Record) -> LinkResult<()>;
}

/// Tab-separated history file. The header row is written when the file is
/// first created; every append after that adds one row.
pub struct TsvHistory {
    path: PathBuf,
    guard: Mutex<()>,
}

impl TsvHistory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        TsvHistory {
            path: path.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistorySink for TsvHistory {
    fn append(&self, record: &Record) -> LinkResult<()> {
        let _guard = self.guard.lock();
        let fresh = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        if fresh {
            writer.write_record(record.columns())?;
        }
        writer.write_record(record.values())?;
        writer.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<Record>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        MemoryHistory::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }
}

impl HistorySink for MemoryHistory {
    fn append(&self, record: &Record) -> LinkResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(scan: u64, value: f64) -> Record {
        let mut record = Record::new();
        record.push("scanNum", scan);
        record.push("value", value);
        record
    }

    #[test]
    fn test_tsv_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.learner.tsv");
        let sink = TsvHistory::new(&path);
        sink.append(&sample(11011, 0.5)).unwrap();
        sink.append(&sample(11021, 0.75)).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "scanNum\tvalue");
        assert_eq!(lines[1], "11011\t0.5");
        assert_eq!(lines[2], "11021\t0.75");
    }

    #[test]
    fn test_memory_history_captures_records() {
        let sink = MemoryHistory::new();
        sink.append(&sample(1, 2.0)).unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].values(), &["1", "2"]);
    }
}
