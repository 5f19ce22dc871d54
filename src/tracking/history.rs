//! Search result log
//!
//! Each evaluated candidate becomes one header-less CSV row:
//! `reward, decision_1, ..., decision_N`. Rows grow with the number of
//! blocks, so the width varies across trials.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KolosalError, Result};
use crate::nas::CellArchitecture;

/// One logged candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub reward: f64,
    /// Decoded decision values in token order
    pub decisions: Vec<String>,
}

impl HistoryRow {
    pub fn new(reward: f64, arch: &CellArchitecture) -> Self {
        Self {
            reward,
            decisions: arch.decision_values(),
        }
    }

    fn to_record(&self) -> Vec<String> {
        std::iter::once(self.reward.to_string())
            .chain(self.decisions.iter().cloned())
            .collect()
    }
}

/// Write-only destination for candidate results
pub trait ResultSink {
    /// Persist one candidate; must be durable when this returns
    fn append(&mut self, row: &HistoryRow) -> Result<()>;

    /// Number of rows appended through this sink
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only CSV file
#[derive(Debug, Clone)]
pub struct CsvHistoryLog {
    path: PathBuf,
    written: usize,
}

impl CsvHistoryLog {
    /// Log appending to `path`; existing rows are kept
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: 0,
        }
    }

    /// Log starting from an empty file
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let log = Self::new(path);
        if let Some(parent) = log.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&log.path)?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for CsvHistoryLog {
    fn append(&mut self, row: &HistoryRow) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        writer.write_record(row.to_record())?;
        writer.flush()?;
        self.written += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.written
    }
}

/// In-memory sink
#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    rows: Vec<HistoryRow>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[HistoryRow] {
        &self.rows
    }
}

impl ResultSink for MemoryHistory {
    fn append(&mut self, row: &HistoryRow) -> Result<()> {
        self.rows.push(row.clone());
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Read a log written by [`CsvHistoryLog`]
pub fn read_history(path: impl AsRef<Path>) -> Result<Vec<HistoryRow>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let reward = record
            .get(0)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .ok_or_else(|| {
                KolosalError::DataError(format!(
                    "{}:{}: row does not start with a reward",
                    path.display(),
                    line + 1
                ))
            })?;
        rows.push(HistoryRow {
            reward,
            decisions: record.iter().skip(1).map(str::to_string).collect(),
        });
    }
    Ok(rows)
}

/// Highest-reward row; earlier rows win ties
pub fn best_row(rows: &[HistoryRow]) -> Option<&HistoryRow> {
    rows.iter().fold(None, |best: Option<&HistoryRow>, row| match best {
        Some(b) if b.reward >= row.reward => Some(b),
        _ => Some(row),
    })
}
