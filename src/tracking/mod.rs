//! Search result tracking

pub mod history;

pub use history::{best_row, read_history, CsvHistoryLog, HistoryRow, MemoryHistory, ResultSink};
