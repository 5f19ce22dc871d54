//! Kolosal PNAS - Progressive Neural Architecture Search
//!
//! This crate searches for a convolutional cell one block at a time:
//! - A discrete decision space encoded as flat token sequences
//! - A recurrent policy controller trained with REINFORCE
//! - Beam-style top-K pruning between trials
//! - Child networks trained and scored under a fixed budget
//!
//! # Modules
//!
//! ## Search
//! - [`nas`] - Search space, controller, evaluator and the trial loop
//!
//! ## Child networks
//! - [`architectures`] - Stacked-cell classifier and its operators
//!
//! ## Infrastructure
//! - [`tracking`] - Append-only result log
//! - [`utils`] - Dataset loading
//!
//! ## Services
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;

// Search
pub mod nas;

// Child networks
pub mod architectures;

// Infrastructure
pub mod tracking;
pub mod utils;

// Services
pub mod cli;

pub use error::{KolosalError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{KolosalError, Result};

    // Search
    pub use crate::nas::{
        CellArchitecture, ChildTrainer, ModelBuilder, Operator, PolicyController,
        ProgressiveSearch, SearchConfig, SearchSummary, StateSpace, TrainableModel,
        TrainingBudget,
    };

    // Child networks
    pub use crate::architectures::{CellNetwork, CellNetworkBuilder};

    // Result log
    pub use crate::tracking::{CsvHistoryLog, HistoryRow, MemoryHistory, ResultSink};

    // Data
    pub use crate::utils::data_loader::{Dataset, DatasetLoader, DatasetShape};
}
