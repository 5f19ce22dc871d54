//! Search configuration
//!
//! All run parameters live in one immutable [`SearchConfig`] built at startup
//! and handed to every component.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::search_space::Operator;
use crate::error::{KolosalError, Result};

/// Shape of the decision space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Number of blocks per cell (B)
    pub num_blocks: usize,
    /// Operator catalog, in token order
    pub operators: Vec<Operator>,
    /// (input, operator) pairs chosen per block
    pub inputs_per_block: usize,
    /// Older cell outputs a block may read besides the immediate input
    pub lookback_depth: usize,
    /// How many of the most recent blocks a block may read (None = all)
    pub lookforward_depth: Option<usize>,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            num_blocks: 3,
            operators: Operator::default_catalog(),
            inputs_per_block: 2,
            lookback_depth: 0,
            lookforward_depth: None,
        }
    }
}

impl SpaceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_blocks == 0 {
            return Err(KolosalError::ConfigError("num_blocks must be at least 1".into()));
        }
        if self.operators.is_empty() {
            return Err(KolosalError::ConfigError("operator catalog is empty".into()));
        }
        if self.inputs_per_block == 0 {
            return Err(KolosalError::ConfigError("inputs_per_block must be at least 1".into()));
        }
        let mut seen = self.operators.clone();
        seen.sort_by_key(|op| op.to_string());
        seen.dedup();
        if seen.len() != self.operators.len() {
            return Err(KolosalError::ConfigError("operator catalog contains duplicates".into()));
        }
        Ok(())
    }
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Candidates per trial and prefixes kept between trials (K)
    pub top_k: usize,
    /// Hidden state dimension of the recurrent policy
    pub hidden_dim: usize,
    /// Gradient steps per `train_step`
    pub train_iterations: usize,
    /// Entropy regularization weight
    pub reg_param: f64,
    /// Controller learning rate
    pub learning_rate: f64,
    /// Baseline decay for REINFORCE
    pub baseline_decay: f64,
    /// Global gradient norm clip
    pub max_grad_norm: f64,
    /// Largest first-block space enumerated exhaustively in trial 0
    pub max_enumerable: usize,
    /// Where the controller checkpoint is written
    pub checkpoint_path: Option<PathBuf>,
    /// Load the checkpoint at startup
    pub restore_controller: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            hidden_dim: 100,
            train_iterations: 2,
            reg_param: 0.0,
            learning_rate: 0.01,
            baseline_decay: 0.95,
            max_grad_norm: 5.0,
            max_enumerable: 256,
            checkpoint_path: None,
            restore_controller: false,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(KolosalError::ConfigError("top_k must be at least 1".into()));
        }
        if self.hidden_dim == 0 {
            return Err(KolosalError::ConfigError("hidden_dim must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.baseline_decay) {
            return Err(KolosalError::ConfigError(format!(
                "baseline_decay must be in [0, 1), got {}",
                self.baseline_decay
            )));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(KolosalError::ConfigError("controller learning_rate must be positive".into()));
        }
        if !self.reg_param.is_finite() || self.reg_param < 0.0 {
            return Err(KolosalError::ConfigError("reg_param must be non-negative".into()));
        }
        if self.restore_controller && self.checkpoint_path.is_none() {
            return Err(KolosalError::ConfigError(
                "restore_controller requires a checkpoint_path".into(),
            ));
        }
        Ok(())
    }
}

/// Fixed training budget shared by every candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingBudget {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
}

impl Default for TrainingBudget {
    fn default() -> Self {
        Self {
            epochs: 2,
            batch_size: 512,
            learning_rate: 0.001,
        }
    }
}

impl TrainingBudget {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(KolosalError::ConfigError("epochs and batch_size must be at least 1".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(KolosalError::ConfigError("child learning_rate must be positive".into()));
        }
        Ok(())
    }
}

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub space: SpaceConfig,
    pub controller: ControllerConfig,
    pub training: TrainingBudget,
    /// Times the searched cell is stacked in each child network
    pub num_cells: usize,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
    /// Append-only result log
    pub history_path: PathBuf,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            space: SpaceConfig::default(),
            controller: ControllerConfig::default(),
            training: TrainingBudget::default(),
            num_cells: 1,
            seed: None,
            history_path: PathBuf::from("train_history.csv"),
        }
    }
}

impl SearchConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Set number of blocks
    pub fn with_blocks(mut self, num_blocks: usize) -> Self {
        self.space.num_blocks = num_blocks;
        self
    }

    /// Set candidates per trial
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.controller.top_k = k;
        self
    }

    /// Set operator catalog
    pub fn with_operators(mut self, operators: Vec<Operator>) -> Self {
        self.space.operators = operators;
        self
    }

    /// Set child training budget
    pub fn with_training(mut self, training: TrainingBudget) -> Self {
        self.training = training;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set result log path
    pub fn with_history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = path.into();
        self
    }

    /// Reject malformed parameters before any trial starts
    pub fn validate(&self) -> Result<()> {
        self.space.validate()?;
        self.controller.validate()?;
        self.training.validate()?;
        if self.num_cells == 0 {
            return Err(KolosalError::ConfigError("num_cells must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SearchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_catalog() {
        let config = SearchConfig::default().with_operators(Vec::new());
        assert!(matches!(config.validate(), Err(KolosalError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_zero_blocks_and_k() {
        assert!(SearchConfig::default().with_blocks(0).validate().is_err());
        assert!(SearchConfig::default().with_top_k(0).validate().is_err());
    }

    #[test]
    fn test_restore_needs_checkpoint() {
        let mut config = SearchConfig::default();
        config.controller.restore_controller = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_keeps_labels() {
        let config = SearchConfig::default().with_seed(7);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("1x7-7x1 conv"));
        let back: SearchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.space.operators, config.space.operators);
        assert_eq!(back.seed, Some(7));
    }
}
