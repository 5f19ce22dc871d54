//! Progressive Neural Architecture Search (PNAS)
//!
//! Searches a cell one block at a time:
//! - Search space definition and the token codec
//! - Recurrent policy controller trained with REINFORCE
//! - Child network evaluation through pluggable model builders
//! - The trial loop tying them together

pub mod config;
pub mod controller;
pub mod evaluator;
pub mod policy_network;
pub mod search;
pub mod search_space;

pub use config::{ControllerConfig, SearchConfig, SpaceConfig, TrainingBudget};
pub use controller::{
    select_top_k, ControllerCheckpoint, ControllerLoss, ControllerPhase, PolicyController,
    ScoredSequence,
};
pub use evaluator::{CandidateOutcome, ChildTrainer, ModelBuilder, TrainableModel, TrainingHistory};
pub use policy_network::PolicyNetwork;
pub use search::{BestResult, ProgressiveSearch, SearchSummary, TrialSummary};
pub use search_space::{
    Block, BlockChoice, CellArchitecture, DecisionKind, DecisionSlot, InputRef, Operator,
    StateSpace,
};
