//! Child network evaluation
//!
//! Turns one decoded cell into a reward: build a fresh network through a
//! [`ModelBuilder`], train it under the shared [`TrainingBudget`], and score
//! it on the validation split. A candidate that fails to train scores 0.

use std::time::Instant;

use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::config::TrainingBudget;
use super::search_space::CellArchitecture;
use crate::error::{KolosalError, Result};
use crate::utils::data_loader::{Dataset, DatasetShape};

/// Per-epoch training losses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epoch_losses: Vec<f64>,
}

impl TrainingHistory {
    /// Loss of the last epoch
    pub fn final_loss(&self) -> Option<f64> {
        self.epoch_losses.last().copied()
    }

    /// Whether every recorded loss is finite
    pub fn is_finite(&self) -> bool {
        self.epoch_losses.iter().all(|l| l.is_finite())
    }
}

/// A network that can be trained and scored
pub trait TrainableModel {
    /// Train on the given split
    fn train(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<usize>,
        budget: &TrainingBudget,
    ) -> Result<TrainingHistory>;

    /// Classification accuracy on the given split
    fn evaluate(&self, x: ArrayView2<f64>, y: ArrayView1<usize>) -> Result<f64>;
}

/// Builds a trainable network from a decoded cell
pub trait ModelBuilder {
    fn build(
        &self,
        arch: &CellArchitecture,
        shape: &DatasetShape,
        seed: u64,
    ) -> Result<Box<dyn TrainableModel>>;
}

/// Result of one candidate evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateOutcome {
    /// Validation accuracy in [0, 1]
    pub reward: f64,
    /// Final training loss
    pub train_loss: Option<f64>,
    /// Wall time spent on the candidate
    pub duration_secs: f64,
}

/// Trains candidates and reports their rewards
#[derive(Debug)]
pub struct ChildTrainer {
    dataset: Dataset,
    budget: TrainingBudget,
    base_seed: u64,
    evaluations: usize,
    failures: usize,
}

impl ChildTrainer {
    /// Create a trainer for a dataset and a fixed budget
    pub fn new(dataset: Dataset, budget: TrainingBudget, base_seed: u64) -> Result<Self> {
        budget.validate()?;
        dataset.validate()?;
        Ok(Self {
            dataset,
            budget,
            base_seed,
            evaluations: 0,
            failures: 0,
        })
    }

    /// Shared training budget
    pub fn budget(&self) -> &TrainingBudget {
        &self.budget
    }

    /// Shape handed to model builders
    pub fn dataset_shape(&self) -> DatasetShape {
        self.dataset.shape()
    }

    /// Number of candidates evaluated
    pub fn eval_count(&self) -> usize {
        self.evaluations
    }

    /// Number of candidates that failed to train
    pub fn failure_count(&self) -> usize {
        self.failures
    }

    /// Train and score a candidate, propagating failures
    pub fn try_reward(
        &mut self,
        arch: &CellArchitecture,
        builder: &dyn ModelBuilder,
    ) -> Result<CandidateOutcome> {
        let seed = self.base_seed.wrapping_add(self.evaluations as u64);
        self.evaluations += 1;
        let start = Instant::now();

        let mut model = builder.build(arch, &self.dataset.shape(), seed)?;
        let history = model.train(
            self.dataset.x_train.view(),
            self.dataset.y_train.view(),
            &self.budget,
        )?;
        if !history.is_finite() {
            return Err(KolosalError::CandidateTraining(format!(
                "Training loss diverged: {:?}",
                history.final_loss()
            )));
        }

        let accuracy = model.evaluate(self.dataset.x_val.view(), self.dataset.y_val.view())?;
        if !accuracy.is_finite() {
            return Err(KolosalError::CandidateTraining(format!(
                "Non-finite accuracy {}",
                accuracy
            )));
        }

        let outcome = CandidateOutcome {
            reward: accuracy.clamp(0.0, 1.0),
            train_loss: history.final_loss(),
            duration_secs: start.elapsed().as_secs_f64(),
        };
        debug!(
            reward = outcome.reward,
            train_loss = ?outcome.train_loss,
            secs = outcome.duration_secs,
            "Candidate evaluated"
        );
        Ok(outcome)
    }

    /// Train and score a candidate; any training failure scores 0
    pub fn get_reward(&mut self, arch: &CellArchitecture, builder: &dyn ModelBuilder) -> f64 {
        match self.try_reward(arch, builder) {
            Ok(outcome) => outcome.reward,
            Err(e) => {
                self.failures += 1;
                if e.is_candidate_local() {
                    warn!(error = %e, architecture = %arch, "Candidate failed, reward set to 0");
                } else {
                    error!(error = %e, architecture = %arch, "Candidate could not be evaluated, reward set to 0");
                }
                0.0
            }
        }
    }
}
