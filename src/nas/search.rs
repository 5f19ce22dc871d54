//! Progressive search loop
//!
//! One trial per block: the controller proposes, every proposal is trained
//! and scored, each result is logged as soon as it is known, and the
//! controller learns from the batch before the top-K prefixes move on.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::SearchConfig;
use super::controller::{ControllerLoss, PolicyController};
use super::evaluator::{ChildTrainer, ModelBuilder};
use super::search_space::{CellArchitecture, StateSpace};
use crate::error::Result;
use crate::tracking::history::{HistoryRow, ResultSink};
use crate::utils::data_loader::Dataset;

/// Best candidate seen so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub reward: f64,
    pub tokens: Vec<usize>,
    pub architecture: CellArchitecture,
    /// Trial that produced it
    pub trial: usize,
}

/// Statistics of one trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSummary {
    pub trial: usize,
    pub num_candidates: usize,
    pub mean_reward: f64,
    pub max_reward: f64,
    pub min_reward: f64,
    pub controller: ControllerLoss,
    pub duration_secs: f64,
}

/// Outcome of a full run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSummary {
    pub best: Option<BestResult>,
    pub trials: Vec<TrialSummary>,
    pub total_candidates: usize,
    /// Candidates that failed to train and scored 0
    pub failed_candidates: usize,
    pub elapsed_secs: f64,
}

/// Drives controller, trainer and result log through all trials
pub struct ProgressiveSearch<B: ModelBuilder, S: ResultSink> {
    controller: PolicyController,
    trainer: ChildTrainer,
    builder: B,
    sink: S,
    best: Option<BestResult>,
}

impl<B: ModelBuilder, S: ResultSink> ProgressiveSearch<B, S> {
    /// Wire up a search from one configuration
    pub fn new(config: &SearchConfig, dataset: Dataset, builder: B, sink: S) -> Result<Self> {
        config.validate()?;
        let space = StateSpace::new(&config.space)?;
        let controller = PolicyController::new(space, config.controller.clone(), config.seed)?;
        let base_seed = config.seed.unwrap_or_else(rand::random);
        let trainer = ChildTrainer::new(dataset, config.training, base_seed)?;
        Ok(Self::from_parts(controller, trainer, builder, sink))
    }

    /// Assemble from already constructed components
    pub fn from_parts(controller: PolicyController, trainer: ChildTrainer, builder: B, sink: S) -> Self {
        Self {
            controller,
            trainer,
            builder,
            sink,
            best: None,
        }
    }

    pub fn controller(&self) -> &PolicyController {
        &self.controller
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn best(&self) -> Option<&BestResult> {
        self.best.as_ref()
    }

    /// Whether every block has been decided
    pub fn is_complete(&self) -> bool {
        self.controller.trial() >= self.controller.space().num_blocks()
    }

    /// Replace the best record only on strict improvement
    fn record_best(&mut self, reward: f64, tokens: &[usize], arch: &CellArchitecture, trial: usize) {
        if self.best.as_ref().map_or(true, |b| reward > b.reward) {
            info!(reward, trial = trial + 1, architecture = %arch, "New best architecture");
            self.best = Some(BestResult {
                reward,
                tokens: tokens.to_vec(),
                architecture: arch.clone(),
                trial,
            });
        }
    }

    /// Run the next trial end to end
    pub fn run_trial(&mut self) -> Result<TrialSummary> {
        let trial = self.controller.trial();
        let start = Instant::now();

        let proposals = self.controller.propose()?;
        info!(
            trial = trial + 1,
            of = self.controller.space().num_blocks(),
            candidates = proposals.len(),
            "Starting trial"
        );

        let mut rewards = Vec::with_capacity(proposals.len());
        for (i, tokens) in proposals.iter().enumerate() {
            let arch = self.controller.space().decode(tokens)?;
            let probs = self.controller.token_probabilities(tokens)?;
            debug!(?tokens, ?probs, "Token probabilities");
            info!(
                trial = trial + 1,
                candidate = i + 1,
                architecture = %arch,
                "Training candidate"
            );

            let reward = self.trainer.get_reward(&arch, &self.builder);
            info!(candidate = i + 1, reward, "Candidate scored");

            self.record_best(reward, tokens, &arch, trial);
            self.sink.append(&HistoryRow::new(reward, &arch))?;
            rewards.push(reward);
        }

        let loss = self.controller.train_step(&rewards)?;
        info!(
            trial = trial + 1,
            loss = loss.loss,
            baseline = loss.baseline,
            "Controller trained"
        );
        self.controller.update_step()?;

        let n = rewards.len().max(1) as f64;
        Ok(TrialSummary {
            trial,
            num_candidates: rewards.len(),
            mean_reward: rewards.iter().sum::<f64>() / n,
            max_reward: rewards.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            min_reward: rewards.iter().cloned().fold(f64::INFINITY, f64::min),
            controller: loss,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Run every remaining trial
    pub fn run(&mut self) -> Result<SearchSummary> {
        let start = Instant::now();
        let space = self.controller.space();
        let config = self.controller.config();
        for line in space.summary() {
            info!("{}", line);
        }
        info!(
            total_models = %space.total_models(config.top_k, config.max_enumerable),
            "Search space ready"
        );

        let failures_before = self.trainer.failure_count();
        let mut trials = Vec::new();
        while !self.is_complete() {
            trials.push(self.run_trial()?);
        }

        let summary = SearchSummary {
            best: self.best.clone(),
            total_candidates: trials.iter().map(|t| t.num_candidates).sum(),
            failed_candidates: self.trainer.failure_count() - failures_before,
            trials,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        info!(
            candidates = summary.total_candidates,
            failed = summary.failed_candidates,
            best_reward = ?summary.best.as_ref().map(|b| b.reward),
            secs = summary.elapsed_secs,
            "Search finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KolosalError;
    use crate::nas::config::{SpaceConfig, TrainingBudget};
    use crate::nas::evaluator::{TrainableModel, TrainingHistory};
    use crate::nas::search_space::Operator;
    use crate::tracking::history::MemoryHistory;
    use crate::utils::data_loader::DatasetShape;
    use ndarray::{ArrayView1, ArrayView2};

    /// Scores a cell by how many pooling operators it uses
    struct PoolCounter;

    struct Scored(f64);

    impl TrainableModel for Scored {
        fn train(
            &mut self,
            _x: ArrayView2<f64>,
            _y: ArrayView1<usize>,
            budget: &TrainingBudget,
        ) -> Result<TrainingHistory> {
            Ok(TrainingHistory { epoch_losses: vec![0.5; budget.epochs] })
        }

        fn evaluate(&self, _x: ArrayView2<f64>, _y: ArrayView1<usize>) -> Result<f64> {
            Ok(self.0)
        }
    }

    impl ModelBuilder for PoolCounter {
        fn build(
            &self,
            arch: &CellArchitecture,
            _shape: &DatasetShape,
            _seed: u64,
        ) -> Result<Box<dyn TrainableModel>> {
            let choices: Vec<_> = arch.blocks.iter().flat_map(|b| b.choices.iter()).collect();
            let pools = choices
                .iter()
                .filter(|c| matches!(c.op, Operator::MaxPool { .. } | Operator::AvgPool { .. }))
                .count();
            Ok(Box::new(Scored(pools as f64 / choices.len().max(1) as f64)))
        }
    }

    fn config(blocks: usize) -> SearchConfig {
        let mut config = SearchConfig::default()
            .with_blocks(blocks)
            .with_top_k(3)
            .with_seed(9);
        config.space = SpaceConfig {
            num_blocks: blocks,
            inputs_per_block: 1,
            ..SpaceConfig::default()
        };
        config.controller.hidden_dim = 12;
        config
    }

    fn search(blocks: usize) -> ProgressiveSearch<PoolCounter, MemoryHistory> {
        let data = Dataset::synthetic(8, 4, 6, 2, 0);
        ProgressiveSearch::new(&config(blocks), data, PoolCounter, MemoryHistory::new()).unwrap()
    }

    #[test]
    fn test_one_row_per_candidate() {
        let mut search = search(3);
        let summary = search.run().unwrap();
        assert_eq!(summary.trials.len(), 3);
        assert_eq!(search.sink().len(), summary.total_candidates);
        for (row, expected_blocks) in search
            .sink()
            .rows()
            .iter()
            .zip(summary.trials.iter().flat_map(|t| std::iter::repeat(t.trial + 1).take(t.num_candidates)))
        {
            assert_eq!(row.decisions.len(), 2 * expected_blocks);
            assert!((0.0..=1.0).contains(&row.reward));
        }
    }

    #[test]
    fn test_best_matches_log_maximum() {
        let mut search = search(2);
        let summary = search.run().unwrap();
        let best = summary.best.unwrap();
        let max = search.sink().rows().iter().map(|r| r.reward).fold(0.0, f64::max);
        assert_eq!(best.reward, max);
        assert_eq!(
            search.controller().space().decode(&best.tokens).unwrap(),
            best.architecture
        );
    }

    #[test]
    fn test_trial_after_completion_is_an_error() {
        let mut search = search(1);
        search.run().unwrap();
        assert!(search.is_complete());
        assert!(matches!(search.run_trial(), Err(KolosalError::ControllerState(_))));
    }
}
