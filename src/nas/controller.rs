//! NAS Controller (progressive, REINFORCE)
//!
//! Proposes candidate token sequences one block at a time and learns from the
//! rewards of the candidates it proposed. Between trials only the top-K
//! sequences by reward survive as prefixes for the next block.
//!
//! Call order per trial is enforced: `propose` -> `train_step` -> `update_step`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use ndarray::Array1;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::ControllerConfig;
use super::policy_network::{entropy, PolicyNetwork};
use super::search_space::StateSpace;
use crate::error::{KolosalError, Result};

/// Attempts per requested proposal before falling back to enumeration
const SAMPLE_ATTEMPTS_PER_PROPOSAL: usize = 20;

/// Where the controller is in the per-trial cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    /// Ready to propose
    Idle,
    /// Proposals issued, waiting for rewards
    Proposed,
    /// Policy trained, waiting for `update_step`
    Trained,
}

/// A proposal paired with its reward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSequence {
    pub tokens: Vec<usize>,
    pub reward: f64,
}

/// Loss report of one `train_step`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControllerLoss {
    /// Policy loss minus weighted entropy
    pub loss: f64,
    /// Advantage-weighted negative log-likelihood
    pub policy_loss: f64,
    /// Mean entropy of the emitted decisions
    pub entropy: f64,
    /// Mean of `reward - baseline` over the batch
    pub mean_advantage: f64,
    /// Baseline after the update
    pub baseline: f64,
}

/// Persisted controller state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerCheckpoint {
    pub network: PolicyNetwork,
    pub baseline: Option<f64>,
}

impl ControllerCheckpoint {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Keep the `k` best sequences by reward, ties in proposal order
pub fn select_top_k(candidates: &[ScoredSequence], k: usize) -> Vec<ScoredSequence> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| candidates[b].reward.total_cmp(&candidates[a].reward));
    order
        .into_iter()
        .take(k)
        .map(|i| candidates[i].clone())
        .collect()
}

/// Policy-gradient controller over a [`StateSpace`]
#[derive(Debug)]
pub struct PolicyController {
    config: ControllerConfig,
    space: StateSpace,
    network: PolicyNetwork,
    baseline: Option<f64>,
    rng: Xoshiro256PlusPlus,
    trial: usize,
    phase: ControllerPhase,
    prefixes: Vec<Vec<usize>>,
    pending: Vec<Vec<usize>>,
    scored: Vec<ScoredSequence>,
}

impl PolicyController {
    /// Create a controller, restoring the checkpoint when configured
    pub fn new(space: StateSpace, config: ControllerConfig, seed: Option<u64>) -> Result<Self> {
        config.validate()?;
        let mut rng = match seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_entropy(),
        };

        let mut network = PolicyNetwork::new(&space, config.hidden_dim, &mut rng);
        let mut baseline = None;

        if config.restore_controller {
            if let Some(path) = config.checkpoint_path.as_deref() {
                let checkpoint = ControllerCheckpoint::load(path)?;
                if !checkpoint.network.fits(&space, config.hidden_dim) {
                    return Err(KolosalError::ConfigError(format!(
                        "Checkpoint {} does not match the search space",
                        path.display()
                    )));
                }
                info!(path = %path.display(), "Restored controller checkpoint");
                network = checkpoint.network;
                baseline = checkpoint.baseline;
            }
        }

        Ok(Self {
            config,
            space,
            network,
            baseline,
            rng,
            trial: 0,
            phase: ControllerPhase::Idle,
            prefixes: vec![Vec::new()],
            pending: Vec::new(),
            scored: Vec::new(),
        })
    }

    /// Current trial index
    pub fn trial(&self) -> usize {
        self.trial
    }

    /// Current phase
    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    /// Reward baseline, if initialised
    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    /// Prefixes the next proposal will extend
    pub fn prefixes(&self) -> &[Vec<usize>] {
        &self.prefixes
    }

    /// Search space the controller proposes in
    pub fn space(&self) -> &StateSpace {
        &self.space
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Underlying policy network
    pub fn network(&self) -> &PolicyNetwork {
        &self.network
    }

    fn expect_phase(&self, expected: ControllerPhase, operation: &str) -> Result<()> {
        if self.phase != expected {
            return Err(KolosalError::ControllerState(format!(
                "{} called in phase {:?}, expected {:?}",
                operation, self.phase, expected
            )));
        }
        Ok(())
    }

    /// Propose the candidate sequences of the current trial
    pub fn propose(&mut self) -> Result<Vec<Vec<usize>>> {
        self.expect_phase(ControllerPhase::Idle, "propose")?;
        if self.trial >= self.space.num_blocks() {
            return Err(KolosalError::ControllerState(format!(
                "All {} blocks have been decided",
                self.space.num_blocks()
            )));
        }
        if self.prefixes.is_empty() {
            return Err(KolosalError::ControllerState("No prefixes to extend".into()));
        }

        let block = self.trial;
        let branching = self.space.block_branching(block);
        let proposals = if block == 0 && branching <= self.config.max_enumerable as u128 {
            self.space.enumerate_block(0, &[])
        } else {
            let available = (self.prefixes.len() as u128).saturating_mul(branching);
            let target = (self.config.top_k as u128).min(available) as usize;
            self.sample_distinct(block, target)
        };

        for tokens in &proposals {
            // A violation here is a masking bug and must abort the run.
            self.space.validate(tokens)?;
        }

        debug!(trial = block, proposals = proposals.len(), "Controller proposals ready");
        self.pending = proposals.clone();
        self.phase = ControllerPhase::Proposed;
        Ok(proposals)
    }

    fn sample_distinct(&mut self, block: usize, target: usize) -> Vec<Vec<usize>> {
        let mut seen = HashSet::with_capacity(target);
        let mut proposals = Vec::with_capacity(target);
        let max_attempts = target * SAMPLE_ATTEMPTS_PER_PROPOSAL;

        let mut attempt = 0;
        while proposals.len() < target && attempt < max_attempts {
            let prefix = &self.prefixes[attempt % self.prefixes.len()];
            let tokens = self.network.sample_block(&self.space, prefix, &mut self.rng);
            if seen.insert(tokens.clone()) {
                proposals.push(tokens);
            }
            attempt += 1;
        }

        // Small spaces: sampling keeps hitting duplicates, so fill in order.
        if proposals.len() < target {
            'fill: for prefix in &self.prefixes {
                for tokens in self.space.enumerate_block(block, prefix) {
                    if proposals.len() >= target {
                        break 'fill;
                    }
                    if seen.insert(tokens.clone()) {
                        proposals.push(tokens);
                    }
                }
            }
        }

        proposals
    }

    /// Probability the policy assigns to each token of a sequence
    pub fn token_probabilities(&self, tokens: &[usize]) -> Result<Vec<f64>> {
        self.space.validate(tokens)?;
        Ok(self
            .network
            .rollout(&self.space, tokens)
            .steps
            .iter()
            .map(|step| step.probs[step.token])
            .collect())
    }

    /// Policy-gradient update from rewards aligned with the last proposals
    pub fn train_step(&mut self, rewards: &[f64]) -> Result<ControllerLoss> {
        self.expect_phase(ControllerPhase::Proposed, "train_step")?;
        if rewards.len() != self.pending.len() {
            return Err(KolosalError::ControllerState(format!(
                "Got {} rewards for {} proposals",
                rewards.len(),
                self.pending.len()
            )));
        }
        if let Some(bad) = rewards.iter().find(|r| !r.is_finite()) {
            return Err(KolosalError::ControllerState(format!("Non-finite reward {}", bad)));
        }
        if rewards.is_empty() {
            return Err(KolosalError::ControllerState("Empty reward batch".into()));
        }

        let n = rewards.len() as f64;
        let mean_reward = rewards.iter().sum::<f64>() / n;
        let baseline = self.baseline.unwrap_or(0.0);
        let advantages: Vec<f64> = rewards.iter().map(|r| r - baseline).collect();
        let start = self.trial * self.space.tokens_per_block();
        let reg = self.config.reg_param;

        let mut report = None;
        for _ in 0..self.config.train_iterations.max(1) {
            let mut grads = self.network.zero_gradients();
            let mut policy_loss = 0.0;
            let mut total_entropy = 0.0;

            for (tokens, &advantage) in self.pending.iter().zip(advantages.iter()) {
                let rollout = self.network.rollout(&self.space, tokens);
                let dlogits: Vec<Option<Array1<f64>>> = rollout
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(t, step)| {
                        if t < start {
                            return None;
                        }
                        let p = &step.probs;
                        let log_p = p.mapv(|v| v.max(1e-12).ln());
                        let h = entropy(p);
                        policy_loss -= advantage * log_p[step.token] / n;
                        total_entropy += h / n;

                        // d(-A log p_a)/dz = -A (onehot - p)
                        let mut d = p * (advantage / n);
                        d[step.token] -= advantage / n;
                        // d(-reg H)/dz = reg p (log p + H)
                        let d_entropy = p * &(&log_p + h) * (reg / n);
                        Some(d + d_entropy)
                    })
                    .collect();
                grads.add(&self.network.backward(&rollout, &dlogits));
            }

            self.network
                .apply_gradients(&grads, self.config.learning_rate, self.config.max_grad_norm);

            if report.is_none() {
                report = Some((policy_loss, total_entropy));
            }
        }

        let (policy_loss, total_entropy) = report.unwrap_or((0.0, 0.0));

        // The baseline only moves after the loss has been computed.
        let decay = self.config.baseline_decay;
        let updated = match self.baseline {
            None => mean_reward,
            Some(b) => decay * b + (1.0 - decay) * mean_reward,
        };
        self.baseline = Some(updated);

        self.scored = self
            .pending
            .iter()
            .cloned()
            .zip(rewards.iter().copied())
            .map(|(tokens, reward)| ScoredSequence { tokens, reward })
            .collect();
        self.phase = ControllerPhase::Trained;

        Ok(ControllerLoss {
            loss: policy_loss - reg * total_entropy,
            policy_loss,
            entropy: total_entropy,
            mean_advantage: advantages.iter().sum::<f64>() / n,
            baseline: updated,
        })
    }

    /// Commit the trial: keep the top-K prefixes, advance, checkpoint
    pub fn update_step(&mut self) -> Result<()> {
        self.expect_phase(ControllerPhase::Trained, "update_step")?;

        // Nothing is committed until the checkpoint is on disk.
        if let Some(path) = self.config.checkpoint_path.as_deref() {
            ControllerCheckpoint {
                network: self.network.clone(),
                baseline: self.baseline,
            }
            .save(path)?;
            debug!(path = %path.display(), "Saved controller checkpoint");
        }

        let kept = select_top_k(&self.scored, self.config.top_k);
        if let Some(best) = kept.first() {
            debug!(trial = self.trial, kept = kept.len(), best_reward = best.reward, "Selected prefixes");
        }
        self.prefixes = kept.into_iter().map(|s| s.tokens).collect();
        self.pending.clear();
        self.scored.clear();
        self.trial += 1;

        self.phase = ControllerPhase::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::config::SpaceConfig;
    use crate::nas::search_space::Operator;

    fn small_space() -> StateSpace {
        StateSpace::new(&SpaceConfig {
            num_blocks: 2,
            operators: Operator::default_catalog().into_iter().take(3).collect(),
            inputs_per_block: 1,
            ..Default::default()
        })
        .unwrap()
    }

    fn controller(space: StateSpace, k: usize, max_enumerable: usize) -> PolicyController {
        let config = ControllerConfig {
            top_k: k,
            hidden_dim: 8,
            max_enumerable,
            ..Default::default()
        };
        PolicyController::new(space, config, Some(42)).unwrap()
    }

    #[test]
    fn test_trial_zero_enumerates_small_space() {
        let mut ctrl = controller(small_space(), 2, 256);
        let proposals = ctrl.propose().unwrap();
        assert_eq!(proposals.len(), 3);
        assert!(proposals.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn test_trial_zero_samples_when_too_large() {
        let mut ctrl = controller(small_space(), 2, 0);
        let proposals = ctrl.propose().unwrap();
        assert_eq!(proposals.len(), 2);
        assert_ne!(proposals[0], proposals[1]);
    }

    #[test]
    fn test_never_requests_more_than_exist() {
        let mut ctrl = controller(small_space(), 10, 0);
        let proposals = ctrl.propose().unwrap();
        assert_eq!(proposals.len(), 3);
    }

    #[test]
    fn test_best_reward_becomes_first_prefix() {
        let mut ctrl = controller(small_space(), 2, 0);
        let proposals = ctrl.propose().unwrap();
        ctrl.train_step(&[0.9, 0.4]).unwrap();
        ctrl.update_step().unwrap();

        assert_eq!(ctrl.prefixes()[0], proposals[0]);
        let next = ctrl.propose().unwrap();
        assert_eq!(next.len(), 2);
        assert!(next.iter().all(|p| p.len() == 4));
        assert!(next.iter().all(|p| ctrl.prefixes().iter().any(|q| p[..2] == q[..])));
    }

    #[test]
    fn test_call_order_is_enforced() {
        let mut ctrl = controller(small_space(), 2, 256);
        assert!(matches!(ctrl.train_step(&[0.5]), Err(KolosalError::ControllerState(_))));
        assert!(ctrl.update_step().is_err());
        let proposals = ctrl.propose().unwrap();
        assert!(ctrl.propose().is_err());
        assert!(ctrl.train_step(&vec![0.5; proposals.len() + 1]).is_err());
        ctrl.train_step(&vec![0.5; proposals.len()]).unwrap();
        assert!(ctrl.propose().is_err());
        ctrl.update_step().unwrap();
        assert_eq!(ctrl.phase(), ControllerPhase::Idle);
    }

    #[test]
    fn test_uniform_rewards_center_advantage() {
        let mut ctrl = controller(small_space(), 3, 256);
        let proposals = ctrl.propose().unwrap();
        let rewards = vec![0.6; proposals.len()];
        ctrl.train_step(&rewards).unwrap();
        assert!((ctrl.baseline().unwrap() - 0.6).abs() < 1e-12);
        ctrl.update_step().unwrap();

        let proposals = ctrl.propose().unwrap();
        let loss = ctrl.train_step(&vec![0.6; proposals.len()]).unwrap();
        assert!(loss.mean_advantage.abs() < 1e-12);
        assert!(loss.policy_loss.abs() < 1e-12);
    }

    #[test]
    fn test_select_top_k() {
        let candidates: Vec<ScoredSequence> = [0.2, 0.9, 0.5, 0.9, 0.1]
            .iter()
            .enumerate()
            .map(|(i, &reward)| ScoredSequence { tokens: vec![i], reward })
            .collect();
        let top = select_top_k(&candidates, 3);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].tokens, vec![1]);
        assert_eq!(top[1].tokens, vec![3]);
        assert_eq!(top[2].tokens, vec![2]);
        assert_eq!(select_top_k(&candidates, 10).len(), 5);
    }

    #[test]
    fn test_checkpoint_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.json");
        let config = ControllerConfig {
            top_k: 2,
            hidden_dim: 8,
            checkpoint_path: Some(path.clone()),
            ..Default::default()
        };

        let mut ctrl = PolicyController::new(small_space(), config.clone(), Some(1)).unwrap();
        let proposals = ctrl.propose().unwrap();
        ctrl.train_step(&vec![0.7; proposals.len()]).unwrap();
        ctrl.update_step().unwrap();
        assert!(path.exists());

        let restored = PolicyController::new(
            small_space(),
            ControllerConfig { restore_controller: true, ..config },
            Some(2),
        )
        .unwrap();
        assert!((restored.baseline().unwrap() - ctrl.baseline().unwrap()).abs() < 1e-12);
        let tokens = &proposals[0];
        let restored_probs = restored.token_probabilities(tokens).unwrap();
        let original_probs = ctrl.token_probabilities(tokens).unwrap();
        for (a, b) in restored_probs.iter().zip(original_probs.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
