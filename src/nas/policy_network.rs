//! Recurrent policy network for the NAS controller
//!
//! A single-layer tanh RNN. Each step consumes the embedding of the previous
//! token and the recurrent state, and emits a distribution over the legal
//! values of the next decision. Logits beyond the legal range are masked, so
//! every sampled token is valid by construction.

use ndarray::{s, Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::search_space::{DecisionKind, StateSpace};

/// What the network consumes at a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenInput {
    /// Beginning of sequence
    Start,
    /// Previously emitted decision
    Decision { kind: DecisionKind, token: usize },
}

/// Output of one recurrent step
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// New recurrent state
    pub hidden: Array1<f64>,
    /// Distribution over the legal tokens of the decision
    pub probs: Array1<f64>,
}

/// Cached step for back-propagation through time
#[derive(Debug, Clone)]
pub struct StepTrace {
    embedding_row: usize,
    kind: DecisionKind,
    hidden_prev: Array1<f64>,
    hidden: Array1<f64>,
    /// Legal-range distribution
    pub probs: Array1<f64>,
    /// Token actually taken
    pub token: usize,
}

/// Forced pass over a known token sequence
#[derive(Debug, Clone)]
pub struct Rollout {
    pub steps: Vec<StepTrace>,
}

impl Rollout {
    /// Log-probability of each token of the sequence
    pub fn log_probs(&self) -> Vec<f64> {
        self.steps
            .iter()
            .map(|step| step.probs[step.token].max(f64::MIN_POSITIVE).ln())
            .collect()
    }
}

/// Parameter gradients, shaped like the network
#[derive(Debug, Clone)]
pub struct Gradients {
    embeddings: Array2<f64>,
    recurrent: Array2<f64>,
    bias: Array1<f64>,
    input_head: Array2<f64>,
    input_head_bias: Array1<f64>,
    op_head: Array2<f64>,
    op_head_bias: Array1<f64>,
}

impl Gradients {
    /// Accumulate another gradient
    pub fn add(&mut self, other: &Gradients) {
        self.embeddings += &other.embeddings;
        self.recurrent += &other.recurrent;
        self.bias += &other.bias;
        self.input_head += &other.input_head;
        self.input_head_bias += &other.input_head_bias;
        self.op_head += &other.op_head;
        self.op_head_bias += &other.op_head_bias;
    }

    /// Global L2 norm
    pub fn norm(&self) -> f64 {
        let sq = |a: f64, v: &f64| a + v * v;
        (self.embeddings.iter().fold(0.0, sq)
            + self.recurrent.iter().fold(0.0, sq)
            + self.bias.iter().fold(0.0, sq)
            + self.input_head.iter().fold(0.0, sq)
            + self.input_head_bias.iter().fold(0.0, sq)
            + self.op_head.iter().fold(0.0, sq)
            + self.op_head_bias.iter().fold(0.0, sq))
        .sqrt()
    }
}

/// Recurrent controller network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyNetwork {
    hidden_dim: usize,
    input_vocab: usize,
    op_vocab: usize,
    /// Row 0 is the start token, then input tokens, then operator tokens
    embeddings: Array2<f64>,
    recurrent: Array2<f64>,
    bias: Array1<f64>,
    input_head: Array2<f64>,
    input_head_bias: Array1<f64>,
    op_head: Array2<f64>,
    op_head_bias: Array1<f64>,
}

impl PolicyNetwork {
    /// Create a network sized for a search space
    pub fn new(space: &StateSpace, hidden_dim: usize, rng: &mut impl Rng) -> Self {
        let input_vocab = space.max_input_cardinality();
        let op_vocab = space.num_operators();

        let mut network = Self {
            hidden_dim,
            input_vocab,
            op_vocab,
            embeddings: Array2::zeros((1 + input_vocab + op_vocab, hidden_dim)),
            recurrent: Array2::zeros((hidden_dim, hidden_dim)),
            bias: Array1::zeros(hidden_dim),
            input_head: Array2::zeros((hidden_dim, input_vocab)),
            input_head_bias: Array1::zeros(input_vocab),
            op_head: Array2::zeros((hidden_dim, op_vocab)),
            op_head_bias: Array1::zeros(op_vocab),
        };
        network.initialize_weights(rng);
        network
    }

    fn initialize_weights(&mut self, rng: &mut impl Rng) {
        let scale = 0.2;
        for val in self.embeddings.iter_mut() {
            *val = (rng.gen::<f64>() - 0.5) * scale;
        }
        for val in self.recurrent.iter_mut() {
            *val = (rng.gen::<f64>() - 0.5) * scale / (self.hidden_dim as f64).sqrt();
        }
        for val in self.input_head.iter_mut() {
            *val = (rng.gen::<f64>() - 0.5) * scale;
        }
        for val in self.op_head.iter_mut() {
            *val = (rng.gen::<f64>() - 0.5) * scale;
        }
    }

    /// Hidden state dimension
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Whether the network's heads fit a search space
    pub fn fits(&self, space: &StateSpace, hidden_dim: usize) -> bool {
        self.hidden_dim == hidden_dim
            && self.input_vocab == space.max_input_cardinality()
            && self.op_vocab == space.num_operators()
    }

    /// Zero recurrent state
    pub fn initial_state(&self) -> Array1<f64> {
        Array1::zeros(self.hidden_dim)
    }

    fn embedding_row(&self, input: TokenInput) -> usize {
        match input {
            TokenInput::Start => 0,
            TokenInput::Decision { kind: DecisionKind::Input, token } => 1 + token,
            TokenInput::Decision { kind: DecisionKind::Operator, token } => {
                1 + self.input_vocab + token
            }
        }
    }

    fn head(&self, kind: DecisionKind) -> (&Array2<f64>, &Array1<f64>) {
        match kind {
            DecisionKind::Input => (&self.input_head, &self.input_head_bias),
            DecisionKind::Operator => (&self.op_head, &self.op_head_bias),
        }
    }

    /// One recurrent step: (previous token, state) in, (distribution, state) out
    pub fn step(
        &self,
        input: TokenInput,
        hidden: &Array1<f64>,
        kind: DecisionKind,
        cardinality: usize,
    ) -> StepOutput {
        let row = self.embedding_row(input);
        let z = &self.embeddings.row(row) + &hidden.dot(&self.recurrent) + &self.bias;
        let hidden = z.mapv(f64::tanh);

        let (w, b) = self.head(kind);
        let logits = hidden.dot(&w.slice(s![.., ..cardinality])) + &b.slice(s![..cardinality]);
        StepOutput {
            probs: softmax(&logits),
            hidden,
        }
    }

    /// Score `tokens` step by step, feeding each known token back in
    pub fn rollout(&self, space: &StateSpace, tokens: &[usize]) -> Rollout {
        let mut hidden = self.initial_state();
        let mut input = TokenInput::Start;
        let mut steps = Vec::with_capacity(tokens.len());

        for (position, &token) in tokens.iter().enumerate() {
            let slot = space.slot(position);
            let out = self.step(input, &hidden, slot.kind, slot.cardinality);
            steps.push(StepTrace {
                embedding_row: self.embedding_row(input),
                kind: slot.kind,
                hidden_prev: hidden,
                hidden: out.hidden.clone(),
                probs: out.probs,
                token,
            });
            hidden = out.hidden;
            input = TokenInput::Decision { kind: slot.kind, token };
        }

        Rollout { steps }
    }

    /// Extend `prefix` by one block, sampling each token from the policy
    pub fn sample_block(
        &self,
        space: &StateSpace,
        prefix: &[usize],
        rng: &mut impl Rng,
    ) -> Vec<usize> {
        let rollout = self.rollout(space, prefix);
        let mut hidden = rollout
            .steps
            .last()
            .map(|s| s.hidden.clone())
            .unwrap_or_else(|| self.initial_state());
        let mut input = match prefix.last() {
            Some(&token) => TokenInput::Decision {
                kind: space.slot(prefix.len() - 1).kind,
                token,
            },
            None => TokenInput::Start,
        };

        let mut tokens = prefix.to_vec();
        for position in prefix.len()..prefix.len() + space.tokens_per_block() {
            let slot = space.slot(position);
            let out = self.step(input, &hidden, slot.kind, slot.cardinality);
            let token = sample_categorical(&out.probs, rng).min(slot.cardinality - 1);
            tokens.push(token);
            hidden = out.hidden;
            input = TokenInput::Decision { kind: slot.kind, token };
        }
        tokens
    }

    /// Zero gradients shaped like this network
    pub fn zero_gradients(&self) -> Gradients {
        Gradients {
            embeddings: Array2::zeros(self.embeddings.raw_dim()),
            recurrent: Array2::zeros(self.recurrent.raw_dim()),
            bias: Array1::zeros(self.hidden_dim),
            input_head: Array2::zeros(self.input_head.raw_dim()),
            input_head_bias: Array1::zeros(self.input_vocab),
            op_head: Array2::zeros(self.op_head.raw_dim()),
            op_head_bias: Array1::zeros(self.op_vocab),
        }
    }

    /// Back-propagation through time.
    ///
    /// `dlogits[t]` is the loss gradient w.r.t. the legal logits of step `t`;
    /// `None` marks steps that do not contribute to the loss.
    pub fn backward(&self, rollout: &Rollout, dlogits: &[Option<Array1<f64>>]) -> Gradients {
        let mut grads = self.zero_gradients();
        let mut dh_next: Array1<f64> = Array1::zeros(self.hidden_dim);

        for (step, dl) in rollout.steps.iter().zip(dlogits.iter()).rev() {
            let mut dh = dh_next;

            if let Some(dl) = dl {
                let card = dl.len();
                let (w, gw, gb) = match step.kind {
                    DecisionKind::Input => {
                        (&self.input_head, &mut grads.input_head, &mut grads.input_head_bias)
                    }
                    DecisionKind::Operator => {
                        (&self.op_head, &mut grads.op_head, &mut grads.op_head_bias)
                    }
                };
                let mut gw_slice = gw.slice_mut(s![.., ..card]);
                gw_slice += &outer(&step.hidden, dl);
                let mut gb_slice = gb.slice_mut(s![..card]);
                gb_slice += dl;
                dh = dh + w.slice(s![.., ..card]).dot(dl);
            }

            let dz = &dh * &step.hidden.mapv(|h| 1.0 - h * h);
            let mut emb_row = grads.embeddings.row_mut(step.embedding_row);
            emb_row += &dz;
            grads.recurrent += &outer(&step.hidden_prev, &dz);
            grads.bias += &dz;
            dh_next = self.recurrent.dot(&dz);
        }

        grads
    }

    /// Plain SGD step with global-norm clipping
    pub fn apply_gradients(&mut self, grads: &Gradients, learning_rate: f64, max_norm: f64) {
        let norm = grads.norm();
        let scale = if max_norm > 0.0 && norm > max_norm {
            max_norm / norm
        } else {
            1.0
        };
        let step = learning_rate * scale;

        self.embeddings.scaled_add(-step, &grads.embeddings);
        self.recurrent.scaled_add(-step, &grads.recurrent);
        self.bias.scaled_add(-step, &grads.bias);
        self.input_head.scaled_add(-step, &grads.input_head);
        self.input_head_bias.scaled_add(-step, &grads.input_head_bias);
        self.op_head.scaled_add(-step, &grads.op_head);
        self.op_head_bias.scaled_add(-step, &grads.op_head_bias);
    }
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    a.view().insert_axis(Axis(1)).dot(&b.view().insert_axis(Axis(0)))
}

/// Numerically stable softmax
pub fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    let max_val = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Array1<f64> = logits.mapv(|x| (x - max_val).exp());
    let sum: f64 = exp.sum();
    exp / sum
}

/// Sample from categorical distribution
pub fn sample_categorical(probs: &Array1<f64>, rng: &mut impl Rng) -> usize {
    let r: f64 = rng.gen();
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    probs.len() - 1
}

/// Entropy of a distribution
pub fn entropy(probs: &Array1<f64>) -> f64 {
    -probs
        .iter()
        .filter(|&&p| p > 1e-12)
        .map(|&p| p * p.ln())
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::config::SpaceConfig;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn setup() -> (StateSpace, PolicyNetwork, Xoshiro256PlusPlus) {
        let space = StateSpace::new(&SpaceConfig::default()).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let network = PolicyNetwork::new(&space, 16, &mut rng);
        (space, network, rng)
    }

    #[test]
    fn test_step_masks_to_cardinality() {
        let (_, network, _) = setup();
        let out = network.step(TokenInput::Start, &network.initial_state(), DecisionKind::Input, 1);
        assert_eq!(out.probs.len(), 1);
        assert!((out.probs[0] - 1.0).abs() < 1e-12);
        assert_eq!(out.hidden.len(), 16);
    }

    #[test]
    fn test_sample_block_is_legal() {
        let (space, network, mut rng) = setup();
        let first = network.sample_block(&space, &[], &mut rng);
        assert_eq!(first.len(), space.tokens_per_block());
        let second = network.sample_block(&space, &first, &mut rng);
        assert_eq!(second.len(), 2 * space.tokens_per_block());
        assert!(space.validate(&second).is_ok());
    }

    #[test]
    fn test_gradient_step_raises_log_prob() {
        let (space, mut network, _) = setup();
        let tokens = vec![0, 3, 0, 5];
        let before: f64 = network.rollout(&space, &tokens).log_probs().iter().sum();

        for _ in 0..20 {
            let rollout = network.rollout(&space, &tokens);
            // Gradient of -sum log p
            let dlogits: Vec<Option<Array1<f64>>> = rollout
                .steps
                .iter()
                .map(|step| {
                    let mut d = step.probs.clone();
                    d[step.token] -= 1.0;
                    Some(d)
                })
                .collect();
            let grads = network.backward(&rollout, &dlogits);
            network.apply_gradients(&grads, 0.1, 5.0);
        }

        let after: f64 = network.rollout(&space, &tokens).log_probs().iter().sum();
        assert!(after > before, "log prob should increase: {} -> {}", before, after);
    }

    #[test]
    fn test_softmax_and_entropy() {
        let probs = softmax(&Array1::from_vec(vec![1.0, 2.0, 3.0]));
        assert!((probs.sum() - 1.0).abs() < 1e-9);
        assert!(probs[2] > probs[1]);

        let uniform = Array1::from_vec(vec![0.25; 4]);
        let peaked = Array1::from_vec(vec![0.97, 0.01, 0.01, 0.01]);
        assert!(entropy(&uniform) > entropy(&peaked));
    }
}
