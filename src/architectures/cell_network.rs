//! Stacked-cell classifier used to score candidate cells
//!
//! The searched cell is repeated `num_cells` times over the raw feature row.
//! Inside a cell each block sums its operator outputs and the cell output is
//! the mean of its block outputs. A dense softmax layer on the last cell
//! output produces class probabilities. Training is plain mini-batch SGD on
//! cross-entropy with hand-written backpropagation.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::debug;

use super::ops::{OpCache, OpGrad, OpLayer};
use crate::error::{KolosalError, Result};
use crate::nas::{
    CellArchitecture, InputRef, ModelBuilder, TrainableModel, TrainingBudget, TrainingHistory,
};
use crate::utils::data_loader::DatasetShape;

/// Rows per forward pass when scoring
const EVAL_CHUNK: usize = 1024;

/// Builds a [`CellNetwork`] per candidate
#[derive(Debug, Clone, Copy)]
pub struct CellNetworkBuilder {
    num_cells: usize,
}

impl Default for CellNetworkBuilder {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CellNetworkBuilder {
    pub fn new(num_cells: usize) -> Self {
        Self {
            num_cells: num_cells.max(1),
        }
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }
}

impl ModelBuilder for CellNetworkBuilder {
    fn build(
        &self,
        arch: &CellArchitecture,
        shape: &DatasetShape,
        seed: u64,
    ) -> Result<Box<dyn TrainableModel>> {
        Ok(Box::new(CellNetwork::new(arch, shape, self.num_cells, seed)?))
    }
}

/// Saved activations of one forward pass
struct ForwardTrace {
    /// Network input followed by every cell output
    history: Vec<Array2<f64>>,
    /// [cell][block][choice]
    caches: Vec<Vec<Vec<OpCache>>>,
    probs: Array2<f64>,
}

struct NetworkGrads {
    ops: Vec<Vec<Vec<OpGrad>>>,
    weights: Array2<f64>,
    bias: Array1<f64>,
}

/// Child network built from one cell description
#[derive(Debug, Clone)]
pub struct CellNetwork {
    /// State index read by each choice of each block
    wiring: Vec<Vec<usize>>,
    num_external: usize,
    /// [cell][block][choice]
    cells: Vec<Vec<Vec<OpLayer>>>,
    weights: Array2<f64>,
    bias: Array1<f64>,
    num_features: usize,
    num_classes: usize,
    rng: Xoshiro256PlusPlus,
}

impl CellNetwork {
    /// Instantiate fresh weights for `arch`
    pub fn new(
        arch: &CellArchitecture,
        shape: &DatasetShape,
        num_cells: usize,
        seed: u64,
    ) -> Result<Self> {
        if shape.num_features == 0 || shape.num_classes == 0 {
            return Err(KolosalError::ConfigError(format!(
                "Cannot build a network for {} features and {} classes",
                shape.num_features, shape.num_classes
            )));
        }

        let num_external = arch.max_lookback() + 1;
        let mut wiring = Vec::with_capacity(arch.num_blocks());
        for (b, block) in arch.blocks.iter().enumerate() {
            let mut sources = Vec::with_capacity(block.choices.len());
            for choice in &block.choices {
                let index = match choice.input {
                    InputRef::External(j) => j,
                    InputRef::Block(k) if k < b => num_external + k,
                    InputRef::Block(k) => {
                        return Err(KolosalError::ConfigError(format!(
                            "Block {} cannot read block {}",
                            b, k
                        )))
                    }
                };
                sources.push(index);
            }
            wiring.push(sources);
        }

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let num_cells = num_cells.max(1);
        let cells = (0..num_cells)
            .map(|_| {
                arch.blocks
                    .iter()
                    .map(|block| {
                        block
                            .choices
                            .iter()
                            .map(|choice| OpLayer::new(choice.op, &mut rng))
                            .collect()
                    })
                    .collect()
            })
            .collect();

        let scale = (2.0 / (shape.num_features + shape.num_classes) as f64).sqrt();
        let weights = Array2::from_shape_fn((shape.num_features, shape.num_classes), |_| {
            rng.gen::<f64>() * 2.0 * scale - scale
        });

        Ok(Self {
            wiring,
            num_external,
            cells,
            weights,
            bias: Array1::zeros(shape.num_classes),
            num_features: shape.num_features,
            num_classes: shape.num_classes,
            rng,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Total trainable weights
    pub fn num_params(&self) -> usize {
        let ops: usize = self
            .cells
            .iter()
            .flat_map(|cell| cell.iter().flat_map(|block| block.iter()))
            .map(OpLayer::num_params)
            .sum();
        ops + self.weights.len() + self.bias.len()
    }

    /// Class probabilities for each row
    pub fn predict_proba(&self, x: &Array2<f64>) -> Array2<f64> {
        self.forward(x).probs
    }

    /// History index of external input `j` of cell `cell`; lookbacks past
    /// the first cell read the network input
    fn external_source(cell: usize, j: usize) -> usize {
        cell.saturating_sub(j)
    }

    fn forward(&self, x: &Array2<f64>) -> ForwardTrace {
        let mut history = vec![x.clone()];
        let mut caches = Vec::with_capacity(self.cells.len());

        for (c, cell) in self.cells.iter().enumerate() {
            let mut states: Vec<Array2<f64>> = (0..self.num_external)
                .map(|j| history[Self::external_source(c, j)].clone())
                .collect();
            let mut cell_caches = Vec::with_capacity(cell.len());

            for (layers, sources) in cell.iter().zip(&self.wiring) {
                let mut out = Array2::zeros(x.raw_dim());
                let mut block_caches = Vec::with_capacity(layers.len());
                for (layer, &src) in layers.iter().zip(sources) {
                    let (y, cache) = layer.forward(&states[src]);
                    out += &y;
                    block_caches.push(cache);
                }
                states.push(out);
                cell_caches.push(block_caches);
            }

            let output = if self.wiring.is_empty() {
                states.swap_remove(0)
            } else {
                let blocks = &states[self.num_external..];
                let mut sum = Array2::zeros(x.raw_dim());
                for block in blocks {
                    sum += block;
                }
                sum / blocks.len() as f64
            };
            history.push(output);
            caches.push(cell_caches);
        }

        let features = &history[history.len() - 1];
        let logits = features.dot(&self.weights) + &self.bias;
        ForwardTrace {
            probs: softmax_rows(&logits),
            history,
            caches,
        }
    }

    fn backward(&self, trace: &ForwardTrace, y: &Array1<usize>) -> NetworkGrads {
        let n = y.len().max(1) as f64;
        let num_cells = self.cells.len();
        let num_blocks = self.wiring.len();

        let mut delta = trace.probs.clone();
        for (i, &label) in y.iter().enumerate() {
            delta[[i, label]] -= 1.0;
        }
        delta /= n;

        let weights = trace.history[num_cells].t().dot(&delta);
        let bias = delta.sum_axis(Axis(0));

        let mut dhistory: Vec<Array2<f64>> = trace
            .history
            .iter()
            .map(|h| Array2::zeros(h.raw_dim()))
            .collect();
        dhistory[num_cells] = delta.dot(&self.weights.t());

        let mut ops = vec![Vec::new(); num_cells];
        for c in (0..num_cells).rev() {
            let dout = dhistory[c + 1].clone();
            let mut dstates: Vec<Array2<f64>> = (0..self.num_external + num_blocks)
                .map(|_| Array2::zeros(dout.raw_dim()))
                .collect();

            if num_blocks == 0 {
                dstates[0] += &dout;
            } else {
                let share = &dout / num_blocks as f64;
                for b in 0..num_blocks {
                    dstates[self.num_external + b] += &share;
                }
            }

            let mut cell_grads: Vec<Vec<OpGrad>> = vec![Vec::new(); num_blocks];
            for b in (0..num_blocks).rev() {
                let d = dstates[self.num_external + b].clone();
                for (i, (layer, &src)) in self.cells[c][b].iter().zip(&self.wiring[b]).enumerate() {
                    let (dx, grad) = layer.backward(&trace.caches[c][b][i], &d);
                    dstates[src] += &dx;
                    cell_grads[b].push(grad);
                }
            }

            for (j, dstate) in dstates.iter().take(self.num_external).enumerate() {
                dhistory[Self::external_source(c, j)] += dstate;
            }
            ops[c] = cell_grads;
        }

        NetworkGrads { ops, weights, bias }
    }

    fn apply(&mut self, grads: &NetworkGrads, learning_rate: f64) {
        for (cell, cell_grads) in self.cells.iter_mut().zip(&grads.ops) {
            for (block, block_grads) in cell.iter_mut().zip(cell_grads) {
                for (layer, grad) in block.iter_mut().zip(block_grads) {
                    layer.apply(grad, learning_rate);
                }
            }
        }
        self.weights.scaled_add(-learning_rate, &grads.weights);
        self.bias.scaled_add(-learning_rate, &grads.bias);
    }

    fn check_inputs(&self, x: &ArrayView2<f64>, y: &ArrayView1<usize>) -> Result<()> {
        if x.nrows() != y.len() {
            return Err(KolosalError::ShapeError {
                expected: format!("{} labels", x.nrows()),
                actual: format!("{} labels", y.len()),
            });
        }
        if x.ncols() != self.num_features {
            return Err(KolosalError::ShapeError {
                expected: format!("{} features", self.num_features),
                actual: format!("{} features", x.ncols()),
            });
        }
        if x.nrows() == 0 {
            return Err(KolosalError::DataError("Empty split".into()));
        }
        if let Some(&label) = y.iter().find(|&&l| l >= self.num_classes) {
            return Err(KolosalError::DataError(format!(
                "Label {} outside {} classes",
                label, self.num_classes
            )));
        }
        Ok(())
    }
}

impl TrainableModel for CellNetwork {
    fn train(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<usize>,
        budget: &TrainingBudget,
    ) -> Result<TrainingHistory> {
        self.check_inputs(&x, &y)?;
        let n = x.nrows();
        let mut indices: Vec<usize> = (0..n).collect();
        let mut history = TrainingHistory::default();

        for epoch in 0..budget.epochs {
            indices.shuffle(&mut self.rng);
            let mut total = 0.0;

            for batch in indices.chunks(budget.batch_size.max(1)) {
                let x_batch = x.select(Axis(0), batch);
                let y_batch = y.select(Axis(0), batch);

                let trace = self.forward(&x_batch);
                let loss = cross_entropy(&trace.probs, &y_batch);
                if !loss.is_finite() {
                    return Err(KolosalError::CandidateTraining(format!(
                        "Non-finite loss in epoch {}",
                        epoch + 1
                    )));
                }
                total += loss * batch.len() as f64;

                let grads = self.backward(&trace, &y_batch);
                self.apply(&grads, budget.learning_rate);
            }

            let epoch_loss = total / n as f64;
            debug!(epoch = epoch + 1, loss = epoch_loss, "Child epoch complete");
            history.epoch_losses.push(epoch_loss);
        }

        Ok(history)
    }

    fn evaluate(&self, x: ArrayView2<f64>, y: ArrayView1<usize>) -> Result<f64> {
        self.check_inputs(&x, &y)?;
        let n = x.nrows();
        let mut correct = 0usize;

        for start in (0..n).step_by(EVAL_CHUNK) {
            let end = (start + EVAL_CHUNK).min(n);
            let probs = self.predict_proba(&x.slice(s![start..end, ..]).to_owned());
            correct += probs
                .rows()
                .into_iter()
                .zip(y.slice(s![start..end]).iter())
                .filter(|(row, &label)| argmax(row.iter()) == label)
                .count();
        }

        Ok(correct as f64 / n as f64)
    }
}

fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut result = logits.clone();
    for mut row in result.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exp_sum: f64 = row.iter().map(|&v| (v - max).exp()).sum();
        for v in row.iter_mut() {
            *v = (*v - max).exp() / exp_sum;
        }
    }
    result
}

/// Mean negative log-likelihood; NaN probabilities stay NaN
fn cross_entropy(probs: &Array2<f64>, y: &Array1<usize>) -> f64 {
    let total: f64 = y
        .iter()
        .enumerate()
        .map(|(i, &label)| -(probs[[i, label]] + 1e-12).ln())
        .sum();
    total / y.len().max(1) as f64
}

fn argmax<'a>(values: impl Iterator<Item = &'a f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, &v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::{Block, BlockChoice, Operator};
    use crate::utils::data_loader::Dataset;

    fn block(index: usize, choices: &[(InputRef, Operator)]) -> Block {
        Block {
            index,
            choices: choices
                .iter()
                .map(|&(input, op)| BlockChoice { input, op })
                .collect(),
        }
    }

    fn two_block_cell() -> CellArchitecture {
        CellArchitecture {
            blocks: vec![
                block(
                    0,
                    &[
                        (InputRef::External(0), Operator::DepthwiseConv { kernel: 3 }),
                        (InputRef::External(1), Operator::MaxPool { width: 3 }),
                    ],
                ),
                block(
                    1,
                    &[
                        (InputRef::Block(0), Operator::FactorizedConv { kernel: 3 }),
                        (InputRef::External(0), Operator::AvgPool { width: 3 }),
                    ],
                ),
            ],
        }
    }

    fn budget(epochs: usize, batch_size: usize, learning_rate: f64) -> TrainingBudget {
        TrainingBudget {
            epochs,
            batch_size,
            learning_rate,
        }
    }

    #[test]
    fn test_train_and_evaluate() {
        let data = Dataset::synthetic(60, 20, 16, 3, 5);
        let mut net = CellNetwork::new(&two_block_cell(), &data.shape(), 2, 11).unwrap();
        let history = net
            .train(data.x_train.view(), data.y_train.view(), &budget(3, 16, 0.05))
            .unwrap();
        assert_eq!(history.epoch_losses.len(), 3);
        assert!(history.is_finite());

        let accuracy = net.evaluate(data.x_val.view(), data.y_val.view()).unwrap();
        assert!((0.0..=1.0).contains(&accuracy));
    }

    #[test]
    fn test_identity_cell_loss_decreases() {
        let data = Dataset::synthetic(60, 20, 16, 2, 9);
        let arch = CellArchitecture {
            blocks: vec![block(0, &[(InputRef::External(0), Operator::Identity)])],
        };
        let mut net = CellNetwork::new(&arch, &data.shape(), 1, 3).unwrap();
        let history = net
            .train(data.x_train.view(), data.y_train.view(), &budget(20, 60, 0.1))
            .unwrap();
        let first = history.epoch_losses[0];
        let last = history.final_loss().unwrap();
        assert!(last < first, "loss went from {} to {}", first, last);
    }

    #[test]
    fn test_classifier_gradient_matches_finite_difference() {
        let data = Dataset::synthetic(12, 4, 8, 2, 2);
        let net = CellNetwork::new(&two_block_cell(), &data.shape(), 1, 4).unwrap();
        let y = data.y_train.clone();

        let trace = net.forward(&data.x_train);
        let grads = net.backward(&trace, &y);

        let eps = 1e-6;
        let mut bumped = net.clone();
        bumped.weights[[3, 1]] += eps;
        let numeric = (cross_entropy(&bumped.forward(&data.x_train).probs, &y)
            - cross_entropy(&trace.probs, &y))
            / eps;
        assert!((numeric - grads.weights[[3, 1]]).abs() < 1e-4);
    }

    #[test]
    fn test_forward_reference_rejected() {
        let arch = CellArchitecture {
            blocks: vec![block(0, &[(InputRef::Block(0), Operator::Identity)])],
        };
        let shape = DatasetShape {
            num_features: 4,
            num_classes: 2,
        };
        assert!(matches!(
            CellNetwork::new(&arch, &shape, 1, 0),
            Err(KolosalError::ConfigError(_))
        ));
    }

    #[test]
    fn test_empty_cell_is_passthrough() {
        let data = Dataset::synthetic(10, 4, 6, 2, 1);
        let mut net = CellNetwork::new(&CellArchitecture::default(), &data.shape(), 3, 0).unwrap();
        assert_eq!(net.num_params(), 6 * 2 + 2);
        let history = net
            .train(data.x_train.view(), data.y_train.view(), &budget(1, 4, 0.01))
            .unwrap();
        assert!(history.is_finite());
    }

    #[test]
    fn test_non_finite_input_fails_training() {
        let mut data = Dataset::synthetic(10, 4, 6, 2, 1);
        data.x_train[[0, 0]] = f64::NAN;
        let mut net = CellNetwork::new(&two_block_cell(), &data.shape(), 1, 0).unwrap();
        assert!(matches!(
            net.train(data.x_train.view(), data.y_train.view(), &budget(1, 64, 0.01)),
            Err(KolosalError::CandidateTraining(_))
        ));
    }

    #[test]
    fn test_feature_mismatch() {
        let data = Dataset::synthetic(10, 4, 6, 2, 1);
        let shape = DatasetShape {
            num_features: 5,
            num_classes: 2,
        };
        let net = CellNetwork::new(&two_block_cell(), &shape, 1, 0).unwrap();
        assert!(matches!(
            net.evaluate(data.x_val.view(), data.y_val.view()),
            Err(KolosalError::ShapeError { .. })
        ));
    }

    #[test]
    fn test_builder_is_seed_deterministic() {
        let data = Dataset::synthetic(20, 8, 8, 2, 3);
        let builder = CellNetworkBuilder::new(1);
        let score = |seed: u64| {
            let mut model = builder.build(&two_block_cell(), &data.shape(), seed).unwrap();
            model
                .train(data.x_train.view(), data.y_train.view(), &budget(2, 8, 0.05))
                .unwrap()
                .final_loss()
                .unwrap()
        };
        assert_eq!(score(42), score(42));
    }
}
