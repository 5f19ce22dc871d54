//! Cell operators over 1-D signals
//!
//! Every operator maps a `(batch, length)` array to one of the same shape
//! ("same" padding, stride 1), so block outputs can be summed freely.

use ndarray::{Array1, Array2};
use rand::Rng;

use crate::nas::Operator;

/// Same-padded 1-D convolution shared across the batch
pub fn conv1d_same(x: &Array2<f64>, kernel: &Array1<f64>, bias: f64) -> Array2<f64> {
    let len = x.ncols() as isize;
    let pad = (kernel.len() / 2) as isize;
    let mut out = Array2::from_elem(x.raw_dim(), bias);

    for (j, &w) in kernel.iter().enumerate() {
        let offset = j as isize - pad;
        for t in 0..len {
            let src = t + offset;
            if src >= 0 && src < len {
                out.column_mut(t as usize).scaled_add(w, &x.column(src as usize));
            }
        }
    }
    out
}

/// Gradients of [`conv1d_same`]: (input, kernel, bias)
pub fn conv1d_same_backward(
    x: &Array2<f64>,
    kernel: &Array1<f64>,
    dout: &Array2<f64>,
) -> (Array2<f64>, Array1<f64>, f64) {
    let len = x.ncols() as isize;
    let pad = (kernel.len() / 2) as isize;
    let mut dx = Array2::zeros(x.raw_dim());
    let mut dkernel = Array1::zeros(kernel.len());

    for (j, &w) in kernel.iter().enumerate() {
        let offset = j as isize - pad;
        for t in 0..len {
            let src = t + offset;
            if src >= 0 && src < len {
                let dcol = dout.column(t as usize);
                dkernel[j] += dcol.dot(&x.column(src as usize));
                dx.column_mut(src as usize).scaled_add(w, &dcol);
            }
        }
    }
    (dx, dkernel, dout.sum())
}

fn window(t: usize, width: usize, len: usize) -> std::ops::Range<usize> {
    let half = width / 2;
    t.saturating_sub(half)..(t + half + 1).min(len)
}

/// Max pooling; also returns the source column of each output
pub fn max_pool1d(x: &Array2<f64>, width: usize) -> (Array2<f64>, Array2<usize>) {
    let (n, len) = x.dim();
    let mut out = Array2::zeros((n, len));
    let mut argmax = Array2::zeros((n, len));

    for i in 0..n {
        for t in 0..len {
            let mut best = t;
            for s in window(t, width, len) {
                if x[[i, s]] > x[[i, best]] {
                    best = s;
                }
            }
            out[[i, t]] = x[[i, best]];
            argmax[[i, t]] = best;
        }
    }
    (out, argmax)
}

/// Route gradients back to the max positions
pub fn max_pool1d_backward(dout: &Array2<f64>, argmax: &Array2<usize>) -> Array2<f64> {
    let mut dx = Array2::zeros(dout.raw_dim());
    for ((i, t), &g) in dout.indexed_iter() {
        dx[[i, argmax[[i, t]]]] += g;
    }
    dx
}

/// Average pooling over the valid part of each window
pub fn avg_pool1d(x: &Array2<f64>, width: usize) -> Array2<f64> {
    let len = x.ncols();
    let mut out = Array2::zeros(x.raw_dim());
    for t in 0..len {
        let w = window(t, width, len);
        let count = w.len() as f64;
        for s in w {
            out.column_mut(t).scaled_add(1.0 / count, &x.column(s));
        }
    }
    out
}

/// Gradient of [`avg_pool1d`]
pub fn avg_pool1d_backward(dout: &Array2<f64>, width: usize) -> Array2<f64> {
    let len = dout.ncols();
    let mut dx = Array2::zeros(dout.raw_dim());
    for t in 0..len {
        let w = window(t, width, len);
        let count = w.len() as f64;
        for s in w {
            dx.column_mut(s).scaled_add(1.0 / count, &dout.column(t));
        }
    }
    dx
}

/// Values saved by a forward pass
#[derive(Debug, Clone)]
pub struct OpCache {
    /// Input of each convolution layer
    layer_inputs: Vec<Array2<f64>>,
    /// Post-activation output of a convolution chain
    output: Option<Array2<f64>>,
    argmax: Option<Array2<usize>>,
}

/// Gradients of an [`OpLayer`]
#[derive(Debug, Clone)]
pub struct OpGrad {
    kernels: Vec<Array1<f64>>,
    biases: Vec<f64>,
}

/// An operator instance with its own weights
#[derive(Debug, Clone)]
pub struct OpLayer {
    op: Operator,
    kernels: Vec<Array1<f64>>,
    biases: Vec<f64>,
}

impl OpLayer {
    /// Fresh layer with randomly initialised kernels
    pub fn new(op: Operator, rng: &mut impl Rng) -> Self {
        let widths: Vec<usize> = match op {
            Operator::DepthwiseConv { kernel } => vec![kernel],
            Operator::FactorizedConv { kernel } => vec![kernel, kernel],
            _ => Vec::new(),
        };

        let kernels = widths
            .iter()
            .map(|&k| {
                let scale = (2.0 / (k + 1) as f64).sqrt();
                (0..k).map(|_| rng.gen::<f64>() * 2.0 * scale - scale).collect()
            })
            .collect();

        Self {
            op,
            kernels,
            biases: vec![0.0; widths.len()],
        }
    }

    /// Number of trainable weights
    pub fn num_params(&self) -> usize {
        self.kernels.iter().map(|k| k.len() + 1).sum()
    }

    pub fn forward(&self, x: &Array2<f64>) -> (Array2<f64>, OpCache) {
        let mut cache = OpCache {
            layer_inputs: Vec::new(),
            output: None,
            argmax: None,
        };

        let out = match self.op {
            Operator::DepthwiseConv { .. } | Operator::FactorizedConv { .. } => {
                let mut h = x.clone();
                for (kernel, &bias) in self.kernels.iter().zip(self.biases.iter()) {
                    let next = conv1d_same(&h, kernel, bias);
                    cache.layer_inputs.push(h);
                    h = next;
                }
                let activated = h.mapv(|v| v.max(0.0));
                cache.output = Some(activated.clone());
                activated
            }
            Operator::MaxPool { width } => {
                let (out, argmax) = max_pool1d(x, width);
                cache.argmax = Some(argmax);
                out
            }
            Operator::AvgPool { width } => avg_pool1d(x, width),
            Operator::Identity => x.clone(),
        };
        (out, cache)
    }

    /// Returns the input gradient and the weight gradients
    pub fn backward(&self, cache: &OpCache, dout: &Array2<f64>) -> (Array2<f64>, OpGrad) {
        let mut grad = OpGrad {
            kernels: self.kernels.iter().map(|k| Array1::zeros(k.len())).collect(),
            biases: vec![0.0; self.biases.len()],
        };

        let dx = match (self.op, cache.output.as_ref(), cache.argmax.as_ref()) {
            (Operator::DepthwiseConv { .. } | Operator::FactorizedConv { .. }, Some(output), _) => {
                let mut d = dout * &output.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                for i in (0..self.kernels.len()).rev() {
                    let (dx, dk, db) = conv1d_same_backward(&cache.layer_inputs[i], &self.kernels[i], &d);
                    grad.kernels[i] = dk;
                    grad.biases[i] = db;
                    d = dx;
                }
                d
            }
            (Operator::MaxPool { .. }, _, Some(argmax)) => max_pool1d_backward(dout, argmax),
            (Operator::AvgPool { width }, _, _) => avg_pool1d_backward(dout, width),
            _ => dout.clone(),
        };
        (dx, grad)
    }

    /// SGD update
    pub fn apply(&mut self, grad: &OpGrad, learning_rate: f64) {
        for (k, g) in self.kernels.iter_mut().zip(grad.kernels.iter()) {
            k.scaled_add(-learning_rate, g);
        }
        for (b, g) in self.biases.iter_mut().zip(grad.biases.iter()) {
            *b -= learning_rate * g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn signal() -> Array2<f64> {
        Array2::from_shape_vec((2, 5), vec![1.0, 3.0, 2.0, 0.0, 4.0, -1.0, 0.5, 2.0, 1.0, 0.0]).unwrap()
    }

    #[test]
    fn test_conv_identity_kernel() {
        let x = signal();
        let kernel = Array1::from_vec(vec![0.0, 1.0, 0.0]);
        let out = conv1d_same(&x, &kernel, 0.5);
        assert_eq!(out, &x + 0.5);
    }

    #[test]
    fn test_conv_kernel_gradient_matches_finite_difference() {
        let x = signal();
        let kernel = Array1::from_vec(vec![0.2, -0.4, 0.7]);
        let dout = Array2::ones(x.raw_dim());
        let (_, dk, db) = conv1d_same_backward(&x, &kernel, &dout);

        let eps = 1e-6;
        for j in 0..kernel.len() {
            let mut bumped = kernel.clone();
            bumped[j] += eps;
            let numeric = (conv1d_same(&x, &bumped, 0.0).sum() - conv1d_same(&x, &kernel, 0.0).sum()) / eps;
            assert!((numeric - dk[j]).abs() < 1e-4, "kernel {}: {} vs {}", j, numeric, dk[j]);
        }
        assert_eq!(db, 10.0);
    }

    #[test]
    fn test_max_pool() {
        let (out, argmax) = max_pool1d(&signal(), 3);
        assert_eq!(out.row(0).to_vec(), vec![3.0, 3.0, 3.0, 4.0, 4.0]);
        let dx = max_pool1d_backward(&Array2::ones((2, 5)), &argmax);
        assert_eq!(dx.row(0).to_vec(), vec![0.0, 3.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_avg_pool_edges() {
        let out = avg_pool1d(&signal(), 3);
        assert!((out[[0, 0]] - 2.0).abs() < 1e-12);
        assert!((out[[0, 2]] - 5.0 / 3.0).abs() < 1e-12);
        let dx = avg_pool1d_backward(&Array2::ones((2, 5)), 3);
        // Total gradient mass is preserved
        assert!((dx.sum() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_op_layer_shapes() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        for op in Operator::default_catalog() {
            let layer = OpLayer::new(op, &mut rng);
            let (out, cache) = layer.forward(&signal());
            assert_eq!(out.dim(), (2, 5));
            let (dx, _) = layer.backward(&cache, &Array2::ones((2, 5)));
            assert_eq!(dx.dim(), (2, 5));
        }
        assert_eq!(OpLayer::new(Operator::FactorizedConv { kernel: 7 }, &mut rng).num_params(), 16);
        assert_eq!(OpLayer::new(Operator::MaxPool { width: 3 }, &mut rng).num_params(), 0);
    }
}
