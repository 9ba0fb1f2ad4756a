//! MADE-style masked linear layers.
//!
//! Masks enforce the autoregressive constraint structurally: under a chosen
//! permutation, the network outputs for dimension *i* may only depend on
//! input dimensions that come before *i* in the permutation (and on the
//! conditioning context, which every output may see).

use std::cell::RefCell;

use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};

use super::activation::Activation;

/// Degrees assigned to hidden units: evenly spaced over the allowed range,
/// rounded to the nearest integer.
///
/// Without a context the degrees run over `1..=input_dim-1` (a unit of
/// degree `k` may read inputs of degree ≤ `k` and feeds outputs of degree
/// > `k`). With a context, degree 0 units are included so that every output
/// can read the conditioning variables.
pub fn hidden_degrees(input_dim: usize, hidden_dim: usize, conditional: bool) -> Vec<usize> {
    let (lo, hi) = if conditional {
        (0.0, (input_dim.max(1) - 1) as f64)
    } else {
        (1.0, input_dim.saturating_sub(1).max(1) as f64)
    };
    (0..hidden_dim)
        .map(|j| {
            let t = if hidden_dim > 1 {
                j as f64 / (hidden_dim - 1) as f64
            } else {
                0.0
            };
            (lo + t * (hi - lo)).round() as usize
        })
        .collect()
}

/// Build the `(in, out)` connectivity masks for every layer of a MADE
/// network.
///
/// Input columns are ordered `[context, data]`; context columns carry degree
/// 0, data dimension `d` carries degree `rank(d) + 1` where `rank` is the
/// position of `d` in `permutation`. The output layer is laid out
/// block-major: `multiplier` blocks of `input_dim` columns, each block
/// repeating the data degrees, so that block `k` holds parameter `k` for
/// every dimension.
pub fn build_masks(
    input_dim: usize,
    context_dim: usize,
    hidden_dims: &[usize],
    permutation: &[usize],
    multiplier: usize,
) -> Vec<Array2<f64>> {
    let mut rank = vec![0usize; input_dim];
    for (pos, &dim) in permutation.iter().enumerate() {
        rank[dim] = pos;
    }

    let mut input_deg = Vec::with_capacity(context_dim + input_dim);
    input_deg.extend(std::iter::repeat(0usize).take(context_dim));
    input_deg.extend((0..input_dim).map(|d| rank[d] + 1));

    let output_deg: Vec<usize> = (0..multiplier)
        .flat_map(|_| (0..input_dim).map(|d| rank[d] + 1))
        .collect();

    let hidden: Vec<Vec<usize>> = hidden_dims
        .iter()
        .map(|&h| hidden_degrees(input_dim, h, context_dim > 0))
        .collect();

    let mut masks = Vec::with_capacity(hidden.len() + 1);
    let mut prev = input_deg;
    for degrees in &hidden {
        let mask = Array2::from_shape_fn((prev.len(), degrees.len()), |(i, j)| {
            if degrees[j] >= prev[i] {
                1.0
            } else {
                0.0
            }
        });
        masks.push(mask);
        prev = degrees.clone();
    }
    // Output connections are strict: an output of degree k may only read
    // units of degree < k, which excludes its own dimension.
    let mask = Array2::from_shape_fn((prev.len(), output_deg.len()), |(i, j)| {
        if output_deg[j] > prev[i] {
            1.0
        } else {
            0.0
        }
    });
    masks.push(mask);
    masks
}

/// Cached forward state needed by the backward pass.
#[derive(Debug)]
struct LayerCache {
    input: Array2<f64>,
    preact: Array2<f64>,
}

/// Gradients of a layer's parameters for one backward pass.
#[derive(Debug, Clone)]
pub struct LayerGrads {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

/// A linear layer whose weight matrix is elementwise-masked, with an
/// explicit backward pass.
///
/// Weights are `(in, out)`; the mask has the same shape and is applied on
/// every use, so masked connections carry no signal and receive no
/// gradient.
#[derive(Debug, Serialize, Deserialize)]
pub struct MaskedLinear {
    weights: Array2<f64>,
    bias: Array1<f64>,
    mask: Array2<f64>,
    activation: Activation,
    #[serde(skip)]
    cache: RefCell<Option<LayerCache>>,
}

impl MaskedLinear {
    /// Xavier-initialized masked layer.
    pub fn new(in_features: usize, out_features: usize, mask: Array2<f64>, activation: Activation) -> Self {
        debug_assert_eq!(mask.dim(), (in_features, out_features));
        let limit = (6.0 / (in_features + out_features) as f64).sqrt();
        let weights = Array2::random((in_features, out_features), Uniform::new(-limit, limit));
        let bias = Array1::zeros(out_features);
        MaskedLinear {
            weights,
            bias,
            mask,
            activation,
            cache: RefCell::new(None),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weights.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weights.ncols()
    }

    pub fn mask(&self) -> &Array2<f64> {
        &self.mask
    }

    /// Forward pass over a `(batch, in)` matrix, caching the state needed
    /// for `backward`.
    pub fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        let masked = &self.weights * &self.mask;
        let preact = x.dot(&masked) + &self.bias;
        let out = self.activation.forward_batch(&preact);
        *self.cache.borrow_mut() = Some(LayerCache {
            input: x.clone(),
            preact,
        });
        out
    }

    /// Backward pass given the gradient with respect to this layer's
    /// output. Returns the gradient with respect to the input plus the
    /// parameter gradients.
    pub fn backward(&self, grad_output: &Array2<f64>) -> (Array2<f64>, LayerGrads) {
        let cache = self.cache.borrow();
        let cache = cache
            .as_ref()
            .expect("forward must run before backward");

        let delta = grad_output * &self.activation.derivative_batch(&cache.preact);
        let masked = &self.weights * &self.mask;
        let weight_grad = cache.input.t().dot(&delta) * &self.mask;
        let bias_grad = delta.sum_axis(ndarray::Axis(0));
        let input_grad = delta.dot(&masked.t());

        (
            input_grad,
            LayerGrads {
                weights: weight_grad,
                bias: bias_grad,
            },
        )
    }

    pub fn weights_mut(&mut self) -> &mut Array2<f64> {
        &mut self.weights
    }

    pub fn bias_mut(&mut self) -> &mut Array1<f64> {
        &mut self.bias
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    /// Flat parameter vector, weights row-major then bias.
    pub fn parameters(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.num_parameters());
        out.extend(self.weights.iter().cloned());
        out.extend(self.bias.iter().cloned());
        out
    }

    pub fn set_parameters(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.num_parameters());
        let w_len = self.weights.len();
        for (w, &v) in self.weights.iter_mut().zip(&values[..w_len]) {
            *w = v;
        }
        for (b, &v) in self.bias.iter_mut().zip(&values[w_len..]) {
            *b = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_hidden_degrees_range() {
        let degs = hidden_degrees(4, 8, false);
        assert_eq!(degs.len(), 8);
        assert!(degs.iter().all(|&d| (1..=3).contains(&d)));
        assert_eq!(degs[0], 1);
        assert_eq!(degs[7], 3);
    }

    #[test]
    fn test_masks_enforce_autoregressive_order() {
        let perm = vec![0usize, 1, 2];
        let masks = build_masks(3, 0, &[8], &perm, 2);
        assert_eq!(masks.len(), 2);

        // Composite input->output connectivity must be strictly lower
        // triangular in permutation order, for every parameter block.
        let reach = masks[0].dot(&masks[1]);
        for i in 0..3 {
            for block in 0..2 {
                for j in 0..3 {
                    let col = block * 3 + j;
                    if j <= i {
                        assert_abs_diff_eq!(reach[[i, col]], 0.0, epsilon = 1e-12);
                    }
                }
            }
        }
        // The last dimension in the ordering must be able to see the first.
        assert!(reach[[0, 2]] > 0.0);
    }

    #[test]
    fn test_masks_with_context_reach_all_outputs() {
        let perm = vec![1usize, 0];
        let masks = build_masks(2, 3, &[8], &perm, 2);
        let reach = masks[0].dot(&masks[1]);
        // Context rows are the first three; they must connect to every
        // output column.
        for i in 0..3 {
            for col in 0..4 {
                assert!(reach[[i, col]] > 0.0);
            }
        }
    }

    #[test]
    fn test_masked_linear_backward_matches_finite_differences() {
        let mask = Array2::from_elem((3, 2), 1.0);
        let mut layer = MaskedLinear::new(3, 2, mask, Activation::ReLU);
        let x = ndarray::arr2(&[[0.3, -0.2, 0.5], [1.0, 0.4, -0.7]]);

        // Scalar loss: sum of outputs.
        let out = layer.forward(&x);
        let grad_out = Array2::from_elem(out.dim(), 1.0);
        let (_, grads) = layer.backward(&grad_out);

        let eps = 1e-6;
        let mut params = layer.parameters();
        for k in 0..params.len() {
            let orig = params[k];
            params[k] = orig + eps;
            layer.set_parameters(&params);
            let up = layer.forward(&x).sum();
            params[k] = orig - eps;
            layer.set_parameters(&params);
            let down = layer.forward(&x).sum();
            params[k] = orig;
            layer.set_parameters(&params);

            let numeric = (up - down) / (2.0 * eps);
            let analytic = if k < grads.weights.len() {
                grads.weights.as_slice().unwrap()[k]
            } else {
                grads.bias[k - grads.weights.len()]
            };
            assert_abs_diff_eq!(numeric, analytic, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_masked_connection_gets_no_gradient() {
        let mut mask = Array2::from_elem((2, 2), 1.0);
        mask[[1, 0]] = 0.0;
        let layer = MaskedLinear::new(2, 2, mask, Activation::Identity);
        let x = ndarray::arr2(&[[1.0, 2.0]]);
        let out = layer.forward(&x);
        let (_, grads) = layer.backward(&Array2::from_elem(out.dim(), 1.0));
        assert_abs_diff_eq!(grads.weights[[1, 0]], 0.0, epsilon = 1e-12);
    }
}
