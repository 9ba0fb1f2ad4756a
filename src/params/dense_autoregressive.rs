//! Dense masked-autoregressive hypernetwork.

use std::cell::Cell;

use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::Parameters;
use crate::error::{FlowError, Result};
use crate::lazy::LazyParameters;
use crate::nn::{build_masks, Activation, LayerGrads, MaskedLinear, Optimizer};

/// MADE network mapping an input vector to one parameter vector per
/// declared shape, under the autoregressive constraint: parameters for
/// dimension *i* depend only on input dimensions earlier than *i* in the
/// permutation (and on the context, if any).
#[derive(Debug, Serialize, Deserialize)]
pub struct DenseAutoregressive {
    input_shape: Vec<usize>,
    param_shapes: Vec<Vec<usize>>,
    context_size: usize,
    hidden_dims: Vec<usize>,
    permutation: Vec<usize>,
    output_multiplier: usize,
    layers: Vec<MaskedLinear>,
    #[serde(skip)]
    evals: Cell<usize>,
}

impl DenseAutoregressive {
    fn build(
        config: &DenseAutoregressiveConfig,
        input_shape: &[usize],
        param_shapes: &[Vec<usize>],
        context_size: usize,
    ) -> Result<Self> {
        let input_dim = input_shape.iter().product::<usize>().max(1);
        if input_dim == 1 {
            tracing::warn!(
                "autoregressive provider over a single dimension; an elementwise affine is cheaper"
            );
        }
        if config.hidden_dims.is_empty() {
            return Err(FlowError::config("hidden_dims must not be empty"));
        }
        // The masking scheme cannot route every required connection through
        // a layer narrower than the input.
        for &h in &config.hidden_dims {
            if h < input_dim {
                return Err(FlowError::shape(format!(
                    "hidden dimension {} is smaller than input dimension {}",
                    h, input_dim
                )));
            }
        }
        if param_shapes.is_empty() {
            return Err(FlowError::config("no parameter shapes declared"));
        }
        for shape in param_shapes {
            let len = shape.iter().product::<usize>().max(1);
            if len != input_dim {
                return Err(FlowError::shape(format!(
                    "parameter shape {:?} does not match event size {}",
                    shape, input_dim
                )));
            }
        }

        let permutation = match &config.permutation {
            Some(perm) => {
                let mut seen = vec![false; input_dim];
                if perm.len() != input_dim
                    || perm.iter().any(|&d| d >= input_dim || std::mem::replace(&mut seen[d], true))
                {
                    return Err(FlowError::config(format!(
                        "permutation {:?} is not a permutation of 0..{}",
                        perm, input_dim
                    )));
                }
                perm.clone()
            }
            None => {
                // Random order helps mixing when several layers are stacked.
                let mut perm: Vec<usize> = (0..input_dim).collect();
                perm.shuffle(&mut rand::thread_rng());
                perm
            }
        };

        let output_multiplier = param_shapes.len();
        let masks = build_masks(
            input_dim,
            context_size,
            &config.hidden_dims,
            &permutation,
            output_multiplier,
        );

        let mut layers = Vec::with_capacity(masks.len());
        let mut in_features = context_size + input_dim;
        for (i, mask) in masks.into_iter().enumerate() {
            let out_features = mask.ncols();
            let activation = if i + 1 == config.hidden_dims.len() + 1 {
                Activation::Identity
            } else {
                Activation::ReLU
            };
            layers.push(MaskedLinear::new(in_features, out_features, mask, activation));
            in_features = out_features;
        }

        Ok(DenseAutoregressive {
            input_shape: input_shape.to_vec(),
            param_shapes: param_shapes.to_vec(),
            context_size,
            hidden_dims: config.hidden_dims.clone(),
            permutation,
            output_multiplier,
            layers,
            evals: Cell::new(0),
        })
    }

    fn input_dim(&self) -> usize {
        self.input_shape.iter().product::<usize>().max(1)
    }

    /// The dimension ordering used by the masks. Inversion must fill
    /// dimensions in exactly this order.
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn reset_evaluations(&self) {
        self.evals.set(0);
    }

    fn assemble_input(
        &self,
        x: &Array2<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<Array2<f64>> {
        let input_dim = self.input_dim();
        if x.ncols() != input_dim {
            return Err(FlowError::shape(format!(
                "provider built for inputs of size {}, got {}",
                input_dim,
                x.ncols()
            )));
        }
        match (self.context_size, context) {
            (0, None) => Ok(x.clone()),
            (0, Some(_)) => Err(FlowError::shape(
                "provider built without context, but one was supplied",
            )),
            (n, Some(ctx)) if ctx.len() == n => {
                let batch = x.nrows();
                let ctx_block = Array2::from_shape_fn((batch, n), |(_, j)| ctx[j]);
                ndarray::concatenate(Axis(1), &[ctx_block.view(), x.view()])
                    .map_err(|e| FlowError::shape(format!("cannot prepend context: {}", e)))
            }
            (n, Some(ctx)) => Err(FlowError::shape(format!(
                "context of size {} expected, got {}",
                n,
                ctx.len()
            ))),
            (n, None) => Err(FlowError::shape(format!(
                "provider requires a context of size {}",
                n
            ))),
        }
    }

    /// Backward pass: gradients with respect to each declared parameter
    /// tensor (same order and `(batch, event size)` shapes as `evaluate`
    /// returned) chained through the masked layers. Returns per-layer
    /// parameter gradients in layer order. Requires a preceding `evaluate`.
    pub fn backward(&self, param_grads: &[Array2<f64>]) -> Result<Vec<LayerGrads>> {
        if param_grads.len() != self.output_multiplier {
            return Err(FlowError::shape(format!(
                "expected gradients for {} parameter tensors, got {}",
                self.output_multiplier,
                param_grads.len()
            )));
        }
        let views: Vec<_> = param_grads.iter().map(|g| g.view()).collect();
        let mut delta = ndarray::concatenate(Axis(1), &views)
            .map_err(|e| FlowError::shape(format!("cannot assemble output gradient: {}", e)))?;

        let mut grads = Vec::with_capacity(self.layers.len());
        for layer in self.layers.iter().rev() {
            let (input_grad, layer_grads) = layer.backward(&delta);
            grads.push(layer_grads);
            delta = input_grad;
        }
        grads.reverse();
        Ok(grads)
    }

    /// Apply one optimizer step per layer. `optimizers` must hold one state
    /// per layer (see [`crate::nn::Optimizer::clone_box`]).
    pub fn apply_gradients(
        &mut self,
        grads: &[LayerGrads],
        optimizers: &mut [Box<dyn Optimizer>],
    ) -> Result<()> {
        if grads.len() != self.layers.len() || optimizers.len() != self.layers.len() {
            return Err(FlowError::config(format!(
                "expected {} per-layer gradient/optimizer entries",
                self.layers.len()
            )));
        }
        for ((layer, grad), opt) in self.layers.iter_mut().zip(grads).zip(optimizers) {
            opt.update_weights(layer.weights_mut(), &grad.weights);
            opt.update_biases(layer.bias_mut(), &grad.bias);
        }
        Ok(())
    }
}

impl Parameters for DenseAutoregressive {
    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn param_shapes(&self) -> &[Vec<usize>] {
        &self.param_shapes
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn evaluate(
        &self,
        x: &Array2<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<Vec<Array2<f64>>> {
        let h0 = self.assemble_input(x, context)?;
        self.evals.set(self.evals.get() + 1);

        let mut h = h0;
        for layer in &self.layers {
            h = layer.forward(&h);
        }

        let input_dim = self.input_dim();
        let out = (0..self.output_multiplier)
            .map(|k| {
                h.slice(ndarray::s![.., k * input_dim..(k + 1) * input_dim])
                    .to_owned()
            })
            .collect();
        Ok(out)
    }

    fn evaluations(&self) -> usize {
        self.evals.get()
    }

    fn num_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.num_parameters()).sum()
    }

    fn parameters(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.num_parameters());
        for layer in &self.layers {
            out.extend(layer.parameters());
        }
        out
    }

    fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.num_parameters() {
            return Err(FlowError::shape(format!(
                "expected {} parameters, got {}",
                self.num_parameters(),
                values.len()
            )));
        }
        let mut offset = 0;
        for layer in &mut self.layers {
            let n = layer.num_parameters();
            layer.set_parameters(&values[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }
}

/// Deferred [`DenseAutoregressive`] construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseAutoregressiveConfig {
    pub hidden_dims: Vec<usize>,
    /// Dimension ordering; sampled at random when absent.
    pub permutation: Option<Vec<usize>>,
}

impl Default for DenseAutoregressiveConfig {
    fn default() -> Self {
        DenseAutoregressiveConfig {
            hidden_dims: crate::config::DEFAULT_HIDDEN_DIMS.to_vec(),
            permutation: None,
        }
    }
}

impl DenseAutoregressiveConfig {
    pub fn with_hidden_dims(mut self, hidden_dims: Vec<usize>) -> Self {
        self.hidden_dims = hidden_dims;
        self
    }

    pub fn with_permutation(mut self, permutation: Vec<usize>) -> Self {
        self.permutation = Some(permutation);
        self
    }

    pub fn build_dense(
        &self,
        input_shape: &[usize],
        param_shapes: &[Vec<usize>],
        context_size: usize,
    ) -> Result<DenseAutoregressive> {
        DenseAutoregressive::build(self, input_shape, param_shapes, context_size)
    }
}

impl LazyParameters for DenseAutoregressiveConfig {
    fn build(
        &self,
        input_shape: &[usize],
        param_shapes: &[Vec<usize>],
        context_size: usize,
    ) -> Result<Box<dyn Parameters>> {
        Ok(Box::new(self.build_dense(
            input_shape,
            param_shapes,
            context_size,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn small_provider(dim: usize) -> DenseAutoregressive {
        DenseAutoregressiveConfig::default()
            .with_hidden_dims(vec![8])
            .with_permutation((0..dim).collect())
            .build_dense(&[dim], &[vec![dim], vec![dim]], 0)
            .unwrap()
    }

    #[test]
    fn test_build_rejects_narrow_hidden_layer() {
        let err = DenseAutoregressiveConfig::default()
            .with_hidden_dims(vec![2])
            .build_dense(&[4], &[vec![4], vec![4]], 0)
            .unwrap_err();
        assert!(matches!(err, FlowError::Shape(_)));
    }

    #[test]
    fn test_build_rejects_bad_permutation() {
        let err = DenseAutoregressiveConfig::default()
            .with_hidden_dims(vec![8])
            .with_permutation(vec![0, 0, 1])
            .build_dense(&[3], &[vec![3]], 0)
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn test_evaluate_shapes_and_counter() {
        let provider = small_provider(3);
        let x = Array2::zeros((5, 3));
        let out = provider.evaluate(&x, None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].dim(), (5, 3));
        assert_eq!(provider.evaluations(), 1);
        provider.evaluate(&x, None).unwrap();
        assert_eq!(provider.evaluations(), 2);
    }

    #[test]
    fn test_autoregressive_dependency_structure() {
        let provider = small_provider(4);
        let x = Array2::zeros((1, 4));
        let base = provider.evaluate(&x, None).unwrap();

        // Perturbing dimension d must leave parameters for dimensions <= d
        // (in permutation order, here the identity) unchanged.
        for d in 0..4 {
            let mut x2 = x.clone();
            x2[[0, d]] = 10.0;
            let out = provider.evaluate(&x2, None).unwrap();
            for p in 0..2 {
                for j in 0..=d {
                    assert_abs_diff_eq!(out[p][[0, j]], base[p][[0, j]], epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_first_dimension_params_are_constant() {
        let provider = small_provider(3);
        let a = provider
            .evaluate(&Array2::from_elem((1, 3), -4.2), None)
            .unwrap();
        let b = provider
            .evaluate(&Array2::from_elem((1, 3), 7.9), None)
            .unwrap();
        assert_abs_diff_eq!(a[0][[0, 0]], b[0][[0, 0]], epsilon = 1e-12);
        assert_abs_diff_eq!(a[1][[0, 0]], b[1][[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let provider = small_provider(2);
        let x = ndarray::arr2(&[[0.4, -1.1], [2.0, 0.3]]);

        // Loss: sum of all parameter outputs.
        let out = provider.evaluate(&x, None).unwrap();
        let grads_out: Vec<Array2<f64>> = out
            .iter()
            .map(|o| Array2::from_elem(o.dim(), 1.0))
            .collect();
        let layer_grads = provider.backward(&grads_out).unwrap();

        let flat_analytic: Vec<f64> = layer_grads
            .iter()
            .flat_map(|g| {
                g.weights
                    .iter()
                    .cloned()
                    .chain(g.bias.iter().cloned())
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut provider = provider;
        let mut params = provider.parameters();
        let eps = 1e-6;
        let loss = |p: &DenseAutoregressive| -> f64 {
            p.evaluate(&x, None)
                .unwrap()
                .iter()
                .map(|o| o.sum())
                .sum()
        };
        for k in 0..params.len() {
            let orig = params[k];
            params[k] = orig + eps;
            provider.set_parameters(&params).unwrap();
            let up = loss(&provider);
            params[k] = orig - eps;
            provider.set_parameters(&params).unwrap();
            let down = loss(&provider);
            params[k] = orig;
            provider.set_parameters(&params).unwrap();
            assert_abs_diff_eq!((up - down) / (2.0 * eps), flat_analytic[k], epsilon = 1e-4);
        }
    }

    #[test]
    fn test_config_later_bindings_override_earlier() {
        let config = DenseAutoregressiveConfig::default()
            .with_hidden_dims(vec![4])
            .with_hidden_dims(vec![16])
            .with_permutation(vec![1, 0])
            .with_permutation(vec![0, 1]);
        assert_eq!(config.hidden_dims, vec![16]);
        let built = config.build_dense(&[2], &[vec![2], vec![2]], 0).unwrap();
        assert_eq!(built.permutation(), &[0, 1]);
    }

    #[test]
    fn test_context_changes_output() {
        let provider = DenseAutoregressiveConfig::default()
            .with_hidden_dims(vec![8])
            .with_permutation(vec![0, 1])
            .build_dense(&[2], &[vec![2], vec![2]], 3)
            .unwrap();
        let x = Array2::zeros((1, 2));
        let a = provider
            .evaluate(&x, Some(&ndarray::arr1(&[0.0, 0.0, 0.0])))
            .unwrap();
        let b = provider
            .evaluate(&x, Some(&ndarray::arr1(&[1.0, -1.0, 2.0])))
            .unwrap();
        let diff: f64 = (&a[0] - &b[0]).mapv(f64::abs).sum();
        assert!(diff > 0.0, "context must influence the parameters");
        assert!(provider.evaluate(&x, None).is_err());
    }
}
