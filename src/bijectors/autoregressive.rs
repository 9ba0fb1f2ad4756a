//! Affine bijector with masked-autoregressive parameters.
//!
//! The forward direction is one hypernetwork evaluation: parameters for all
//! dimensions come out of a single masked pass over the input. The inverse
//! has no such parallel form: the parameters for dimension *i* depend on
//! already-reconstructed dimensions earlier in the permutation, so inversion
//! re-evaluates the hypernetwork once per dimension on a partially filled
//! buffer. That D-evaluation cost is inherent to the parameterization.

use ndarray::{Array1, Array2, ArrayD};
use serde::{Deserialize, Serialize};

use super::affine::{AffineOps, ScaleFn};
use super::{Bijector, Constraint};
use crate::error::{FlowError, Result};
use crate::lazy::LazyBijector;
use crate::ops::{flatten_event, unflatten_batch, unflatten_event};
use crate::params::{DenseAutoregressive, DenseAutoregressiveConfig, Parameters};
use crate::tracking::{
    is_tracking_enabled, next_bijector_id, BijectorId, Direction, FlowTensor,
};

/// `y_i = s_i(x_{<i}) · x_i + m_i(x_{<i})` under the provider's permutation.
#[derive(Debug)]
pub struct AffineAutoregressive {
    id: BijectorId,
    shape: Vec<usize>,
    context_size: usize,
    ops: AffineOps,
    params: DenseAutoregressive,
}

impl AffineAutoregressive {
    fn event_len(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }

    pub fn ops(&self) -> &AffineOps {
        &self.ops
    }

    /// The owned hypernetwork.
    pub fn hypernet(&self) -> &DenseAutoregressive {
        &self.params
    }

    pub fn hypernet_mut(&mut self) -> &mut DenseAutoregressive {
        &mut self.params
    }

    fn evaluate_params(
        &self,
        x: &Array2<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let mut out = self.params.evaluate(x, context)?;
        let unbounded = out.pop().expect("two parameter tensors declared");
        let mean = out.pop().expect("two parameter tensors declared");
        Ok((mean, unbounded))
    }

    /// Negative log-likelihood of `y` under the model read in the
    /// normalizing direction (`u = forward(y)` scored against a standard
    /// normal), together with the gradients of the loss with respect to the
    /// provider's two output tensors. Chain the result through
    /// [`DenseAutoregressive::backward`] to get weight gradients.
    pub fn nll_grads(&self, y: &Array2<f64>) -> Result<(f64, Vec<Array2<f64>>)> {
        let batch = y.nrows() as f64;
        let (mean, unbounded) = self.evaluate_params(y, None)?;

        let dim = y.ncols();
        let mut nll = 0.0;
        let mut grad_mean = Array2::zeros(y.dim());
        let mut grad_unbounded = Array2::zeros(y.dim());
        let half_ln_2pi = 0.5 * (2.0 * std::f64::consts::PI).ln();

        for b in 0..y.nrows() {
            for i in 0..dim {
                let t = unbounded[[b, i]];
                let (s, log_s) = self.ops.scale_and_log_scale(t);
                let u = s * y[[b, i]] + mean[[b, i]];
                nll += 0.5 * u * u + half_ln_2pi - log_s;

                let du = u / batch;
                grad_mean[[b, i]] = du;
                grad_unbounded[[b, i]] =
                    (du * y[[b, i]] - 1.0 / (batch * s)) * self.ops.scale_grad(t);
            }
        }

        Ok((nll / batch, vec![grad_mean, grad_unbounded]))
    }

    /// Plain NLL in the normalizing direction, for validation.
    pub fn nll(&self, y: &Array2<f64>) -> Result<f64> {
        let batch = y.nrows() as f64;
        let (mean, unbounded) = self.evaluate_params(y, None)?;
        let (u, log_scale) = self.ops.forward2d(y, &mean, &unbounded);
        let half_ln_2pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
        let nll: f64 = u
            .iter()
            .zip(log_scale.iter())
            .map(|(&u, &ls)| 0.5 * u * u + half_ln_2pi - ls)
            .sum();
        Ok(nll / batch)
    }
}

impl Bijector for AffineAutoregressive {
    fn id(&self) -> BijectorId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn event_dim(&self) -> usize {
        1
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn domain(&self) -> Constraint {
        Constraint::RealVector
    }

    fn codomain(&self) -> Constraint {
        Constraint::RealVector
    }

    fn is_autoregressive(&self) -> bool {
        true
    }

    fn param_shapes(&self, shape: &[usize]) -> Vec<Vec<usize>> {
        vec![shape.to_vec(), shape.to_vec()]
    }

    fn params(&self) -> Option<&dyn Parameters> {
        Some(&self.params)
    }

    fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        self.params.set_parameters(values)
    }

    fn forward_raw(
        &self,
        x: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let (x2d, batch_shape) = flatten_event(&x.view(), self.event_len())?;
        let (mean, unbounded) = self.evaluate_params(&x2d, context)?;
        let (y, log_scale) = self.ops.forward2d(&x2d, &mean, &unbounded);
        let ldj = log_scale.sum_axis(ndarray::Axis(1));
        Ok((
            unflatten_event(y, &batch_shape),
            unflatten_batch(ldj, &batch_shape),
        ))
    }

    /// One full elementwise inversion per permutation step; only the column
    /// for the current dimension is kept, because earlier columns are
    /// already final and later ones were computed from incomplete inputs.
    fn inverse_raw(
        &self,
        y: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let (y2d, batch_shape) = flatten_event(&y.view(), self.event_len())?;
        let mut x = Array2::zeros(y2d.dim());
        let mut last_log_scale: Option<Array2<f64>> = None;

        for &idx in self.params.permutation() {
            let (mean, unbounded) = self.evaluate_params(&x, context)?;
            let (x_full, log_scale) = self.ops.inverse2d(&y2d, &mean, &unbounded);
            x.column_mut(idx).assign(&x_full.column(idx));
            last_log_scale = Some(log_scale);
        }

        // The final evaluation saw every dimension it depends on fully
        // reconstructed, so its log-scales match the forward formula at x.
        let log_scale = last_log_scale.ok_or_else(|| {
            FlowError::shape("autoregressive bijector over an empty event")
        })?;
        let ldj = log_scale.sum_axis(ndarray::Axis(1));
        Ok((
            unflatten_event(x, &batch_shape),
            unflatten_batch(ldj, &batch_shape),
        ))
    }

    fn inverse(&self, y: &FlowTensor, context: Option<&Array1<f64>>) -> Result<FlowTensor> {
        self.check_context(context)?;
        if is_tracking_enabled()
            && y.from_forward()
            && y.producer() == Some(self.id())
            && y.context_matches(context)
        {
            if let Some(parent) = y.parent() {
                return Ok(parent);
            }
        }
        self.check_shape(y.array())?;
        let (x, ldj) = self.inverse_raw(y.array(), context)?;
        if is_tracking_enabled() {
            FlowTensor::register(y, x, self.id(), Direction::Inverse, Some(ldj), context)
        } else {
            Ok(FlowTensor::new(x))
        }
    }

    fn log_abs_det_raw(
        &self,
        x: &ArrayD<f64>,
        _y: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        let (x2d, batch_shape) = flatten_event(&x.view(), self.event_len())?;
        let (mean, unbounded) = self.evaluate_params(&x2d, context)?;
        let (_, log_scale) = self.ops.forward2d(&x2d, &mean, &unbounded);
        let ldj = log_scale.sum_axis(ndarray::Axis(1));
        Ok(unflatten_batch(ldj, &batch_shape))
    }
}

/// Deferred [`AffineAutoregressive`] construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffineAutoregressiveConfig {
    pub params: DenseAutoregressiveConfig,
    pub ops: AffineOps,
}

impl Default for AffineAutoregressiveConfig {
    fn default() -> Self {
        AffineAutoregressiveConfig {
            params: DenseAutoregressiveConfig::default(),
            ops: AffineOps::default(),
        }
    }
}

impl AffineAutoregressiveConfig {
    pub fn with_params(mut self, params: DenseAutoregressiveConfig) -> Self {
        self.params = params;
        self
    }

    pub fn with_scale_fn(mut self, scale_fn: ScaleFn) -> Self {
        self.ops.scale_fn = scale_fn;
        self
    }

    pub fn with_clamp(mut self, min_clip: f64, max_clip: f64) -> Self {
        self.ops.clamp = true;
        self.ops.log_scale_min_clip = min_clip;
        self.ops.log_scale_max_clip = max_clip;
        self
    }

    pub fn build_affine_autoregressive(
        &self,
        shape: &[usize],
        context_size: usize,
    ) -> Result<AffineAutoregressive> {
        if shape.len() != 1 {
            return Err(FlowError::shape(format!(
                "autoregressive bijector requires a vector event shape, got {:?}",
                shape
            )));
        }
        let param_shapes = vec![shape.to_vec(), shape.to_vec()];
        let params = self.params.build_dense(shape, &param_shapes, context_size)?;
        Ok(AffineAutoregressive {
            id: next_bijector_id(),
            shape: shape.to_vec(),
            context_size,
            ops: self.ops.clone(),
            params,
        })
    }
}

impl LazyBijector for AffineAutoregressiveConfig {
    fn build(&self, shape: &[usize], context_size: usize) -> Result<Box<dyn Bijector>> {
        Ok(Box::new(
            self.build_affine_autoregressive(shape, context_size)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::set_tracking;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn build(dim: usize) -> AffineAutoregressive {
        AffineAutoregressiveConfig::default()
            .with_params(
                DenseAutoregressiveConfig::default()
                    .with_hidden_dims(vec![16])
                    .with_permutation((0..dim).collect()),
            )
            .build_affine_autoregressive(&[dim], 0)
            .unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let b = build(4);
        let x = arr1(&[0.3, -1.0, 2.0, 0.5]).into_dyn();
        let (y, ldj_fwd) = b.forward_raw(&x, None).unwrap();
        let (x_rec, ldj_inv) = b.inverse_raw(&y, None).unwrap();
        for (a, r) in x.iter().zip(x_rec.iter()) {
            assert_abs_diff_eq!(a, r, epsilon = 1e-8);
        }
        assert_abs_diff_eq!(ldj_fwd[[]], ldj_inv[[]], epsilon = 1e-8);
    }

    #[test]
    fn test_inverse_costs_one_evaluation_per_dimension() {
        let b = build(5);
        let x = arr1(&[0.1, 0.2, 0.3, 0.4, 0.5]).into_dyn();
        let (y, _) = b.forward_raw(&x, None).unwrap();

        b.hypernet().reset_evaluations();
        let _ = b.inverse_raw(&y, None).unwrap();
        assert_eq!(b.hypernet().evaluations(), 5);

        b.hypernet().reset_evaluations();
        let _ = b.forward_raw(&x, None).unwrap();
        assert_eq!(b.hypernet().evaluations(), 1);
    }

    #[test]
    fn test_forward_inverse_shortcut_identity() {
        let b = build(3);
        let x = FlowTensor::from(arr1(&[0.5, -0.5, 1.5]));
        let y = b.forward(&x, None).unwrap();

        b.hypernet().reset_evaluations();
        let x_back = b.inverse(&y, None).unwrap();
        assert!(x_back.same_value(&x), "cached inverse must return the input");
        assert_eq!(b.hypernet().evaluations(), 0, "no recomputation on the cached path");

        let _guard = set_tracking(false);
        let y2 = b.forward(&x, None).unwrap();
        let x2 = b.inverse(&y2, None).unwrap();
        assert!(!x2.same_value(&x), "tracking off recomputes from scratch");
    }

    #[test]
    fn test_jacobian_cached_equals_fresh() {
        let b = build(3);
        let x = FlowTensor::from(arr1(&[0.5, -0.5, 1.5]));
        let y = b.forward(&x, None).unwrap();
        let cached = b.log_abs_det_jacobian(&x, &y, None).unwrap();

        let _guard = set_tracking(false);
        let fresh = b.log_abs_det_raw(x.array(), y.array(), None).unwrap();
        assert_abs_diff_eq!(cached[[]], fresh[[]], epsilon = 1e-12);
    }

    #[test]
    fn test_batched_roundtrip() {
        let b = build(3);
        let x = ndarray::arr2(&[[0.1, 0.2, 0.3], [-1.0, 0.0, 1.0]]).into_dyn();
        let (y, ldj) = b.forward_raw(&x, None).unwrap();
        assert_eq!(ldj.shape(), &[2]);
        let (x_rec, _) = b.inverse_raw(&y, None).unwrap();
        for (a, r) in x.iter().zip(x_rec.iter()) {
            assert_abs_diff_eq!(a, r, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_nll_grads_match_finite_differences() {
        let mut b = build(2);
        let y = ndarray::arr2(&[[4.2, 5.8], [5.1, 4.4]]);

        let (_, out_grads) = b.nll_grads(&y).unwrap();
        let layer_grads = b.hypernet().backward(&out_grads).unwrap();
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

        let mut params = b.hypernet().parameters();
        let eps = 1e-6;
        for k in 0..params.len() {
            let orig = params[k];
            params[k] = orig + eps;
            b.hypernet_mut().set_parameters(&params).unwrap();
            let up = b.nll(&y).unwrap();
            params[k] = orig - eps;
            b.hypernet_mut().set_parameters(&params).unwrap();
            let down = b.nll(&y).unwrap();
            params[k] = orig;
            b.hypernet_mut().set_parameters(&params).unwrap();
            assert_abs_diff_eq!((up - down) / (2.0 * eps), flat_analytic[k], epsilon = 1e-4);
        }
    }

    #[test]
    fn test_non_vector_shape_rejected() {
        let err = AffineAutoregressiveConfig::default()
            .build_affine_autoregressive(&[2, 2], 0)
            .unwrap_err();
        assert!(matches!(err, FlowError::Shape(_)));
    }
}
