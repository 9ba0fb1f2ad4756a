//! Bijectors with no learnable parameters.

use ndarray::{Array1, Array2, ArrayD};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::{Bijector, Constraint};
use crate::error::{FlowError, Result};
use crate::lazy::LazyBijector;
use crate::ops::{clipped_sigmoid, flatten_event, logit, softplus, unflatten_batch, unflatten_event};
use crate::tracking::{next_bijector_id, BijectorId};

/// `y = exp(x)`, mapping the reals onto the positive half-line.
#[derive(Debug)]
pub struct Exp {
    id: BijectorId,
    shape: Vec<usize>,
}

impl Bijector for Exp {
    fn id(&self) -> BijectorId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn codomain(&self) -> Constraint {
        Constraint::Positive
    }

    fn param_shapes(&self, _shape: &[usize]) -> Vec<Vec<usize>> {
        vec![]
    }

    fn forward_raw(
        &self,
        x: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        Ok((x.mapv(f64::exp), x.clone()))
    }

    fn inverse_raw(
        &self,
        y: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let x = y.mapv(f64::ln);
        let ldj = x.clone();
        Ok((x, ldj))
    }

    fn log_abs_det_raw(
        &self,
        x: &ArrayD<f64>,
        _y: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        Ok(x.clone())
    }
}

/// Deferred [`Exp`] construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpConfig;

impl LazyBijector for ExpConfig {
    fn build(&self, shape: &[usize], _context_size: usize) -> Result<Box<dyn Bijector>> {
        Ok(Box::new(Exp {
            id: next_bijector_id(),
            shape: shape.to_vec(),
        }))
    }
}

/// Logistic sigmoid onto the open unit interval.
#[derive(Debug)]
pub struct Sigmoid {
    id: BijectorId,
    shape: Vec<usize>,
}

impl Bijector for Sigmoid {
    fn id(&self) -> BijectorId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn codomain(&self) -> Constraint {
        Constraint::UnitInterval
    }

    fn param_shapes(&self, _shape: &[usize]) -> Vec<Vec<usize>> {
        vec![]
    }

    fn forward_raw(
        &self,
        x: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let y = x.mapv(clipped_sigmoid);
        let ldj = x.mapv(|v| -softplus(-v) - softplus(v));
        Ok((y, ldj))
    }

    fn inverse_raw(
        &self,
        y: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let x = y.mapv(logit);
        let ldj = x.mapv(|v| -softplus(-v) - softplus(v));
        Ok((x, ldj))
    }

    fn log_abs_det_raw(
        &self,
        x: &ArrayD<f64>,
        _y: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        Ok(x.mapv(|v| -softplus(-v) - softplus(v)))
    }
}

/// Deferred [`Sigmoid`] construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigmoidConfig;

impl LazyBijector for SigmoidConfig {
    fn build(&self, shape: &[usize], _context_size: usize) -> Result<Box<dyn Bijector>> {
        Ok(Box::new(Sigmoid {
            id: next_bijector_id(),
            shape: shape.to_vec(),
        }))
    }
}

/// Affine map with constant scalar location and scale.
#[derive(Debug)]
pub struct AffineFixed {
    id: BijectorId,
    shape: Vec<usize>,
    loc: f64,
    scale: f64,
}

impl AffineFixed {
    pub fn loc(&self) -> f64 {
        self.loc
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Bijector for AffineFixed {
    fn id(&self) -> BijectorId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn param_shapes(&self, _shape: &[usize]) -> Vec<Vec<usize>> {
        vec![]
    }

    fn forward_raw(
        &self,
        x: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let y = x.mapv(|v| self.scale * v + self.loc);
        let ldj = ArrayD::from_elem(x.raw_dim(), self.scale.abs().ln());
        Ok((y, ldj))
    }

    fn inverse_raw(
        &self,
        y: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let x = y.mapv(|v| (v - self.loc) / self.scale);
        let ldj = ArrayD::from_elem(y.raw_dim(), self.scale.abs().ln());
        Ok((x, ldj))
    }

    fn log_abs_det_raw(
        &self,
        x: &ArrayD<f64>,
        _y: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        Ok(ArrayD::from_elem(x.raw_dim(), self.scale.abs().ln()))
    }
}

/// Deferred [`AffineFixed`] construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffineFixedConfig {
    pub loc: f64,
    pub scale: f64,
}

impl AffineFixedConfig {
    pub fn new(loc: f64, scale: f64) -> Self {
        AffineFixedConfig { loc, scale }
    }
}

impl LazyBijector for AffineFixedConfig {
    fn build(&self, shape: &[usize], _context_size: usize) -> Result<Box<dyn Bijector>> {
        if self.scale == 0.0 || !self.scale.is_finite() {
            return Err(FlowError::config(format!(
                "fixed affine scale must be finite and non-zero, got {}",
                self.scale
            )));
        }
        Ok(Box::new(AffineFixed {
            id: next_bijector_id(),
            shape: shape.to_vec(),
            loc: self.loc,
            scale: self.scale,
        }))
    }
}

/// Reorders the event dimensions. Volume-preserving.
#[derive(Debug)]
pub struct Permute {
    id: BijectorId,
    shape: Vec<usize>,
    permutation: Vec<usize>,
    inverse_permutation: Vec<usize>,
}

impl Permute {
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    fn event_len(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }

    fn gather(&self, v: &ArrayD<f64>, order: &[usize]) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let (v2d, batch_shape) = flatten_event(&v.view(), self.event_len())?;
        let mut out = Array2::zeros(v2d.dim());
        for (k, &src) in order.iter().enumerate() {
            out.column_mut(k).assign(&v2d.column(src));
        }
        let ldj = unflatten_batch(ndarray::Array1::zeros(v2d.nrows()), &batch_shape);
        Ok((unflatten_event(out, &batch_shape), ldj))
    }
}

impl Bijector for Permute {
    fn id(&self) -> BijectorId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn event_dim(&self) -> usize {
        1
    }

    fn domain(&self) -> Constraint {
        Constraint::RealVector
    }

    fn codomain(&self) -> Constraint {
        Constraint::RealVector
    }

    fn is_volume_preserving(&self) -> bool {
        true
    }

    fn param_shapes(&self, _shape: &[usize]) -> Vec<Vec<usize>> {
        vec![]
    }

    fn forward_raw(
        &self,
        x: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        self.gather(x, &self.permutation)
    }

    fn inverse_raw(
        &self,
        y: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        self.gather(y, &self.inverse_permutation)
    }

    fn log_abs_det_raw(
        &self,
        x: &ArrayD<f64>,
        _y: &ArrayD<f64>,
        _context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        let (x2d, batch_shape) = flatten_event(&x.view(), self.event_len())?;
        Ok(unflatten_batch(
            ndarray::Array1::zeros(x2d.nrows()),
            &batch_shape,
        ))
    }
}

/// Deferred [`Permute`] construction; samples a random order when none is
/// given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermuteConfig {
    pub permutation: Option<Vec<usize>>,
}

impl PermuteConfig {
    pub fn with_permutation(mut self, permutation: Vec<usize>) -> Self {
        self.permutation = Some(permutation);
        self
    }
}

impl LazyBijector for PermuteConfig {
    fn build(&self, shape: &[usize], _context_size: usize) -> Result<Box<dyn Bijector>> {
        if shape.len() != 1 {
            return Err(FlowError::shape(format!(
                "permutation bijector requires a vector event shape, got {:?}",
                shape
            )));
        }
        let dim = shape[0];
        let permutation = match &self.permutation {
            Some(perm) => {
                let mut seen = vec![false; dim];
                if perm.len() != dim
                    || perm
                        .iter()
                        .any(|&d| d >= dim || std::mem::replace(&mut seen[d], true))
                {
                    return Err(FlowError::config(format!(
                        "permutation {:?} is not a permutation of 0..{}",
                        perm, dim
                    )));
                }
                perm.clone()
            }
            None => {
                let mut perm: Vec<usize> = (0..dim).collect();
                perm.shuffle(&mut rand::thread_rng());
                perm
            }
        };
        let mut inverse_permutation = vec![0usize; dim];
        for (k, &src) in permutation.iter().enumerate() {
            inverse_permutation[src] = k;
        }
        Ok(Box::new(Permute {
            id: next_bijector_id(),
            shape: shape.to_vec(),
            permutation,
            inverse_permutation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn test_exp_roundtrip_and_jacobian() {
        let b = ExpConfig.build(&[3], 0).unwrap();
        let x = arr1(&[0.0, 1.0, -2.0]).into_dyn();
        let (y, ldj) = b.forward_raw(&x, None).unwrap();
        assert_abs_diff_eq!(y[[0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ldj[[1]], 1.0, epsilon = 1e-12);
        let (x_rec, _) = b.inverse_raw(&y, None).unwrap();
        for (a, r) in x.iter().zip(x_rec.iter()) {
            assert_abs_diff_eq!(a, r, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_sigmoid_roundtrip() {
        let b = SigmoidConfig.build(&[2], 0).unwrap();
        let x = arr1(&[0.5, -3.0]).into_dyn();
        let (y, _) = b.forward_raw(&x, None).unwrap();
        assert!(y.iter().all(|&v| (0.0..1.0).contains(&v)));
        let (x_rec, _) = b.inverse_raw(&y, None).unwrap();
        for (a, r) in x.iter().zip(x_rec.iter()) {
            assert_abs_diff_eq!(a, r, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_affine_fixed_jacobian() {
        let b = AffineFixedConfig::new(1.0, 2.0).build(&[2], 0).unwrap();
        let x = arr1(&[0.0, 3.0]).into_dyn();
        let (y, ldj) = b.forward_raw(&x, None).unwrap();
        assert_abs_diff_eq!(y[[0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y[[1]], 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ldj[[0]], 2.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_affine_fixed_rejects_zero_scale() {
        assert!(AffineFixedConfig::new(0.0, 0.0).build(&[2], 0).is_err());
    }

    #[test]
    fn test_permute_roundtrip_and_volume() {
        let b = PermuteConfig::default()
            .with_permutation(vec![2, 0, 1])
            .build(&[3], 0)
            .unwrap();
        assert!(b.is_volume_preserving());
        let x = arr1(&[10.0, 20.0, 30.0]).into_dyn();
        let (y, ldj) = b.forward_raw(&x, None).unwrap();
        assert_abs_diff_eq!(y[[0]], 30.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y[[1]], 10.0, epsilon = 1e-12);
        assert_eq!(ldj.ndim(), 0);
        assert_abs_diff_eq!(ldj[[]], 0.0, epsilon = 1e-12);
        let (x_rec, _) = b.inverse_raw(&y, None).unwrap();
        for (a, r) in x.iter().zip(x_rec.iter()) {
            assert_abs_diff_eq!(a, r, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_permute_rejects_invalid_order() {
        let err = PermuteConfig::default()
            .with_permutation(vec![0, 0, 1])
            .build(&[3], 0)
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }
}
