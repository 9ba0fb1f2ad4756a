//! Swaps a bijector's forward and inverse directions.
//!
//! Useful when a transform is cheap one way and sequential the other: a
//! masked-autoregressive bijector wrapped in [`Invert`] gives a flow whose
//! density evaluation is the parallel direction and whose sampling pays the
//! sequential cost.
//!
//! The log-Jacobian convention follows from the change-of-variables
//! formula: with `g = f^{-1}`, log|det dg(x)/dx| = −log|det df(y)/dy| at
//! `y = g(x)`. The delegate's value is therefore negated.

use ndarray::{Array1, ArrayD};

use super::{Bijector, Constraint};
use crate::error::Result;
use crate::lazy::LazyBijector;
use crate::params::Parameters;
use crate::tracking::{next_bijector_id, BijectorId, FlowTensor};

/// A bijector running its wrapped bijector backwards.
pub struct Invert {
    id: BijectorId,
    inner: Box<dyn Bijector>,
}

impl Invert {
    pub fn new(inner: Box<dyn Bijector>) -> Self {
        Invert {
            id: next_bijector_id(),
            inner,
        }
    }

    pub fn inner(&self) -> &dyn Bijector {
        self.inner.as_ref()
    }

    pub fn inner_mut(&mut self) -> &mut dyn Bijector {
        self.inner.as_mut()
    }
}

impl std::fmt::Debug for Invert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invert").field("id", &self.id).finish()
    }
}

impl Bijector for Invert {
    fn id(&self) -> BijectorId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        self.inner.shape()
    }

    fn event_dim(&self) -> usize {
        self.inner.event_dim()
    }

    fn context_size(&self) -> usize {
        self.inner.context_size()
    }

    fn domain(&self) -> Constraint {
        self.inner.codomain()
    }

    fn codomain(&self) -> Constraint {
        self.inner.domain()
    }

    fn is_autoregressive(&self) -> bool {
        self.inner.is_autoregressive()
    }

    fn is_volume_preserving(&self) -> bool {
        self.inner.is_volume_preserving()
    }

    fn param_shapes(&self, shape: &[usize]) -> Vec<Vec<usize>> {
        self.inner.param_shapes(shape)
    }

    fn forward_shape(&self, shape: &[usize]) -> Vec<usize> {
        self.inner.inverse_shape(shape)
    }

    fn inverse_shape(&self, shape: &[usize]) -> Vec<usize> {
        self.inner.forward_shape(shape)
    }

    fn params(&self) -> Option<&dyn Parameters> {
        self.inner.params()
    }

    fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        self.inner.set_parameters(values)
    }

    fn forward_raw(
        &self,
        x: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let (y, inner_ldj) = self.inner.inverse_raw(x, context)?;
        Ok((y, inner_ldj.mapv(|v| -v)))
    }

    fn inverse_raw(
        &self,
        y: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let (x, inner_ldj) = self.inner.forward_raw(y, context)?;
        Ok((x, inner_ldj.mapv(|v| -v)))
    }

    fn log_abs_det_raw(
        &self,
        x: &ArrayD<f64>,
        y: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        Ok(self.inner.log_abs_det_raw(y, x, context)?.mapv(|v| -v))
    }

    // Delegate the tracked paths directly so the wrapped bijector's own
    // caching applies: a sample produced through `forward` here is tagged
    // by the inner bijector and short-circuits its `inverse`.
    fn forward(&self, x: &FlowTensor, context: Option<&Array1<f64>>) -> Result<FlowTensor> {
        self.inner.inverse(x, context)
    }

    fn inverse(&self, y: &FlowTensor, context: Option<&Array1<f64>>) -> Result<FlowTensor> {
        self.inner.forward(y, context)
    }

    fn log_abs_det_jacobian(
        &self,
        x: &FlowTensor,
        y: &FlowTensor,
        context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        Ok(self
            .inner
            .log_abs_det_jacobian(y, x, context)?
            .mapv(|v| -v))
    }
}

/// Deferred [`Invert`] construction around a deferred inner bijector.
pub struct InvertConfig {
    pub inner: Box<dyn LazyBijector>,
}

impl InvertConfig {
    pub fn new(inner: Box<dyn LazyBijector>) -> Self {
        InvertConfig { inner }
    }
}

impl LazyBijector for InvertConfig {
    fn build(&self, shape: &[usize], context_size: usize) -> Result<Box<dyn Bijector>> {
        Ok(Box::new(Invert::new(self.inner.build(shape, context_size)?)))
    }
}
