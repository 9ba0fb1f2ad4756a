//! Invertible transformations and their composition.

mod affine;
mod autoregressive;
mod compose;
mod fixed;
mod invert;

pub use affine::{Affine, AffineConfig, AffineOps, ScaleFn};
pub use autoregressive::{AffineAutoregressive, AffineAutoregressiveConfig};
pub use compose::{Compose, ComposeConfig};
pub use fixed::{AffineFixed, AffineFixedConfig, Exp, ExpConfig, Permute, PermuteConfig, Sigmoid, SigmoidConfig};
pub use invert::{Invert, InvertConfig};

use ndarray::{Array1, ArrayD};

use crate::error::{FlowError, Result};
use crate::params::Parameters;
use crate::tracking::{is_tracking_enabled, BijectorId, Direction, FlowTensor};

/// Support of a bijector's input or output space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    Real,
    RealVector,
    Positive,
    UnitInterval,
}

/// An invertible transformation with a tractable log|det J|.
///
/// Implementors supply the closed-form math through the `*_raw` methods;
/// the provided `forward`/`inverse`/`log_abs_det_jacobian` wrap them with
/// shape validation, provenance tracking, and the cache shortcuts:
/// `forward` of an inverse-tagged tensor (and vice versa) returns the
/// recorded parent without recomputation, and a log-Jacobian query answered
/// by a matching trace returns the cached value.
///
/// Raw log-Jacobians are always in the forward sense,
/// log|det d(forward output)/d(forward input)|, at this bijector's event
/// granularity (`event_dim` trailing axes summed out).
pub trait Bijector: std::fmt::Debug {
    /// Identity of this constructed instance; ties traces to their
    /// producer.
    fn id(&self) -> BijectorId;

    /// Event shape the bijector was built for. Immutable after
    /// construction.
    fn shape(&self) -> &[usize];

    /// Number of trailing axes treated as jointly dependent by the
    /// log-Jacobian.
    fn event_dim(&self) -> usize {
        0
    }

    fn context_size(&self) -> usize {
        0
    }

    fn domain(&self) -> Constraint {
        Constraint::Real
    }

    fn codomain(&self) -> Constraint {
        Constraint::Real
    }

    fn is_autoregressive(&self) -> bool {
        false
    }

    fn is_volume_preserving(&self) -> bool {
        false
    }

    /// Parameter-tensor shapes required for the given event shape.
    fn param_shapes(&self, shape: &[usize]) -> Vec<Vec<usize>>;

    /// Output event shape for a given input event shape.
    fn forward_shape(&self, shape: &[usize]) -> Vec<usize> {
        shape.to_vec()
    }

    fn inverse_shape(&self, shape: &[usize]) -> Vec<usize> {
        shape.to_vec()
    }

    /// The owned parameter provider, if any.
    fn params(&self) -> Option<&dyn Parameters> {
        None
    }

    fn num_parameters(&self) -> usize {
        self.params().map(|p| p.num_parameters()).unwrap_or(0)
    }

    /// Flat learnable parameters for checkpointing.
    fn parameters(&self) -> Vec<f64> {
        self.params().map(|p| p.parameters()).unwrap_or_default()
    }

    fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        if values.is_empty() && self.num_parameters() == 0 {
            Ok(())
        } else {
            Err(FlowError::config(
                "bijector has no settable parameters",
            ))
        }
    }

    /// Closed-form forward transform; returns the output and the forward
    /// log|det J|.
    fn forward_raw(
        &self,
        x: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)>;

    /// Closed-form inverse transform; returns the reconstruction and the
    /// forward-sense log|det J| consistent with it.
    fn inverse_raw(
        &self,
        y: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)>;

    /// Closed-form forward log|det J| given both endpoints.
    fn log_abs_det_raw(
        &self,
        x: &ArrayD<f64>,
        y: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>>;

    fn check_context(&self, context: Option<&Array1<f64>>) -> Result<()> {
        match (self.context_size(), context) {
            (0, None) => Ok(()),
            (0, Some(_)) => Err(FlowError::shape(
                "bijector built without context, but one was supplied",
            )),
            (n, Some(ctx)) if ctx.len() == n => Ok(()),
            (n, Some(ctx)) => Err(FlowError::shape(format!(
                "context of size {} expected, got {}",
                n,
                ctx.len()
            ))),
            (n, None) => Err(FlowError::shape(format!(
                "bijector requires a context of size {}",
                n
            ))),
        }
    }

    /// Trailing dims of `value` must match the configured event shape;
    /// leading (batch) dims are free.
    fn check_shape(&self, value: &ArrayD<f64>) -> Result<()> {
        let shape = self.shape();
        let v = value.shape();
        if v.len() < shape.len() || &v[v.len() - shape.len()..] != shape {
            return Err(FlowError::shape(format!(
                "bijector built for event shape {:?}, got input shape {:?}",
                shape, v
            )));
        }
        Ok(())
    }

    /// Forward transform with tracking and the inverse-of-inverse shortcut.
    /// With tracking disabled, shortcuts are bypassed too: every call
    /// recomputes from scratch.
    fn forward(&self, x: &FlowTensor, context: Option<&Array1<f64>>) -> Result<FlowTensor> {
        self.check_context(context)?;
        if is_tracking_enabled()
            && x.from_inverse()
            && x.producer() == Some(self.id())
            && x.context_matches(context)
        {
            if let Some(parent) = x.parent() {
                return Ok(parent);
            }
        }
        self.check_shape(x.array())?;
        let (y, ldj) = self.forward_raw(x.array(), context)?;
        if is_tracking_enabled() {
            FlowTensor::register(x, y, self.id(), Direction::Forward, Some(ldj), context)
        } else {
            Ok(FlowTensor::new(y))
        }
    }

    /// Inverse transform with tracking and the forward-of-forward shortcut.
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

    /// Forward log|det J| between `x` and `y = forward(x)`, served from a
    /// matching trace when one exists.
    fn log_abs_det_jacobian(
        &self,
        x: &FlowTensor,
        y: &FlowTensor,
        context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        self.check_context(context)?;
        if is_tracking_enabled() {
            if y.from_forward() && y.producer() == Some(self.id()) && y.context_matches(context) {
                if let (Some(parent), Some(ldj)) = (y.parent(), y.cached_log_det()) {
                    if parent.same_value(x) {
                        return Ok(ldj.clone());
                    }
                }
            }
            if x.from_inverse() && x.producer() == Some(self.id()) && x.context_matches(context) {
                if let (Some(parent), Some(ldj)) = (x.parent(), x.cached_log_det()) {
                    if parent.same_value(y) {
                        return Ok(ldj.clone());
                    }
                }
            }
        }
        self.check_shape(x.array())?;
        self.log_abs_det_raw(x.array(), y.array(), context)
    }
}
