//! Ordered chains of bijectors.

use ndarray::{Array1, ArrayD};

use super::{Bijector, Constraint};
use crate::error::{FlowError, Result};
use crate::lazy::LazyBijector;
use crate::ops::sum_rightmost;
use crate::tracking::{
    is_tracking_enabled, next_bijector_id, requires_log_det, BijectorId, Direction, FlowTensor,
};

/// Pipeline of bijectors applied in order; the composite's domain is the
/// first element's, its codomain the last element's.
///
/// Each member handles its own caching, so a round trip through the chain
/// unwinds hop by hop via the members' shortcuts. The composite reads the
/// per-hop log-Jacobians off the members' traces while iterating (lazily:
/// only when tracking and log-det accumulation are both enabled) and only
/// wraps the final value under its own identity when no member left a trace
/// on it.
pub struct Compose {
    id: BijectorId,
    bijectors: Vec<Box<dyn Bijector>>,
    shape: Vec<usize>,
    event_dim: usize,
}

impl Compose {
    pub fn new(bijectors: Vec<Box<dyn Bijector>>) -> Result<Self> {
        if bijectors.is_empty() {
            return Err(FlowError::config("cannot compose an empty bijector sequence"));
        }
        let shape = bijectors[0].shape().to_vec();
        let event_dim = bijectors.iter().map(|b| b.event_dim()).max().unwrap_or(0);
        Ok(Compose {
            id: next_bijector_id(),
            bijectors,
            shape,
            event_dim,
        })
    }

    pub fn bijectors(&self) -> &[Box<dyn Bijector>] {
        &self.bijectors
    }

    pub fn len(&self) -> usize {
        self.bijectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bijectors.is_empty()
    }

    fn child_context<'a>(
        child: &dyn Bijector,
        context: Option<&'a Array1<f64>>,
    ) -> Option<&'a Array1<f64>> {
        if child.context_size() > 0 {
            context
        } else {
            None
        }
    }

    fn batch_ndim(&self, value: &ArrayD<f64>) -> usize {
        value.ndim().saturating_sub(self.event_dim)
    }

    /// Reduce a member's log-det to the composite's event granularity.
    fn reduce_hop(&self, hop: &ArrayD<f64>, batch_ndim: usize) -> ArrayD<f64> {
        sum_rightmost(hop, hop.ndim().saturating_sub(batch_ndim))
    }

    /// Recompute the composite log|det J| by explicitly inverting through
    /// every member. The uncached fallback for `log_abs_det_jacobian`.
    fn recompute_log_abs_det(
        &self,
        y: &FlowTensor,
        context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        let batch_ndim = self.batch_ndim(y.array());
        let mut total: Option<ArrayD<f64>> = None;
        let mut cur = y.clone();
        for b in self.bijectors.iter().rev() {
            let ctx = Self::child_context(b.as_ref(), context);
            let inv = b.inverse(&cur, ctx)?;
            let hop = b.log_abs_det_jacobian(&inv, &cur, ctx)?;
            let term = self.reduce_hop(&hop, batch_ndim);
            total = Some(match total {
                Some(acc) => acc + term,
                None => term,
            });
            cur = inv;
        }
        Ok(total.expect("composite has at least one member"))
    }
}

impl std::fmt::Debug for Compose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compose")
            .field("id", &self.id)
            .field("len", &self.bijectors.len())
            .finish()
    }
}

impl Bijector for Compose {
    fn id(&self) -> BijectorId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn event_dim(&self) -> usize {
        self.event_dim
    }

    fn context_size(&self) -> usize {
        self.bijectors
            .iter()
            .map(|b| b.context_size())
            .max()
            .unwrap_or(0)
    }

    fn domain(&self) -> Constraint {
        self.bijectors.first().map(|b| b.domain()).unwrap_or(Constraint::Real)
    }

    fn codomain(&self) -> Constraint {
        self.bijectors.last().map(|b| b.codomain()).unwrap_or(Constraint::Real)
    }

    fn is_volume_preserving(&self) -> bool {
        self.bijectors.iter().all(|b| b.is_volume_preserving())
    }

    fn param_shapes(&self, _shape: &[usize]) -> Vec<Vec<usize>> {
        vec![]
    }

    fn forward_shape(&self, shape: &[usize]) -> Vec<usize> {
        self.bijectors
            .iter()
            .fold(shape.to_vec(), |s, b| b.forward_shape(&s))
    }

    fn inverse_shape(&self, shape: &[usize]) -> Vec<usize> {
        self.bijectors
            .iter()
            .rev()
            .fold(shape.to_vec(), |s, b| b.inverse_shape(&s))
    }

    fn num_parameters(&self) -> usize {
        self.bijectors.iter().map(|b| b.num_parameters()).sum()
    }

    fn parameters(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.num_parameters());
        for b in &self.bijectors {
            out.extend(b.parameters());
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
        for b in &mut self.bijectors {
            let n = b.num_parameters();
            b.set_parameters(&values[offset..offset + n])?;
            offset += n;
        }
        Ok(())
    }

    fn forward_raw(
        &self,
        x: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let batch_ndim = self.batch_ndim(x);
        let mut cur = x.clone();
        let mut total: Option<ArrayD<f64>> = None;
        for b in &self.bijectors {
            let ctx = Self::child_context(b.as_ref(), context);
            let (y, hop) = b.forward_raw(&cur, ctx)?;
            let term = self.reduce_hop(&hop, batch_ndim);
            total = Some(match total {
                Some(acc) => acc + term,
                None => term,
            });
            cur = y;
        }
        Ok((cur, total.expect("composite has at least one member")))
    }

    fn inverse_raw(
        &self,
        y: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let batch_ndim = self.batch_ndim(y);
        let mut cur = y.clone();
        let mut total: Option<ArrayD<f64>> = None;
        for b in self.bijectors.iter().rev() {
            let ctx = Self::child_context(b.as_ref(), context);
            let (x, hop) = b.inverse_raw(&cur, ctx)?;
            let term = self.reduce_hop(&hop, batch_ndim);
            total = Some(match total {
                Some(acc) => acc + term,
                None => term,
            });
            cur = x;
        }
        Ok((cur, total.expect("composite has at least one member")))
    }

    fn log_abs_det_raw(
        &self,
        _x: &ArrayD<f64>,
        y: &ArrayD<f64>,
        context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        self.recompute_log_abs_det(&FlowTensor::new(y.clone()), context)
    }

    fn forward(&self, x: &FlowTensor, context: Option<&Array1<f64>>) -> Result<FlowTensor> {
        self.check_context(context)?;
        let tracking = is_tracking_enabled();
        if tracking
            && x.from_inverse()
            && x.producer() == Some(self.id)
            && x.context_matches(context)
        {
            if let Some(parent) = x.parent() {
                return Ok(parent);
            }
        }
        self.check_shape(x.array())?;

        let want_log_det = tracking && requires_log_det();
        let mut cur = x.clone();
        let mut total: Option<ArrayD<f64>> = None;
        let mut complete = true;

        for b in &self.bijectors {
            let ctx = Self::child_context(b.as_ref(), context);
            let y = b.forward(&cur, ctx)?;
            if want_log_det {
                // A fresh computation leaves the hop term on the output; a
                // member shortcut consumed the input's trace instead.
                let hop = if y.from_forward() && y.producer() == Some(b.id()) {
                    y.cached_log_det().cloned()
                } else if cur.from_inverse() && cur.producer() == Some(b.id()) {
                    cur.cached_log_det().cloned()
                } else {
                    None
                };
                match hop {
                    Some(h) => {
                        let batch_ndim = self.batch_ndim(y.array());
                        let term = self.reduce_hop(&h, batch_ndim);
                        total = Some(match total {
                            Some(acc) => acc + term,
                            None => term,
                        });
                    }
                    None => complete = false,
                }
            }
            cur = y;
        }

        if tracking && !cur.is_tracked() {
            let log_det = if want_log_det && complete { total } else { None };
            cur = FlowTensor::retag(x, &cur, self.id, Direction::Forward, log_det, context)?;
        }
        Ok(cur)
    }

    fn inverse(&self, y: &FlowTensor, context: Option<&Array1<f64>>) -> Result<FlowTensor> {
        self.check_context(context)?;
        let tracking = is_tracking_enabled();
        if tracking
            && y.from_forward()
            && y.producer() == Some(self.id)
            && y.context_matches(context)
        {
            if let Some(parent) = y.parent() {
                return Ok(parent);
            }
        }
        self.check_shape(y.array())?;

        let want_log_det = tracking && requires_log_det();
        let mut cur = y.clone();
        let mut total: Option<ArrayD<f64>> = None;
        let mut complete = true;

        for b in self.bijectors.iter().rev() {
            let ctx = Self::child_context(b.as_ref(), context);
            let x = b.inverse(&cur, ctx)?;
            if want_log_det {
                let hop = if x.from_inverse() && x.producer() == Some(b.id()) {
                    x.cached_log_det().cloned()
                } else if cur.from_forward() && cur.producer() == Some(b.id()) {
                    cur.cached_log_det().cloned()
                } else {
                    None
                };
                match hop {
                    Some(h) => {
                        let batch_ndim = self.batch_ndim(x.array());
                        let term = self.reduce_hop(&h, batch_ndim);
                        total = Some(match total {
                            Some(acc) => acc + term,
                            None => term,
                        });
                    }
                    None => complete = false,
                }
            }
            cur = x;
        }

        if tracking && !cur.is_tracked() {
            let log_det = if want_log_det && complete { total } else { None };
            cur = FlowTensor::retag(y, &cur, self.id, Direction::Inverse, log_det, context)?;
        }
        Ok(cur)
    }

    fn log_abs_det_jacobian(
        &self,
        x: &FlowTensor,
        y: &FlowTensor,
        context: Option<&Array1<f64>>,
    ) -> Result<ArrayD<f64>> {
        self.check_context(context)?;
        let batch_ndim = self.batch_ndim(y.array());
        if is_tracking_enabled() {
            if y.has_ancestor(x) {
                if let Ok(total) = y.log_abs_det_to_ancestor(x, batch_ndim) {
                    return Ok(total);
                }
            }
            if x.has_ancestor(y) {
                if let Ok(total) = x.log_abs_det_to_ancestor(y, batch_ndim) {
                    return Ok(total.mapv(|v| -v));
                }
            }
        }
        tracing::warn!(
            "no cached chain between the queried tensors; recomputing the composite log-Jacobian"
        );
        self.recompute_log_abs_det(y, context)
    }
}

/// Deferred [`Compose`] construction: each part is built in order, with the
/// event shape propagated through `forward_shape`.
pub struct ComposeConfig {
    parts: Vec<Box<dyn LazyBijector>>,
}

impl ComposeConfig {
    pub fn new(parts: Vec<Box<dyn LazyBijector>>) -> Self {
        ComposeConfig { parts }
    }

    pub fn push(mut self, part: Box<dyn LazyBijector>) -> Self {
        self.parts.push(part);
        self
    }
}

impl LazyBijector for ComposeConfig {
    fn build(&self, shape: &[usize], context_size: usize) -> Result<Box<dyn Bijector>> {
        if self.parts.is_empty() {
            return Err(FlowError::config("cannot compose an empty bijector sequence"));
        }
        let mut bijectors = Vec::with_capacity(self.parts.len());
        let mut cur_shape = shape.to_vec();
        for part in &self.parts {
            let b = part.build(&cur_shape, context_size)?;
            cur_shape = b.forward_shape(&cur_shape);
            bijectors.push(b);
        }
        Ok(Box::new(Compose::new(bijectors)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijectors::{AffineFixedConfig, ExpConfig, PermuteConfig};
    use crate::tracking::set_tracking;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn chain() -> Box<dyn Bijector> {
        ComposeConfig::new(vec![
            Box::new(AffineFixedConfig::new(0.5, 2.0)),
            Box::new(PermuteConfig::default().with_permutation(vec![1, 0])),
            Box::new(ExpConfig),
        ])
        .build(&[2], 0)
        .unwrap()
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let err = ComposeConfig::new(vec![]).build(&[2], 0).unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn test_forward_matches_members_applied_in_order() {
        let c = chain();
        let a = AffineFixedConfig::new(0.5, 2.0).build(&[2], 0).unwrap();
        let p = PermuteConfig::default()
            .with_permutation(vec![1, 0])
            .build(&[2], 0)
            .unwrap();
        let e = ExpConfig.build(&[2], 0).unwrap();

        let x = arr1(&[0.3, -0.8]).into_dyn();
        let (y_c, ldj_c) = c.forward_raw(&x, None).unwrap();

        let (h1, l1) = a.forward_raw(&x, None).unwrap();
        let (h2, l2) = p.forward_raw(&h1, None).unwrap();
        let (y_m, l3) = e.forward_raw(&h2, None).unwrap();

        for (a, b) in y_c.iter().zip(y_m.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        // Composite log-det equals the sum of member log-dets at the
        // composite's event granularity.
        let expected = l1.sum() + l2[[]] + l3.sum();
        assert_abs_diff_eq!(ldj_c[[]], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_roundtrip_and_shortcut() {
        let c = chain();
        let x = FlowTensor::from(arr1(&[0.2, 1.4]));
        let y = c.forward(&x, None).unwrap();
        let x_back = c.inverse(&y, None).unwrap();
        assert!(x_back.same_value(&x), "chain must unwind hop by hop to the input");

        let _guard = set_tracking(false);
        let y2 = c.forward(&x, None).unwrap();
        let x2 = c.inverse(&y2, None).unwrap();
        assert!(!x2.same_value(&x));
        for (a, b) in x2.array().iter().zip(x.array().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_cached_jacobian_matches_recomputed() {
        let c = chain();
        let x = FlowTensor::from(arr1(&[0.2, 1.4]));
        let y = c.forward(&x, None).unwrap();
        let cached = c.log_abs_det_jacobian(&x, &y, None).unwrap();

        let fresh = {
            let _guard = set_tracking(false);
            let y_plain = FlowTensor::new(y.array().clone());
            let x_plain = FlowTensor::new(x.array().clone());
            c.log_abs_det_jacobian(&x_plain, &y_plain, None).unwrap()
        };
        assert_abs_diff_eq!(cached[[]], fresh[[]], epsilon = 1e-10);
    }

    #[test]
    fn test_jacobian_from_inverse_direction_chain() {
        let c = chain();
        // Start from the codomain: positive values only (Exp output).
        let y = FlowTensor::from(arr1(&[0.9, 2.1]));
        let x = c.inverse(&y, None).unwrap();
        // x carries the cached chain back to y; the forward-sense value
        // must equal the freshly recomputed one.
        let via_cache = c.log_abs_det_jacobian(&x, &y, None).unwrap();
        let fresh = {
            let _guard = set_tracking(false);
            c.log_abs_det_jacobian(
                &FlowTensor::new(x.array().clone()),
                &FlowTensor::new(y.array().clone()),
                None,
            )
            .unwrap()
        };
        assert_abs_diff_eq!(via_cache[[]], fresh[[]], epsilon = 1e-10);
    }

    #[test]
    fn test_volume_preserving_flag() {
        let c = ComposeConfig::new(vec![
            Box::new(PermuteConfig::default().with_permutation(vec![1, 0])),
            Box::new(PermuteConfig::default().with_permutation(vec![1, 0])),
        ])
        .build(&[2], 0)
        .unwrap();
        assert!(c.is_volume_preserving());
        assert!(!chain().is_volume_preserving());
    }
}
