//! Deferred construction of bijectors and parameter providers.
//!
//! A flow is usually assembled before the dimensionality of the data is
//! known: the base distribution (or an enclosing composite) supplies the
//! event shape last. Config structs capture everything else up front and
//! implement these traits; `build` completes construction once the shape is
//! available. Calling a config's setters again overrides the earlier
//! binding. Invalid bindings surface as configuration or shape errors at
//! build time, never later.

use crate::bijectors::Bijector;
use crate::error::Result;
use crate::params::Parameters;

/// A bijector specification waiting for its event shape.
pub trait LazyBijector {
    /// Complete construction for the given event shape and conditioning
    /// size.
    fn build(&self, shape: &[usize], context_size: usize) -> Result<Box<dyn Bijector>>;
}

/// A parameter-provider specification waiting for the shapes declared by
/// its bijector.
pub trait LazyParameters {
    /// Allocate provider state realizing each of `param_shapes` from inputs
    /// of `input_shape` (plus an optional context of `context_size` dims).
    fn build(
        &self,
        input_shape: &[usize],
        param_shapes: &[Vec<usize>],
        context_size: usize,
    ) -> Result<Box<dyn Parameters>>;
}
