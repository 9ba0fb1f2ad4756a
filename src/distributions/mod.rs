//! Probability distributions: the base-distribution contract, a diagonal
//! normal, and the flow distribution built from a base plus a bijector.

mod flow;
mod normal;

pub use flow::Flow;
pub use normal::DiagNormal;

use ndarray::ArrayD;

use crate::error::Result;

/// Sampling and scoring contract for base (and target) distributions.
///
/// `sample(n)` returns `n` draws shaped `(n,) + event_shape`. `rsample` is
/// the reparameterized variant used on gradient-carrying paths; `log_prob`
/// returns one value per batch element, with the event dimensions already
/// summed out.
pub trait Distribution {
    fn event_shape(&self) -> &[usize];

    fn batch_shape(&self) -> &[usize] {
        &[]
    }

    fn sample(&self, n: usize) -> ArrayD<f64>;

    fn rsample(&self, n: usize) -> ArrayD<f64> {
        self.sample(n)
    }

    fn log_prob(&self, value: &ArrayD<f64>) -> Result<ArrayD<f64>>;
}
