//! Parameter providers: the state that turns a bijector's input into the
//! parameters of its transform.

mod dense_autoregressive;
mod tensor;

pub use dense_autoregressive::{DenseAutoregressive, DenseAutoregressiveConfig};
pub use tensor::{TensorParams, TensorParamsConfig};

use ndarray::{Array1, Array2};

use crate::error::Result;

/// A built parameter provider.
///
/// `evaluate` is a pure function of the input for fixed weights: it must
/// not mutate provider state beyond interior bookkeeping (activation caches
/// for the backward pass, the evaluation counter). Weights change only
/// between calls, through `set_parameters` or an optimizer.
///
/// Inputs arrive batch-flattened: `(batch, event size)` matrices, with the
/// optional context as a single vector broadcast over the batch. Each
/// returned tensor is `(batch, parameter size)` in the order the shapes
/// were declared.
pub trait Parameters {
    fn input_shape(&self) -> &[usize];

    fn param_shapes(&self) -> &[Vec<usize>];

    fn context_size(&self) -> usize;

    fn evaluate(&self, x: &Array2<f64>, context: Option<&Array1<f64>>)
        -> Result<Vec<Array2<f64>>>;

    /// How many times `evaluate` has run. Autoregressive inversion cost is
    /// observable through this counter.
    fn evaluations(&self) -> usize {
        0
    }

    fn num_parameters(&self) -> usize;

    /// Flat parameter vector for checkpointing.
    fn parameters(&self) -> Vec<f64>;

    fn set_parameters(&mut self, values: &[f64]) -> Result<()>;
}
