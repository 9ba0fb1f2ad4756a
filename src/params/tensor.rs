//! Plain learnable-tensor provider for elementwise bijectors.

use ndarray::{Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Parameters;
use crate::error::{FlowError, Result};
use crate::lazy::LazyParameters;

/// Input-independent parameters: one learnable flat tensor per declared
/// shape, broadcast over the batch at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorParams {
    input_shape: Vec<usize>,
    param_shapes: Vec<Vec<usize>>,
    context_size: usize,
    values: Vec<Array1<f64>>,
}

impl TensorParams {
    pub fn build(
        input_shape: &[usize],
        param_shapes: &[Vec<usize>],
        context_size: usize,
        init_scale: f64,
    ) -> Result<Self> {
        if param_shapes.is_empty() {
            return Err(FlowError::config(
                "tensor provider needs at least one parameter shape",
            ));
        }
        let mut rng = rand::thread_rng();
        let values = param_shapes
            .iter()
            .map(|shape| {
                let len = shape.iter().product::<usize>().max(1);
                Array1::from_shape_fn(len, |_| rng.gen::<f64>() * 2.0 * init_scale - init_scale)
            })
            .collect();
        Ok(TensorParams {
            input_shape: input_shape.to_vec(),
            param_shapes: param_shapes.to_vec(),
            context_size,
            values,
        })
    }

    pub fn values(&self) -> &[Array1<f64>] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [Array1<f64>] {
        &mut self.values
    }
}

impl Parameters for TensorParams {
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
        _context: Option<&Array1<f64>>,
    ) -> Result<Vec<Array2<f64>>> {
        let batch = x.nrows();
        Ok(self
            .values
            .iter()
            .map(|v| {
                Array2::from_shape_fn((batch, v.len()), |(_, j)| v[j])
            })
            .collect())
    }

    fn num_parameters(&self) -> usize {
        self.values.iter().map(|v| v.len()).sum()
    }

    fn parameters(&self) -> Vec<f64> {
        self.values.iter().flat_map(|v| v.iter().cloned()).collect()
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
        for v in &mut self.values {
            let len = v.len();
            for (dst, &src) in v.iter_mut().zip(&values[offset..offset + len]) {
                *dst = src;
            }
            offset += len;
        }
        Ok(())
    }
}

/// Deferred [`TensorParams`] construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorParamsConfig {
    pub init_scale: f64,
}

impl Default for TensorParamsConfig {
    fn default() -> Self {
        TensorParamsConfig { init_scale: 1e-3 }
    }
}

impl TensorParamsConfig {
    pub fn with_init_scale(mut self, scale: f64) -> Self {
        self.init_scale = scale;
        self
    }

    pub fn build_tensor(
        &self,
        input_shape: &[usize],
        param_shapes: &[Vec<usize>],
        context_size: usize,
    ) -> Result<TensorParams> {
        TensorParams::build(input_shape, param_shapes, context_size, self.init_scale)
    }
}

impl LazyParameters for TensorParamsConfig {
    fn build(
        &self,
        input_shape: &[usize],
        param_shapes: &[Vec<usize>],
        context_size: usize,
    ) -> Result<Box<dyn Parameters>> {
        Ok(Box::new(self.build_tensor(
            input_shape,
            param_shapes,
            context_size,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_over_batch() {
        let params =
            TensorParams::build(&[3], &[vec![3], vec![3]], 0, 1e-3).unwrap();
        let x = Array2::zeros((5, 3));
        let out = params.evaluate(&x, None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].dim(), (5, 3));
        // All rows identical: parameters are input-independent.
        for row in out[0].rows() {
            for (a, b) in row.iter().zip(out[0].row(0).iter()) {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_flat_roundtrip() {
        let mut params = TensorParams::build(&[2], &[vec![2], vec![2]], 0, 1e-3).unwrap();
        let flat = params.parameters();
        assert_eq!(flat.len(), 4);
        let replaced: Vec<f64> = (0..4).map(|i| i as f64).collect();
        params.set_parameters(&replaced).unwrap();
        assert_eq!(params.parameters(), replaced);
        assert!(params.set_parameters(&[1.0]).is_err());
    }
}
