//! Elementwise numeric helpers shared by the bijector implementations.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

use crate::error::{FlowError, Result};

/// Numerically stable softplus, `ln(1 + e^x)`.
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Logistic sigmoid.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(sigmoid(x))` without overflow for large negative `x`.
pub fn log_sigmoid(x: f64) -> f64 {
    -softplus(-x)
}

/// Sigmoid clipped away from exactly 0 and 1 so that its inverse stays
/// finite.
pub fn clipped_sigmoid(x: f64) -> f64 {
    sigmoid(x).clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON)
}

/// Logit of a value clipped into the open unit interval.
pub fn logit(y: f64) -> f64 {
    let y = y.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
    y.ln() - (-y).ln_1p()
}

/// Sum the `k` right-most axes of `x`.
///
/// `k == 0` returns the array unchanged; summing every axis yields a 0-d
/// array.
pub fn sum_rightmost(x: &ArrayD<f64>, k: usize) -> ArrayD<f64> {
    let mut result = x.clone();
    for _ in 0..k {
        let last = result.ndim() - 1;
        result = result.sum_axis(Axis(last));
    }
    result
}

/// Split `batch shape + event shape` input into a `(batch, event)` matrix
/// plus the batch shape needed to restore it.
///
/// The event is the single trailing axis (`event_len` dims); all leading
/// axes are batch. A bare vector is treated as a batch of one.
pub fn flatten_event(x: &ArrayViewD<'_, f64>, event_len: usize) -> Result<(ndarray::Array2<f64>, Vec<usize>)> {
    let shape = x.shape();
    if shape.is_empty() || shape[shape.len() - 1] != event_len {
        return Err(FlowError::shape(format!(
            "expected trailing event dimension {}, got shape {:?}",
            event_len, shape
        )));
    }
    let batch_shape: Vec<usize> = shape[..shape.len() - 1].to_vec();
    let batch: usize = batch_shape.iter().product::<usize>().max(1);
    let flat = x
        .as_standard_layout()
        .into_owned()
        .into_shape((batch, event_len))
        .map_err(|e| FlowError::shape(format!("cannot flatten input: {}", e)))?;
    Ok((flat, batch_shape))
}

/// Restore a `(batch, event)` matrix to `batch shape + [event]`.
pub fn unflatten_event(x: ndarray::Array2<f64>, batch_shape: &[usize]) -> ArrayD<f64> {
    let event_len = x.ncols();
    let mut shape = batch_shape.to_vec();
    shape.push(event_len);
    x.into_shape(IxDyn(&shape))
        .expect("batch shape product matches flattened rows")
}

/// Restore a per-row vector (one entry per flattened batch element) to the
/// batch shape. An empty batch shape yields a 0-d array.
pub fn unflatten_batch(x: ndarray::Array1<f64>, batch_shape: &[usize]) -> ArrayD<f64> {
    if batch_shape.is_empty() {
        ndarray::arr0(x[0]).into_dyn()
    } else {
        x.into_shape(IxDyn(batch_shape))
            .expect("batch shape product matches vector length")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_softplus_stable() {
        assert_abs_diff_eq!(softplus(0.0), 2.0_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(softplus(100.0), 100.0, epsilon = 1e-12);
        assert!(softplus(-100.0) > 0.0);
    }

    #[test]
    fn test_sigmoid_logit_roundtrip() {
        for &x in &[-3.0, -0.5, 0.0, 0.7, 4.0] {
            assert_abs_diff_eq!(logit(sigmoid(x)), x, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_sum_rightmost() {
        let x = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let s1 = sum_rightmost(&x, 1);
        assert_eq!(s1.shape(), &[2]);
        assert_abs_diff_eq!(s1[[0]], 3.0);
        let s2 = sum_rightmost(&x, 2);
        assert_eq!(s2.ndim(), 0);
        assert_abs_diff_eq!(s2[[]], 10.0);
    }

    #[test]
    fn test_flatten_roundtrip() {
        let x = ndarray::Array::from_shape_fn(IxDyn(&[3, 4, 2]), |ix| (ix[0] + ix[2]) as f64);
        let (flat, batch) = flatten_event(&x.view(), 2).unwrap();
        assert_eq!(flat.dim(), (12, 2));
        assert_eq!(batch, vec![3, 4]);
        let back = unflatten_event(flat, &batch);
        assert_eq!(back, x);
    }

    #[test]
    fn test_flatten_vector_input() {
        let x = array![1.0, 2.0, 3.0].into_dyn();
        let (flat, batch) = flatten_event(&x.view(), 3).unwrap();
        assert_eq!(flat.dim(), (1, 3));
        assert!(batch.is_empty());
        let ldj = unflatten_batch(ndarray::arr1(&[5.0]), &batch);
        assert_eq!(ldj.ndim(), 0);
    }

    #[test]
    fn test_flatten_shape_error() {
        let x = array![[1.0, 2.0, 3.0]].into_dyn();
        assert!(flatten_event(&x.view(), 2).is_err());
    }
}
