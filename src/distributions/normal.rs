//! Independent normal distribution with diagonal scale.

use ndarray::{Array1, Array2, ArrayD};
use rand_distr::{Distribution as RandDistribution, Normal};

use super::Distribution;
use crate::error::{FlowError, Result};
use crate::ops::{flatten_event, unflatten_batch};

/// `N(loc, diag(scale²))` over a vector event.
#[derive(Debug, Clone)]
pub struct DiagNormal {
    loc: Array1<f64>,
    scale: Array1<f64>,
    event_shape: Vec<usize>,
}

impl DiagNormal {
    pub fn new(loc: Array1<f64>, scale: Array1<f64>) -> Result<Self> {
        if loc.len() != scale.len() {
            return Err(FlowError::shape(format!(
                "loc has {} dims, scale has {}",
                loc.len(),
                scale.len()
            )));
        }
        if scale.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
            return Err(FlowError::config("scale entries must be positive and finite"));
        }
        let event_shape = vec![loc.len()];
        Ok(DiagNormal {
            loc,
            scale,
            event_shape,
        })
    }

    /// Standard normal over `dim` dimensions.
    pub fn standard(dim: usize) -> Self {
        DiagNormal {
            loc: Array1::zeros(dim),
            scale: Array1::ones(dim),
            event_shape: vec![dim],
        }
    }

    pub fn loc(&self) -> &Array1<f64> {
        &self.loc
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    fn dim(&self) -> usize {
        self.loc.len()
    }
}

impl Distribution for DiagNormal {
    fn event_shape(&self) -> &[usize] {
        &self.event_shape
    }

    fn sample(&self, n: usize) -> ArrayD<f64> {
        let mut rng = rand::thread_rng();
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((n, self.dim()), |(_, j)| {
            self.loc[j] + self.scale[j] * normal.sample(&mut rng)
        })
        .into_dyn()
    }

    fn log_prob(&self, value: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        let (v, batch_shape) = flatten_event(&value.view(), self.dim())?;
        let half_ln_2pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
        let lp = Array1::from_shape_fn(v.nrows(), |b| {
            (0..self.dim())
                .map(|j| {
                    let z = (v[[b, j]] - self.loc[j]) / self.scale[j];
                    -0.5 * z * z - self.scale[j].ln() - half_ln_2pi
                })
                .sum()
        });
        Ok(unflatten_batch(lp, &batch_shape))
    }
}
