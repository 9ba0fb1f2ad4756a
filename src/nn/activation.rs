//! Activation functions used by the masked layers.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Elementwise activation applied after a linear layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    /// No activation (used on output layers).
    Identity,
    ReLU,
    /// Leaky ReLU with negative slope 0.01.
    LeakyReLU,
}

impl Activation {
    pub fn forward(&self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::ReLU => x.max(0.0),
            Activation::LeakyReLU => {
                if x > 0.0 {
                    x
                } else {
                    0.01 * x
                }
            }
        }
    }

    /// Derivative with respect to the pre-activation.
    pub fn derivative(&self, x: f64) -> f64 {
        match self {
            Activation::Identity => 1.0,
            Activation::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.01
                }
            }
        }
    }

    pub fn forward_batch(&self, z: &Array2<f64>) -> Array2<f64> {
        z.mapv(|v| self.forward(v))
    }

    pub fn derivative_batch(&self, z: &Array2<f64>) -> Array2<f64> {
        z.mapv(|v| self.derivative(v))
    }
}
