//! First-order optimizers for the hypernetwork weights.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Per-layer weight updater. One optimizer instance holds the moment state
/// for exactly one layer; clone it per layer via `clone_box`.
pub trait Optimizer {
    fn update_weights(&mut self, weights: &mut Array2<f64>, gradients: &Array2<f64>);

    fn update_biases(&mut self, biases: &mut Array1<f64>, gradients: &Array1<f64>);

    /// Clear accumulated state for a fresh training run.
    fn reset(&mut self);

    fn clone_box(&self) -> Box<dyn Optimizer>;
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    #[serde(skip)]
    velocity_w: Option<Array2<f64>>,
    #[serde(skip)]
    velocity_b: Option<Array1<f64>>,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Sgd {
            learning_rate,
            momentum: 0.0,
            velocity_w: None,
            velocity_b: None,
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn update_weights(&mut self, weights: &mut Array2<f64>, gradients: &Array2<f64>) {
        if self.momentum > 0.0 {
            let v = self
                .velocity_w
                .get_or_insert_with(|| Array2::zeros(weights.dim()));
            *v = &*v * self.momentum - gradients * self.learning_rate;
            *weights = &*weights + &*v;
        } else {
            *weights = &*weights - &(gradients * self.learning_rate);
        }
    }

    fn update_biases(&mut self, biases: &mut Array1<f64>, gradients: &Array1<f64>) {
        if self.momentum > 0.0 {
            let v = self
                .velocity_b
                .get_or_insert_with(|| Array1::zeros(biases.len()));
            *v = &*v * self.momentum - gradients * self.learning_rate;
            *biases = &*biases + &*v;
        } else {
            *biases = &*biases - &(gradients * self.learning_rate);
        }
    }

    fn reset(&mut self) {
        self.velocity_w = None;
        self.velocity_b = None;
    }

    fn clone_box(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

/// Adam. The step counter advances on `update_weights`; call it before
/// `update_biases` within a step so both use the same bias correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    #[serde(skip)]
    t: usize,
    #[serde(skip)]
    m_w: Option<Array2<f64>>,
    #[serde(skip)]
    v_w: Option<Array2<f64>>,
    #[serde(skip)]
    m_b: Option<Array1<f64>>,
    #[serde(skip)]
    v_b: Option<Array1<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m_w: None,
            v_w: None,
            m_b: None,
            v_b: None,
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for Adam {
    fn update_weights(&mut self, weights: &mut Array2<f64>, gradients: &Array2<f64>) {
        self.t += 1;

        let m = self.m_w.get_or_insert_with(|| Array2::zeros(weights.dim()));
        let v = self.v_w.get_or_insert_with(|| Array2::zeros(weights.dim()));

        *m = &*m * self.beta1 + gradients * (1.0 - self.beta1);
        *v = &*v * self.beta2 + &(gradients * gradients) * (1.0 - self.beta2);

        let m_hat = &*m / (1.0 - self.beta1.powi(self.t as i32));
        let v_hat = &*v / (1.0 - self.beta2.powi(self.t as i32));

        *weights =
            &*weights - &(&m_hat * self.learning_rate / &(v_hat.mapv(f64::sqrt) + self.epsilon));
    }

    fn update_biases(&mut self, biases: &mut Array1<f64>, gradients: &Array1<f64>) {
        let t = self.t.max(1);

        let m = self.m_b.get_or_insert_with(|| Array1::zeros(biases.len()));
        let v = self.v_b.get_or_insert_with(|| Array1::zeros(biases.len()));

        *m = &*m * self.beta1 + gradients * (1.0 - self.beta1);
        *v = &*v * self.beta2 + &(gradients * gradients) * (1.0 - self.beta2);

        let m_hat = &*m / (1.0 - self.beta1.powi(t as i32));
        let v_hat = &*v / (1.0 - self.beta2.powi(t as i32));

        *biases =
            &*biases - &(&m_hat * self.learning_rate / &(v_hat.mapv(f64::sqrt) + self.epsilon));
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m_w = None;
        self.v_w = None;
        self.m_b = None;
        self.v_b = None;
    }

    fn clone_box(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_sgd_step() {
        let mut opt = Sgd::new(0.1);
        let mut w = Array2::from_elem((2, 2), 1.0);
        let g = Array2::from_elem((2, 2), 0.5);
        opt.update_weights(&mut w, &g);
        assert_abs_diff_eq!(w[[0, 0]], 0.95, epsilon = 1e-12);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut opt = Sgd::new(0.1).with_momentum(0.9);
        let mut w = Array2::from_elem((1, 1), 0.0);
        let g = Array2::from_elem((1, 1), 1.0);
        opt.update_weights(&mut w, &g);
        let first = w[[0, 0]];
        opt.update_weights(&mut w, &g);
        let second_step = w[[0, 0]] - first;
        assert!(second_step.abs() > first.abs());
    }

    #[test]
    fn test_adam_descends() {
        let mut opt = Adam::new(0.01);
        let mut w = Array2::from_elem((3, 2), 1.0);
        let g = Array2::from_elem((3, 2), 1.0);
        for _ in 0..20 {
            opt.update_weights(&mut w, &g);
        }
        assert!(w[[0, 0]] < 1.0);
    }
}
