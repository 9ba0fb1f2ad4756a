//! Maximum-likelihood training for masked-autoregressive density
//! estimators, plus checkpointing.

use std::path::Path;

use ndarray::Array2;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::bijectors::{AffineAutoregressive, Bijector};
use crate::error::Result;
use crate::nn::{Adam, Optimizer};
use crate::params::Parameters;

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            learning_rate: crate::config::DEFAULT_LEARNING_RATE,
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            epochs: 100,
        }
    }
}

/// Per-epoch loss record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_losses: Vec<f64>,
    pub val_losses: Vec<f64>,
}

/// Fits an [`AffineAutoregressive`] read in the normalizing direction: each
/// step scores a minibatch against a standard normal in base space, takes
/// analytic gradients of the negative log-likelihood, and backpropagates
/// them through the masked hypernetwork. One Adam state per layer.
pub struct DensityTrainer {
    config: TrainConfig,
    optimizers: Option<Vec<Box<dyn Optimizer>>>,
    best_val_loss: f64,
    best_params: Option<Vec<f64>>,
    pub history: TrainingHistory,
}

impl DensityTrainer {
    pub fn new(config: TrainConfig) -> Self {
        DensityTrainer {
            config,
            optimizers: None,
            best_val_loss: f64::INFINITY,
            best_params: None,
            history: TrainingHistory::default(),
        }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    fn ensure_optimizers(&mut self, model: &AffineAutoregressive) {
        if self.optimizers.is_none() {
            let template = Adam::new(self.config.learning_rate);
            self.optimizers = Some(
                (0..model.hypernet().num_layers())
                    .map(|_| template.clone_box())
                    .collect(),
            );
        }
    }

    /// One gradient step on a minibatch; returns the batch NLL.
    pub fn step(&mut self, model: &mut AffineAutoregressive, batch: &Array2<f64>) -> Result<f64> {
        self.ensure_optimizers(model);
        let (loss, out_grads) = model.nll_grads(batch)?;
        let layer_grads = model.hypernet().backward(&out_grads)?;
        let optimizers = self.optimizers.as_mut().expect("initialized above");
        model.hypernet_mut().apply_gradients(&layer_grads, optimizers)?;
        Ok(loss)
    }

    /// One pass over shuffled minibatches; returns the mean batch NLL.
    pub fn train_epoch(
        &mut self,
        model: &mut AffineAutoregressive,
        data: &Array2<f64>,
    ) -> Result<f64> {
        let n = data.nrows();
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut total = 0.0;
        let mut batches = 0usize;
        for chunk in order.chunks(self.config.batch_size.max(1)) {
            let batch = ndarray::Array2::from_shape_fn((chunk.len(), data.ncols()), |(i, j)| {
                data[[chunk[i], j]]
            });
            total += self.step(model, &batch)?;
            batches += 1;
        }
        let mean = total / batches.max(1) as f64;
        self.history.train_losses.push(mean);
        Ok(mean)
    }

    /// Score held-out data; tracks the best parameters seen.
    pub fn validate(&mut self, model: &AffineAutoregressive, data: &Array2<f64>) -> Result<f64> {
        let loss = model.nll(data)?;
        self.history.val_losses.push(loss);
        if loss < self.best_val_loss {
            self.best_val_loss = loss;
            self.best_params = Some(model.hypernet().parameters());
        }
        Ok(loss)
    }

    pub fn best_loss(&self) -> f64 {
        self.best_val_loss
    }

    /// Restore the best validated parameters, if any were recorded.
    pub fn restore_best(&self, model: &mut AffineAutoregressive) -> Result<()> {
        if let Some(params) = &self.best_params {
            model.hypernet_mut().set_parameters(params)?;
        }
        Ok(())
    }

    /// Full training loop with optional validation data.
    pub fn fit(
        &mut self,
        model: &mut AffineAutoregressive,
        train: &Array2<f64>,
        val: Option<&Array2<f64>>,
    ) -> Result<()> {
        for epoch in 0..self.config.epochs {
            let train_loss = self.train_epoch(model, train)?;
            match val {
                Some(val) => {
                    let val_loss = self.validate(model, val)?;
                    tracing::info!(epoch, train_loss, val_loss, "epoch complete");
                }
                None => {
                    tracing::info!(epoch, train_loss, "epoch complete");
                }
            }
        }
        if val.is_some() {
            self.restore_best(model)?;
        }
        Ok(())
    }
}

/// Serialized training state: flat model parameters plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub parameters: Vec<f64>,
    pub epoch: usize,
    pub best_val_loss: f64,
    pub history: TrainingHistory,
}

impl Checkpoint {
    pub fn capture(bijector: &dyn Bijector, trainer: &DensityTrainer) -> Self {
        Checkpoint {
            parameters: bijector.parameters(),
            epoch: trainer.history.train_losses.len(),
            best_val_loss: trainer.best_val_loss,
            history: trainer.history.clone(),
        }
    }

    /// Load the stored parameters into a compatibly-built bijector.
    pub fn apply(&self, bijector: &mut dyn Bijector) -> Result<()> {
        bijector.set_parameters(&self.parameters)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let checkpoint = bincode::deserialize(&bytes)?;
        Ok(checkpoint)
    }
}
