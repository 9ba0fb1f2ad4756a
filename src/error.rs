//! Error types shared across the library.

use thiserror::Error;

/// Errors surfaced by flow construction and evaluation.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Invalid builder/config values (unknown scale function, empty layer
    /// stack, malformed permutation, ...). Reported at build time.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Input or parameter shapes inconsistent with what a bijector or
    /// parameter provider was built for.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Violation of the tracked computation graph: no ancestor path between
    /// two tensors, or a malformed cached log-Jacobian.
    #[error("flow graph violation: {0}")]
    Graph(String),
}

impl FlowError {
    pub fn config(msg: impl Into<String>) -> Self {
        FlowError::Configuration(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        FlowError::Shape(msg.into())
    }

    pub fn graph(msg: impl Into<String>) -> Self {
        FlowError::Graph(msg.into())
    }
}

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, FlowError>;
