//! Neural-network substrate for hypernetworks: masked linear layers, MADE
//! mask construction, activations, and optimizers.

mod activation;
mod made;
mod optimizer;

pub use activation::Activation;
pub use made::{build_masks, hidden_degrees, LayerGrads, MaskedLinear};
pub use optimizer::{Adam, Optimizer, Sgd};
