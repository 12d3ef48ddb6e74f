/// Multi-Layer Perceptron (MLP) - Generic feedforward neural network
///
/// This is the `MlpPolicy` network: every actor, critic and Q-network in the crate is
/// one of these.

use burn::{
    module::{Module, Param},
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::{activation::relu, backend::Backend},
};

/// Configuration for Multi-Layer Perceptron
#[derive(Config, Debug)]
pub struct MLPConfig {
    /// Input dimension
    pub input_dim: usize,
    /// Hidden layer dimensions (e.g., [64, 64] for two hidden layers of 64 units each)
    pub hidden_layers: Vec<usize>,
    /// Output dimension
    pub output_dim: usize,
}

/// Multi-Layer Perceptron implementation
///
/// Hidden layers use ReLU activation
/// Output layer has no activation (linear)
#[derive(Module, Debug)]
pub struct MLP<B: Backend> {
    layers: Vec<Linear<B>>,
}

impl MLPConfig {
    /// Initialize the MLP with the given configuration
    pub fn init<B: Backend>(&self, device: &B::Device) -> MLP<B> {
        let mut dims = Vec::with_capacity(self.hidden_layers.len() + 2);
        dims.push(self.input_dim);
        dims.extend_from_slice(&self.hidden_layers);
        dims.push(self.output_dim);

        // Input → hidden → ... → output, or input → output without hidden layers
        let layers = dims
            .windows(2)
            .map(|pair| LinearConfig::new(pair[0], pair[1]).init(device))
            .collect();

        MLP { layers }
    }
}

impl<B: Backend> MLP<B> {
    /// Generic forward pass - works with any tensor dimension
    ///
    /// Applies ReLU activation to all hidden layers, no activation on output layer.
    ///
    /// Works with:
    /// - D=1: Single example `[features]`
    /// - D=2: Batch processing `[batch, features]` (most common)
    /// - D=3: Sequences or multi-entity `[batch, sequence/entities, features]`
    ///
    /// The last dimension is always treated as the feature dimension.
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let Some((output_layer, hidden)) = self.layers.split_last() else {
            return input;
        };

        let mut x = input;
        for layer in hidden {
            x = relu(layer.forward(x));
        }

        output_layer.forward(x)
    }

    /// Soft update: θ′ ← τθ + (1 − τ)θ′
    ///
    /// Used for the DQN target network.
    /// Updates `self` (target) toward `other` (policy) by factor `tau`.
    pub fn soft_update(&mut self, other: &Self, tau: f32) {
        for (target_layer, policy_layer) in self.layers.iter_mut().zip(other.layers.iter()) {
            soft_update_linear_inplace(target_layer, policy_layer, tau);
        }
    }
}

fn soft_update_tensor_inplace<B: Backend, const D: usize>(
    this: &mut Param<Tensor<B, D>>,
    that: &Param<Tensor<B, D>>,
    tau: f32,
) {
    // detach() keeps the autodiff graph from growing with every update
    *this = this.clone().map(|tensor| tensor * (1.0 - tau) + that.val().detach() * tau);
}

fn soft_update_linear_inplace<B: Backend>(this: &mut Linear<B>, that: &Linear<B>, tau: f32) {
    soft_update_tensor_inplace(&mut this.weight, &that.weight, tau);

    if let (Some(b1), Some(b2)) = (&mut this.bias, &that.bias) {
        soft_update_tensor_inplace(b1, b2, tau);
    }
}
