//! Neural network building blocks for RL algorithms

pub mod mlp;

pub use mlp::{MLP, MLPConfig};
