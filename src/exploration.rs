//! Exploration strategies for value-based agents

use rand::{thread_rng, Rng};

use crate::decay::Decay;

/// Whether the agent should take a random action or follow its policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Explore,
    Exploit,
}

/// ε-greedy exploration with a decaying ε
#[derive(Debug, Clone)]
pub struct EpsilonGreedy<D> {
    decay: D,
}

impl<D: Decay> EpsilonGreedy<D> {
    pub fn new(decay: D) -> Self {
        Self { decay }
    }

    /// The exploration probability after `step` environment steps
    pub fn epsilon(&self, step: u32) -> f32 {
        self.decay.evaluate(step).clamp(0.0, 1.0)
    }

    pub fn choose(&self, step: u32) -> Choice {
        if thread_rng().gen::<f32>() < self.epsilon(step) {
            Choice::Explore
        } else {
            Choice::Exploit
        }
    }
}
