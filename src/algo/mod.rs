/// Advantage Actor-Critic
pub mod a2c;

/// Deep Q Network
pub mod dqn;

/// Proximal Policy Optimization
pub mod ppo;

use burn::{
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{adaptor::OptimizerAdaptor, AdamW, AdamWConfig},
    prelude::*,
    tensor::backend::{AutodiffBackend, Backend},
};
use rand::{
    distributions::{Distribution, WeightedIndex},
    thread_rng,
};

/// Copy a tensor's values out as `f32`
pub(crate) fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Index of the largest value, the first one on ties
pub(crate) fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, &v)| {
            if v > best_value {
                (i, v)
            } else {
                (best, best_value)
            }
        })
        .0
}

/// Sample an index from a categorical distribution
///
/// Falls back to the most likely index when the weights are degenerate.
pub(crate) fn sample_categorical(probs: &[f32]) -> usize {
    match WeightedIndex::new(probs) {
        Ok(dist) => dist.sample(&mut thread_rng()),
        Err(_) => argmax(probs),
    }
}

/// Build a 1D `Int` tensor of indices
pub(crate) fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let indices: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    let len = indices.len();
    Tensor::from_data(TensorData::new(indices, [len]).convert::<B::IntElem>(), device)
}

/// Build a 1D `Float` tensor from values
pub(crate) fn float_tensor<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 1> {
    Tensor::from_data(
        TensorData::new(values.to_vec(), [values.len()]).convert::<B::FloatElem>(),
        device,
    )
}

/// AdamW optimizer, clipping gradient values when `gradient_clip` is set
pub(crate) fn adamw<B, M>(gradient_clip: Option<f32>) -> OptimizerAdaptor<AdamW, M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    AdamWConfig::new()
        .with_grad_clipping(gradient_clip.map(GradientClippingConfig::Value))
        .init()
}

#[cfg(test)]
pub(crate) mod testing {
    //! A tiny deterministic environment for exercising the agents

    use rand::{thread_rng, Rng};

    use crate::env::{
        DiscreteActionSpace, EnvError, EpisodeSummary, Environment, Observation,
        ObservationSpace, Step, StepInfo,
    };

    /// A corridor of `length` cells; action 1 moves right, 0 moves left.
    /// Reaching the right end pays 1 and ends the episode, every other step costs 0.01.
    #[derive(Debug, Clone)]
    pub struct Corridor {
        pub length: usize,
        pub position: usize,
        pub max_steps: usize,
        pub steps: usize,
        pub episode_reward: f64,
        pub resets: usize,
        pub closes: usize,
    }

    impl Corridor {
        pub fn new(length: usize, max_steps: usize) -> Self {
            Self {
                length,
                position: 0,
                max_steps,
                steps: 0,
                episode_reward: 0.0,
                resets: 0,
                closes: 0,
            }
        }

        fn observation(&self) -> Observation {
            let mut obs = vec![0.0; self.length];
            obs[self.position] = 1.0;
            obs
        }
    }

    impl Environment for Corridor {
        type State = Observation;
        type Action = usize;

        fn step(&mut self, action: usize) -> Result<Step<Observation>, EnvError> {
            if action >= 2 {
                return Err(EnvError::InvalidAction { action, size: 2 });
            }
            if action == 1 {
                self.position = (self.position + 1).min(self.length - 1);
            } else {
                self.position = self.position.saturating_sub(1);
            }
            self.steps += 1;

            let reached = self.position == self.length - 1;
            let reward = if reached { 1.0 } else { -0.01 };
            self.episode_reward += reward as f64;
            let interrupted = !reached && self.steps >= self.max_steps;
            let done = reached || interrupted;

            let episode = done.then(|| EpisodeSummary {
                reward: self.episode_reward,
                length: self.steps,
            });

            Ok(Step {
                observation: self.observation(),
                reward,
                done,
                info: StepInfo {
                    interrupted,
                    episode,
                },
            })
        }

        fn reset(&mut self) -> Result<Observation, EnvError> {
            self.position = 0;
            self.steps = 0;
            self.episode_reward = 0.0;
            self.resets += 1;
            Ok(self.observation())
        }

        fn current_state(&self) -> Observation {
            self.observation()
        }

        fn random_action(&self) -> usize {
            thread_rng().gen_range(0..2)
        }

        fn close(&mut self) -> Result<(), EnvError> {
            self.closes += 1;
            Ok(())
        }
    }

    impl DiscreteActionSpace for Corridor {
        fn actions(&self) -> Vec<usize> {
            vec![0, 1]
        }
    }

    impl ObservationSpace for Corridor {
        fn observation_size(&self) -> usize {
            self.length
        }
    }
}
