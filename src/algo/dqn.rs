//! Deep Q-Network (DQN)
//!
//! DQN is a value-based algorithm that approximates the Q-function with a neural network
//! for discrete action spaces.
//!
//! # Algorithm Overview
//!
//! DQN learns an action-value function Q(s,a) that estimates the expected return of
//! taking action a in state s. The agent then acts greedily by selecting the action
//! with the highest Q-value.
//!
//! ## Key Features
//! - **Experience replay**: Stores transitions and samples randomly to break correlations
//! - **Target network**: Uses a slowly-updated copy of Q-network for stable learning
//! - **ε-greedy exploration**: Balances exploration and exploitation
//! - **Learning starts**: No gradient step is taken before `learning_starts` transitions
//!
//! Episodes cut short by the simulator (`interrupted`) are stored as non-terminal so the
//! Bellman target still bootstraps from the last observation.
//!
//! # Hyperparameter Tuning
//!
//! - **Learning rate**: 1e-4 to 1e-3
//! - **Discount (γ)**: 0.95-0.999
//! - **Replay buffer**: 10k-1M transitions
//! - **Batch size**: 32-128
//! - **Target update**: soft update with τ=0.001-0.01 every gradient step
//! - **Epsilon decay**: Start at 1.0, decay to 0.01-0.1
//!
//! Reference: "Playing Atari with Deep Reinforcement Learning" (Mnih et al., 2013)

use std::collections::HashMap;

use burn::{
    module::AutodiffModule,
    nn::loss::{MseLoss, Reduction},
    optim::{adaptor::OptimizerAdaptor, AdamW, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use super::{adamw, argmax, float_tensor, index_tensor, tensor_to_vec};
use crate::{
    decay::Exponential,
    env::{EnvError, Environment},
    exploration::{Choice, EpsilonGreedy},
    memory::{Exp, ReplayMemory},
    nn::MLP,
    traits::{BoolToTensor, StepOutcome, ToTensor, TrainableAgent, TrainingMetrics},
};

/// A burn module used with a Deep Q network agent
///
/// ### Generics
/// - `B` - A burn backend
/// - `D` - The dimension of the input tensor
pub trait DQNModel<B: AutodiffBackend, const D: usize>: AutodiffModule<B> {
    /// Forward pass through the model
    fn forward(&self, input: Tensor<B, D>) -> Tensor<B, 2>;

    /// Soft update the parameters of the target network
    ///
    /// θ′ ← τθ + (1 − τ)θ′
    ///
    /// ```ignore
    /// target_net.soft_update(&policy_net, tau);
    /// ```
    fn soft_update(&mut self, other: &Self, tau: f32);
}

/// Configuration for the [`DQNAgent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DQNAgentConfig {
    /// The capacity of the replay memory
    ///
    /// **Default:** `16384`
    pub memory_capacity: usize,
    /// The size of batches to be sampled from the replay memory
    ///
    /// **Default:** `128`
    pub memory_batch_size: usize,
    /// Number of environment steps collected before the first gradient step
    ///
    /// **Default:** `100`
    pub learning_starts: usize,
    /// Take gradient steps every `train_freq` environment steps
    ///
    /// **Default:** `1`
    pub train_freq: usize,
    /// Number of gradient steps per training round
    ///
    /// **Default:** `1`
    pub gradient_steps: usize,
    /// The epsilon decay strategy
    ///
    /// **Default:** [`Exponential`] decay with decay rate `1e-3`, start value `1.0`, and end value `0.05`
    pub epsilon_decay: Exponential,
    /// The discount factor
    ///
    /// **Default:** `0.999`
    pub gamma: f32,
    /// Soft update the target network every `target_update_interval` gradient steps
    ///
    /// **Default:** `1`
    pub target_update_interval: usize,
    /// The rate at which the target network's parameters are soft updated with the policy network's parameters
    ///
    /// **Default:** `5e-3`
    pub tau: f32,
    /// The learning rate for the optimizer
    ///
    /// **Default:** `1e-3`
    pub lr: f64,
    /// Gradient clipping value
    ///
    /// **Default:** `Some(100.0)`
    pub gradient_clip: Option<f32>,
}

impl Default for DQNAgentConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 16384,
            memory_batch_size: 128,
            learning_starts: 100,
            train_freq: 1,
            gradient_steps: 1,
            epsilon_decay: Exponential::default(),
            gamma: 0.999,
            target_update_interval: 1,
            tau: 5e-3,
            lr: 1e-3,
            gradient_clip: Some(100.0),
        }
    }
}

/// A Deep Q Network agent
///
/// ### Generics
/// - `B` - A burn backend
/// - `M` - The [`DQNModel`] used for the policy and target networks
/// - `E` - The [`Environment`] in which the agent will learn
///     - The environment's action space must be discrete, since the policy network produces a Q value for each action.
///     - The state type's implementation of [`Clone`] should be lightweight, as states are cloned into the replay memory.
/// - `D` - The dimension of the input
pub struct DQNAgent<B, M, E, const D: usize>
where
    B: AutodiffBackend,
    E: Environment,
    M: AutodiffModule<B>,
{
    policy_net: M,
    target_net: M,
    device: &'static B::Device,
    memory: ReplayMemory<E::State>,
    optimizer: OptimizerAdaptor<AdamW, M, B>,
    exploration: EpsilonGreedy<Exponential>,
    config: DQNAgentConfig,
    total_steps: usize,
    gradient_steps_taken: usize,
    learn_mode: bool,
}

impl<B, M, E, const D: usize> DQNAgent<B, M, E, D>
where
    B: AutodiffBackend,
    M: DQNModel<B, D>,
    E: Environment,
    Vec<E::State>: ToTensor<B, D, Float>,
{
    /// Initialize a new `DQNAgent`
    ///
    /// ### Arguments
    /// - `model` A [`DQNModel`] to be used as the policy and target networks
    /// - `config` A [`DQNAgentConfig`] containing hyperparameters for the agent
    /// - `device` A static reference to the device used for the `model`
    pub fn new(model: M, config: DQNAgentConfig, device: &'static B::Device) -> Self {
        Self {
            target_net: model.clone(),
            policy_net: model,
            device,
            memory: ReplayMemory::new(config.memory_capacity, config.memory_batch_size),
            optimizer: adamw(config.gradient_clip),
            exploration: EpsilonGreedy::new(config.epsilon_decay),
            config,
            total_steps: 0,
            gradient_steps_taken: 0,
            learn_mode: true,
        }
    }

    pub fn q_network(&self) -> &M {
        &self.policy_net
    }

    pub fn config(&self) -> &DQNAgentConfig {
        &self.config
    }

    /// Current exploration probability
    pub fn epsilon(&self) -> f32 {
        self.exploration.epsilon(self.total_steps as u32)
    }

    fn q_values(&self, state: &E::State) -> Vec<f32> {
        let input = vec![state.clone()].to_tensor(self.device);
        tensor_to_vec(self.policy_net.forward(input).detach())
    }

    /// Perform `gradient_steps` DQN learning steps
    fn update(&mut self) -> Option<TrainingMetrics> {
        let mut total_loss = 0.0_f32;
        let mut n_updates = 0;

        for _ in 0..self.config.gradient_steps {
            let Some(batch) = self.memory.sample_zipped() else {
                break;
            };

            // Terminal rows get their own state as a placeholder next state; the mask zeroes them out
            let non_terminal_mask = batch
                .next_states
                .iter()
                .map(Option::is_some)
                .collect::<Vec<_>>()
                .to_bool_tensor(self.device)
                .unsqueeze_dim::<2>(1);
            let next_states = batch
                .next_states
                .into_iter()
                .zip(batch.states.iter())
                .map(|(next, state)| next.unwrap_or_else(|| state.clone()))
                .collect::<Vec<_>>()
                .to_tensor(self.device);

            let batch_size = batch.actions.len();
            let states = batch.states.to_tensor(self.device);
            let actions = index_tensor::<B>(&batch.actions, self.device).unsqueeze_dim::<2>(1);
            let rewards = float_tensor::<B>(&batch.rewards, self.device).unsqueeze_dim::<2>(1);

            // Q values of the chosen actions in each state
            let q_values = self.policy_net.forward(states).gather(1, actions);

            // Maximum Q values obtainable from each next state
            let next_q_values = self.target_net.forward(next_states).max_dim(1).detach();
            let expected_q_values =
                Tensor::<B, 2>::zeros([batch_size, 1], self.device).mask_where(non_terminal_mask, next_q_values);

            let target = rewards + expected_q_values * self.config.gamma;

            let loss = MseLoss::new().forward(q_values, target, Reduction::Mean);
            total_loss += loss.clone().into_scalar().elem::<f32>();

            let grads = GradientsParams::from_grads(loss.backward(), &self.policy_net);
            self.policy_net = self.optimizer.step(self.config.lr, self.policy_net.clone(), grads);

            n_updates += 1;
            self.gradient_steps_taken += 1;

            if self.gradient_steps_taken % self.config.target_update_interval.max(1) == 0 {
                self.target_net.soft_update(&self.policy_net, self.config.tau);
            }
        }

        if n_updates == 0 {
            return None;
        }

        let mut extra = HashMap::new();
        extra.insert("epsilon".to_string(), self.epsilon());

        Some(TrainingMetrics {
            value_loss: total_loss / n_updates as f32,
            n_updates,
            extra,
            ..Default::default()
        })
    }
}

impl<B, M, E, const D: usize> TrainableAgent<E> for DQNAgent<B, M, E, D>
where
    B: AutodiffBackend,
    M: DQNModel<B, D>,
    E: Environment,
    Vec<E::State>: ToTensor<B, D, Float>,
    E::Action: From<usize> + Into<usize>,
{
    /// ε-greedy step; stores the transition and trains on the replay memory when due
    fn step(&mut self, env: &mut E) -> Result<StepOutcome, EnvError> {
        let state = env.current_state();

        let action_idx = match self.exploration.choose(self.total_steps as u32) {
            Choice::Explore => env.random_action().into(),
            Choice::Exploit => argmax(&self.q_values(&state)),
        };

        let step = env.step(action_idx.into())?;

        let terminal = step.done && !step.info.interrupted;
        self.memory.push(Exp {
            state,
            action: action_idx,
            reward: step.reward,
            next_state: (!terminal).then(|| step.observation.clone()),
        });
        self.total_steps += 1;

        let metrics = if self.should_learn() { self.update() } else { None };

        Ok(StepOutcome {
            reward: step.reward,
            done: step.done,
            info: step.info,
            metrics,
        })
    }

    fn should_learn(&self) -> bool {
        self.learn_mode
            && self.total_steps > self.config.learning_starts
            && self.total_steps % self.config.train_freq.max(1) == 0
            && self.memory.len() >= self.memory.batch_size
    }

    fn predict(&self, state: &E::State, deterministic: bool) -> E::Action {
        let q_values = self.q_values(state);
        if !deterministic && thread_rng().gen::<f32>() < self.epsilon() {
            return thread_rng().gen_range(0..q_values.len().max(1)).into();
        }
        argmax(&q_values).into()
    }

    // The replay memory already holds the last transition as recorded
    fn end_episode(&mut self) {}

    fn eval(&mut self) {
        self.learn_mode = false;
    }

    fn train(&mut self) {
        self.learn_mode = true;
    }
}

// ============================================================================
// MLP Implementations for DQN
// ============================================================================

/// Implementation for 2D tensors (batch of states)
/// `[batch, features]` → `[batch, actions]`
impl<B: AutodiffBackend> DQNModel<B, 2> for MLP<B> {
    fn forward(&self, state: Tensor<B, 2>) -> Tensor<B, 2> {
        MLP::forward(self, state)
    }

    fn soft_update(&mut self, other: &Self, tau: f32) {
        MLP::soft_update(self, other, tau)
    }
}
