//! Proximal Policy Optimization (PPO) implementation
//!
//! PPO is an on-policy actor-critic algorithm that improves upon A2C by using a clipped
//! surrogate objective to prevent excessively large policy updates.
//!
//! # Key Features
//!
//! - **Clipped objective**: Prevents policy from changing too much in one update
//! - **Multiple epochs**: Reuses trajectory data for multiple gradient steps
//! - **Generalized Advantage Estimation (GAE)**: Reduces variance in advantage estimates
//! - **Value clipping**: Optional clipping of value function updates
//! - **KL early stopping**: Optional, stops the epochs once the policy drifted too far
//!
//! # Algorithm Overview
//!
//! 1. Collect `n_steps` transitions using current policy (episodes may span updates)
//! 2. Compute advantages using GAE
//! 3. For K epochs:
//!    - Sample mini-batches from trajectories
//!    - Update actor with clipped PPO objective
//!    - Update critic with value loss (optionally clipped)
//!
//! # Usage Example
//!
//! ```ignore
//! use drive_gym::algo::ppo::{PPOAgent, PPOAgentConfig};
//!
//! let config = PPOAgentConfig {
//!     n_steps: 512,
//!     ..Default::default()
//! };
//!
//! let mut agent = PPOAgent::new(actor, critic, config, &DEVICE);
//! loop {
//!     let outcome = agent.step(&mut env)?;
//!     if outcome.done {
//!         env.reset()?;
//!     }
//! }
//! ```
//!
//! # Hyperparameters
//!
//! - `clip_epsilon`: Clipping parameter (typically 0.1-0.3)
//! - `gae_lambda`: GAE lambda for advantage estimation (0.9-0.99)
//! - `n_steps`: Steps to collect before update (1024-4096)
//! - `n_epochs`: Number of optimization epochs per update (3-10)
//! - `batch_size`: Mini-batch size for updates (32-256)
//!
//! Reference: "Proximal Policy Optimization Algorithms" (Schulman et al., 2017)

use std::collections::HashMap;

use burn::{
    module::AutodiffModule,
    optim::{adaptor::OptimizerAdaptor, AdamW, GradientsParams, Optimizer},
    prelude::*,
    tensor::{
        activation::{log_softmax, softmax},
        backend::AutodiffBackend,
        BasicOps,
    },
};
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};

use super::{adamw, argmax, float_tensor, index_tensor, sample_categorical, tensor_to_vec};
use crate::{
    env::{EnvError, Environment},
    nn::MLP,
    traits::{StepOutcome, ToTensor, TrainableAgent, TrainingMetrics},
};

/// PPO Actor model trait for discrete actions
/// Outputs action logits
pub trait PPOActorModel<B: AutodiffBackend, const D: usize>: AutodiffModule<B> {
    /// Forward pass: state -> action logits
    ///
    /// Takes states with dimension D and returns a 2D tensor of action logits.
    /// - D=2 `[batch, features]` → `[batch, num_actions]`
    fn forward(&self, state: Tensor<B, D>) -> Tensor<B, 2>;
}

/// PPO Critic model trait
/// Outputs state values V(s)
pub trait PPOCriticModel<B: AutodiffBackend, const D: usize>: AutodiffModule<B> {
    /// Forward pass: state -> value
    ///
    /// - D=2 `[batch, features]` → `[batch, 1]`
    fn forward(&self, state: Tensor<B, D>) -> Tensor<B, 2>;
}

/// Configuration for PPO agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PPOAgentConfig {
    /// Discount factor γ (default: 0.99)
    pub gamma: f32,
    /// GAE lambda λ for advantage estimation (default: 0.95)
    pub gae_lambda: f32,
    /// Clipping parameter ε (default: 0.2)
    pub clip_epsilon: f32,
    /// Actor learning rate (default: 3e-4)
    pub lr_actor: f64,
    /// Critic learning rate (default: 3e-4)
    pub lr_critic: f64,
    /// Entropy coefficient for exploration (default: 0.01)
    pub entropy_coef: f32,
    /// Value loss coefficient (default: 0.5)
    pub value_coef: f32,
    /// Number of steps to collect before update (default: 2048)
    pub n_steps: usize,
    /// Number of optimization epochs per update (default: 10)
    pub n_epochs: usize,
    /// Mini-batch size for updates (default: 64)
    pub batch_size: usize,
    /// Gradient clipping value (default: Some(0.5))
    pub gradient_clip: Option<f32>,
    /// Maximum KL divergence before early stopping (default: None)
    ///
    /// An update stops once the approximate KL of a mini-batch exceeds `1.5 * target_kl`.
    pub target_kl: Option<f32>,
    /// Clip value function loss (default: false)
    pub clip_value_loss: bool,
}

impl Default for PPOAgentConfig {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_epsilon: 0.2,
            lr_actor: 3e-4,
            lr_critic: 3e-4,
            entropy_coef: 0.01,
            value_coef: 0.5,
            n_steps: 2048,
            n_epochs: 10,
            batch_size: 64,
            gradient_clip: Some(0.5),
            target_kl: None,
            clip_value_loss: false,
        }
    }
}

/// Trajectory storage for PPO
#[derive(Clone, Debug)]
struct Trajectory<S> {
    states: Vec<S>,
    action_indices: Vec<usize>,
    rewards: Vec<f32>,
    log_probs: Vec<f32>,
    values: Vec<f32>,
    dones: Vec<bool>,
}

impl<S> Trajectory<S> {
    fn new() -> Self {
        Self {
            states: Vec::new(),
            action_indices: Vec::new(),
            rewards: Vec::new(),
            log_probs: Vec::new(),
            values: Vec::new(),
            dones: Vec::new(),
        }
    }

    fn push(&mut self, state: S, action_idx: usize, reward: f32, log_prob: f32, value: f32, done: bool) {
        self.states.push(state);
        self.action_indices.push(action_idx);
        self.rewards.push(reward);
        self.log_probs.push(log_prob);
        self.values.push(value);
        self.dones.push(done);
    }

    fn clear(&mut self) {
        self.states.clear();
        self.action_indices.clear();
        self.rewards.clear();
        self.log_probs.clear();
        self.values.clear();
        self.dones.clear();
    }

    fn len(&self) -> usize {
        self.states.len()
    }

    fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// PPO Agent for discrete action spaces
///
/// This agent is generic over:
/// - `B`: Autodiff backend (e.g., NdArray)
/// - `Actor`: Actor network implementing PPOActorModel
/// - `Critic`: Critic network implementing PPOCriticModel
/// - `E`: Environment with discrete action space
/// - `D`: Dimension of the batched state tensor
pub struct PPOAgent<B, Actor, Critic, E, const D: usize>
where
    B: AutodiffBackend,
    E: Environment,
    Actor: AutodiffModule<B>,
    Critic: AutodiffModule<B>,
{
    actor: Actor,
    critic: Critic,

    trajectory: Trajectory<E::State>,

    device: &'static B::Device,

    config: PPOAgentConfig,

    // Training state
    total_steps: usize,
    learn_mode: bool,

    // Optimizers (stored to avoid recreation)
    optimizer_actor: OptimizerAdaptor<AdamW, Actor, B>,
    optimizer_critic: OptimizerAdaptor<AdamW, Critic, B>,
}

impl<B, Actor, Critic, E, const D: usize> PPOAgent<B, Actor, Critic, E, D>
where
    B: AutodiffBackend,
    Actor: PPOActorModel<B, D>,
    Critic: PPOCriticModel<B, D>,
    E: Environment,
    Vec<E::State>: ToTensor<B, D, Float>,
{
    /// Create a new PPO agent
    pub fn new(actor: Actor, critic: Critic, config: PPOAgentConfig, device: &'static B::Device) -> Self {
        Self {
            actor,
            critic,
            trajectory: Trajectory::new(),
            device,
            optimizer_actor: adamw(config.gradient_clip),
            optimizer_critic: adamw(config.gradient_clip),
            config,
            total_steps: 0,
            learn_mode: true,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn critic(&self) -> &Critic {
        &self.critic
    }

    pub fn config(&self) -> &PPOAgentConfig {
        &self.config
    }

    /// Action probabilities for a single state
    fn action_probs(&self, state: &E::State) -> Vec<f32> {
        let state_tensor = vec![state.clone()].to_tensor(self.device);
        let logits = self.actor.forward(state_tensor).detach();
        tensor_to_vec(softmax(logits, 1))
    }

    /// Select an action for a given state
    ///
    /// Returns (action_index, log_prob, value_estimate)
    pub fn select_action(&self, state: &E::State) -> (usize, f32, f32) {
        let state_tensor = vec![state.clone()].to_tensor(self.device);

        let logits = self.actor.forward(state_tensor.clone()).detach();
        let log_probs = tensor_to_vec(log_softmax(logits.clone(), 1));
        let probs = tensor_to_vec(softmax(logits, 1));

        let value = self
            .critic
            .forward(state_tensor)
            .detach()
            .into_scalar()
            .elem::<f32>();

        let action_idx = sample_categorical(&probs);
        (action_idx, log_probs[action_idx], value)
    }

    /// Update the agent using the collected trajectory
    fn update(&mut self, next_state: &E::State, done: bool) -> Option<TrainingMetrics> {
        if self.trajectory.is_empty() {
            return None;
        }

        let mut total_policy_loss = 0.0_f32;
        let mut total_value_loss = 0.0_f32;
        let mut total_entropy = 0.0_f32;
        let mut total_approx_kl = 0.0_f32;
        let mut total_clip_fraction = 0.0_f32;
        let mut n_updates = 0;
        let mut early_stopped = false;

        let (returns, advantages) = self.compute_gae(next_state, done);

        let action_indices = index_tensor::<B>(&self.trajectory.action_indices, self.device).unsqueeze_dim::<2>(1);
        let old_log_probs = float_tensor::<B>(&self.trajectory.log_probs, self.device);
        let old_values = float_tensor::<B>(&self.trajectory.values, self.device);

        let n_samples = self.trajectory.len();
        let batch_size = self.config.batch_size.max(1);
        let clip_epsilon = self.config.clip_epsilon;
        let mut indices: Vec<usize> = (0..n_samples).collect();

        'epochs: for _epoch in 0..self.config.n_epochs {
            indices.shuffle(&mut thread_rng());

            for batch_indices in indices.chunks(batch_size) {
                let batch_states = self.gather_states(batch_indices);
                let batch_action_indices = self.gather_tensor(&action_indices, batch_indices);
                let batch_old_log_probs = self.gather_tensor(&old_log_probs, batch_indices);
                let batch_returns = self.gather_tensor(&returns, batch_indices);
                let batch_advantages = self.gather_tensor(&advantages, batch_indices);

                // Update actor
                {
                    let actor = self.actor.clone();
                    let logits = actor.forward(batch_states.clone());
                    let log_probs = log_softmax(logits.clone(), 1);

                    let action_log_probs: Tensor<B, 1> =
                        log_probs.clone().gather(1, batch_action_indices).squeeze_dims(&[1]);

                    let log_ratio = action_log_probs - batch_old_log_probs;
                    let ratio = log_ratio.clone().exp();

                    // KL(old || new) ≈ E[(r - 1) - log r], always non-negative
                    let approx_kl_val = (ratio.clone() - 1.0 - log_ratio.clone())
                        .mean()
                        .detach()
                        .into_scalar()
                        .elem::<f32>();

                    if let Some(target_kl) = self.config.target_kl {
                        if approx_kl_val > 1.5 * target_kl {
                            tracing::debug!(
                                approx_kl = approx_kl_val,
                                target_kl,
                                n_updates,
                                "stopping PPO update early"
                            );
                            early_stopped = true;
                            break 'epochs;
                        }
                    }

                    let clipped_ratio = ratio.clone().clamp(1.0 - clip_epsilon, 1.0 + clip_epsilon);

                    let surr1 = ratio.clone() * batch_advantages.clone();
                    let surr2 = clipped_ratio * batch_advantages;
                    let policy_loss = surr1.min_pair(surr2).mean().neg();

                    let probs = softmax(logits, 1);
                    let entropy = (probs * log_probs).sum_dim(1).neg().mean();

                    let actor_loss = policy_loss.clone() - entropy.clone() * self.config.entropy_coef;

                    let policy_loss_val = policy_loss.into_scalar().elem::<f32>();
                    let entropy_val = entropy.into_scalar().elem::<f32>();

                    // Fraction of ratios outside [1-eps, 1+eps]
                    let detached_ratio = ratio.detach();
                    let clipped = detached_ratio.clone().lower_elem(1.0 - clip_epsilon).int()
                        + detached_ratio.greater_elem(1.0 + clip_epsilon).int();
                    let clip_frac = clipped.float().mean().into_scalar().elem::<f32>();

                    total_policy_loss += policy_loss_val;
                    total_entropy += entropy_val;
                    total_approx_kl += approx_kl_val;
                    total_clip_fraction += clip_frac;

                    let actor_grads = GradientsParams::from_grads(actor_loss.backward(), &actor);
                    self.actor = self.optimizer_actor.step(self.config.lr_actor, actor, actor_grads);
                }

                // Update critic
                {
                    let critic = self.critic.clone();
                    let values: Tensor<B, 1> = critic.forward(batch_states).squeeze_dims(&[1]);

                    let critic_loss = if self.config.clip_value_loss {
                        let batch_old_values = self.gather_tensor(&old_values, batch_indices);
                        let values_clipped = batch_old_values.clone()
                            + (values.clone() - batch_old_values).clamp(-clip_epsilon, clip_epsilon);
                        let loss1 = (batch_returns.clone() - values).powf_scalar(2.0);
                        let loss2 = (batch_returns - values_clipped).powf_scalar(2.0);
                        loss1.max_pair(loss2).mean() * self.config.value_coef
                    } else {
                        (batch_returns - values).powf_scalar(2.0).mean() * self.config.value_coef
                    };

                    total_value_loss += critic_loss.clone().into_scalar().elem::<f32>();
                    n_updates += 1;

                    let critic_grads = GradientsParams::from_grads(critic_loss.backward(), &critic);
                    self.critic = self.optimizer_critic.step(self.config.lr_critic, critic, critic_grads);
                }
            }
        }

        self.trajectory.clear();

        let average = |total: f32| if n_updates > 0 { total / n_updates as f32 } else { 0.0 };

        Some(TrainingMetrics {
            policy_loss: average(total_policy_loss),
            value_loss: average(total_value_loss),
            entropy: average(total_entropy),
            approx_kl: Some(average(total_approx_kl)),
            clip_fraction: Some(average(total_clip_fraction)),
            n_updates,
            early_stopped,
            extra: HashMap::new(),
        })
    }

    /// Compute Generalized Advantage Estimation (GAE)
    ///
    /// Returns `(returns, normalized_advantages)`.
    fn compute_gae(&self, next_state: &E::State, done: bool) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let n = self.trajectory.len();
        let gamma = self.config.gamma;

        let bootstrap_value = if done {
            0.0
        } else {
            let next_state_tensor = vec![next_state.clone()].to_tensor(self.device);
            self.critic
                .forward(next_state_tensor)
                .detach()
                .into_scalar()
                .elem::<f32>()
        };

        let mut advantages = vec![0.0; n];
        let mut gae = 0.0;

        for i in (0..n).rev() {
            let next_value = if i == n - 1 {
                bootstrap_value
            } else {
                self.trajectory.values[i + 1]
            };
            let not_done = if self.trajectory.dones[i] { 0.0 } else { 1.0 };

            let delta = self.trajectory.rewards[i] + gamma * next_value * not_done - self.trajectory.values[i];
            gae = delta + gamma * self.config.gae_lambda * not_done * gae;
            advantages[i] = gae;
        }

        let returns: Vec<f32> = advantages
            .iter()
            .zip(self.trajectory.values.iter())
            .map(|(adv, val)| adv + val)
            .collect();

        let returns_tensor = float_tensor::<B>(&returns, self.device);
        let advantages_tensor = float_tensor::<B>(&advantages, self.device);

        let adv_mean = advantages_tensor.clone().mean();
        let adv_std = advantages_tensor
            .clone()
            .sub(adv_mean.clone())
            .powf_scalar(2.0)
            .mean()
            .sqrt();
        let advantages_normalized = (advantages_tensor - adv_mean) / (adv_std + 1e-8);

        (returns_tensor, advantages_normalized)
    }

    fn gather_states(&self, indices: &[usize]) -> Tensor<B, D, Float> {
        let batch_states: Vec<E::State> = indices.iter().map(|&i| self.trajectory.states[i].clone()).collect();
        batch_states.to_tensor(self.device)
    }

    fn gather_tensor<const DIM: usize, K: BasicOps<B>>(
        &self,
        tensor: &Tensor<B, DIM, K>,
        indices: &[usize],
    ) -> Tensor<B, DIM, K> {
        tensor.clone().select(0, index_tensor::<B>(indices, self.device))
    }
}

impl<B, Actor, Critic, E, const D: usize> TrainableAgent<E> for PPOAgent<B, Actor, Critic, E, D>
where
    B: AutodiffBackend,
    Actor: PPOActorModel<B, D>,
    Critic: PPOCriticModel<B, D>,
    E: Environment,
    Vec<E::State>: ToTensor<B, D, Float>,
    E::Action: From<usize>,
{
    /// Collects one transition; trains once `n_steps` transitions are buffered
    fn step(&mut self, env: &mut E) -> Result<StepOutcome, EnvError> {
        let state = env.current_state();
        let (action_idx, log_prob, value) = self.select_action(&state);

        let step = env.step(action_idx.into())?;

        self.trajectory.push(state, action_idx, step.reward, log_prob, value, step.done);
        self.total_steps += 1;

        let metrics = if self.should_learn() {
            self.update(&step.observation, step.done)
        } else {
            None
        };

        Ok(StepOutcome {
            reward: step.reward,
            done: step.done,
            info: step.info,
            metrics,
        })
    }

    /// PPO trains when the trajectory buffer reaches n_steps, not at episode boundaries.
    /// Multiple episodes can contribute to a single training batch.
    fn should_learn(&self) -> bool {
        self.trajectory.len() >= self.config.n_steps && self.learn_mode
    }

    fn predict(&self, state: &E::State, deterministic: bool) -> E::Action {
        let probs = self.action_probs(state);
        let action_idx = if deterministic {
            argmax(&probs)
        } else {
            sample_categorical(&probs)
        };
        action_idx.into()
    }

    fn end_episode(&mut self) {
        if let Some(done) = self.trajectory.dones.last_mut() {
            *done = true;
        }
    }

    fn eval(&mut self) {
        self.learn_mode = false;
    }

    fn train(&mut self) {
        self.learn_mode = true;
    }
}

// ============================================================================
// MLP Implementations for PPO
// ============================================================================

/// `[batch, features]` → `[batch, actions]`
impl<B: AutodiffBackend> PPOActorModel<B, 2> for MLP<B> {
    fn forward(&self, state: Tensor<B, 2>) -> Tensor<B, 2> {
        MLP::forward(self, state)
    }
}

/// `[batch, features]` → `[batch, 1]`
impl<B: AutodiffBackend> PPOCriticModel<B, 2> for MLP<B> {
    fn forward(&self, state: Tensor<B, 2>) -> Tensor<B, 2> {
        MLP::forward(self, state)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use once_cell::sync::Lazy;

    use super::*;
    use crate::{algo::testing::Corridor, nn::MLPConfig};

    type TB = Autodiff<NdArray>;
    static DEVICE: Lazy<NdArrayDevice> = Lazy::new(NdArrayDevice::default);

    fn agent(config: PPOAgentConfig) -> PPOAgent<TB, MLP<TB>, MLP<TB>, Corridor, 2> {
        let actor = MLPConfig::new(4, vec![16], 2).init::<TB>(&DEVICE);
        let critic = MLPConfig::new(4, vec![16], 1).init::<TB>(&DEVICE);
        PPOAgent::new(actor, critic, config, &DEVICE)
    }

    fn small_config() -> PPOAgentConfig {
        PPOAgentConfig {
            n_steps: 8,
            batch_size: 4,
            n_epochs: 2,
            ..Default::default()
        }
    }

    #[test]
    fn trains_once_the_buffer_is_full() {
        let mut agent = agent(small_config());
        let mut env = Corridor::new(4, 50);
        env.reset().unwrap();

        let mut updates = Vec::new();
        for _ in 0..8 {
            let outcome = agent.step(&mut env).unwrap();
            if outcome.done {
                env.reset().unwrap();
            }
            updates.push(outcome.metrics);
        }

        assert!(updates[..7].iter().all(Option::is_none));
        let metrics = updates[7].as_ref().expect("update after n_steps transitions");
        // 2 epochs of 2 mini-batches
        assert_eq!(metrics.n_updates, 4);
        assert!(metrics.approx_kl.is_some());
        assert!(!metrics.early_stopped);
        assert_eq!(agent.total_steps, 8);
    }

    #[test]
    fn eval_mode_never_trains() {
        let mut agent = agent(small_config());
        agent.eval();
        let mut env = Corridor::new(4, 50);
        env.reset().unwrap();

        for _ in 0..20 {
            let outcome = agent.step(&mut env).unwrap();
            assert!(outcome.metrics.is_none());
            if outcome.done {
                env.reset().unwrap();
            }
        }
        assert!(!agent.should_learn());

        agent.train();
        assert!(agent.should_learn());
    }

    #[test]
    fn deterministic_prediction_is_stable() {
        let agent = agent(small_config());
        let state = vec![1.0, 0.0, 0.0, 0.0];

        let first = agent.predict(&state, true);
        assert!(first < 2);
        assert!((0..10).all(|_| agent.predict(&state, true) == first));
    }

    #[test]
    fn kl_threshold_stops_the_update_early() {
        let mut agent = agent(PPOAgentConfig {
            lr_actor: 0.1,
            target_kl: Some(1e-6),
            n_epochs: 10,
            ..small_config()
        });
        let mut env = Corridor::new(4, 50);
        env.reset().unwrap();

        let mut metrics = None;
        for _ in 0..8 {
            let outcome = agent.step(&mut env).unwrap();
            if outcome.done {
                env.reset().unwrap();
            }
            metrics = metrics.or(outcome.metrics);
        }

        let metrics = metrics.expect("update after n_steps transitions");
        assert!(metrics.early_stopped);
        assert!(metrics.n_updates < 20);
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: PPOAgentConfig = serde_json::from_str(r#"{"n_steps": 128, "target_kl": 0.02}"#).unwrap();
        assert_eq!(config.n_steps, 128);
        assert_eq!(config.target_kl, Some(0.02));
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.gamma, 0.99);
    }
}
