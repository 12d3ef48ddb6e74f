//! Trainable agent trait for step-by-step training control
//!
//! Every algorithm in [`crate::algo`] implements [`TrainableAgent`]. The policy wrapper
//! drives them one environment step at a time so that callbacks can run between steps:
//! - Collecting experience and training when enough has been gathered
//! - Picking actions deterministically for evaluation
//! - Reporting losses and other diagnostics after each update

use std::collections::HashMap;

use serde::Serialize;

use crate::env::{EnvError, Environment, StepInfo};

/// Training metrics returned after each training update
///
/// These metrics allow monitoring the training progress and detecting issues
/// like divergence or lack of exploration.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TrainingMetrics {
    /// Policy/actor loss (zero for value-based methods)
    pub policy_loss: f32,

    /// Value/critic loss, or the TD loss for DQN
    pub value_loss: f32,

    /// Entropy of the policy (higher means more exploration)
    pub entropy: f32,

    /// Approximate KL divergence from old policy (for PPO)
    pub approx_kl: Option<f32>,

    /// Fraction of probability ratios that were clipped (for PPO)
    pub clip_fraction: Option<f32>,

    /// Number of gradient updates performed
    pub n_updates: usize,

    /// Whether training was stopped early (e.g., due to KL threshold)
    pub early_stopped: bool,

    /// Additional algorithm-specific metrics
    pub extra: HashMap<String, f32>,
}

/// What happened during one call to [`TrainableAgent::step`]
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
    /// Present when the step triggered a training update
    pub metrics: Option<TrainingMetrics>,
}

/// Trait for trainable RL agents with fine-grained control
///
/// # Example
///
/// ```ignore
/// let outcome = agent.step(&mut env)?;
/// if let Some(metrics) = outcome.metrics {
///     println!("Policy loss: {}", metrics.policy_loss);
/// }
/// if outcome.done {
///     env.reset()?;
/// }
/// ```
pub trait TrainableAgent<E: Environment> {
    /// Take one step in the environment starting from `env.current_state()`
    ///
    /// Stores the transition and trains when the agent's update schedule says so.
    /// The caller is responsible for resetting the environment when the episode ends.
    fn step(&mut self, env: &mut E) -> Result<StepOutcome, EnvError>;

    /// Check if the agent is ready to train
    ///
    /// Returns true when enough experience has been collected
    /// (e.g., trajectory buffer is full for PPO, replay buffer has enough samples for DQN).
    /// Always false in evaluation mode.
    fn should_learn(&self) -> bool;

    /// Pick an action for `state` without storing anything
    fn predict(&self, state: &E::State, deterministic: bool) -> E::Action;

    /// Mark the last stored transition as the end of an episode
    ///
    /// Used when something outside the agent (an evaluation rollout) reset the environment.
    fn end_episode(&mut self);

    /// Stop training updates; steps still pick actions the way training does
    fn eval(&mut self);

    /// Resume training updates
    fn train(&mut self);
}
