//! Hooks run by [`Policy::learn`] after every environment step
//!
//! [`EvalCallback`] keeps the best policy seen so far, [`CheckpointCallback`] snapshots
//! the policy at a fixed cadence and [`ProgressBarCallback`] draws the step budget.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    env::{EnvError, Environment},
    naming::RunArtifactNames,
    policy::{Policy, PolicyEnv, PolicyError},
};

pub const DEFAULT_EVAL_FREQ: usize = 1000;
pub const DEFAULT_N_EVAL_EPISODES: usize = 5;
pub const DEFAULT_SAVE_FREQ: usize = 2000;

pub const EVALUATIONS_FILE: &str = "evaluations.json";
pub const BEST_MODEL_DIR: &str = "best_model";

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("evaluation rollout failed: {0}")]
    Env(#[from] EnvError),

    #[error(transparent)]
    Save(#[from] PolicyError),

    #[error("failed to write evaluation log {}: {message}", path.display())]
    Log { path: PathBuf, message: String },
}

/// What a callback sees after each step
pub struct CallbackContext<'a, E: PolicyEnv> {
    /// Environment steps taken by the policy so far
    pub num_timesteps: usize,
    pub policy: &'a Policy<E>,
    /// The training environment
    pub env: &'a mut E,
    env_reset: bool,
}

impl<'a, E: PolicyEnv> CallbackContext<'a, E> {
    pub fn new(num_timesteps: usize, policy: &'a Policy<E>, env: &'a mut E) -> Self {
        Self {
            num_timesteps,
            policy,
            env,
            env_reset: false,
        }
    }

    /// Tell the training loop that the environment was reset behind its back
    pub fn mark_env_reset(&mut self) {
        self.env_reset = true;
    }

    pub fn env_was_reset(&self) -> bool {
        self.env_reset
    }
}

pub trait Callback<E: PolicyEnv> {
    fn on_training_start(&mut self, _total_timesteps: usize) {}

    /// Called once per environment step; returning `false` stops training
    fn on_step(&mut self, ctx: &mut CallbackContext<'_, E>) -> Result<bool, CallbackError>;

    fn on_training_end(&mut self) {}
}

/// Run `n_episodes` full episodes, returning each one's total reward and length
///
/// Leaves the environment at the end of the last episode.
pub fn evaluate_policy<E: PolicyEnv>(
    policy: &Policy<E>,
    env: &mut E,
    n_episodes: usize,
    deterministic: bool,
) -> Result<(Vec<f64>, Vec<usize>), EnvError> {
    let mut rewards = Vec::with_capacity(n_episodes);
    let mut lengths = Vec::with_capacity(n_episodes);

    for _ in 0..n_episodes {
        let mut observation = env.reset()?;
        let mut reward = 0.0;
        let mut length = 0;
        loop {
            let step = env.step(policy.predict(&observation, deterministic))?;
            reward += step.reward as f64;
            length += 1;
            if step.done {
                break;
            }
            observation = step.observation;
        }
        rewards.push(reward);
        lengths.push(length);
    }

    Ok((rewards, lengths))
}

fn mean<T: Copy + Into<f64>>(values: &[T]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().map(|&v| v.into()).sum::<f64>() / values.len() as f64
}

/// History written to `evaluations.json`, one entry per evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluations {
    pub timesteps: Vec<usize>,
    pub results: Vec<Vec<f64>>,
    pub ep_lengths: Vec<Vec<usize>>,
}

/// Periodically evaluate the policy on the training environment and keep the best one
pub struct EvalCallback {
    pub eval_freq: usize,
    pub n_eval_episodes: usize,
    pub deterministic: bool,
    best_model_dir: PathBuf,
    n_calls: usize,
    best_mean_reward: f64,
    evaluations: Evaluations,
}

impl EvalCallback {
    pub fn new(best_model_dir: impl Into<PathBuf>) -> Self {
        Self {
            eval_freq: DEFAULT_EVAL_FREQ,
            n_eval_episodes: DEFAULT_N_EVAL_EPISODES,
            deterministic: true,
            best_model_dir: best_model_dir.into(),
            n_calls: 0,
            best_mean_reward: f64::NEG_INFINITY,
            evaluations: Evaluations::default(),
        }
    }

    pub fn with_eval_freq(mut self, eval_freq: usize) -> Self {
        self.eval_freq = eval_freq;
        self
    }

    pub fn with_n_eval_episodes(mut self, n_eval_episodes: usize) -> Self {
        self.n_eval_episodes = n_eval_episodes;
        self
    }

    pub fn evaluations(&self) -> &Evaluations {
        &self.evaluations
    }

    pub fn best_mean_reward(&self) -> f64 {
        self.best_mean_reward
    }

    fn write_evaluations(&self) -> Result<(), CallbackError> {
        let path = self.best_model_dir.join(EVALUATIONS_FILE);
        let log_error = |message: String| CallbackError::Log {
            path: path.clone(),
            message,
        };
        fs::create_dir_all(&self.best_model_dir).map_err(|e| log_error(e.to_string()))?;
        let json = serde_json::to_string_pretty(&self.evaluations).map_err(|e| log_error(e.to_string()))?;
        fs::write(&path, json).map_err(|e| log_error(e.to_string()))
    }
}

impl<E: PolicyEnv> Callback<E> for EvalCallback {
    fn on_step(&mut self, ctx: &mut CallbackContext<'_, E>) -> Result<bool, CallbackError> {
        self.n_calls += 1;
        if self.eval_freq == 0 || self.n_calls % self.eval_freq != 0 {
            return Ok(true);
        }

        let (results, ep_lengths) = evaluate_policy(ctx.policy, ctx.env, self.n_eval_episodes, self.deterministic)?;
        ctx.env.reset()?;
        ctx.mark_env_reset();

        let mean_reward = mean(&results);
        let mean_length = mean(&ep_lengths.iter().map(|&l| l as f64).collect::<Vec<_>>());
        info!(
            num_timesteps = ctx.num_timesteps,
            mean_reward,
            mean_length,
            "evaluation"
        );

        self.evaluations.timesteps.push(ctx.num_timesteps);
        self.evaluations.results.push(results);
        self.evaluations.ep_lengths.push(ep_lengths);
        self.write_evaluations()?;

        if mean_reward > self.best_mean_reward {
            let path = self.best_model_dir.join(BEST_MODEL_DIR);
            ctx.policy.save(&path)?;
            info!(mean_reward, path = %path.display(), "new best mean reward");
            self.best_mean_reward = mean_reward;
        }

        Ok(true)
    }
}

/// Save the policy every `save_freq` steps
pub struct CheckpointCallback {
    pub save_freq: usize,
    save_path: PathBuf,
    name_prefix: String,
    n_calls: usize,
}

impl CheckpointCallback {
    pub fn new(save_path: impl Into<PathBuf>, name_prefix: impl Into<String>) -> Self {
        Self {
            save_freq: DEFAULT_SAVE_FREQ,
            save_path: save_path.into(),
            name_prefix: name_prefix.into(),
            n_calls: 0,
        }
    }

    pub fn with_save_freq(mut self, save_freq: usize) -> Self {
        self.save_freq = save_freq;
        self
    }

    /// `{save_path}/{name_prefix}_{num_timesteps}_steps`
    pub fn checkpoint_path(&self, num_timesteps: usize) -> PathBuf {
        self.save_path.join(format!("{}_{num_timesteps}_steps", self.name_prefix))
    }
}

impl<E: PolicyEnv> Callback<E> for CheckpointCallback {
    fn on_step(&mut self, ctx: &mut CallbackContext<'_, E>) -> Result<bool, CallbackError> {
        self.n_calls += 1;
        if self.save_freq > 0 && self.n_calls % self.save_freq == 0 {
            let path = self.checkpoint_path(ctx.num_timesteps);
            ctx.policy.save(&path)?;
            info!(path = %path.display(), "saving model checkpoint");
        }
        Ok(true)
    }
}

/// Progress over the step budget on stderr
#[derive(Default)]
pub struct ProgressBarCallback {
    bar: Option<ProgressBar>,
}

impl ProgressBarCallback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: PolicyEnv> Callback<E> for ProgressBarCallback {
    fn on_training_start(&mut self, total_timesteps: usize) {
        let bar = ProgressBar::new(total_timesteps as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        self.bar = Some(bar);
    }

    fn on_step(&mut self, _ctx: &mut CallbackContext<'_, E>) -> Result<bool, CallbackError> {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
        Ok(true)
    }

    fn on_training_end(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// The evaluation and checkpoint callbacks of a training run, in that order
pub fn make_callbacks<E: PolicyEnv>(names: &RunArtifactNames, log_dir: &Path) -> Vec<Box<dyn Callback<E>>> {
    vec![
        Box::new(EvalCallback::new(&names.best_model_dir)),
        Box::new(CheckpointCallback::new(log_dir, &names.checkpoint_prefix)),
    ]
}

/// Read back an `evaluations.json`
pub fn read_evaluations(best_model_dir: &Path) -> io::Result<Evaluations> {
    let json = fs::read_to_string(best_model_dir.join(EVALUATIONS_FILE))?;
    serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
