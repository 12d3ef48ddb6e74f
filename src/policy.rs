//! Algorithm-tagged policies: construction, persistence and the training loop
//!
//! A [`Policy`] wraps one of the agents in [`crate::algo`] behind a single set of
//! capabilities (construct, load, bind_env, predict, learn, save) so the workflow never
//! has to care which algorithm it is driving.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    algo::{
        a2c::{A2CAgent, A2CAgentConfig},
        dqn::{DQNAgent, DQNAgentConfig},
        ppo::{PPOAgent, PPOAgentConfig},
    },
    callbacks::{Callback, CallbackContext, CallbackError},
    env::{DiscreteActionSpace, EnvError, Environment, Observation, ObservationSpace},
    metrics::{MetricsError, MetricsLog},
    nn::{MLPConfig, MLP},
    traits::{StepOutcome, TrainableAgent},
};

/// Backend every policy trains on
pub type TrainingBackend = Autodiff<NdArray>;

/// Device shared by every policy network
pub static DEVICE: Lazy<NdArrayDevice> = Lazy::new(NdArrayDevice::default);

/// The only policy architecture: a multi-layer perceptron
pub const POLICY_TAG: &str = "MlpPolicy";

/// Hidden layers of every actor, critic and Q-network
pub const NET_ARCH: [usize; 2] = [64, 64];

const FORMAT_VERSION: u32 = 1;
const METADATA_FILE: &str = "policy.json";

type Net = MLP<TrainingBackend>;

/// The supported algorithm families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize)]
pub enum Algorithm {
    PPO,
    A2C,
    DQN,
}

/// Parse an algorithm name as given on the command line
pub fn parse_algorithm(name: &str) -> Result<Algorithm, PolicyError> {
    Algorithm::from_str(name).map_err(|_| PolicyError::UnsupportedAlgorithm(name.to_string()))
}

/// Environments a policy can be bound to: flat observations, one discrete action branch
pub trait PolicyEnv: Environment<State = Observation, Action = usize> + DiscreteActionSpace + ObservationSpace {}

impl<T> PolicyEnv for T where T: Environment<State = Observation, Action = usize> + DiscreteActionSpace + ObservationSpace {}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unsupported algorithm `{0}`, expected one of PPO, A2C, DQN")]
    UnsupportedAlgorithm(String),

    #[error("no saved policy at {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid policy metadata in {}: {message}", path.display())]
    InvalidMetadata { path: PathBuf, message: String },

    #[error("policy at {} was trained with {found}, not {expected}", path.display())]
    AlgorithmMismatch {
        path: PathBuf,
        expected: Algorithm,
        found: Algorithm,
    },

    #[error("failed to read network weights {}: {message}", path.display())]
    Record { path: PathBuf, message: String },

    #[error("failed to save policy to {}: {message}", path.display())]
    Save { path: PathBuf, message: String },

    #[error(
        "environment has {observation_size} observations and {num_actions} actions, \
         policy expects {expected_observation_size} and {expected_num_actions}"
    )]
    SpaceMismatch {
        observation_size: usize,
        num_actions: usize,
        expected_observation_size: usize,
        expected_num_actions: usize,
    },
}

/// Errors raised by [`Policy::learn`]
#[derive(Debug, Error)]
pub enum LearnError {
    #[error("policy is not bound to an environment")]
    NoEnvironment,

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Agent configuration overrides, one optional section per algorithm
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub ppo: PPOAgentConfig,
    pub a2c: A2CAgentConfig,
    pub dqn: DQNAgentConfig,
}

impl Hyperparameters {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Contents of `policy.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyMetadata {
    format_version: u32,
    /// Kept as text so that unknown tags can be reported as such
    algorithm: String,
    policy: String,
    observation_size: usize,
    num_actions: usize,
    hidden_layers: Vec<usize>,
    num_timesteps: usize,
    config: serde_json::Value,
}

type PpoAgent<E> = PPOAgent<TrainingBackend, Net, Net, E, 2>;
type A2cAgent<E> = A2CAgent<TrainingBackend, Net, Net, E, 2>;
type DqnAgent<E> = DQNAgent<TrainingBackend, Net, E, 2>;

enum Agent<E: PolicyEnv> {
    Ppo(PpoAgent<E>),
    A2c(A2cAgent<E>),
    Dqn(DqnAgent<E>),
}

impl<E: PolicyEnv> Agent<E> {
    fn as_trainable(&self) -> &dyn TrainableAgent<E> {
        match self {
            Agent::Ppo(agent) => agent,
            Agent::A2c(agent) => agent,
            Agent::Dqn(agent) => agent,
        }
    }

    fn as_trainable_mut(&mut self) -> &mut dyn TrainableAgent<E> {
        match self {
            Agent::Ppo(agent) => agent,
            Agent::A2c(agent) => agent,
            Agent::Dqn(agent) => agent,
        }
    }
}

/// Counters of a single [`Policy::learn`] call
#[derive(Debug, Default)]
struct RunProgress {
    timesteps: usize,
    episodes: usize,
}

/// A trained or untrained `MlpPolicy` of one algorithm family
pub struct Policy<E: PolicyEnv> {
    algorithm: Algorithm,
    observation_size: usize,
    num_actions: usize,
    agent: Agent<E>,
    env_bound: bool,
    num_timesteps: usize,
    tensorboard_log: Option<PathBuf>,
}

impl<E: PolicyEnv> Policy<E> {
    /// A fresh policy sized for `env` and bound to it
    pub fn new(algorithm: Algorithm, env: &E, hyperparameters: &Hyperparameters) -> Self {
        let observation_size = env.observation_size();
        let num_actions = env.num_actions();
        let actor = || MLPConfig::new(observation_size, NET_ARCH.to_vec(), num_actions).init::<TrainingBackend>(&*DEVICE);
        let critic = || MLPConfig::new(observation_size, NET_ARCH.to_vec(), 1).init::<TrainingBackend>(&*DEVICE);

        let agent = match algorithm {
            Algorithm::PPO => Agent::Ppo(PPOAgent::new(actor(), critic(), hyperparameters.ppo.clone(), &*DEVICE)),
            Algorithm::A2C => Agent::A2c(A2CAgent::new(actor(), critic(), hyperparameters.a2c.clone(), &*DEVICE)),
            Algorithm::DQN => Agent::Dqn(DQNAgent::new(actor(), hyperparameters.dqn.clone(), &*DEVICE)),
        };

        info!(%algorithm, policy = POLICY_TAG, observation_size, num_actions, "created policy");

        Self {
            algorithm,
            observation_size,
            num_actions,
            agent,
            env_bound: true,
            num_timesteps: 0,
            tensorboard_log: None,
        }
    }

    /// Write training metrics under `dir` during [`Policy::learn`]
    pub fn with_tensorboard_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tensorboard_log = Some(dir.into());
        self
    }

    /// Load a policy saved with [`Policy::save`]; the result is not bound to any environment
    pub fn load(path: &Path, algorithm: Algorithm) -> Result<Self, PolicyError> {
        if !path.is_dir() {
            return Err(PolicyError::NotFound(path.to_path_buf()));
        }

        let metadata_path = path.join(METADATA_FILE);
        let json = fs::read_to_string(&metadata_path).map_err(|e| PolicyError::InvalidMetadata {
            path: metadata_path.clone(),
            message: e.to_string(),
        })?;
        let metadata: PolicyMetadata = serde_json::from_str(&json).map_err(|e| PolicyError::InvalidMetadata {
            path: metadata_path.clone(),
            message: e.to_string(),
        })?;

        if metadata.format_version != FORMAT_VERSION {
            return Err(PolicyError::InvalidMetadata {
                path: metadata_path,
                message: format!("unsupported format version {}", metadata.format_version),
            });
        }
        let found = parse_algorithm(&metadata.algorithm)?;
        if found != algorithm {
            return Err(PolicyError::AlgorithmMismatch {
                path: path.to_path_buf(),
                expected: algorithm,
                found,
            });
        }
        if metadata.policy != POLICY_TAG {
            return Err(PolicyError::InvalidMetadata {
                path: metadata_path,
                message: format!("unsupported policy `{}`", metadata.policy),
            });
        }

        let PolicyMetadata {
            observation_size,
            num_actions,
            hidden_layers,
            num_timesteps,
            config,
            ..
        } = metadata;
        let network = |output_dim: usize, file: &str| -> Result<Net, PolicyError> {
            let record = path.join(file);
            MLPConfig::new(observation_size, hidden_layers.clone(), output_dim)
                .init::<TrainingBackend>(&*DEVICE)
                .load_file(record.clone(), &recorder(), &*DEVICE)
                .map_err(|e| PolicyError::Record {
                    path: record,
                    message: format!("{e:?}"),
                })
        };

        let agent = match algorithm {
            Algorithm::PPO => {
                let config = agent_config::<PPOAgentConfig>(&metadata_path, config)?;
                Agent::Ppo(PPOAgent::new(network(num_actions, "actor")?, network(1, "critic")?, config, &*DEVICE))
            }
            Algorithm::A2C => {
                let config = agent_config::<A2CAgentConfig>(&metadata_path, config)?;
                Agent::A2c(A2CAgent::new(network(num_actions, "actor")?, network(1, "critic")?, config, &*DEVICE))
            }
            Algorithm::DQN => {
                let config = agent_config::<DQNAgentConfig>(&metadata_path, config)?;
                Agent::Dqn(DQNAgent::new(network(num_actions, "q_network")?, config, &*DEVICE))
            }
        };

        info!(%algorithm, path = %path.display(), num_timesteps, "loaded policy");

        Ok(Self {
            algorithm,
            observation_size,
            num_actions,
            agent,
            env_bound: false,
            num_timesteps,
            tensorboard_log: None,
        })
    }

    /// Attach the policy to an environment with matching spaces
    pub fn bind_env(&mut self, env: &E) -> Result<(), PolicyError> {
        let observation_size = env.observation_size();
        let num_actions = env.num_actions();
        if observation_size != self.observation_size || num_actions != self.num_actions {
            return Err(PolicyError::SpaceMismatch {
                observation_size,
                num_actions,
                expected_observation_size: self.observation_size,
                expected_num_actions: self.num_actions,
            });
        }
        self.env_bound = true;
        Ok(())
    }

    pub fn has_env(&self) -> bool {
        self.env_bound
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Environment steps taken by [`Policy::learn`] over the policy's lifetime, across loads
    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    /// Pick an action for `observation`
    pub fn predict(&self, observation: &Observation, deterministic: bool) -> usize {
        self.agent.as_trainable().predict(observation, deterministic)
    }

    /// Train for `total_timesteps` environment steps and return how many were taken
    ///
    /// Step counts handed to callbacks and the metrics log start from 0 on every call;
    /// only [`Policy::num_timesteps`] keeps the lifetime total. The environment is reset
    /// first and after every finished episode. Callbacks run in order after every step and
    /// training stops early when one of them returns `false`. Every callback sees
    /// `on_training_end`, whether training succeeded or not.
    pub fn learn(
        &mut self,
        total_timesteps: usize,
        env: &mut E,
        callbacks: &mut [Box<dyn Callback<E>>],
        tb_log_name: &str,
    ) -> Result<usize, LearnError> {
        if !self.env_bound {
            return Err(LearnError::NoEnvironment);
        }

        for callback in callbacks.iter_mut() {
            callback.on_training_start(total_timesteps);
        }

        info!(algorithm = %self.algorithm, total_timesteps, "training started");
        self.agent.as_trainable_mut().train();

        let mut progress = RunProgress::default();
        let result = self.run_steps(total_timesteps, env, callbacks, tb_log_name, &mut progress);

        // Steps outside learn never train
        self.agent.as_trainable_mut().eval();
        for callback in callbacks.iter_mut() {
            callback.on_training_end();
        }
        info!(
            algorithm = %self.algorithm,
            timesteps = progress.timesteps,
            num_timesteps = self.num_timesteps,
            episodes = progress.episodes,
            "training finished"
        );
        result.map(|()| progress.timesteps)
    }

    fn run_steps(
        &mut self,
        total_timesteps: usize,
        env: &mut E,
        callbacks: &mut [Box<dyn Callback<E>>],
        tb_log_name: &str,
        progress: &mut RunProgress,
    ) -> Result<(), LearnError> {
        let mut metrics_log = match &self.tensorboard_log {
            Some(dir) => Some(MetricsLog::create(dir, tb_log_name)?),
            None => None,
        };
        env.reset()?;

        while progress.timesteps < total_timesteps {
            let StepOutcome { done, info, metrics, .. } = self.agent.as_trainable_mut().step(env)?;
            progress.timesteps += 1;
            self.num_timesteps += 1;

            if let Some(metrics) = &metrics {
                debug!(
                    step = progress.timesteps,
                    policy_loss = metrics.policy_loss,
                    value_loss = metrics.value_loss,
                    entropy = metrics.entropy,
                    n_updates = metrics.n_updates,
                    "training update"
                );
                if let Some(log) = metrics_log.as_mut() {
                    log.record_update(progress.timesteps, metrics)?;
                }
            }
            if let Some(episode) = info.episode {
                progress.episodes += 1;
                debug!(episode = progress.episodes, reward = episode.reward, length = episode.length, "episode finished");
                if let Some(log) = metrics_log.as_mut() {
                    log.record_episode(progress.timesteps, &episode)?;
                }
            }
            if done {
                env.reset()?;
            }

            let (keep_going, env_reset) = {
                let mut ctx = CallbackContext::new(progress.timesteps, &*self, &mut *env);
                let mut keep_going = true;
                for callback in callbacks.iter_mut() {
                    if !callback.on_step(&mut ctx)? {
                        keep_going = false;
                        break;
                    }
                }
                (keep_going, ctx.env_was_reset())
            };

            // A callback rolled the environment over; the interrupted episode ends here
            if env_reset {
                self.agent.as_trainable_mut().end_episode();
            }
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// Save the policy as a directory of `policy.json` plus one record per network
    pub fn save(&self, path: &Path) -> Result<(), PolicyError> {
        let save_error = |message: String| PolicyError::Save {
            path: path.to_path_buf(),
            message,
        };
        fs::create_dir_all(path).map_err(|e| save_error(e.to_string()))?;

        let recorder = recorder();
        let config = match &self.agent {
            Agent::Ppo(agent) => {
                agent.actor().clone().save_file(path.join("actor"), &recorder)
                    .and_then(|_| agent.critic().clone().save_file(path.join("critic"), &recorder))
                    .map_err(|e| save_error(format!("{e:?}")))?;
                serde_json::to_value(agent.config())
            }
            Agent::A2c(agent) => {
                agent.actor().clone().save_file(path.join("actor"), &recorder)
                    .and_then(|_| agent.critic().clone().save_file(path.join("critic"), &recorder))
                    .map_err(|e| save_error(format!("{e:?}")))?;
                serde_json::to_value(agent.config())
            }
            Agent::Dqn(agent) => {
                agent.q_network().clone().save_file(path.join("q_network"), &recorder)
                    .map_err(|e| save_error(format!("{e:?}")))?;
                serde_json::to_value(agent.config())
            }
        }
        .map_err(|e| save_error(e.to_string()))?;

        let metadata = PolicyMetadata {
            format_version: FORMAT_VERSION,
            algorithm: self.algorithm.to_string(),
            policy: POLICY_TAG.to_string(),
            observation_size: self.observation_size,
            num_actions: self.num_actions,
            hidden_layers: NET_ARCH.to_vec(),
            num_timesteps: self.num_timesteps,
            config,
        };
        let json = serde_json::to_string_pretty(&metadata).map_err(|e| save_error(e.to_string()))?;
        fs::write(path.join(METADATA_FILE), json).map_err(|e| save_error(e.to_string()))?;

        debug!(path = %path.display(), "saved policy");
        Ok(())
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

fn agent_config<C: DeserializeOwned>(path: &Path, value: serde_json::Value) -> Result<C, PolicyError> {
    serde_json::from_value(value).map_err(|e| PolicyError::InvalidMetadata {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
