//! Command line arguments and the validated run configuration built from them

use std::{fs, path::PathBuf, str::FromStr};

use clap::Parser;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::{
    error::RunError,
    policy::{parse_algorithm, Algorithm, Hyperparameters},
    sim::{factory::DEFAULT_BASE_PORT, SimulatorConfig},
};

pub const DEFAULT_STEPS: usize = 20_000;

const USAGE_EXAMPLES: &str = "\
Examples:
  Train a new model:
    drive-gym --action train --rl_algorithm PPO
  Continue training an existing model:
    drive-gym --action cont_train --rl_algorithm PPO --model logs/PPO-MlpPolicy-08-05-2023-16-51-19_best/best_model
  Evaluate a trained model:
    drive-gym --action eval --rl_algorithm PPO --model logs/PPO-MlpPolicy-08-05-2023-16-51-19_best/best_model

Without --exec, open the environment in the editor and press play after starting this program.";

#[derive(Debug, Error, PartialEq)]
pub enum ArgError {
    #[error("argument must be a floating point number, got `{0}`")]
    NotAFloat(String),

    #[error("argument must be in range {min} - {max}, got {value}")]
    OutOfRange { value: f32, min: f32, max: f32 },

    #[error("unknown action `{0}`, expected one of train, cont_train, eval")]
    UnknownAction(String),

    #[error("time scale must be greater than 0")]
    ZeroTimeScale,

    #[error("number of steps must be positive")]
    ZeroSteps,

    #[error("failed to read hyperparameters from {}: {message}", path.display())]
    Hyperparameters { path: PathBuf, message: String },
}

/// Parse `arg` as a float within `[min, max]`, returning it unchanged
pub fn parse_float_in_range(arg: &str, min: f32, max: f32) -> Result<f32, ArgError> {
    let value = f32::from_str(arg.trim()).map_err(|_| ArgError::NotAFloat(arg.to_string()))?;
    if !(min..=max).contains(&value) {
        return Err(ArgError::OutOfRange { value, min, max });
    }
    Ok(value)
}

/// A clap value parser for floats within `[min, max]`
pub fn float_range(min: f32, max: f32) -> impl Fn(&str) -> Result<f32, ArgError> + Clone + Send + Sync + 'static {
    move |arg| parse_float_in_range(arg, min, max)
}

fn time_scale_range(arg: &str) -> Result<f32, ArgError> {
    float_range(0.0, f32::INFINITY)(arg)
}

/// What a run does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum RunAction {
    #[strum(serialize = "train")]
    Train,
    #[strum(serialize = "cont_train")]
    ContinueTrain,
    #[strum(serialize = "eval")]
    Evaluate,
}

impl RunAction {
    pub fn needs_model(self) -> bool {
        matches!(self, RunAction::ContinueTrain | RunAction::Evaluate)
    }
}

fn parse_action(arg: &str) -> Result<RunAction, ArgError> {
    RunAction::from_str(arg).map_err(|_| ArgError::UnknownAction(arg.to_string()))
}

/// Train, continue training or evaluate a driving policy against the simulator
#[derive(Parser, Debug, Clone)]
#[command(name = "drive-gym", version, about, after_help = USAGE_EXAMPLES)]
pub struct Args {
    /// Train a new model, continue training an existing one or evaluate one
    #[arg(short, long, value_parser = parse_action)]
    pub action: RunAction,

    /// Simulator executable to launch; without it, connect to the editor
    #[arg(short, long = "exec")]
    pub exec: Option<PathBuf>,

    /// Simulation speed, 2.0 runs the simulation twice as fast
    #[arg(short, long = "time_scale", default_value_t = 1.0, value_parser = time_scale_range)]
    pub time_scale: f32,

    /// Reinforcement learning algorithm: PPO, A2C or DQN
    #[arg(short = 'l', long = "rl_algorithm")]
    pub rl_algorithm: String,

    /// Saved model directory, required for cont_train and eval
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Number of environment steps to train for
    #[arg(short, long, default_value_t = DEFAULT_STEPS)]
    pub steps: usize,

    /// Where evaluations, best models and checkpoints are written
    #[arg(long = "log_dir", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Where training metrics are written
    #[arg(long = "tensorboard_log", default_value = "tensorboard")]
    pub tensorboard_log: PathBuf,

    #[arg(long, default_value_t = 0)]
    pub seed: i32,

    /// First port for launched executables
    #[arg(long = "base_port", default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// Offset added to the base port
    #[arg(long = "worker_id", default_value_t = 0)]
    pub worker_id: u16,

    /// Launch the executable without rendering
    #[arg(long = "no_graphics")]
    pub no_graphics: bool,

    /// JSON file overriding agent settings, with optional `ppo`, `a2c` and `dqn` sections
    #[arg(long)]
    pub hyperparams: Option<PathBuf>,
}

/// Validated settings of one run; never changes once built
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub action: RunAction,
    pub algorithm: Algorithm,
    pub simulator: SimulatorConfig,
    pub model_path: Option<PathBuf>,
    pub step_budget: usize,
    pub log_dir: PathBuf,
    pub tensorboard_log: PathBuf,
    pub hyperparameters: Hyperparameters,
}

impl RunConfig {
    /// Build the run configuration, failing before any resource is acquired
    pub fn from_args(args: Args) -> Result<Self, RunError> {
        let algorithm = parse_algorithm(&args.rl_algorithm)?;
        let hyperparameters = match &args.hyperparams {
            Some(path) => load_hyperparameters(path)?,
            None => Hyperparameters::default(),
        };

        let config = Self {
            action: args.action,
            algorithm,
            simulator: SimulatorConfig {
                executable: args.exec,
                time_scale: args.time_scale,
                base_port: args.base_port,
                worker_id: args.worker_id,
                seed: args.seed,
                no_graphics: args.no_graphics,
            },
            model_path: args.model,
            step_budget: args.steps,
            log_dir: args.log_dir,
            tensorboard_log: args.tensorboard_log,
            hyperparameters,
        };
        config.validate()?;
        Ok(config)
    }

    /// A config for `action` and `algorithm` with every other setting at its default
    pub fn new(action: RunAction, algorithm: Algorithm) -> Self {
        Self {
            action,
            algorithm,
            simulator: SimulatorConfig::default(),
            model_path: None,
            step_budget: DEFAULT_STEPS,
            log_dir: PathBuf::from("logs"),
            tensorboard_log: PathBuf::from("tensorboard"),
            hyperparameters: Hyperparameters::default(),
        }
    }

    /// Overrides that will not take effect: a loaded policy keeps the configuration it was
    /// saved with
    pub fn ignored_hyperparameters(&self) -> bool {
        self.action.needs_model() && self.hyperparameters != Hyperparameters::default()
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if self.action.needs_model() && self.model_path.is_none() {
            return Err(RunError::MissingPrecondition(format!(
                "when selecting action {}, you must provide the path to a model with --model",
                self.action
            )));
        }
        let time_scale = self.simulator.time_scale;
        if time_scale.is_nan() || time_scale < 0.0 {
            return Err(ArgError::OutOfRange {
                value: time_scale,
                min: 0.0,
                max: f32::INFINITY,
            }
            .into());
        }
        if time_scale == 0.0 {
            return Err(ArgError::ZeroTimeScale.into());
        }
        if self.step_budget == 0 && self.action != RunAction::Evaluate {
            return Err(ArgError::ZeroSteps.into());
        }
        Ok(())
    }
}

fn load_hyperparameters(path: &PathBuf) -> Result<Hyperparameters, ArgError> {
    let error = |message: String| ArgError::Hyperparameters {
        path: path.clone(),
        message,
    };
    let json = fs::read_to_string(path).map_err(|e| error(e.to_string()))?;
    Hyperparameters::from_json(&json).map_err(|e| error(e.to_string()))
}
