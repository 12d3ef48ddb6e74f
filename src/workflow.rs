//! The run dispatcher: connect, build the policy, train or evaluate, disconnect
//!
//! The environment factory and the clock are injected so runs can be driven without a
//! simulator.

use tracing::{info, warn};

use crate::{
    callbacks::{make_callbacks, ProgressBarCallback},
    cli::{RunAction, RunConfig},
    env::{EnvError, Environment},
    error::RunError,
    naming::{Clock, RunArtifactNames},
    policy::{Policy, PolicyEnv},
    sim::SimulatorConfig,
};

/// Upper bound on evaluation steps
pub const EVAL_ITERATIONS: usize = 10_000;

/// What a finished run did
#[derive(Debug, Clone, PartialEq)]
pub enum RunSummary {
    Trained {
        names: RunArtifactNames,
        /// Environment steps taken by this run
        num_timesteps: usize,
    },
    Evaluated(Evaluation),
}

/// Outcome of the evaluation rollout
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Environment steps taken, the initial random one included
    pub steps: usize,
    pub reward: f64,
    /// Whether the rollout stopped because the episode ended
    pub finished: bool,
}

/// Execute one run
///
/// `make_env` is only called once `config` is known to be valid. Whatever happens after
/// it succeeds, the environment is closed exactly once before returning.
pub fn run<E, F>(config: &RunConfig, make_env: F, clock: &dyn Clock) -> Result<RunSummary, RunError>
where
    E: PolicyEnv,
    F: FnOnce(&SimulatorConfig) -> Result<E, EnvError>,
{
    config.validate()?;

    let mut env = make_env(&config.simulator).map_err(RunError::EnvironmentConnection)?;
    let result = run_with_env(config, &mut env, clock);

    match (result, env.close()) {
        (Ok(summary), Ok(())) => Ok(summary),
        (Ok(_), Err(e)) => Err(RunError::Environment(e)),
        (Err(e), closed) => {
            if let Err(close_error) = closed {
                warn!(error = %close_error, "failed to close the environment");
            }
            Err(e)
        }
    }
}

fn run_with_env<E: PolicyEnv>(config: &RunConfig, env: &mut E, clock: &dyn Clock) -> Result<RunSummary, RunError> {
    let mut policy = build_policy(config, env)?;

    match config.action {
        RunAction::Train | RunAction::ContinueTrain => train(config, &mut policy, env, clock),
        RunAction::Evaluate => evaluate(&policy, env).map(RunSummary::Evaluated),
    }
}

/// Create or load the policy the run asks for
///
/// Loaded policies are rebound to `env` only when they will be trained.
pub fn build_policy<E: PolicyEnv>(config: &RunConfig, env: &E) -> Result<Policy<E>, RunError> {
    let model_path = || {
        config
            .model_path
            .as_deref()
            .ok_or_else(|| RunError::MissingPrecondition(format!("action {} needs a model path", config.action)))
    };

    if config.ignored_hyperparameters() {
        warn!(
            action = %config.action,
            "hyperparameter overrides are ignored, the loaded policy keeps its saved configuration"
        );
    }

    let policy = match config.action {
        RunAction::Train => Policy::new(config.algorithm, env, &config.hyperparameters)
            .with_tensorboard_log(&config.tensorboard_log),
        RunAction::ContinueTrain => {
            let mut policy = Policy::load(model_path()?, config.algorithm)?;
            policy.bind_env(env)?;
            policy.with_tensorboard_log(&config.tensorboard_log)
        }
        RunAction::Evaluate => Policy::load(model_path()?, config.algorithm)?,
    };
    Ok(policy)
}

fn train<E: PolicyEnv>(
    config: &RunConfig,
    policy: &mut Policy<E>,
    env: &mut E,
    clock: &dyn Clock,
) -> Result<RunSummary, RunError> {
    let names = RunArtifactNames::new(config.algorithm, clock, &config.log_dir);
    info!(
        run = %names.run_name,
        best_model_dir = %names.best_model_dir.display(),
        steps = config.step_budget,
        "starting training"
    );

    let mut callbacks = make_callbacks(&names, &config.log_dir);
    callbacks.push(Box::new(ProgressBarCallback::new()));
    let num_timesteps = policy.learn(config.step_budget, env, &mut callbacks, &names.run_name)?;

    Ok(RunSummary::Trained { names, num_timesteps })
}

/// One random action, then act deterministically until the episode ends
///
/// The environment is reset once the episode has ended and the rollout stops there.
fn evaluate<E: PolicyEnv>(policy: &Policy<E>, env: &mut E) -> Result<Evaluation, RunError> {
    let first = env.step(env.random_action()).map_err(RunError::Environment)?;
    let mut observation = first.observation;
    let mut done = first.done;
    let mut reward = first.reward as f64;
    let mut steps = 1;

    for _ in 0..EVAL_ITERATIONS {
        if done {
            env.reset().map_err(RunError::Environment)?;
            break;
        }
        let step = env
            .step(policy.predict(&observation, true))
            .map_err(RunError::Environment)?;
        observation = step.observation;
        done = step.done;
        reward += step.reward as f64;
        steps += 1;
    }

    info!(steps, reward, finished = done, "evaluation finished");
    println!("Evaluation: {steps} steps, total reward {reward:.3}, episode finished: {done}");

    Ok(Evaluation {
        steps,
        reward,
        finished: done,
    })
}
