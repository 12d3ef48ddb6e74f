use thiserror::Error;

use crate::{
    callbacks::CallbackError,
    cli::ArgError,
    env::EnvError,
    metrics::MetricsError,
    policy::{LearnError, PolicyError},
};

/// Everything that can end a run
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ArgError),

    #[error("{0}")]
    MissingPrecondition(String),

    #[error("could not connect to the simulator: {0}")]
    EnvironmentConnection(#[source] EnvError),

    #[error("could not load model: {0}")]
    ModelLoad(#[source] PolicyError),

    #[error("unsupported algorithm `{0}`, expected one of PPO, A2C, DQN")]
    UnsupportedAlgorithm(String),

    #[error("environment failure: {0}")]
    Environment(#[source] EnvError),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

impl From<PolicyError> for RunError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::UnsupportedAlgorithm(name) => RunError::UnsupportedAlgorithm(name),
            e => RunError::ModelLoad(e),
        }
    }
}

impl From<LearnError> for RunError {
    fn from(e: LearnError) -> Self {
        match e {
            LearnError::NoEnvironment => {
                RunError::MissingPrecondition("the policy must be bound to an environment to train".into())
            }
            LearnError::Env(e) => RunError::Environment(e),
            LearnError::Callback(e) => RunError::Callback(e),
            LearnError::Metrics(e) => RunError::Metrics(e),
        }
    }
}
