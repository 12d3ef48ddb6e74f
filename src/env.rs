//! Environment abstraction shared by the agents, the callbacks and the simulator bridge
//!
//! The agents in [`crate::algo`] only ever talk to an [`Environment`]. The simulator bridge
//! ([`crate::sim::SimEnv`]) is the production implementation; tests use small scripted ones.

use std::collections::{btree_map::Entry, BTreeMap};

use thiserror::Error;

/// Observation vector produced by the simulator
pub type Observation = Vec<f32>;

/// Errors raised while talking to an environment
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("simulator I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed simulator message: {0}")]
    Protocol(String),

    #[error("gRPC server failed: {0}")]
    Rpc(String),

    #[error("the simulator ended the session")]
    SimulatorStopped,

    #[error("communication version mismatch: trainer speaks {trainer}, simulator speaks {simulator}")]
    VersionMismatch { trainer: String, simulator: String },

    #[error("expected a single behavior in the scene, found {0}")]
    MultipleBehaviors(usize),

    #[error("the environment was launched as a single-agent environment, but {0} agents are in the scene")]
    MultipleAgents(usize),

    #[error("behavior `{0}` does not use a single discrete action branch")]
    UnsupportedActionSpace(String),

    #[error("action {action} is outside the discrete action space of size {size}")]
    InvalidAction { action: usize, size: usize },

    #[error("time scale must be greater than 0, got {0}")]
    InvalidTimeScale(f32),

    #[error("simulator process exited ({0})")]
    ProcessExited(String),

    #[error("environment is closed")]
    Closed,
}

/// Statistics of a finished episode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeSummary {
    pub reward: f64,
    pub length: usize,
}

/// Auxiliary information attached to a [`Step`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInfo {
    /// The episode was cut short by the simulator (time limit) rather than terminated
    pub interrupted: bool,
    /// Set on the step that ends an episode
    pub episode: Option<EpisodeSummary>,
}

/// Result of one environment step
#[derive(Debug, Clone)]
pub struct Step<S> {
    pub observation: S,
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
}

/// A single-agent reinforcement learning environment
pub trait Environment {
    /// The type of the state/observation handed to the agent
    type State: Clone;
    /// The type of the action applied to the environment
    type Action: Clone;

    /// Apply `action` and advance the environment by one step
    fn step(&mut self, action: Self::Action) -> Result<Step<Self::State>, EnvError>;

    /// Start a new episode and return its first observation
    fn reset(&mut self) -> Result<Self::State, EnvError>;

    /// The most recent observation
    fn current_state(&self) -> Self::State;

    /// Sample an action uniformly from the action space
    fn random_action(&self) -> Self::Action;

    /// Release the environment. Calling it more than once is a no-op.
    fn close(&mut self) -> Result<(), EnvError>;
}

/// An environment with a finite set of actions
pub trait DiscreteActionSpace: Environment {
    /// Every valid action
    fn actions(&self) -> Vec<Self::Action>;

    fn num_actions(&self) -> usize {
        self.actions().len()
    }
}

/// An environment with flat vector observations
pub trait ObservationSpace {
    fn observation_size(&self) -> usize;
}

/// Named running totals for the current episode
#[derive(Debug, Clone, Default)]
pub struct Report {
    keys: Vec<&'static str>,
    data: BTreeMap<&'static str, f64>,
}

impl Report {
    pub fn new(keys: Vec<&'static str>) -> Self {
        let data = keys.iter().map(|&k| (k, 0.0)).collect();
        Self { keys, data }
    }

    pub fn keys(&self) -> &[&'static str] {
        &self.keys
    }

    pub fn entry(&mut self, key: &'static str) -> Entry<'_, &'static str, f64> {
        self.data.entry(key)
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.data.get(key).copied()
    }

    /// Return the accumulated values and zero every key
    pub fn take(&mut self) -> BTreeMap<&'static str, f64> {
        let fresh = self.keys.iter().map(|&k| (k, 0.0)).collect();
        std::mem::replace(&mut self.data, fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_take_resets_values() {
        let mut report = Report::new(vec!["reward", "steps"]);
        report.entry("reward").and_modify(|x| *x += 1.5);
        report.entry("steps").and_modify(|x| *x += 1.0);
        report.entry("reward").and_modify(|x| *x += 0.5);

        let taken = report.take();
        assert_eq!(taken.get("reward"), Some(&2.0));
        assert_eq!(taken.get("steps"), Some(&1.0));
        assert_eq!(report.get("reward"), Some(0.0));
        assert_eq!(report.keys(), &["reward", "steps"]);
    }

    #[test]
    fn report_unknown_key_is_absent() {
        let report = Report::new(vec!["reward"]);
        assert_eq!(report.get("length"), None);
    }
}
