//! Building trainer inputs and reading simulator outputs
//!
//! The simulator batches every agent of every behavior into one [`UnityOutputProto`]. Agents
//! that need an action show up as decision steps, agents whose episode just ended as
//! terminal steps; [`BehaviorSteps::from_agent_infos`] does that split.

use std::collections::{BTreeMap, HashMap};

use super::communicator_objects::{
    observation_proto::ObservationData, unity_rl_input_proto::ListAgentActionProto, AgentActionProto,
    AgentInfoProto, BrainParametersProto, CommandProto, SpaceTypeProto, UnityInputProto, UnityOutputProto,
    UnityRlCapabilitiesProto, UnityRlInitializationInputProto, UnityRlInputProto,
};
use crate::env::{EnvError, Observation};

/// Version of the trainer/simulator API spoken by this crate
pub const COMMUNICATION_VERSION: &str = "1.5.0";

/// Reported to the simulator as the trainer's package version
pub const PACKAGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Two versions are compatible when their major components match
pub fn versions_compatible(trainer: &str, simulator: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_owned);
    matches!((major(trainer), major(simulator)), (Some(a), Some(b)) if a == b && !a.is_empty())
}

/// Observation and action layout of one behavior
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorSpec {
    /// Length of the flattened vector observation
    pub observation_size: usize,
    /// Number of choices in each discrete action branch
    pub discrete_branches: Vec<usize>,
    /// Size of the continuous action vector
    pub continuous_size: usize,
}

/// Discrete branch sizes and continuous size announced for a behavior
///
/// Simulators older than the hybrid action spec only fill the deprecated fields.
pub fn action_layout(brain: &BrainParametersProto) -> (Vec<usize>, usize) {
    let to_sizes = |sizes: &[i32]| sizes.iter().map(|&s| s.max(0) as usize).collect::<Vec<_>>();
    match &brain.action_spec {
        Some(spec) => (
            to_sizes(&spec.discrete_branch_sizes),
            spec.num_continuous_actions.max(0) as usize,
        ),
        None if brain.vector_action_space_type_deprecated == SpaceTypeProto::Continuous as i32 => (
            Vec::new(),
            brain.vector_action_size_deprecated.first().copied().unwrap_or_default().max(0) as usize,
        ),
        None => (to_sizes(&brain.vector_action_size_deprecated), 0),
    }
}

/// Agents requesting a decision
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionSteps {
    pub agent_ids: Vec<i32>,
    pub observations: Vec<Observation>,
    pub rewards: Vec<f32>,
    /// Per agent, `true` for every discrete action that is currently forbidden
    pub action_masks: Option<Vec<Vec<bool>>>,
}

/// Agents whose episode ended since the last exchange
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminalSteps {
    pub agent_ids: Vec<i32>,
    pub observations: Vec<Observation>,
    pub rewards: Vec<f32>,
    /// The episode hit the simulator's step limit rather than a terminal state
    pub interrupted: Vec<bool>,
}

/// Decision and terminal steps of one behavior
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BehaviorSteps {
    pub decision: DecisionSteps,
    pub terminal: TerminalSteps,
}

impl BehaviorSteps {
    pub fn from_agent_infos(infos: &[AgentInfoProto]) -> Result<Self, EnvError> {
        let mut steps = Self::default();
        let mut masks = Vec::new();

        for info in infos {
            let observation = flatten_observations(info)?;
            if info.done {
                steps.terminal.agent_ids.push(info.id);
                steps.terminal.observations.push(observation);
                steps.terminal.rewards.push(info.reward);
                steps.terminal.interrupted.push(info.max_step_reached);
            } else {
                steps.decision.agent_ids.push(info.id);
                steps.decision.observations.push(observation);
                steps.decision.rewards.push(info.reward);
                masks.push(info.action_mask.clone());
            }
        }

        if masks.iter().any(|mask| !mask.is_empty()) {
            steps.decision.action_masks = Some(masks);
        }
        Ok(steps)
    }
}

/// Concatenate an agent's float observations into one vector
pub fn flatten_observations(info: &AgentInfoProto) -> Result<Observation, EnvError> {
    let mut flat = Vec::new();
    for observation in &info.observations {
        match &observation.observation_data {
            Some(ObservationData::FloatData(data)) => flat.extend_from_slice(&data.data),
            Some(ObservationData::CompressedData(_)) => {
                return Err(EnvError::Protocol(format!(
                    "compressed observation `{}` of agent {} is not supported",
                    observation.name, info.id
                )))
            }
            None => {
                return Err(EnvError::Protocol(format!(
                    "observation `{}` of agent {} carries no data",
                    observation.name, info.id
                )))
            }
        }
    }
    Ok(flat)
}

/// Steps of `behavior` in `output`; a behavior without agents this round has none
pub fn behavior_steps(output: &UnityOutputProto, behavior: &str) -> Result<BehaviorSteps, EnvError> {
    let rl_output = output
        .rl_output
        .as_ref()
        .ok_or_else(|| EnvError::Protocol("simulator output without agent steps".into()))?;
    match rl_output.agent_infos.get(behavior) {
        Some(infos) => BehaviorSteps::from_agent_infos(&infos.value),
        None => Ok(BehaviorSteps::default()),
    }
}

/// Behaviors announced in `output`, keyed by name
pub fn brain_parameters(output: &UnityOutputProto) -> BTreeMap<String, BrainParametersProto> {
    output
        .rl_initialization_output
        .iter()
        .flat_map(|init| init.brain_parameters.iter())
        .map(|brain| (brain.brain_name.clone(), brain.clone()))
        .collect()
}

/// Side-channel block attached to `output`
pub fn side_channel(output: &UnityOutputProto) -> &[u8] {
    output
        .rl_output
        .as_ref()
        .map(|rl_output| rl_output.side_channel.as_slice())
        .unwrap_or_default()
}

/// The trainer's answer to the simulator's initialization output
pub fn initialization_input(seed: i32) -> UnityInputProto {
    UnityInputProto {
        rl_input: None,
        rl_initialization_input: Some(UnityRlInitializationInputProto {
            seed,
            communication_version: COMMUNICATION_VERSION.to_string(),
            package_version: PACKAGE_VERSION.to_string(),
            capabilities: Some(UnityRlCapabilitiesProto {
                base_rl_capabilities: true,
                hybrid_actions: true,
                ..Default::default()
            }),
            num_areas: 1,
        }),
    }
}

pub fn reset_input(side_channel: Vec<u8>) -> UnityInputProto {
    rl_input(CommandProto::Reset, Default::default(), side_channel)
}

/// One discrete action per agent of `behavior`, in decision-step order
pub fn step_input(behavior: &str, actions: &[i32], side_channel: Vec<u8>) -> UnityInputProto {
    let value = actions
        .iter()
        .map(|&action| AgentActionProto {
            discrete_actions: vec![action],
            ..Default::default()
        })
        .collect();
    let agent_actions = [(behavior.to_string(), ListAgentActionProto { value })].into();
    rl_input(CommandProto::Step, agent_actions, side_channel)
}

fn rl_input(
    command: CommandProto,
    agent_actions: HashMap<String, ListAgentActionProto>,
    side_channel: Vec<u8>,
) -> UnityInputProto {
    UnityInputProto {
        rl_input: Some(UnityRlInputProto {
            agent_actions,
            command: command as i32,
            side_channel,
        }),
        rl_initialization_input: None,
    }
}
