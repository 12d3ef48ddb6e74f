//! Single-agent adapter over the simulator's batched multi-agent exchange

use std::{collections::BTreeMap, net::TcpListener, process::Child};

use rand::{thread_rng, Rng};
use tracing::{debug, info};

use super::{
    communicator_objects::{BrainParametersProto, UnityOutputProto},
    factory::SimulatorConfig,
    grpc_server::RpcCommunicator,
    messages::{self, versions_compatible, BehaviorSpec, BehaviorSteps, COMMUNICATION_VERSION},
    side_channel::{self, EngineConfigurationChannel},
};
use crate::env::{
    DiscreteActionSpace, EnvError, EpisodeSummary, Environment, Observation, ObservationSpace, Report,
    Step, StepInfo,
};

/// A simulator scene with one behavior driving one agent, seen as a plain environment
///
/// Actions are indices into the behavior's single discrete branch.
pub struct SimEnv {
    communicator: RpcCommunicator,
    behavior_name: String,
    spec: BehaviorSpec,
    engine_channel: EngineConfigurationChannel,
    last_observation: Observation,
    report: Report,
    needs_reset: bool,
}

impl SimEnv {
    /// Serve the simulator on `listener`, perform the handshake and reset the scene with
    /// the configured simulation speed
    ///
    /// `child` is the simulator process when we launched it ourselves.
    pub fn connect(listener: TcpListener, child: Option<Child>, config: &SimulatorConfig) -> Result<Self, EnvError> {
        let mut engine_channel = EngineConfigurationChannel::new();
        engine_channel.set_time_scale(config.time_scale)?;

        let mut communicator = RpcCommunicator::serve(listener, child)?;

        match handshake(&mut communicator, &mut engine_channel, config.seed) {
            Ok((behavior_name, spec, observation)) => {
                info!(
                    behavior = %behavior_name,
                    observation_size = spec.observation_size,
                    num_actions = spec.discrete_branches[0],
                    time_scale = config.time_scale,
                    "connected to simulator"
                );
                Ok(Self {
                    communicator,
                    behavior_name,
                    spec,
                    engine_channel,
                    last_observation: observation,
                    report: Report::new(vec!["reward", "length"]),
                    needs_reset: false,
                })
            }
            Err(e) => {
                communicator.close();
                Err(e)
            }
        }
    }

    pub fn behavior_name(&self) -> &str {
        &self.behavior_name
    }

    pub fn behavior_spec(&self) -> &BehaviorSpec {
        &self.spec
    }

    /// Running totals of the current episode
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Queue a new simulation speed, sent with the next request
    pub fn set_time_scale(&mut self, time_scale: f32) -> Result<(), EnvError> {
        self.engine_channel.set_time_scale(time_scale)
    }

    fn outgoing_side_channel(&mut self) -> Vec<u8> {
        side_channel::encode(&self.engine_channel.drain())
    }

    /// This env's behavior in a simulator output
    fn behavior_steps(&self, output: &UnityOutputProto) -> Result<BehaviorSteps, EnvError> {
        log_side_channel(output)?;
        messages::behavior_steps(output, &self.behavior_name)
    }

    fn check_observation(&self, observation: Observation) -> Result<Observation, EnvError> {
        if observation.len() != self.spec.observation_size {
            return Err(EnvError::Protocol(format!(
                "observation of size {} does not match the behavior's {}",
                observation.len(),
                self.spec.observation_size
            )));
        }
        Ok(observation)
    }
}

fn log_side_channel(output: &UnityOutputProto) -> Result<(), EnvError> {
    for message in side_channel::decode(messages::side_channel(output))? {
        debug!(channel = %message.channel_id, bytes = message.payload.len(), "side-channel message from simulator");
    }
    Ok(())
}

/// The observation of the one agent requesting a decision
fn first_decision(steps: BehaviorSteps) -> Result<Observation, EnvError> {
    let decision = steps.decision;
    match decision.agent_ids.len() {
        1 => {}
        0 => return Err(EnvError::Protocol("no agent requested a decision".into())),
        n => return Err(EnvError::MultipleAgents(n)),
    }
    decision
        .observations
        .into_iter()
        .next()
        .ok_or_else(|| EnvError::Protocol("decision step without observation".into()))
}

/// Initialize, check versions, then reset once to learn the scene's behavior
///
/// Behaviors are announced either with the initialization output or with the first
/// output after a reset.
fn handshake(
    communicator: &mut RpcCommunicator,
    engine_channel: &mut EngineConfigurationChannel,
    seed: i32,
) -> Result<(String, BehaviorSpec, Observation), EnvError> {
    let academy = communicator.initialize(messages::initialization_input(seed))?;
    let init = academy.rl_initialization_output.clone().unwrap_or_default();

    if !versions_compatible(COMMUNICATION_VERSION, &init.communication_version) {
        return Err(EnvError::VersionMismatch {
            trainer: COMMUNICATION_VERSION.to_string(),
            simulator: init.communication_version,
        });
    }
    debug!(
        name = %init.name,
        communication_version = %init.communication_version,
        package_version = %init.package_version,
        "simulator initialized"
    );

    let first = communicator.exchange(messages::reset_input(side_channel::encode(&engine_channel.drain())))?;
    log_side_channel(&first)?;

    let mut behaviors = messages::brain_parameters(&academy);
    behaviors.extend(messages::brain_parameters(&first));
    let (behavior_name, num_actions) = single_behavior(behaviors)?;

    let observation = first_decision(messages::behavior_steps(&first, &behavior_name)?)?;
    let spec = BehaviorSpec {
        observation_size: observation.len(),
        discrete_branches: vec![num_actions],
        continuous_size: 0,
    };
    Ok((behavior_name, spec, observation))
}

/// The scene must expose exactly one behavior with a single discrete branch
fn single_behavior(behaviors: BTreeMap<String, BrainParametersProto>) -> Result<(String, usize), EnvError> {
    if behaviors.len() != 1 {
        return Err(EnvError::MultipleBehaviors(behaviors.len()));
    }
    let Some((name, brain)) = behaviors.into_iter().next() else {
        return Err(EnvError::MultipleBehaviors(0));
    };
    match messages::action_layout(&brain) {
        (branches, 0) if branches.len() == 1 && branches[0] > 0 => Ok((name, branches[0])),
        _ => Err(EnvError::UnsupportedActionSpace(name)),
    }
}

impl Environment for SimEnv {
    type State = Observation;
    type Action = usize;

    fn step(&mut self, action: usize) -> Result<Step<Observation>, EnvError> {
        let size = self.num_actions();
        if action >= size {
            return Err(EnvError::InvalidAction { action, size });
        }
        if self.needs_reset {
            debug!("stepping a finished episode, the simulator starts a new one");
            self.needs_reset = false;
        }

        let side_channel = self.outgoing_side_channel();
        let input = messages::step_input(&self.behavior_name, &[action as i32], side_channel);
        let output = self.communicator.exchange(input)?;
        let steps = self.behavior_steps(&output)?;

        let (observation, reward, done, interrupted) = if !steps.terminal.agent_ids.is_empty() {
            let terminal = steps.terminal;
            if terminal.agent_ids.len() > 1 {
                return Err(EnvError::MultipleAgents(terminal.agent_ids.len()));
            }
            let observation = terminal
                .observations
                .into_iter()
                .next()
                .ok_or_else(|| EnvError::Protocol("terminal step without observation".into()))?;
            let reward = terminal.rewards.first().copied().unwrap_or_default();
            let interrupted = terminal.interrupted.first().copied().unwrap_or_default();
            (observation, reward, true, interrupted)
        } else {
            let decision = steps.decision;
            match decision.agent_ids.len() {
                1 => {}
                0 => return Err(EnvError::Protocol("no agent requested a decision".into())),
                n => return Err(EnvError::MultipleAgents(n)),
            }
            let observation = decision
                .observations
                .into_iter()
                .next()
                .ok_or_else(|| EnvError::Protocol("decision step without observation".into()))?;
            let reward = decision.rewards.first().copied().unwrap_or_default();
            (observation, reward, false, false)
        };
        let observation = self.check_observation(observation)?;

        self.report.entry("reward").and_modify(|x| *x += reward as f64);
        self.report.entry("length").and_modify(|x| *x += 1.0);

        let episode = if done {
            self.needs_reset = true;
            let totals = self.report.take();
            Some(EpisodeSummary {
                reward: totals.get("reward").copied().unwrap_or_default(),
                length: totals.get("length").copied().unwrap_or_default() as usize,
            })
        } else {
            None
        };

        self.last_observation = observation.clone();
        Ok(Step {
            observation,
            reward,
            done,
            info: StepInfo { interrupted, episode },
        })
    }

    fn reset(&mut self) -> Result<Observation, EnvError> {
        let side_channel = self.outgoing_side_channel();
        let output = self.communicator.exchange(messages::reset_input(side_channel))?;
        let observation = self.check_observation(first_decision(self.behavior_steps(&output)?)?)?;

        self.report.take();
        self.needs_reset = false;
        self.last_observation = observation.clone();
        Ok(observation)
    }

    fn current_state(&self) -> Observation {
        self.last_observation.clone()
    }

    fn random_action(&self) -> usize {
        thread_rng().gen_range(0..self.num_actions())
    }

    fn close(&mut self) -> Result<(), EnvError> {
        if !self.communicator.is_closed() {
            info!(behavior = %self.behavior_name, "closing simulator connection");
            self.communicator.close();
        }
        Ok(())
    }
}

impl DiscreteActionSpace for SimEnv {
    fn actions(&self) -> Vec<usize> {
        (0..self.num_actions()).collect()
    }

    fn num_actions(&self) -> usize {
        self.spec.discrete_branches[0]
    }
}

impl ObservationSpace for SimEnv {
    fn observation_size(&self) -> usize {
        self.spec.observation_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::communicator_objects::ActionSpecProto;

    fn brain(name: &str, branches: Vec<i32>, continuous: i32) -> (String, BrainParametersProto) {
        let brain = BrainParametersProto {
            brain_name: name.to_string(),
            action_spec: Some(ActionSpecProto {
                num_continuous_actions: continuous,
                num_discrete_actions: branches.len() as i32,
                discrete_branch_sizes: branches,
                ..Default::default()
            }),
            ..Default::default()
        };
        (name.to_string(), brain)
    }

    #[test]
    fn accepts_one_discrete_behavior() {
        let behaviors = BTreeMap::from([brain("Car?team=0", vec![3], 0)]);
        assert_eq!(single_behavior(behaviors).unwrap(), ("Car?team=0".to_string(), 3));
    }

    #[test]
    fn rejects_several_behaviors() {
        let behaviors = BTreeMap::from([brain("A", vec![3], 0), brain("B", vec![3], 0)]);
        assert!(matches!(single_behavior(behaviors), Err(EnvError::MultipleBehaviors(2))));
        assert!(matches!(single_behavior(BTreeMap::new()), Err(EnvError::MultipleBehaviors(0))));
    }

    #[test]
    fn rejects_unsupported_action_spaces() {
        for (branches, continuous) in [(vec![3, 2], 0), (vec![], 2), (vec![3], 1), (vec![0], 0)] {
            let behaviors = BTreeMap::from([brain("Car", branches, continuous)]);
            assert!(matches!(
                single_behavior(behaviors),
                Err(EnvError::UnsupportedActionSpace(name)) if name == "Car"
            ));
        }
    }
}
