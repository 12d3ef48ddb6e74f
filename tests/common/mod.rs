#![allow(dead_code)]

use std::{
    cell::Cell,
    rc::Rc,
    thread::{self, JoinHandle},
};

use chrono::{NaiveDate, NaiveDateTime};
use drive_gym::{
    env::{DiscreteActionSpace, EnvError, Environment, Observation, ObservationSpace, Step, StepInfo},
    sim::{
        communicator_objects::{
            observation_proto::{FloatData, ObservationData},
            unity_rl_output_proto::ListAgentInfoProto,
            unity_to_external_proto_client::UnityToExternalProtoClient,
            ActionSpecProto, AgentInfoProto, BrainParametersProto, CommandProto, HeaderProto, ObservationProto,
            UnityMessageProto, UnityOutputProto, UnityRlInitializationOutputProto, UnityRlOutputProto,
        },
        grpc_server::{STATUS_CLOSE, STATUS_OK},
        messages::COMMUNICATION_VERSION,
        side_channel::{self, ENGINE_CONFIGURATION_CHANNEL_ID},
    },
};

pub const OBSERVATION_SIZE: usize = 4;
pub const NUM_ACTIONS: usize = 3;
pub const BEHAVIOR: &str = "RaceCar?team=0";

pub fn fixed_clock() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, 5, 8)
        .unwrap()
        .and_hms_opt(16, 51, 19)
        .unwrap()
}

/// Shared view of what happened to a [`ScriptedEnv`] after it was handed away
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub created: Rc<Cell<usize>>,
    pub steps: Rc<Cell<usize>>,
    pub resets: Rc<Cell<usize>>,
    pub closes: Rc<Cell<usize>>,
}

/// An in-memory environment whose episodes last `episode_length` steps, or forever
pub struct ScriptedEnv {
    episode_length: Option<usize>,
    t: usize,
    counters: Counters,
}

impl ScriptedEnv {
    pub fn new(episode_length: Option<usize>, counters: &Counters) -> Self {
        counters.created.set(counters.created.get() + 1);
        Self {
            episode_length,
            t: 0,
            counters: counters.clone(),
        }
    }

    fn observation(&self) -> Observation {
        let phase = self.t as f32 / 10.0;
        vec![phase.sin(), phase.cos(), 0.5, -0.5]
    }
}

impl Environment for ScriptedEnv {
    type State = Observation;
    type Action = usize;

    fn step(&mut self, action: usize) -> Result<Step<Observation>, EnvError> {
        if action >= NUM_ACTIONS {
            return Err(EnvError::InvalidAction {
                action,
                size: NUM_ACTIONS,
            });
        }
        self.counters.steps.set(self.counters.steps.get() + 1);
        self.t += 1;
        let done = self.episode_length.is_some_and(|length| self.t >= length);
        Ok(Step {
            observation: self.observation(),
            reward: if action == 0 { 1.0 } else { 0.0 },
            done,
            info: StepInfo::default(),
        })
    }

    fn reset(&mut self) -> Result<Observation, EnvError> {
        self.counters.resets.set(self.counters.resets.get() + 1);
        self.t = 0;
        Ok(self.observation())
    }

    fn current_state(&self) -> Observation {
        self.observation()
    }

    fn random_action(&self) -> usize {
        self.t % NUM_ACTIONS
    }

    fn close(&mut self) -> Result<(), EnvError> {
        self.counters.closes.set(self.counters.closes.get() + 1);
        Ok(())
    }
}

impl DiscreteActionSpace for ScriptedEnv {
    fn actions(&self) -> Vec<usize> {
        (0..NUM_ACTIONS).collect()
    }
}

impl ObservationSpace for ScriptedEnv {
    fn observation_size(&self) -> usize {
        OBSERVATION_SIZE
    }
}

/// What the mock simulator saw
#[derive(Debug, Default)]
pub struct SimulatorLog {
    pub seed: i32,
    pub time_scale: Option<f32>,
    pub actions: Vec<i32>,
    /// Every reset, the one that follows the handshake included
    pub resets: usize,
    pub closed: bool,
}

/// What the mock simulator announces
#[derive(Debug, Clone)]
pub struct Scene {
    pub communication_version: String,
    pub behaviors: Vec<String>,
}

pub fn scene(behaviors: &[&str]) -> Scene {
    Scene {
        communication_version: COMMUNICATION_VERSION.to_string(),
        behaviors: behaviors.iter().map(|b| b.to_string()).collect(),
    }
}

pub fn single_behavior_scene() -> Scene {
    scene(&[BEHAVIOR])
}

fn brain(name: &str) -> BrainParametersProto {
    BrainParametersProto {
        brain_name: name.to_string(),
        is_training: true,
        action_spec: Some(ActionSpecProto {
            num_continuous_actions: 0,
            num_discrete_actions: 1,
            discrete_branch_sizes: vec![NUM_ACTIONS as i32],
            action_descriptions: vec![],
        }),
        ..Default::default()
    }
}

fn agent(t: usize, reward: f32, done: bool, interrupted: bool) -> AgentInfoProto {
    AgentInfoProto {
        id: 0,
        reward,
        done,
        max_step_reached: interrupted,
        observations: vec![ObservationProto {
            shape: vec![OBSERVATION_SIZE as i32],
            observation_data: Some(ObservationData::FloatData(FloatData {
                data: vec![t as f32; OBSERVATION_SIZE],
            })),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn message(output: Option<UnityOutputProto>) -> UnityMessageProto {
    UnityMessageProto {
        header: Some(HeaderProto {
            status: STATUS_OK,
            message: String::new(),
        }),
        unity_output: output,
        unity_input: None,
    }
}

/// The agents of [`BEHAVIOR`], plus the behaviors' parameters on the first output
fn steps(agents: Vec<AgentInfoProto>, announce: Option<&Scene>) -> UnityMessageProto {
    message(Some(UnityOutputProto {
        rl_output: Some(UnityRlOutputProto {
            agent_infos: [(BEHAVIOR.to_string(), ListAgentInfoProto { value: agents })].into(),
            side_channel: vec![],
        }),
        rl_initialization_output: announce.map(|scene| UnityRlInitializationOutputProto {
            brain_parameters: scene.behaviors.iter().map(|b| brain(b)).collect(),
            ..Default::default()
        }),
    }))
}

/// Extract the time scale from an incoming side-channel block
fn time_scale(block: &[u8]) -> Option<f32> {
    side_channel::decode(block)
        .ok()?
        .into_iter()
        .filter(|m| m.channel_id == ENGINE_CONFIGURATION_CHANNEL_ID)
        .filter_map(|m| side_channel::decode_float_setting(&m.payload))
        .find(|&(kind, _)| kind == 2)
        .map(|(_, value)| value)
}

/// A simulator with one agent whose episodes end after `episode_length` steps, calling
/// the trainer on `port` the way the ML-Agents runtime does.
/// Each step pays the action's index; the last step of an episode is interrupted when
/// `interrupt` is set.
pub fn spawn_simulator(port: u16, scene: Scene, episode_length: usize, interrupt: bool) -> JoinHandle<SimulatorLog> {
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async move {
            let mut log = SimulatorLog::default();
            let mut client = UnityToExternalProtoClient::connect(format!("http://127.0.0.1:{port}"))
                .await
                .unwrap();

            let academy = message(Some(UnityOutputProto {
                rl_output: None,
                rl_initialization_output: Some(UnityRlInitializationOutputProto {
                    name: "RaceTrack".to_string(),
                    communication_version: scene.communication_version.clone(),
                    package_version: "2.0.1".to_string(),
                    ..Default::default()
                }),
            }));
            let mut outgoing = academy;
            let mut announced = false;
            let mut t = 0;

            loop {
                let Ok(reply) = client.exchange(outgoing).await else {
                    return log;
                };
                let reply = reply.into_inner();
                if reply.header.as_ref().map_or(true, |h| h.status == STATUS_CLOSE) {
                    log.closed = true;
                    return log;
                }
                let Some(input) = reply.unity_input else {
                    return log;
                };

                if let Some(init) = input.rl_initialization_input {
                    log.seed = init.seed;
                    // An empty call whose answer is the first real input
                    outgoing = message(None);
                    continue;
                }
                let Some(rl_input) = input.rl_input else {
                    return log;
                };
                if log.time_scale.is_none() {
                    log.time_scale = time_scale(&rl_input.side_channel);
                }

                let announce = (!announced).then_some(&scene);
                announced = true;
                outgoing = if rl_input.command == CommandProto::Reset as i32 {
                    log.resets += 1;
                    t = 0;
                    steps(vec![agent(0, 0.0, false, false)], announce)
                } else {
                    let action = rl_input.agent_actions[BEHAVIOR].value[0].discrete_actions[0];
                    log.actions.push(action);
                    t += 1;
                    if t >= episode_length {
                        t = 0;
                        // The agent starts its next episode right away
                        steps(
                            vec![
                                agent(episode_length, action as f32, true, interrupt),
                                agent(0, 0.0, false, false),
                            ],
                            announce,
                        )
                    } else {
                        steps(vec![agent(t, action as f32, false, false)], announce)
                    }
                };
            }
        })
    })
}
