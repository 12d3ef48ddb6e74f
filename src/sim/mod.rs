//! Bridge to the external driving simulator
//!
//! The simulator is an ML-Agents client that calls the trainer's `UnityToExternalProto`
//! gRPC service with a batched multi-agent view of the scene. This module hosts that
//! service and adapts it to a single-agent [`Environment`](crate::env::Environment).

pub mod factory;
pub mod grpc_server;
pub mod gym;
pub mod messages;
pub mod side_channel;

pub mod communicator_objects {
    tonic::include_proto!("communicator_objects");
}

pub use factory::{make_env, SimulatorConfig};
pub use gym::SimEnv;
