//! Train and evaluate driving policies against an external simulator
//!
//! The binary parses a [`cli::RunConfig`] and hands it to [`workflow::run`] together with
//! [`sim::make_env`]. Everything below the workflow is usable on its own: the simulator
//! bridge in [`sim`], the agents in [`algo`] and the algorithm-tagged [`policy::Policy`].

pub mod algo;
pub mod callbacks;
pub mod cli;
pub mod decay;
pub mod env;
pub mod error;
pub mod exploration;
pub mod memory;
pub mod metrics;
pub mod naming;
pub mod nn;
pub mod policy;
pub mod sim;
pub mod traits;
pub mod workflow;
