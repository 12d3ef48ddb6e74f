//! Building a [`SimEnv`] from run settings

use std::path::PathBuf;

use tracing::info;

use super::{grpc_server, gym::SimEnv};
use crate::env::EnvError;

/// Port the editor connects to
pub const EDITOR_PORT: u16 = 5004;
/// First port used for launched executables, offset by the worker id
pub const DEFAULT_BASE_PORT: u16 = 5005;

/// How to reach the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Simulator build to launch; `None` waits for an editor instance
    pub executable: Option<PathBuf>,
    pub time_scale: f32,
    pub base_port: u16,
    pub worker_id: u16,
    pub seed: i32,
    pub no_graphics: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            executable: None,
            time_scale: 1.0,
            base_port: DEFAULT_BASE_PORT,
            worker_id: 0,
            seed: 0,
            no_graphics: false,
        }
    }
}

impl SimulatorConfig {
    /// Port to listen on: the editor port when attaching, `base_port + worker_id` otherwise
    pub fn port(&self) -> u16 {
        match self.executable {
            None => EDITOR_PORT,
            Some(_) => self.base_port.saturating_add(self.worker_id),
        }
    }
}

/// Connect to the simulator, launching it first when an executable is configured
///
/// Blocks until the simulator connects; there is no timeout.
pub fn make_env(config: &SimulatorConfig) -> Result<SimEnv, EnvError> {
    if config.time_scale.is_nan() || config.time_scale <= 0.0 {
        return Err(EnvError::InvalidTimeScale(config.time_scale));
    }

    let port = config.port();
    let listener = grpc_server::bind(port)?;

    let child = match &config.executable {
        Some(executable) => Some(grpc_server::launch(executable, port, config.no_graphics)?),
        None => {
            info!(port, "press play in the editor to connect");
            None
        }
    };

    SimEnv::connect(listener, child, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editor_uses_the_fixed_port() {
        let config = SimulatorConfig {
            worker_id: 3,
            ..Default::default()
        };
        assert_eq!(config.port(), EDITOR_PORT);
    }

    #[test]
    fn executable_port_is_offset_by_worker_id() {
        let config = SimulatorConfig {
            executable: Some("build/Car.x86_64".into()),
            worker_id: 2,
            ..Default::default()
        };
        assert_eq!(config.port(), 5007);
    }

    #[test]
    fn zero_time_scale_fails_before_listening() {
        let config = SimulatorConfig {
            time_scale: 0.0,
            ..Default::default()
        };
        assert!(matches!(make_env(&config), Err(EnvError::InvalidTimeScale(_))));
    }
}
