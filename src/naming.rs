//! Run names derived from the algorithm and the wall clock

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};

use crate::policy::{Algorithm, POLICY_TAG};

/// Day first, second precision
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y-%H-%M-%S";

/// Source of the current time
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// The local wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A frozen clock
impl Clock for NaiveDateTime {
    fn now(&self) -> NaiveDateTime {
        *self
    }
}

/// Where a training run writes its artifacts
///
/// Two runs of the same algorithm started within the same second get the same names and
/// write into the same directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifactNames {
    /// `{algorithm}-MlpPolicy-{timestamp}`, also the name of the metrics log
    pub run_name: String,
    /// `{log_dir}/{run_name}_best`
    pub best_model_dir: PathBuf,
    /// `{run_name}checkpoint`, checkpoints land in `{log_dir}/{checkpoint_prefix}_{steps}_steps`
    pub checkpoint_prefix: String,
}

impl RunArtifactNames {
    pub fn new(algorithm: Algorithm, clock: &dyn Clock, log_dir: &Path) -> Self {
        let timestamp = clock.now().format(TIMESTAMP_FORMAT);
        let run_name = format!("{algorithm}-{POLICY_TAG}-{timestamp}");

        Self {
            best_model_dir: log_dir.join(format!("{run_name}_best")),
            checkpoint_prefix: format!("{run_name}checkpoint"),
            run_name,
        }
    }
}
