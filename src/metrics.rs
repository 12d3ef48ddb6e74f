//! JSON-lines training log
//!
//! Each run gets its own `{root}/{name}_{n}` directory, `n` counting up from 1 so that
//! reruns under the same name never overwrite each other. Every line of
//! `progress.jsonl` is one event: an update with its [`TrainingMetrics`], or a finished
//! episode.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{env::EpisodeSummary, traits::TrainingMetrics};

pub const PROGRESS_FILE: &str = "progress.jsonl";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to write training log {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to encode training log entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Entry<'a> {
    Update {
        timesteps: usize,
        #[serde(flatten)]
        metrics: &'a TrainingMetrics,
    },
    Episode {
        timesteps: usize,
        reward: f64,
        length: usize,
    },
}

pub struct MetricsLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsLog {
    /// Open a fresh log directory under `root`
    pub fn create(root: &Path, name: &str) -> Result<Self, MetricsError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| MetricsError::Io { path, source }
        };

        fs::create_dir_all(root).map_err(io_error(root))?;
        let dir = next_run_dir(root, name);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let path = dir.join(PROGRESS_FILE);
        let file = File::create(&path).map_err(io_error(&path))?;
        info!(path = %path.display(), "logging training metrics");

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_update(&mut self, timesteps: usize, metrics: &TrainingMetrics) -> Result<(), MetricsError> {
        self.write(&Entry::Update { timesteps, metrics })
    }

    pub fn record_episode(&mut self, timesteps: usize, episode: &EpisodeSummary) -> Result<(), MetricsError> {
        self.write(&Entry::Episode {
            timesteps,
            reward: episode.reward,
            length: episode.length,
        })
    }

    fn write(&mut self, entry: &Entry<'_>) -> Result<(), MetricsError> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer
            .write_all(b"\n")
            .and_then(|_| self.writer.flush())
            .map_err(|source| MetricsError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

fn next_run_dir(root: &Path, name: &str) -> PathBuf {
    (1..)
        .map(|n| root.join(format!("{name}_{n}")))
        .find(|dir| !dir.exists())
        .unwrap_or_else(|| root.join(name))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn writes_one_line_per_event() {
        let dir = tempdir().unwrap();
        let mut log = MetricsLog::create(dir.path(), "PPO-MlpPolicy-run").unwrap();

        let metrics = TrainingMetrics {
            policy_loss: 0.5,
            n_updates: 3,
            ..Default::default()
        };
        log.record_update(2048, &metrics).unwrap();
        log.record_episode(2050, &EpisodeSummary { reward: 1.5, length: 12 }).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "update");
        assert_eq!(lines[0]["timesteps"], 2048);
        assert_eq!(lines[0]["n_updates"], 3);
        assert_eq!(lines[1]["event"], "episode");
        assert_eq!(lines[1]["length"], 12);
    }

    #[test]
    fn reruns_get_numbered_directories() {
        let dir = tempdir().unwrap();
        let first = MetricsLog::create(dir.path(), "run").unwrap();
        let second = MetricsLog::create(dir.path(), "run").unwrap();

        assert_eq!(first.path(), dir.path().join("run_1").join(PROGRESS_FILE));
        assert_eq!(second.path(), dir.path().join("run_2").join(PROGRESS_FILE));
    }
}
