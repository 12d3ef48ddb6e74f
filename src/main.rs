use anyhow::{Context, Result};
use clap::Parser;
use drive_gym::{
    cli::{Args, RunConfig},
    naming::SystemClock,
    sim,
    workflow::{self, RunSummary},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::from_args(Args::parse()).context("invalid arguments")?;
    let summary = workflow::run(&config, sim::make_env, &SystemClock)
        .with_context(|| format!("{} run with {} failed", config.action, config.algorithm))?;

    if let RunSummary::Trained { names, num_timesteps } = summary {
        info!(run = %names.run_name, num_timesteps, "done");
    }
    Ok(())
}
