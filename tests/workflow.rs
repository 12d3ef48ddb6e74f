mod common;

use std::{fs, path::Path};

use common::*;
use drive_gym::{
    callbacks::read_evaluations,
    cli::{RunAction, RunConfig},
    env::EnvError,
    error::RunError,
    metrics::PROGRESS_FILE,
    naming::RunArtifactNames,
    policy::{Algorithm, Hyperparameters, Policy, PolicyError},
    workflow::{self, build_policy, RunSummary, EVAL_ITERATIONS},
};
use tempfile::{tempdir, TempDir};

fn config(action: RunAction, algorithm: Algorithm, dir: &TempDir) -> RunConfig {
    RunConfig {
        log_dir: dir.path().join("logs"),
        tensorboard_log: dir.path().join("tensorboard"),
        ..RunConfig::new(action, algorithm)
    }
}

fn save_policy(algorithm: Algorithm, path: &Path) {
    let counters = Counters::default();
    Policy::new(algorithm, &ScriptedEnv::new(Some(20), &counters), &Hyperparameters::default())
        .save(path)
        .unwrap();
}

fn checkpoints(log_dir: &Path) -> Vec<String> {
    fs::read_dir(log_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with("_steps"))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn missing_model_fails_before_connecting() {
    let dir = tempdir().unwrap();
    for action in [RunAction::ContinueTrain, RunAction::Evaluate] {
        let counters = Counters::default();
        let result = workflow::run(
            &config(action, Algorithm::PPO, &dir),
            |_| Ok(ScriptedEnv::new(None, &counters)),
            &fixed_clock(),
        );

        assert!(matches!(result, Err(RunError::MissingPrecondition(_))));
        assert_eq!(counters.created.get(), 0);
    }
}

#[test]
fn zero_time_scale_fails_before_connecting() {
    let dir = tempdir().unwrap();
    let mut config = config(RunAction::Train, Algorithm::PPO, &dir);
    config.simulator.time_scale = 0.0;
    let counters = Counters::default();

    let result = workflow::run(&config, |_| Ok(ScriptedEnv::new(None, &counters)), &fixed_clock());

    assert!(matches!(result, Err(RunError::InvalidArgument(_))));
    assert_eq!(counters.created.get(), 0);
}

#[test]
fn failed_connection_is_reported() {
    let dir = tempdir().unwrap();
    let result = workflow::run::<ScriptedEnv, _>(
        &config(RunAction::Train, Algorithm::A2C, &dir),
        |_| Err(EnvError::VersionMismatch {
            trainer: "1.5.0".into(),
            simulator: "0.9.0".into(),
        }),
        &fixed_clock(),
    );

    assert!(matches!(
        result,
        Err(RunError::EnvironmentConnection(EnvError::VersionMismatch { .. }))
    ));
}

#[test]
fn training_ppo_for_1000_steps_evaluates_once_and_never_checkpoints() {
    let dir = tempdir().unwrap();
    let config = RunConfig {
        step_budget: 1000,
        ..config(RunAction::Train, Algorithm::PPO, &dir)
    };
    let counters = Counters::default();

    let summary = workflow::run(&config, |_| Ok(ScriptedEnv::new(Some(20), &counters)), &fixed_clock()).unwrap();

    let RunSummary::Trained { names, num_timesteps } = summary else {
        panic!("expected a training summary");
    };
    assert_eq!(num_timesteps, 1000);
    assert_eq!(names, RunArtifactNames::new(Algorithm::PPO, &fixed_clock(), &config.log_dir));
    assert_eq!(names.run_name, "PPO-MlpPolicy-08-05-2023-16-51-19");

    let evaluations = read_evaluations(&names.best_model_dir).unwrap();
    assert_eq!(evaluations.timesteps, vec![1000]);
    assert_eq!(evaluations.results[0].len(), 5);
    assert_eq!(evaluations.ep_lengths[0], vec![20; 5]);
    assert!(names.best_model_dir.join("best_model").join("policy.json").exists());
    assert!(checkpoints(&config.log_dir).is_empty());

    let progress = config.tensorboard_log.join(format!("{}_1", names.run_name)).join(PROGRESS_FILE);
    assert!(progress.exists());

    assert_eq!(counters.created.get(), 1);
    assert_eq!(counters.closes.get(), 1);
}

#[test]
fn checkpoints_land_every_2000_steps() {
    let dir = tempdir().unwrap();
    let config = RunConfig {
        step_budget: 4000,
        hyperparameters: Hyperparameters {
            a2c: drive_gym::algo::a2c::A2CAgentConfig {
                n_steps: 64,
                ..Default::default()
            },
            ..Default::default()
        },
        ..config(RunAction::Train, Algorithm::A2C, &dir)
    };
    let counters = Counters::default();

    let summary = workflow::run(&config, |_| Ok(ScriptedEnv::new(Some(50), &counters)), &fixed_clock()).unwrap();

    let RunSummary::Trained { names, .. } = summary else {
        panic!("expected a training summary");
    };
    let mut saved = checkpoints(&config.log_dir);
    saved.sort();
    assert_eq!(
        saved,
        vec![
            format!("{}_2000_steps", names.checkpoint_prefix),
            format!("{}_4000_steps", names.checkpoint_prefix),
        ]
    );
    assert_eq!(read_evaluations(&names.best_model_dir).unwrap().timesteps, vec![1000, 2000, 3000, 4000]);
    assert_eq!(counters.closes.get(), 1);
}

#[test]
fn evaluating_dqn_stops_at_the_first_done() {
    let dir = tempdir().unwrap();
    let model = dir.path().join("dqn_model");
    save_policy(Algorithm::DQN, &model);
    let config = RunConfig {
        model_path: Some(model),
        ..config(RunAction::Evaluate, Algorithm::DQN, &dir)
    };
    let counters = Counters::default();

    let summary = workflow::run(&config, |_| Ok(ScriptedEnv::new(Some(25), &counters)), &fixed_clock()).unwrap();

    let RunSummary::Evaluated(evaluation) = summary else {
        panic!("expected an evaluation summary");
    };
    assert!(evaluation.finished);
    assert_eq!(evaluation.steps, 25);
    assert_eq!(counters.steps.get(), 25);
    // Only the reset that ends the rollout
    assert_eq!(counters.resets.get(), 1);
    assert_eq!(counters.closes.get(), 1);
}

#[test]
fn evaluation_gives_up_after_the_iteration_limit() {
    let dir = tempdir().unwrap();
    let model = dir.path().join("dqn_model");
    save_policy(Algorithm::DQN, &model);
    let config = RunConfig {
        model_path: Some(model),
        ..config(RunAction::Evaluate, Algorithm::DQN, &dir)
    };
    let counters = Counters::default();

    let summary = workflow::run(&config, |_| Ok(ScriptedEnv::new(None, &counters)), &fixed_clock()).unwrap();

    let RunSummary::Evaluated(evaluation) = summary else {
        panic!("expected an evaluation summary");
    };
    assert!(!evaluation.finished);
    assert_eq!(evaluation.steps, EVAL_ITERATIONS + 1);
    assert_eq!(counters.resets.get(), 0);
    assert_eq!(counters.closes.get(), 1);
}

#[test]
fn evaluation_loads_without_binding_the_environment() {
    let dir = tempdir().unwrap();
    let model = dir.path().join("dqn_model");
    save_policy(Algorithm::DQN, &model);
    let counters = Counters::default();
    let env = ScriptedEnv::new(None, &counters);

    let evaluate = RunConfig {
        model_path: Some(model.clone()),
        ..config(RunAction::Evaluate, Algorithm::DQN, &dir)
    };
    assert!(!build_policy(&evaluate, &env).unwrap().has_env());

    let resume = RunConfig {
        model_path: Some(model),
        ..config(RunAction::ContinueTrain, Algorithm::DQN, &dir)
    };
    assert!(build_policy(&resume, &env).unwrap().has_env());
}

#[test]
fn continuing_from_a_missing_model_closes_the_environment() {
    let dir = tempdir().unwrap();
    let config = RunConfig {
        model_path: Some(dir.path().join("does_not_exist")),
        ..config(RunAction::ContinueTrain, Algorithm::PPO, &dir)
    };
    let counters = Counters::default();

    let result = workflow::run(&config, |_| Ok(ScriptedEnv::new(Some(20), &counters)), &fixed_clock());

    assert!(matches!(result, Err(RunError::ModelLoad(PolicyError::NotFound(_)))));
    assert_eq!(counters.created.get(), 1);
    assert_eq!(counters.closes.get(), 1);
}

#[test]
fn loading_another_algorithm_is_a_model_load_error() {
    let dir = tempdir().unwrap();
    let model = dir.path().join("ppo_model");
    save_policy(Algorithm::PPO, &model);
    let config = RunConfig {
        model_path: Some(model),
        ..config(RunAction::Evaluate, Algorithm::A2C, &dir)
    };
    let counters = Counters::default();

    let result = workflow::run(&config, |_| Ok(ScriptedEnv::new(Some(20), &counters)), &fixed_clock());

    assert!(matches!(
        result,
        Err(RunError::ModelLoad(PolicyError::AlgorithmMismatch { .. }))
    ));
    assert_eq!(counters.closes.get(), 1);
}

#[test]
fn continued_training_names_checkpoints_by_this_run_steps() {
    let dir = tempdir().unwrap();
    let model = dir.path().join("a2c_model");
    let counters = Counters::default();
    let mut env = ScriptedEnv::new(Some(30), &counters);
    let mut policy = Policy::new(Algorithm::A2C, &env, &Hyperparameters::default());
    policy.learn(500, &mut env, &mut [], "A2C").unwrap();
    policy.save(&model).unwrap();

    let config = RunConfig {
        model_path: Some(model),
        step_budget: 2000,
        ..config(RunAction::ContinueTrain, Algorithm::A2C, &dir)
    };
    let counters = Counters::default();

    let summary = workflow::run(&config, |_| Ok(ScriptedEnv::new(Some(30), &counters)), &fixed_clock()).unwrap();

    let RunSummary::Trained { names, num_timesteps } = summary else {
        panic!("expected a training summary");
    };
    assert_eq!(num_timesteps, 2000);
    assert_eq!(
        checkpoints(&config.log_dir),
        vec![format!("{}_2000_steps", names.checkpoint_prefix)]
    );
    assert_eq!(read_evaluations(&names.best_model_dir).unwrap().timesteps, vec![1000, 2000]);

    // The saved lifetime total still includes the earlier run
    let checkpoint = config.log_dir.join(format!("{}_2000_steps", names.checkpoint_prefix));
    let resumed = Policy::<ScriptedEnv>::load(&checkpoint, Algorithm::A2C).unwrap();
    assert_eq!(resumed.num_timesteps(), 2500);
    assert_eq!(counters.created.get(), 1);
    assert_eq!(counters.closes.get(), 1);
}
