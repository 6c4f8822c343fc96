use clap::Args;
use serde::Serialize;

use hubctl::deploy::{lock, DeploymentRun, LockHolder, RunStore};
use hubctl::environment::Environment;
use hubctl::paths;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct StatusArgs {
    /// Environment to inspect
    #[arg(long, value_parser = super::parse_environment)]
    env: Environment,

    /// Show this run record instead of the most recent one
    #[arg(long = "run", value_name = "RUN_ID")]
    run_id: Option<String>,
}

#[derive(Serialize)]
pub struct StatusOutput {
    environment: String,
    locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_holder: Option<LockHolder>,
    /// The requested run, or the most recent one.
    #[serde(skip_serializing_if = "Option::is_none")]
    last_run: Option<DeploymentRun>,
}

pub fn run(args: StatusArgs, _global: &GlobalArgs) -> CmdResult<StatusOutput> {
    let env = args.env.as_str();
    let locks_dir = paths::locks()?;
    let locked = lock::is_locked(&locks_dir, env);
    let lock_holder = lock::read_holder(&locks_dir, env)?;
    let store = RunStore::new(paths::runs(env)?);
    let last_run = match &args.run_id {
        Some(run_id) => Some(store.load(run_id)?),
        None => store.latest()?,
    };

    Ok((
        StatusOutput {
            environment: env.to_string(),
            locked,
            lock_holder,
            last_run,
        },
        0,
    ))
}
