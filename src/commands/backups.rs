use clap::Args;
use serde::Serialize;

use hubctl::backup::{self, ListedArtifact};
use hubctl::environment::Environment;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct BackupsArgs {
    /// Environment whose artifacts are listed
    #[arg(long, value_parser = super::parse_environment)]
    env: Environment,
}

#[derive(Serialize)]
pub struct BackupsOutput {
    environment: String,
    directory: String,
    artifacts: Vec<ListedArtifact>,
}

pub fn run(args: BackupsArgs, global: &GlobalArgs) -> CmdResult<BackupsOutput> {
    let directory = global.config.backup.resolve_directory()?;
    let artifacts = backup::list_artifacts(&directory, args.env.as_str())?;
    Ok((
        BackupsOutput {
            environment: args.env.to_string(),
            directory: directory.display().to_string(),
            artifacts,
        },
        0,
    ))
}
