use clap::Args;
use std::path::PathBuf;

use hubctl::backup::{Confirm, RestoreReport};
use hubctl::environment::Environment;

use super::{BackupTooling, CmdResult, GlobalArgs};
use crate::tty;

#[derive(Args)]
pub struct RestoreArgs {
    /// Environment whose database is overwritten
    #[arg(long, value_parser = super::parse_environment)]
    env: Environment,

    /// Backup artifact to restore (.sql, .sql.gz, .sql.gpg, .sql.gz.gpg)
    #[arg(long)]
    file: PathBuf,

    /// Skip the confirmation prompt
    #[arg(long)]
    force: bool,
}

pub fn run(args: RestoreArgs, global: &GlobalArgs) -> CmdResult<RestoreReport> {
    let profile = super::resolve_profile(args.env, global)?;
    let tooling = BackupTooling::from_config(&global.config)?;
    let path = PathBuf::from(shellexpand::tilde(&args.file.to_string_lossy()).to_string());

    let ask = |message: &str| tty::confirm_yes(message);
    let confirm = if args.force {
        Confirm::Forced
    } else if tty::is_stdin_tty() {
        Confirm::Ask(&ask)
    } else {
        Confirm::Deny
    };

    let report = tooling.engine().restore(&profile, &path, confirm)?;
    Ok((report, 0))
}
