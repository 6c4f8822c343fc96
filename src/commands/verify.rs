use clap::Args;
use std::path::PathBuf;

use hubctl::backup::metadata::{self, Verification};
use hubctl::ErrorCode;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct VerifyArgs {
    /// Backup artifact to check against its .meta sidecar
    #[arg(long)]
    file: PathBuf,
}

pub fn run(args: VerifyArgs, _global: &GlobalArgs) -> CmdResult<Verification> {
    let path = PathBuf::from(shellexpand::tilde(&args.file.to_string_lossy()).to_string());
    let verification = metadata::verify(&path)?;
    let exit_code = if verification.valid {
        0
    } else {
        ErrorCode::PreconditionFailed.exit_code()
    };
    Ok((verification, exit_code))
}
