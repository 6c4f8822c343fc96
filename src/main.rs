use clap::{Parser, Subcommand};

mod commands;
mod output;
mod tty;

use commands::{backup, backups, deploy, restore, status, test, verify};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "hubctl")]
#[command(version = VERSION)]
#[command(about = "Backup, test and deployment pipeline for the learning platform")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump an environment's database to a checksummed artifact
    Backup(backup::BackupArgs),
    /// Overwrite an environment's database from an artifact
    Restore(restore::RestoreArgs),
    /// Run the test suites
    Test(test::TestArgs),
    /// Test, back up, build, apply, migrate and health-check a version
    Deploy(deploy::DeployArgs),
    /// Revert an environment to a previously published version
    Rollback(deploy::RollbackArgs),
    /// List backup artifacts for an environment
    Backups(backups::BackupsArgs),
    /// Check an artifact against its metadata sidecar
    Verify(verify::VerifyArgs),
    /// Show the environment lock and the last deployment run
    Status(status::StatusArgs),
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Backup(_) => "backup",
            Commands::Restore(_) => "restore",
            Commands::Test(_) => "test",
            Commands::Deploy(_) => "deploy",
            Commands::Rollback(_) => "rollback",
            Commands::Backups(_) => "backups",
            Commands::Verify(_) => "verify",
            Commands::Status(_) => "status",
        }
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    hubctl::interrupt::install_handler();

    let command = cli.command.name();
    let (json_result, exit_code) = commands::run_json(cli.command);
    if let Err(err) = output::print_json_result(command, json_result, exit_code) {
        eprintln!("{}", err);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
