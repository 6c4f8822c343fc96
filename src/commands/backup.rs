use clap::Args;
use std::path::PathBuf;

use hubctl::backup::storage;
use hubctl::backup::{BackupMode, BackupOptions, BackupReport};
use hubctl::environment::Environment;

use super::{BackupTooling, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct BackupArgs {
    /// Environment to back up (development, staging, production)
    #[arg(long, value_parser = super::parse_environment)]
    env: Environment,

    /// Write the artifact here instead of the backup directory
    #[arg(long)]
    output: Option<PathBuf>,

    /// Gzip the dump
    #[arg(long)]
    compress: bool,

    /// Encrypt the dump with gpg (passphrase from BACKUP_ENCRYPTION_KEY)
    #[arg(long)]
    encrypt: bool,

    /// Also upload to this S3 bucket (defaults to BACKUP_S3_BUCKET or config)
    #[arg(long)]
    s3_bucket: Option<String>,

    /// Delete artifacts older than this many days (0 keeps everything)
    #[arg(long, value_name = "DAYS")]
    retention: Option<u32>,

    /// Only dump these tables
    #[arg(long, value_delimiter = ',')]
    tables: Vec<String>,

    /// Dump everything except these tables
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Schema only, no data
    #[arg(long, conflicts_with = "data_only")]
    schema_only: bool,

    /// Data only, no schema
    #[arg(long)]
    data_only: bool,
}

pub fn run(args: BackupArgs, global: &GlobalArgs) -> CmdResult<BackupReport> {
    let profile = super::resolve_profile(args.env, global)?;
    let tooling = BackupTooling::from_config(&global.config)?;

    let mode = if args.schema_only {
        BackupMode::SchemaOnly
    } else if args.data_only {
        BackupMode::DataOnly
    } else {
        BackupMode::Full
    };
    let options = BackupOptions {
        mode,
        compress: args.compress,
        encrypt: args.encrypt,
        tables: args.tables,
        exclude: args.exclude,
        retention_days: args.retention,
        remote_bucket: storage::resolve_bucket(
            args.s3_bucket.as_deref(),
            global.config.backup.s3_bucket.as_deref(),
        ),
        output: args.output,
    };

    let report = tooling.engine().backup(&profile, &options)?;
    Ok((report, 0))
}
