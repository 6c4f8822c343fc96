//! PostgreSQL client tooling (`pg_isready`, `pg_dump`, `psql`).

use serde::Serialize;
use std::io::{Read, Write};

use super::BackupMode;
use crate::config::TimeoutsConfig;
use crate::environment::DatabaseTarget;
use crate::error::{Error, ErrorCode, Result};
use crate::utils::command::{self, ProcessSpec};

/// What a dump should contain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DumpPlan {
    pub mode: BackupMode,
    pub tables: Vec<String>,
    pub exclude: Vec<String>,
    /// Emit `DROP ... IF EXISTS` ahead of each object so the dump replays over
    /// an existing copy. Ignored for data-only dumps.
    pub clean: bool,
}

/// How a replay treats what is already in the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    /// Drop and recreate the `public` schema before replaying, so objects
    /// created after the dump (a migration's new tables) go too.
    pub reset_schema: bool,
}

/// Database client operations the backup engine depends on.
pub trait DatabaseTool {
    /// External binaries a backup needs on PATH before any work starts.
    fn backup_tools(&self) -> Vec<&'static str>;

    fn restore_tools(&self) -> Vec<&'static str>;

    fn check_connection(&self, target: &DatabaseTarget) -> Result<()>;

    /// Write a plain SQL dump of `target` into `sink`.
    fn dump(&self, target: &DatabaseTarget, plan: &DumpPlan, sink: &mut dyn Write) -> Result<()>;

    /// Replay plain SQL from `source` into `target` as one transaction,
    /// stopping on the first error.
    fn restore(&self, target: &DatabaseTarget, plan: &RestorePlan, source: &mut dyn Read) -> Result<()>;
}

/// `DatabaseTool` backed by the PostgreSQL client binaries.
#[derive(Debug, Clone)]
pub struct PgTools {
    pub connect_timeout_secs: u64,
    pub dump_timeout_secs: u64,
    pub restore_timeout_secs: u64,
}

impl PgTools {
    pub fn from_timeouts(timeouts: &TimeoutsConfig) -> Self {
        Self {
            connect_timeout_secs: timeouts.connect_secs,
            dump_timeout_secs: timeouts.dump_secs,
            restore_timeout_secs: timeouts.restore_secs,
        }
    }
}

fn with_connection(spec: ProcessSpec, target: &DatabaseTarget) -> ProcessSpec {
    let spec = spec
        .arg("-h")
        .arg(&target.host)
        .arg("-p")
        .arg(target.port.to_string())
        .arg("-U")
        .arg(&target.user);
    match &target.password {
        Some(password) => spec.env("PGPASSWORD", password),
        None => spec,
    }
}

pub fn dump_args(target: &DatabaseTarget, plan: &DumpPlan) -> Vec<String> {
    let mut args = vec![
        "-d".to_string(),
        target.name.clone(),
        "--no-password".to_string(),
        "--format=plain".to_string(),
        "--no-owner".to_string(),
        "--no-privileges".to_string(),
    ];
    match plan.mode {
        BackupMode::Full => {}
        BackupMode::SchemaOnly => args.push("--schema-only".to_string()),
        BackupMode::DataOnly => args.push("--data-only".to_string()),
    }
    // pg_dump rejects --clean together with --data-only.
    if plan.clean && plan.mode != BackupMode::DataOnly {
        args.push("--clean".to_string());
        args.push("--if-exists".to_string());
    }
    for table in &plan.tables {
        args.push(format!("--table={}", table));
    }
    for table in &plan.exclude {
        args.push(format!("--exclude-table={}", table));
    }
    args
}

const RESET_SCHEMA_SQL: &str = "DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;";

pub fn restore_args(target: &DatabaseTarget, plan: &RestorePlan) -> Vec<String> {
    let mut args = vec![
        "-d".to_string(),
        target.name.clone(),
        "--no-password".to_string(),
        "--quiet".to_string(),
        "--single-transaction".to_string(),
        "-v".to_string(),
        "ON_ERROR_STOP=1".to_string(),
    ];
    if plan.reset_schema {
        args.push("-c".to_string());
        args.push(RESET_SCHEMA_SQL.to_string());
    }
    args.push("-f".to_string());
    args.push("-".to_string());
    args
}

impl DatabaseTool for PgTools {
    fn backup_tools(&self) -> Vec<&'static str> {
        vec!["pg_dump", "pg_isready"]
    }

    fn restore_tools(&self) -> Vec<&'static str> {
        vec!["psql", "pg_isready"]
    }

    fn check_connection(&self, target: &DatabaseTarget) -> Result<()> {
        let spec = with_connection(ProcessSpec::new("pg_isready"), target)
            .arg("-d")
            .arg(&target.name)
            .arg("-t")
            .arg(self.connect_timeout_secs.max(1).to_string())
            .timeout_secs(self.connect_timeout_secs.saturating_add(5));

        let output = command::execute(&spec)?;
        if !output.success {
            return Err(Error::connection_failed(
                &target.host,
                target.port,
                &target.name,
                output.error_text(),
            ));
        }
        Ok(())
    }

    fn dump(&self, target: &DatabaseTarget, plan: &DumpPlan, sink: &mut dyn Write) -> Result<()> {
        let spec = with_connection(ProcessSpec::new("pg_dump"), target)
            .args(dump_args(target, plan))
            .timeout_secs(self.dump_timeout_secs);

        log_status!("backup", "Dumping {} ({})", target.name, plan.mode.meta_label());
        let output = command::execute_to_writer(&spec, sink)?;
        if !output.success {
            return Err(Error::backup_failed(format!(
                "pg_dump exited with {}",
                output.exit_code
            ))
            .with_context("command", output.failure_details(&spec)));
        }
        Ok(())
    }

    fn restore(&self, target: &DatabaseTarget, plan: &RestorePlan, source: &mut dyn Read) -> Result<()> {
        let spec = with_connection(ProcessSpec::new("psql"), target)
            .args(restore_args(target, plan))
            .timeout_secs(self.restore_timeout_secs);

        if plan.reset_schema {
            log_status!("restore", "Resetting schema public in {}", target.name);
        }
        log_status!("restore", "Replaying SQL into {}", target.name);
        let output = command::execute_with_stdin(&spec, source)?;
        if !output.success {
            return Err(Error::restore_failed(output.failure_details(&spec)));
        }
        Ok(())
    }
}

/// Map a lower-level dump error into the backup failure class, keeping interrupts
/// and missing tooling distinct.
pub fn as_backup_failure(err: Error) -> Error {
    match err.code {
        ErrorCode::BackupFailed | ErrorCode::ProcessInterrupted | ErrorCode::ToolingUnavailable => err,
        _ => {
            let message = format!("Backup failed: {}", err.message);
            err.reclassify(ErrorCode::BackupFailed, message)
        }
    }
}
