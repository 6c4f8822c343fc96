use serde::Serialize;
use std::path::Path;

use super::codec;
use super::metadata::{self, BackupMetadata};
use super::naming::Pipeline;
use super::postgres::RestorePlan;
use super::{BackupEngine, BackupMode};
use crate::environment::EnvironmentProfile;
use crate::error::{Error, Result};
use crate::interrupt;
use crate::utils::command;

/// How a destructive restore is authorized.
pub enum Confirm<'a> {
    /// `--force`, or a rollback driven by the deployment controller.
    Forced,
    /// Ask the operator; `Ok(true)` only for an explicit yes.
    Ask(&'a dyn Fn(&str) -> Result<bool>),
    /// No way to ask (non-interactive); always a refusal.
    Deny,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub path: String,
    pub environment: String,
    pub database: String,
    pub pipeline: Pipeline,
    pub metadata_present: bool,
    pub checksum_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<BackupMode>,
    pub reset_schema: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Only a full, unfiltered dump describes the whole schema; anything narrower
/// replays over what is there and relies on the dump's own `DROP ... IF EXISTS`.
pub fn restore_plan(meta: Option<&BackupMetadata>) -> Result<(Option<BackupMode>, RestorePlan)> {
    let Some(meta) = meta else {
        return Ok((None, RestorePlan::default()));
    };
    let mode = meta.mode().ok_or_else(|| {
        Error::precondition(format!(
            "Unknown backup_type '{}' in metadata sidecar",
            meta.backup_type
        ))
        .with_context("backup_type", &meta.backup_type)
    })?;
    let reset_schema =
        mode == BackupMode::Full && meta.table_list().is_empty() && meta.excluded_list().is_empty();
    Ok((Some(mode), RestorePlan { reset_schema }))
}

impl BackupEngine<'_> {
    /// Replace the target database contents with an artifact.
    ///
    /// Nothing touches the database until the file, its pipeline, the tooling
    /// and the confirmation have all checked out.
    pub fn restore(
        &self,
        profile: &EnvironmentProfile,
        path: &Path,
        confirm: Confirm<'_>,
    ) -> Result<RestoreReport> {
        if !path.is_file() {
            return Err(Error::backup_file_not_found(path.display().to_string()));
        }

        let pipeline = Pipeline::from_path(path);
        let meta = metadata::read(path)?;
        let mut warnings = Vec::new();
        let mut checksum_verified = false;

        if let Some(meta) = &meta {
            if meta.pipeline() != pipeline {
                return Err(Error::precondition(format!(
                    "{} suffixes imply compressed={} encrypted={}, but its metadata records compressed={} encrypted={}",
                    path.display(),
                    pipeline.compressed,
                    pipeline.encrypted,
                    meta.compressed,
                    meta.encrypted
                ))
                .with_context("inferred", pipeline)
                .with_context("recorded", meta.pipeline()));
            }
            let actual = metadata::sha256_file(path)?;
            if actual != meta.checksum {
                return Err(Error::precondition(format!(
                    "Checksum mismatch for {}: artifact is corrupt or was modified",
                    path.display()
                ))
                .with_context("expected", &meta.checksum)
                .with_context("actual", actual));
            }
            checksum_verified = true;
            if meta.database_name != profile.database.name {
                warnings.push(format!(
                    "Artifact was taken from database '{}', restoring into '{}'",
                    meta.database_name, profile.database.name
                ));
            }
        } else {
            warnings.push("No metadata sidecar; pipeline inferred from file name only".to_string());
        }
        let (mode, plan) = restore_plan(meta.as_ref())?;

        let mut tools = self.db.restore_tools();
        if pipeline.encrypted {
            tools.push("gpg");
        }
        command::require_tools(&tools)?;

        let target = &profile.database;
        let approved = match confirm {
            Confirm::Forced => true,
            Confirm::Ask(ask) => ask(&format!(
                "This will overwrite database '{}' on {}:{} ({}). Type 'yes' to continue: ",
                target.name, target.host, target.port, profile.environment
            ))?,
            Confirm::Deny => false,
        };
        if !approved {
            return Err(Error::confirmation_denied(&target.name));
        }

        self.db.check_connection(target)?;
        interrupt::check("restore")?;

        log_status!("restore", "Restoring {} into {}", path.display(), target.name);
        let mut payload = codec::open_decoded(
            path,
            pipeline,
            self.settings.passphrase.as_deref(),
            self.settings.encrypt_timeout_secs,
        )?;
        self.db.restore(target, &plan, &mut payload)?;

        Ok(RestoreReport {
            path: path.display().to_string(),
            environment: profile.environment.to_string(),
            database: target.name.clone(),
            pipeline,
            metadata_present: meta.is_some(),
            checksum_verified,
            mode,
            reset_schema: plan.reset_schema,
            warnings,
        })
    }
}
