//! The deployment state machine.

use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use super::health::{self, HealthProbe, RetryPolicy};
use super::lock::{EnvironmentLock, LockHolder};
use super::notify::Notifier;
use super::platform::Platform;
use super::run::{DeploymentRun, RollbackRecord, RunFlags, RunMode, RunStatus, RunStore, Stage, StageOutcome};
use crate::backup::{BackupEngine, BackupOptions, Confirm};
use crate::config::HubConfig;
use crate::environment::EnvironmentProfile;
use crate::error::{Error, ErrorCode, Result};
use crate::git::SourceTree;
use crate::interrupt;
use crate::testing::{TestGate, TestOptions};
use crate::utils::command;
use crate::utils::http;

/// What the controller drives. Every collaborator sits behind a trait so runs can be
/// exercised without a cluster, a registry or a database.
pub struct Collaborators<'a> {
    pub source: &'a dyn SourceTree,
    pub tests: &'a dyn TestGate,
    pub backups: &'a BackupEngine<'a>,
    pub platform: &'a dyn Platform,
    pub probe: &'a dyn HealthProbe,
    pub notifier: Option<&'a dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub release_branch: String,
    pub health_path: String,
    pub health: RetryPolicy,
    pub locks_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub test_options: TestOptions,
    pub backup_options: BackupOptions,
}

impl ControllerSettings {
    pub fn from_config(config: &HubConfig, locks_dir: PathBuf, runs_dir: PathBuf) -> Self {
        Self {
            release_branch: config.deploy.release_branch.clone(),
            health_path: config.deploy.health_path.clone(),
            health: RetryPolicy {
                attempts: config.deploy.health_retries,
                backoff: Duration::from_secs(config.deploy.health_backoff_secs),
            },
            locks_dir,
            runs_dir,
            test_options: TestOptions::default(),
            backup_options: BackupOptions {
                compress: true,
                ..BackupOptions::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub version: Option<String>,
    pub mode: RunMode,
    pub flags: RunFlags,
}

pub struct Controller<'a> {
    deps: Collaborators<'a>,
    settings: ControllerSettings,
    store: RunStore,
}

impl<'a> Controller<'a> {
    pub fn new(deps: Collaborators<'a>, settings: ControllerSettings) -> Self {
        let store = RunStore::new(settings.runs_dir.clone());
        Self {
            deps,
            settings,
            store,
        }
    }

    /// Execute one run to a terminal status.
    ///
    /// `Ok` only for `succeeded`. Failures carry `stage`, `run_id`, the rollback
    /// outcome and the full run record in their details.
    pub fn run(&self, profile: &EnvironmentProfile, request: DeployRequest) -> Result<DeploymentRun> {
        let mut run = DeploymentRun::new(
            profile.environment,
            request.mode,
            request.flags,
            request.version,
        );

        run.enter(Stage::Validating);
        let lock = match self.validate(profile, &mut run) {
            Ok(lock) => lock,
            Err(err) => return Err(self.fail(&mut run, err)),
        };
        self.persist(&mut run);

        let outcome = self.drive(profile, &mut run);
        let result = match outcome {
            Ok(()) => {
                run.enter(Stage::Done);
                run.record(StageOutcome::Completed, "");
                run.finish(RunStatus::Succeeded);
                self.persist(&mut run);
                log_status!("deploy", "Run {} succeeded", run.run_id);
                Ok(run)
            }
            Err(err) => Err(self.recover(profile, &mut run, err)),
        };
        drop(lock);
        result
    }

    fn persist(&self, run: &mut DeploymentRun) {
        if let Err(e) = self.store.save(run) {
            let message = format!("Could not write run record: {}", e.message);
            run.warn(message);
        }
    }

    fn validate(&self, profile: &EnvironmentProfile, run: &mut DeploymentRun) -> Result<EnvironmentLock> {
        let flags = run.flags;

        if run.mode == RunMode::Rollback && run.version.is_none() {
            return Err(Error::validation_missing_argument(vec!["version".to_string()])
                .with_hint("Rollback needs the version to revert to: --version <tag>"));
        }

        if profile.environment.is_production() {
            if flags.force {
                run.warn("Skipping clean-tree and release-branch checks for production (--force)");
            } else {
                if !self.deps.source.is_clean()? {
                    return Err(Error::precondition(
                        "Working tree has uncommitted changes; production deploys require a clean tree",
                    )
                    .with_hint("Commit or stash your changes, or pass --force"));
                }
                let branch = self.deps.source.current_branch()?;
                if branch != self.settings.release_branch {
                    return Err(Error::precondition(format!(
                        "Production deploys must run from '{}', current branch is '{}'",
                        self.settings.release_branch, branch
                    ))
                    .with_context("branch", branch)
                    .with_hint("Check out the release branch, or pass --force"));
                }
            }
        }

        if run.version.is_none() {
            run.version = Some(self.deps.source.head_commit()?);
        }
        profile.require_base_url()?;

        if !flags.dry_run {
            command::require_tools(&self.deps.platform.required_tools())?;
        }

        let lock = EnvironmentLock::acquire(
            &self.settings.locks_dir,
            profile.environment.as_str(),
            &LockHolder {
                run_id: run.run_id.clone(),
                pid: std::process::id(),
                version: run.version.clone(),
                acquired_at: chrono::Utc::now(),
            },
        )?;
        run.record(
            StageOutcome::Completed,
            format!("{} {} to {}", verb(run.mode), run.version_or_unknown(), profile.environment),
        );
        Ok(lock)
    }

    /// Every stage after validation, in order. The first fatal error stops the run.
    fn drive(&self, profile: &EnvironmentProfile, run: &mut DeploymentRun) -> Result<()> {
        let version = run.version_or_unknown().to_string();
        let dry_run = run.flags.dry_run;
        let rollback_mode = run.mode == RunMode::Rollback;

        // Testing
        self.stage(run, Stage::Testing);
        if run.flags.skip_tests || rollback_mode {
            run.record(StageOutcome::Skipped, skip_reason(run.flags.skip_tests, "--skip-tests"));
        } else if dry_run {
            run.record(
                StageOutcome::Planned,
                format!("would run {} tests", self.settings.test_options.scope.as_str()),
            );
        } else {
            let result = self.deps.tests.run(&self.settings.test_options)?;
            if !result.success {
                return Err(Error::test_failed(
                    format!(
                        "Test gate failed: {} failed, {} errors",
                        result.counts.failed, result.counts.errors
                    ),
                    serde_json::to_value(&result).unwrap_or_default(),
                ));
            }
            run.record(
                StageOutcome::Completed,
                format!("{} passed", result.counts.passed),
            );
        }

        // BackingUp
        self.stage(run, Stage::BackingUp);
        if run.flags.skip_backup || rollback_mode {
            run.record(StageOutcome::Skipped, skip_reason(run.flags.skip_backup, "--skip-backup"));
        } else if dry_run {
            run.record(
                StageOutcome::Planned,
                format!("would back up database {}", profile.database.name),
            );
        } else {
            match self.deps.backups.backup(profile, &self.settings.backup_options) {
                Ok(report) => {
                    let detail = report.artifact.path.display().to_string();
                    run.warnings.extend(report.warnings);
                    run.backup_anchor = Some(report.artifact);
                    run.record(StageOutcome::Completed, detail);
                    self.persist(run);
                }
                Err(err) if run.flags.force => {
                    run.warn(format!(
                        "Backup failed, continuing without a rollback anchor (--force): {}",
                        err.message
                    ));
                    run.record(StageOutcome::Warned, err.message);
                }
                Err(err) => return Err(backup_stage_failure(err)),
            }
        }

        // Building
        self.stage(run, Stage::Building);
        if rollback_mode {
            run.record(StageOutcome::Skipped, "rollback reuses the published image");
        } else if dry_run {
            run.record(StageOutcome::Planned, format!("would build and publish {}", version));
        } else {
            self.deps.platform.build(&version)?;
            self.deps.platform.publish(&version)?;
            run.record(StageOutcome::Completed, format!("published {}", version));
        }

        // Deploying
        self.stage(run, Stage::Deploying);
        if dry_run {
            run.record(StageOutcome::Planned, format!("would apply {}", version));
        } else {
            run.previous_version = self.deps.platform.current_version(profile)?;
            self.persist(run);
            if run.previous_version.as_deref() == Some(version.as_str()) {
                run.warn(format!("{} is already deployed; re-applying", version));
            }
            self.deps.platform.apply(profile, &version)?;
            let detail = match &run.previous_version {
                Some(previous) => format!("{} -> {}", previous, version),
                None => format!("applied {}", version),
            };
            run.record(StageOutcome::Completed, detail);
        }

        // Migrating
        self.stage(run, Stage::Migrating);
        if rollback_mode {
            run.record(StageOutcome::Skipped, "migrations are forward-only");
        } else if dry_run {
            run.record(StageOutcome::Planned, "would run the migration job");
        } else {
            self.deps.platform.migrate(profile, &version)?;
            run.record(StageOutcome::Completed, "");
        }

        // HealthChecking
        self.stage(run, Stage::HealthChecking);
        let url = http::join_url(profile.require_base_url()?, &self.settings.health_path);
        if dry_run {
            run.record(StageOutcome::Planned, format!("would probe {}", url));
        } else {
            match health::wait_healthy(self.deps.probe, &url, self.settings.health) {
                Ok(attempts) => {
                    run.record(StageOutcome::Completed, format!("healthy after {} attempt(s)", attempts))
                }
                Err(err) if run.flags.force => {
                    run.warn(format!("Health check failed, continuing (--force): {}", err.message));
                    run.record(StageOutcome::Warned, err.message);
                }
                Err(err) => return Err(err),
            }
        }

        // Notifying
        self.stage(run, Stage::Notifying);
        match self.deps.notifier {
            None => run.record(StageOutcome::Skipped, "no webhook configured"),
            Some(_) if dry_run => run.record(StageOutcome::Planned, "would send notification"),
            Some(notifier) => match notifier.notify(run) {
                Ok(()) => run.record(StageOutcome::Completed, ""),
                Err(e) => {
                    run.warn(format!("Notification failed: {}", e.message));
                    run.record(StageOutcome::Warned, e.message);
                }
            },
        }

        // Cleaning
        self.stage(run, Stage::Cleaning);
        if dry_run {
            run.record(StageOutcome::Planned, "would prune stale images");
        } else {
            match self.deps.platform.prune() {
                Ok(removed) => run.record(StageOutcome::Completed, format!("pruned {} image(s)", removed.len())),
                Err(e) => {
                    run.warn(format!("Cleanup failed: {}", e.message));
                    run.record(StageOutcome::Warned, e.message);
                }
            }
        }

        Ok(())
    }

    fn stage(&self, run: &mut DeploymentRun, stage: Stage) {
        run.enter(stage);
        self.persist(run);
    }

    /// Terminal failure before the environment was touched: nothing to undo.
    fn fail(&self, run: &mut DeploymentRun, err: Error) -> Error {
        let stage = run.stage;
        run.failed_stage = Some(stage);
        run.record(StageOutcome::Failed, err.message.clone());
        run.enter(Stage::Failed);
        run.finish(RunStatus::Failed);
        if stage != Stage::Validating {
            self.notify_outcome(run);
        }
        self.persist(run);
        log_status!("deploy", "Run {} failed in {}: {}", run.run_id, stage, err.message);

        err.with_context("stage", stage.as_str())
            .with_context("run_id", &run.run_id)
            .with_context("rollback", json!({ "attempted": false }))
            .with_context("run", &*run)
    }

    /// Route a fatal error: roll back when the environment was touched, otherwise fail.
    fn recover(&self, profile: &EnvironmentProfile, run: &mut DeploymentRun, err: Error) -> Error {
        let stage = run.stage;
        let can_undo = run.backup_anchor.is_some() || run.previous_version.is_some();
        if !stage.mutates_environment() || run.flags.dry_run || !can_undo {
            if stage.mutates_environment() && !run.flags.dry_run {
                run.warn("No rollback anchor or previous version recorded; environment left as is");
            }
            return self.fail(run, err);
        }

        run.failed_stage = Some(stage);
        run.record(StageOutcome::Failed, err.message.clone());
        log_status!("deploy", "{} failed: {}. Rolling back", stage, err.message);

        // An interrupt must not also abort the rollback's own subprocesses.
        if interrupt::is_interrupted() {
            interrupt::clear();
            run.warn("Interrupted; rolling back before exit");
        }

        run.enter(Stage::RollingBack);
        self.persist(run);
        let record = self.roll_back(profile, run);
        run.rollback = Some(record.clone());

        if record.succeeded {
            run.record(StageOutcome::Completed, "");
            run.finish(RunStatus::RolledBack);
            self.notify_outcome(run);
            self.persist(run);
            log_status!("deploy", "Run {} rolled back", run.run_id);
            err.with_context("stage", stage.as_str())
                .with_context("run_id", &run.run_id)
                .with_context("rollback", json!({ "attempted": true, "outcome": record }))
                .with_context("run", &*run)
        } else {
            run.record(StageOutcome::Failed, record.failures.join("; "));
            run.finish(RunStatus::Failed);
            self.notify_outcome(run);
            self.persist(run);
            log_status!("deploy", "Rollback of run {} FAILED", run.run_id);
            Error::rollback_failed(record.failures.clone())
                .with_context(
                    "trigger",
                    json!({ "code": err.code.as_str(), "message": err.message, "details": err.details }),
                )
                .with_context("stage", stage.as_str())
                .with_context("run_id", &run.run_id)
                .with_context("rollback", json!({ "attempted": true, "outcome": record }))
                .with_context("run", &*run)
        }
    }

    /// Best effort: a failed or rolled-back run still reaches the webhook, and a
    /// webhook error only adds a warning.
    fn notify_outcome(&self, run: &mut DeploymentRun) {
        let Some(notifier) = self.deps.notifier else {
            return;
        };
        if run.flags.dry_run {
            return;
        }
        if let Err(e) = notifier.notify(run) {
            run.warn(format!("Notification failed: {}", e.message));
        }
    }

    /// Best effort: every step is attempted and every failure reported. Never recurses.
    fn roll_back(&self, profile: &EnvironmentProfile, run: &DeploymentRun) -> RollbackRecord {
        let mut record = RollbackRecord::default();

        match &run.backup_anchor {
            Some(anchor) => {
                log_status!("rollback", "Restoring {}", anchor.path.display());
                match self.deps.backups.restore(profile, &anchor.path, Confirm::Forced) {
                    Ok(report) => {
                        record.warnings.extend(report.warnings);
                        record.restored_backup = Some(anchor.path.display().to_string());
                    }
                    Err(e) => record
                        .failures
                        .push(format!("restore of {} failed: {}", anchor.path.display(), e.message)),
                }
            }
            None => record
                .warnings
                .push("No backup anchor; database not restored".to_string()),
        }

        match &run.previous_version {
            Some(previous) => {
                log_status!("rollback", "Reverting to {}", previous);
                match self.deps.platform.apply(profile, previous) {
                    Ok(()) => record.reverted_to = Some(previous.clone()),
                    Err(e) => record
                        .failures
                        .push(format!("revert to {} failed: {}", previous, e.message)),
                }
            }
            None => record
                .warnings
                .push("No previously deployed version recorded; environment not reverted".to_string()),
        }

        record.succeeded = record.failures.is_empty();
        record
    }
}

/// Everything that stops the backup stage surfaces as `backup.failed`, with the
/// original error kept under `details.cause`. Interrupts stay interrupts.
fn backup_stage_failure(err: Error) -> Error {
    match err.code {
        ErrorCode::BackupFailed | ErrorCode::ProcessInterrupted => err,
        _ => {
            let message = format!("Backup failed: {}", err.message);
            err.reclassify(ErrorCode::BackupFailed, message)
        }
    }
}

fn verb(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Deploy => "deploy",
        RunMode::Rollback => "roll back",
    }
}

fn skip_reason(flagged: bool, flag: &str) -> String {
    if flagged {
        format!("skipped ({})", flag)
    } else {
        "skipped (rollback mode)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_stage_errors_become_backup_failures() {
        let err = backup_stage_failure(Error::tooling_unavailable(vec!["pg_dump".to_string()]));
        assert_eq!(err.code, ErrorCode::BackupFailed);
        assert_eq!(err.code.exit_code(), 5);
        assert_eq!(err.details["cause"]["code"], "tooling.unavailable");

        let err = backup_stage_failure(Error::interrupted("pg_dump"));
        assert_eq!(err.code, ErrorCode::ProcessInterrupted);
    }
}
