//! Deployment run state and its on-disk journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::backup::BackupArtifact;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::utils::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    Testing,
    BackingUp,
    Building,
    Deploying,
    Migrating,
    HealthChecking,
    Notifying,
    Cleaning,
    Done,
    RollingBack,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::Testing => "testing",
            Stage::BackingUp => "backing_up",
            Stage::Building => "building",
            Stage::Deploying => "deploying",
            Stage::Migrating => "migrating",
            Stage::HealthChecking => "health_checking",
            Stage::Notifying => "notifying",
            Stage::Cleaning => "cleaning",
            Stage::Done => "done",
            Stage::RollingBack => "rolling_back",
            Stage::Failed => "failed",
        }
    }

    /// Stages whose failure leaves the environment changed and so warrants rollback.
    pub fn mutates_environment(&self) -> bool {
        matches!(
            self,
            Stage::Deploying | Stage::Migrating | Stage::HealthChecking
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Deploy,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFlags {
    pub skip_tests: bool,
    pub skip_backup: bool,
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Completed,
    Skipped,
    /// Dry run: the action was described, not performed.
    Planned,
    /// The stage failed but the run continued (`--force`, or a non-fatal stage).
    Warned,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_backup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverted_to: Option<String>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub run_id: String,
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub mode: RunMode,
    pub flags: RunFlags,
    /// The backup taken by this run; the only thing rollback restores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_anchor: Option<BackupArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    pub stage: Stage,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    pub transcript: Vec<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentRun {
    pub fn new(environment: Environment, mode: RunMode, flags: RunFlags, version: Option<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            environment,
            version,
            mode,
            flags,
            backup_anchor: None,
            previous_version: None,
            stage: Stage::Validating,
            status: RunStatus::Running,
            failed_stage: None,
            transcript: Vec::new(),
            rollback: None,
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        log_status!("deploy", "[{}] {}", self.environment, stage);
    }

    pub fn record(&mut self, outcome: StageOutcome, detail: impl Into<String>) {
        let detail = detail.into();
        if !detail.is_empty() {
            log_status!("deploy", "[{}] {} {:?}: {}", self.environment, self.stage, outcome, detail);
        }
        self.transcript.push(StageRecord {
            stage: self.stage,
            outcome,
            detail,
            at: Utc::now(),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log_status!("deploy", "Warning: {}", message);
        self.warnings.push(message);
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Stages in the order they were recorded, without repeats.
    pub fn visited(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = Vec::new();
        for record in &self.transcript {
            if stages.last() != Some(&record.stage) {
                stages.push(record.stage);
            }
        }
        stages
    }

    pub fn version_or_unknown(&self) -> &str {
        self.version.as_deref().unwrap_or("unknown")
    }
}

/// Journal of runs for one environment, one JSON file per run.
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    pub fn save(&self, run: &DeploymentRun) -> Result<()> {
        let content = serde_json::to_string_pretty(run)
            .map_err(|e| Error::internal_json(e.to_string(), Some("serialize run".to_string())))?;
        io::write_file_atomic(&self.path_for(&run.run_id), &content, "write run record")
    }

    pub fn load(&self, run_id: &str) -> Result<DeploymentRun> {
        let path = self.path_for(run_id);
        if run_id.contains(['/', '\\']) || !path.is_file() {
            return Err(Error::validation_invalid_argument(
                "run",
                format!("No run record '{}' in {}", run_id, self.dir.display()),
                Some(run_id.to_string()),
                None,
            ));
        }
        let raw = io::read_file(&path, "read run record")?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::internal_json(e.to_string(), Some(format!("parse {}", path.display())))
        })
    }

    /// Most recently started run, if any records exist.
    pub fn latest(&self) -> Result<Option<DeploymentRun>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let pattern = format!("{}/*.json", glob::Pattern::escape(&self.dir.to_string_lossy()));
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::internal_unexpected(format!("Invalid run glob {}: {}", pattern, e)))?;

        let latest = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|path| io::read_file(&path, "read run record").ok())
            .filter_map(|raw| serde_json::from_str::<DeploymentRun>(&raw).ok())
            .max_by_key(|run| run.started_at);
        Ok(latest)
    }
}
