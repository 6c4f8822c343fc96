//! Database backup and restore.
//!
//! The engine knows nothing about deployments: it turns an `EnvironmentProfile`
//! into a checksummed artifact (plus `.meta` sidecar) and back.

pub mod codec;
pub mod metadata;
pub mod naming;
pub mod postgres;
pub mod restore;
pub mod retention;
pub mod storage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::HubConfig;
use crate::environment::EnvironmentProfile;
use crate::error::{Error, ErrorCode, Result};
use crate::interrupt;
use crate::utils::command;
use crate::utils::io;

use codec::{Encryption, PartialFile, PayloadWriter, ENCRYPTION_KEY_VAR};
use metadata::BackupMetadata;
use postgres::as_backup_failure;
use retention::{RetentionOutcome, RetentionScope};

pub use postgres::{DatabaseTool, DumpPlan, PgTools, RestorePlan};
pub use restore::{Confirm, RestoreReport};
pub use storage::{AwsCli, ObjectStore, RemoteObject};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupMode {
    #[default]
    Full,
    SchemaOnly,
    DataOnly,
}

impl BackupMode {
    /// `backup_type` value written to the sidecar.
    pub fn meta_label(&self) -> &'static str {
        match self {
            BackupMode::Full => "full",
            BackupMode::SchemaOnly => "schema",
            BackupMode::DataOnly => "data",
        }
    }

    pub fn from_meta_label(label: &str) -> Option<Self> {
        match label {
            "full" => Some(BackupMode::Full),
            "schema" => Some(BackupMode::SchemaOnly),
            "data" => Some(BackupMode::DataOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub mode: BackupMode,
    pub compress: bool,
    pub encrypt: bool,
    pub tables: Vec<String>,
    pub exclude: Vec<String>,
    /// Overrides the configured retention window.
    pub retention_days: Option<u32>,
    pub remote_bucket: Option<String>,
    pub output: Option<PathBuf>,
}

/// A written, checksummed dump. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub environment: String,
    pub database: String,
    pub mode: BackupMode,
    pub compressed: bool,
    pub encrypted: bool,
    pub tables: Vec<String>,
    pub excluded_tables: Vec<String>,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub artifact: BackupArtifact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_uri: Option<String>,
    pub retention: RetentionOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// An artifact found on disk, with its sidecar when present.
#[derive(Debug, Clone, Serialize)]
pub struct ListedArtifact {
    pub path: String,
    pub file_name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BackupMetadata>,
}

/// Engine-wide settings resolved from configuration and the process environment.
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub directory: PathBuf,
    pub retention_days: u32,
    pub s3_prefix: String,
    pub passphrase: Option<String>,
    pub encrypt_timeout_secs: u64,
}

impl BackupSettings {
    pub fn from_config(config: &HubConfig) -> Result<Self> {
        Ok(Self {
            directory: config.backup.resolve_directory()?,
            retention_days: config.backup.retention_days,
            s3_prefix: config.backup.s3_prefix.clone(),
            passphrase: std::env::var(ENCRYPTION_KEY_VAR)
                .ok()
                .filter(|v| !v.is_empty()),
            encrypt_timeout_secs: config.timeouts.dump_secs,
        })
    }
}

pub struct BackupEngine<'a> {
    db: &'a dyn DatabaseTool,
    store: &'a dyn ObjectStore,
    settings: BackupSettings,
}

impl<'a> BackupEngine<'a> {
    pub fn new(db: &'a dyn DatabaseTool, store: &'a dyn ObjectStore, settings: BackupSettings) -> Self {
        Self { db, store, settings }
    }

    /// Reject contradictory options before anything touches the database.
    pub fn validate_options(&self, options: &BackupOptions) -> Result<()> {
        let overlap: Vec<String> = options
            .tables
            .iter()
            .filter(|t| options.exclude.contains(t))
            .cloned()
            .collect();
        if !overlap.is_empty() {
            return Err(Error::precondition(format!(
                "Tables are both included and excluded: {}",
                overlap.join(", ")
            ))
            .with_context("tables", overlap));
        }
        if !options.tables.is_empty() && !options.exclude.is_empty() {
            return Err(Error::config_invalid_value(
                "tables",
                Some(options.tables.join(",")),
                "--tables and --exclude are mutually exclusive",
            ));
        }
        if options.encrypt && self.settings.passphrase.is_none() {
            return Err(Error::precondition(format!(
                "Encryption requested but {} is not set",
                ENCRYPTION_KEY_VAR
            ))
            .with_hint(format!("export {}=<passphrase>", ENCRYPTION_KEY_VAR)));
        }
        Ok(())
    }

    fn preflight(&self, options: &BackupOptions) -> Result<()> {
        let mut tools = self.db.backup_tools();
        if options.encrypt {
            tools.push("gpg");
        }
        if options.remote_bucket.is_some() {
            tools.extend(self.store.required_tools());
        }
        command::require_tools(&tools)
    }

    /// Dump, encode, checksum, upload and apply retention.
    ///
    /// Retention runs once the dump has been attempted, whether or not it succeeded.
    pub fn backup(&self, profile: &EnvironmentProfile, options: &BackupOptions) -> Result<BackupReport> {
        self.validate_options(options)?;
        self.preflight(options)?;
        self.db.check_connection(&profile.database)?;

        let now = Utc::now();
        let result = self.create(profile, options, now);
        let retention = self.apply_retention(profile, options, now);

        match result {
            Ok((artifact, remote_uri, warnings)) => Ok(BackupReport {
                artifact,
                remote_uri,
                retention,
                warnings,
            }),
            Err(err) => Err(err.with_context("retention", &retention)),
        }
    }

    fn create(
        &self,
        profile: &EnvironmentProfile,
        options: &BackupOptions,
        now: DateTime<Utc>,
    ) -> Result<(BackupArtifact, Option<String>, Vec<String>)> {
        let target = &profile.database;
        let environment = profile.environment.as_str();
        let path = match &options.output {
            Some(path) => with_pipeline_suffixes(
                PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string()),
                options.compress,
                options.encrypt,
            ),
            None => self.settings.directory.join(naming::artifact_file_name(
                &target.name,
                environment,
                now,
                options.compress,
                options.encrypt,
            )),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            io::ensure_dir(parent, "create backup directory")?;
        }

        log_status!("backup", "Writing {}", path.display());
        let payload = PartialFile::new(&path);
        let encryption = match (options.encrypt, self.settings.passphrase.as_deref()) {
            (true, Some(passphrase)) => Some(Encryption {
                passphrase,
                timeout_secs: self.settings.encrypt_timeout_secs,
            }),
            _ => None,
        };

        let plan = DumpPlan {
            mode: options.mode,
            tables: options.tables.clone(),
            exclude: options.exclude.clone(),
            clean: options.mode != BackupMode::DataOnly,
        };
        let mut writer = PayloadWriter::create(&path, options.compress, encryption)?;
        self.db
            .dump(target, &plan, &mut writer)
            .map_err(as_backup_failure)?;
        writer.finish().map_err(as_backup_failure)?;
        interrupt::check("backup")?;

        let size = std::fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| Error::internal_io(e.to_string(), Some("stat backup".to_string())))?;
        let checksum = metadata::sha256_file(&path)?;
        let artifact = BackupArtifact {
            path: path.clone(),
            created_at: now,
            environment: environment.to_string(),
            database: target.name.clone(),
            mode: options.mode,
            compressed: options.compress,
            encrypted: options.encrypt,
            tables: options.tables.clone(),
            excluded_tables: options.exclude.clone(),
            size,
            checksum,
        };
        metadata::write(&path, &BackupMetadata::from_artifact(&artifact, &target.host))
            .map_err(as_backup_failure)?;
        payload.commit();
        log_status!("backup", "Wrote {} bytes (sha256 {})", artifact.size, artifact.checksum);

        let mut warnings = Vec::new();
        let remote_uri = match &options.remote_bucket {
            Some(bucket) => Some(self.upload(bucket, &artifact, &mut warnings)?),
            None => None,
        };

        Ok((artifact, remote_uri, warnings))
    }

    fn upload(&self, bucket: &str, artifact: &BackupArtifact, warnings: &mut Vec<String>) -> Result<String> {
        let file_name = file_name_of(&artifact.path);
        let key = naming::remote_key(&self.settings.s3_prefix, &artifact.environment, &file_name);

        log_status!("backup", "Uploading to s3://{}/{}", bucket, key);
        let uri = self
            .store
            .upload(bucket, &artifact.path, &key)
            .map_err(|e| {
                let message = format!("Upload of {} failed: {}", file_name, e.message);
                e.reclassify(ErrorCode::BackupFailed, message)
            })?;

        let sidecar = naming::sidecar_path(&artifact.path);
        let sidecar_key = format!("{}{}", key, naming::META_SUFFIX);
        if let Err(e) = self.store.upload(bucket, &sidecar, &sidecar_key) {
            warnings.push(format!("Metadata upload failed: {}", e.message));
        }
        Ok(uri)
    }

    fn apply_retention(
        &self,
        profile: &EnvironmentProfile,
        options: &BackupOptions,
        now: DateTime<Utc>,
    ) -> RetentionOutcome {
        let days = options.retention_days.unwrap_or(self.settings.retention_days);
        let mut outcome = RetentionOutcome {
            retention_days: days,
            ..RetentionOutcome::default()
        };
        if days == 0 {
            return outcome;
        }

        let scope = RetentionScope {
            database: &profile.database.name,
            environment: profile.environment.as_str(),
            days,
            now,
        };
        let dir = options
            .output
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(&self.settings.directory);
        retention::prune_local(dir, scope, &mut outcome);

        if let Some(bucket) = &options.remote_bucket {
            let prefix = naming::remote_key(&self.settings.s3_prefix, scope.environment, "");
            retention::prune_remote(self.store, bucket, &prefix, scope, &mut outcome);
        }

        if !outcome.removed_local.is_empty() || !outcome.removed_remote.is_empty() {
            log_status!(
                "backup",
                "Retention removed {} local and {} remote artifacts older than {} days",
                outcome.removed_local.len(),
                outcome.removed_remote.len(),
                days
            );
        }
        outcome
    }

    /// Artifacts in the backup directory for one environment, newest first.
    pub fn list(&self, environment: &str) -> Result<Vec<ListedArtifact>> {
        list_artifacts(&self.settings.directory, environment)
    }
}

/// Make an explicit output name agree with the encoding actually applied,
/// so restore's suffix inference matches the sidecar.
fn with_pipeline_suffixes(path: PathBuf, compress: bool, encrypt: bool) -> PathBuf {
    let name = file_name_of(&path);
    let base = name.strip_suffix(".gpg").unwrap_or(&name);
    let base = base.strip_suffix(".gz").unwrap_or(base);
    let mut fixed = base.to_string();
    if compress {
        fixed.push_str(".gz");
    }
    if encrypt {
        fixed.push_str(".gpg");
    }
    path.with_file_name(fixed)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn list_artifacts(dir: &Path, environment: &str) -> Result<Vec<ListedArtifact>> {
    let pattern = format!("{}/*.sql*", glob::Pattern::escape(&dir.to_string_lossy()));
    let entries = glob::glob(&pattern).map_err(|e| {
        Error::internal_unexpected(format!("Invalid backup glob {}: {}", pattern, e))
    })?;
    let marker = format!("_{}_", environment);

    let mut listed = Vec::new();
    for path in entries.filter_map(|e| e.ok()) {
        let file_name = file_name_of(&path);
        if file_name.ends_with(naming::META_SUFFIX) {
            continue;
        }
        let meta = metadata::read(&path).ok().flatten();
        let matches_env = match &meta {
            Some(meta) => meta.environment == environment,
            None => file_name.contains(&marker),
        };
        if !matches_env {
            continue;
        }
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let created_at = meta
            .as_ref()
            .and_then(|m| m.created_at())
            .or_else(|| naming::parse_timestamp(&file_name));
        listed.push(ListedArtifact {
            path: path.display().to_string(),
            file_name,
            size,
            created_at,
            metadata: meta,
        });
    }

    listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(listed)
}
