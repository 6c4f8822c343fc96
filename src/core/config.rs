//! `hubctl.json` configuration.
//!
//! Every section has serde defaults, so an absent file or a partial file is valid.
//! Environment variables override file values when profiles are resolved
//! (see `environment`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths;
use crate::utils::io;

pub const CONFIG_ENV_VAR: &str = "HUBCTL_CONFIG";
const LOCAL_CONFIG_FILE: &str = "hubctl.json";

/// Root configuration structure for hubctl.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_environments")]
    pub environments: BTreeMap<String, ProfileSeed>,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub tests: TestsConfig,

    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Where this config was loaded from (None for built-in defaults).
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            environments: default_environments(),
            backup: BackupConfig::default(),
            tests: TestsConfig::default(),
            deploy: DeployConfig::default(),
            timeouts: TimeoutsConfig::default(),
            source: None,
        }
    }
}

/// File-level seed for an environment profile. Any field may be overridden
/// by `{PREFIX}_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSeed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Local backup directory; `~` is expanded. Defaults to ~/.config/hubctl/backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,

    #[serde(default = "default_s3_prefix")]
    pub s3_prefix: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: None,
            retention_days: default_retention_days(),
            s3_bucket: None,
            s3_prefix: default_s3_prefix(),
        }
    }
}

impl BackupConfig {
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(dir) => Ok(PathBuf::from(shellexpand::tilde(dir).to_string())),
            None => paths::backups(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintCommand {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub image: String,
    pub port: u16,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_service_ready_timeout")]
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppServiceConfig {
    pub command: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_health_path")]
    pub ready_path: String,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsConfig {
    /// Directory tests run in; `~` is expanded. Defaults to the current directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Test runner invocation; scope paths and flags are appended.
    #[serde(default = "default_runner")]
    pub runner: Vec<String>,

    #[serde(default = "default_quick_args")]
    pub quick_args: Vec<String>,

    #[serde(default = "default_unit_paths")]
    pub unit_paths: Vec<String>,

    /// Unit test shards executed concurrently with `--parallel`.
    #[serde(default)]
    pub unit_shards: Vec<String>,

    #[serde(default = "default_integration_paths")]
    pub integration_paths: Vec<String>,

    #[serde(default = "default_browser_paths")]
    pub browser_paths: Vec<String>,

    #[serde(default = "default_lint")]
    pub lint: Vec<LintCommand>,

    /// Runner flags for in-process parallelism when no shards are configured.
    #[serde(default = "default_parallel_args")]
    pub parallel_args: Vec<String>,

    #[serde(default = "default_coverage_args")]
    pub coverage_args: Vec<String>,

    #[serde(default = "default_verbose_args")]
    pub verbose_args: Vec<String>,

    #[serde(default = "default_database_service")]
    pub database_service: ServiceConfig,

    #[serde(default = "default_app_service")]
    pub app_service: AppServiceConfig,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            runner: default_runner(),
            quick_args: default_quick_args(),
            unit_paths: default_unit_paths(),
            unit_shards: Vec::new(),
            integration_paths: default_integration_paths(),
            browser_paths: default_browser_paths(),
            lint: default_lint(),
            parallel_args: default_parallel_args(),
            coverage_args: default_coverage_args(),
            verbose_args: default_verbose_args(),
            database_service: default_database_service(),
            app_service: default_app_service(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_registry")]
    pub registry: String,

    #[serde(default = "default_image")]
    pub image: String,

    /// Kubernetes deployment name.
    #[serde(default = "default_image")]
    pub deployment: String,

    #[serde(default = "default_container")]
    pub container: String,

    #[serde(default = "default_release_branch")]
    pub release_branch: String,

    #[serde(default = "default_build_context")]
    pub build_context: String,

    #[serde(default = "default_migration_command")]
    pub migration_command: Vec<String>,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_health_retries")]
    pub health_retries: u32,

    #[serde(default = "default_health_backoff")]
    pub health_backoff_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_webhook: Option<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            image: default_image(),
            deployment: default_image(),
            container: default_container(),
            release_branch: default_release_branch(),
            build_context: default_build_context(),
            migration_command: default_migration_command(),
            health_path: default_health_path(),
            health_retries: default_health_retries(),
            health_backoff_secs: default_health_backoff(),
            notify_webhook: None,
        }
    }
}

impl DeployConfig {
    /// Fully qualified image reference for a version.
    pub fn image_ref(&self, version: &str) -> String {
        format!("{}/{}:{}", self.registry.trim_end_matches('/'), self.image, version)
    }
}

/// Upper bounds (seconds) for each long-running subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_dump_timeout")]
    pub dump_secs: u64,
    #[serde(default = "default_dump_timeout")]
    pub restore_secs: u64,
    #[serde(default = "default_upload_timeout")]
    pub upload_secs: u64,
    #[serde(default = "default_build_timeout")]
    pub build_secs: u64,
    #[serde(default = "default_upload_timeout")]
    pub publish_secs: u64,
    #[serde(default = "default_apply_timeout")]
    pub apply_secs: u64,
    #[serde(default = "default_migration_timeout")]
    pub migration_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_secs: u64,
    #[serde(default = "default_test_timeout")]
    pub test_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub connect_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            dump_secs: default_dump_timeout(),
            restore_secs: default_dump_timeout(),
            upload_secs: default_upload_timeout(),
            build_secs: default_build_timeout(),
            publish_secs: default_upload_timeout(),
            apply_secs: default_apply_timeout(),
            migration_secs: default_migration_timeout(),
            probe_secs: default_probe_timeout(),
            test_secs: default_test_timeout(),
            connect_secs: default_probe_timeout(),
        }
    }
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_environments() -> BTreeMap<String, ProfileSeed> {
    let mut map = BTreeMap::new();
    map.insert(
        "development".to_string(),
        ProfileSeed {
            db_host: Some("localhost".to_string()),
            db_port: Some(5432),
            db_name: Some("python_mastery_hub_dev".to_string()),
            db_user: Some("postgres".to_string()),
            kube_context: None,
            namespace: None,
            base_url: Some("http://localhost:5000".to_string()),
        },
    );
    map
}

fn default_retention_days() -> u32 {
    30
}

fn default_s3_prefix() -> String {
    "backups".to_string()
}

fn default_container_port() -> u16 {
    5432
}

fn default_runner() -> Vec<String> {
    vec!["python".to_string(), "-m".to_string(), "pytest".to_string()]
}

fn default_quick_args() -> Vec<String> {
    ["tests/unit", "-x", "-q", "-m", "not slow"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_unit_paths() -> Vec<String> {
    vec!["tests/unit".to_string()]
}

fn default_integration_paths() -> Vec<String> {
    vec!["tests/integration".to_string()]
}

fn default_browser_paths() -> Vec<String> {
    vec!["tests/e2e".to_string()]
}

fn default_lint() -> Vec<LintCommand> {
    vec![
        LintCommand {
            name: "format".to_string(),
            command: vec!["black".to_string(), "--check".to_string(), "src".to_string(), "tests".to_string()],
        },
        LintCommand {
            name: "imports".to_string(),
            command: vec!["isort".to_string(), "--check-only".to_string(), "src".to_string(), "tests".to_string()],
        },
        LintCommand {
            name: "lint".to_string(),
            command: vec!["flake8".to_string(), "src".to_string(), "tests".to_string()],
        },
    ]
}

fn default_parallel_args() -> Vec<String> {
    vec!["-n".to_string(), "auto".to_string()]
}

fn default_coverage_args() -> Vec<String> {
    vec!["--cov=src".to_string(), "--cov-report=term".to_string()]
}

fn default_verbose_args() -> Vec<String> {
    vec!["-v".to_string()]
}

fn default_database_service() -> ServiceConfig {
    let mut env = BTreeMap::new();
    env.insert("POSTGRES_USER".to_string(), "postgres".to_string());
    env.insert("POSTGRES_PASSWORD".to_string(), "postgres".to_string());
    env.insert("POSTGRES_DB".to_string(), "python_mastery_hub_test".to_string());
    ServiceConfig {
        image: "postgres:15".to_string(),
        port: 5433,
        container_port: default_container_port(),
        env,
        ready_timeout_secs: default_service_ready_timeout(),
    }
}

fn default_app_service() -> AppServiceConfig {
    AppServiceConfig {
        command: ["python", "-m", "flask", "run", "--port", "5001"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        port: 5001,
        env: BTreeMap::new(),
        ready_path: default_health_path(),
        ready_timeout_secs: default_ready_timeout(),
    }
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_service_ready_timeout() -> u64 {
    30
}

fn default_registry() -> String {
    "ghcr.io/python-mastery-hub".to_string()
}

fn default_image() -> String {
    "python-mastery-hub".to_string()
}

fn default_container() -> String {
    "web".to_string()
}

fn default_release_branch() -> String {
    "main".to_string()
}

fn default_build_context() -> String {
    ".".to_string()
}

/// `{environment}` is replaced with the target environment name.
fn default_migration_command() -> Vec<String> {
    ["python", "scripts/migrate_db.py", "--env", "{environment}", "upgrade"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_retries() -> u32 {
    10
}

fn default_health_backoff() -> u64 {
    10
}

fn default_dump_timeout() -> u64 {
    3600
}

fn default_upload_timeout() -> u64 {
    1800
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_apply_timeout() -> u64 {
    600
}

fn default_migration_timeout() -> u64 {
    900
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_test_timeout() -> u64 {
    3600
}

// =============================================================================
// Loading
// =============================================================================

/// Resolve which config file to read: `$HUBCTL_CONFIG`, then `./hubctl.json`,
/// then `~/.config/hubctl/hubctl.json`.
fn locate() -> Result<Option<PathBuf>> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(shellexpand::tilde(&explicit).to_string());
        if !path.exists() {
            return Err(Error::config_invalid_value(
                CONFIG_ENV_VAR,
                Some(explicit),
                "config file does not exist",
            ));
        }
        return Ok(Some(path));
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Ok(Some(local));
    }

    let global = paths::hubctl_json()?;
    Ok(global.exists().then_some(global))
}

/// Load configuration from the first available location, or built-in defaults.
pub fn load() -> Result<HubConfig> {
    match locate()? {
        Some(path) => load_from(&path),
        None => Ok(HubConfig::default()),
    }
}

pub fn load_from(path: &Path) -> Result<HubConfig> {
    let raw = io::read_file(path, "read config")?;
    parse(&raw, path)
}

fn parse(raw: &str, path: &Path) -> Result<HubConfig> {
    let mut config: HubConfig = serde_json::from_str(raw)
        .map_err(|e| Error::config_invalid_json(path.display().to_string(), e))?;
    config.source = Some(path.to_path_buf());
    validate(&config)?;
    Ok(config)
}

fn validate(config: &HubConfig) -> Result<()> {
    if config.tests.runner.is_empty() {
        return Err(Error::config_invalid_value(
            "tests.runner",
            None,
            "runner command must not be empty",
        ));
    }
    if config.tests.app_service.command.is_empty() {
        return Err(Error::config_invalid_value(
            "tests.app_service.command",
            None,
            "app service command must not be empty",
        ));
    }
    if let Some(lint) = config.tests.lint.iter().find(|l| l.command.is_empty()) {
        return Err(Error::config_invalid_value(
            "tests.lint",
            Some(lint.name.clone()),
            "lint command must not be empty",
        ));
    }
    if config.deploy.health_retries == 0 {
        return Err(Error::config_invalid_value(
            "deploy.health_retries",
            Some("0".to_string()),
            "at least one health probe is required",
        ));
    }
    Ok(())
}
