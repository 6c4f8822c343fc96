//! End-to-end pipeline behaviour against in-memory collaborators.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use hubctl::backup::naming;
use hubctl::backup::{
    BackupEngine, BackupMode, BackupOptions, BackupSettings, Confirm, DatabaseTool, DumpPlan,
    ObjectStore, RemoteObject, RestorePlan,
};
use hubctl::deploy::{
    lock, notify, Collaborators, Controller, ControllerSettings, DeployRequest, DeploymentRun,
    HealthProbe, Notifier, Platform, RetryPolicy, RunFlags, RunMode, RunStatus, Stage,
};
use hubctl::environment::{DatabaseTarget, Environment, EnvironmentProfile};
use hubctl::git::SourceTree;
use hubctl::testing::{Counts, TestGate, TestOptions, TestResult};
use hubctl::utils::command;
use hubctl::{Error, ErrorCode, Result};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Tables and row counts. Dumps are a tiny SQL dialect (`DROP t`, `CREATE t`,
/// `INSERT t rows`) replayed with the same rules PostgreSQL applies: creating an
/// existing table fails, inserting into a missing one fails, and a failed replay
/// changes nothing.
#[derive(Default)]
struct FakeDb {
    tables: RefCell<BTreeMap<String, u32>>,
    restores: Cell<u32>,
    offline: Cell<bool>,
    /// Emit part of the dump, then fail.
    broken_dump: bool,
    tools: Vec<&'static str>,
}

impl FakeDb {
    fn with(tables: &[(&str, u32)]) -> Self {
        let db = FakeDb::default();
        db.replace(tables);
        db
    }

    fn replace(&self, tables: &[(&str, u32)]) {
        *self.tables.borrow_mut() = tables.iter().map(|(t, r)| (t.to_string(), *r)).collect();
    }

    fn snapshot(&self) -> BTreeMap<String, u32> {
        self.tables.borrow().clone()
    }
}

fn io_error(e: std::io::Error) -> Error {
    Error::internal_io(e.to_string(), None)
}

fn replay_error(message: String) -> Error {
    Error::new(ErrorCode::RestoreExecutionFailed, message, serde_json::Value::Null)
}

impl DatabaseTool for FakeDb {
    fn backup_tools(&self) -> Vec<&'static str> {
        self.tools.clone()
    }

    fn restore_tools(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn check_connection(&self, target: &DatabaseTarget) -> Result<()> {
        if self.offline.get() {
            return Err(Error::connection_failed(
                &target.host,
                target.port,
                &target.name,
                "connection refused",
            ));
        }
        Ok(())
    }

    fn dump(&self, _target: &DatabaseTarget, plan: &DumpPlan, sink: &mut dyn Write) -> Result<()> {
        for (table, rows) in self.tables.borrow().iter() {
            if !plan.tables.is_empty() && !plan.tables.contains(table) {
                continue;
            }
            if plan.exclude.contains(table) {
                continue;
            }
            if plan.mode != BackupMode::DataOnly {
                if plan.clean {
                    writeln!(sink, "DROP {}", table).map_err(io_error)?;
                }
                writeln!(sink, "CREATE {}", table).map_err(io_error)?;
            }
            if plan.mode != BackupMode::SchemaOnly {
                writeln!(sink, "INSERT {} {}", table, rows).map_err(io_error)?;
            }
            if self.broken_dump {
                return Err(Error::backup_failed("server closed the connection during dump"));
            }
        }
        Ok(())
    }

    fn restore(&self, _target: &DatabaseTarget, plan: &RestorePlan, source: &mut dyn Read) -> Result<()> {
        let mut sql = String::new();
        source.read_to_string(&mut sql).map_err(io_error)?;

        let mut tables = if plan.reset_schema {
            BTreeMap::new()
        } else {
            self.snapshot()
        };
        for line in sql.lines() {
            match line.split_whitespace().collect::<Vec<_>>().as_slice() {
                ["DROP", table] => {
                    tables.remove(*table);
                }
                ["CREATE", table] => {
                    if tables.contains_key(*table) {
                        return Err(replay_error(format!("relation \"{}\" already exists", table)));
                    }
                    tables.insert(table.to_string(), 0);
                }
                ["INSERT", table, rows] => {
                    let Some(count) = tables.get_mut(*table) else {
                        return Err(replay_error(format!("relation \"{}\" does not exist", table)));
                    };
                    *count += rows.parse::<u32>().unwrap_or(0);
                }
                _ => {}
            }
        }
        *self.tables.borrow_mut() = tables;
        self.restores.set(self.restores.get() + 1);
        Ok(())
    }
}

#[derive(Default)]
struct FakeStore {
    uploads: RefCell<Vec<String>>,
}

impl ObjectStore for FakeStore {
    fn required_tools(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn upload(&self, bucket: &str, _local: &Path, key: &str) -> Result<String> {
        let uri = format!("s3://{}/{}", bucket, key);
        self.uploads.borrow_mut().push(uri.clone());
        Ok(uri)
    }

    fn list(&self, _bucket: &str, _prefix: &str) -> Result<Vec<RemoteObject>> {
        Ok(Vec::new())
    }

    fn delete(&self, _bucket: &str, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Tracks the deployed version; migrations add a table to the attached database.
struct FakePlatform<'a> {
    deployed: RefCell<Option<String>>,
    calls: RefCell<Vec<String>>,
    db: Option<&'a FakeDb>,
    /// A version whose rollout always fails.
    broken: Option<&'static str>,
}

impl<'a> FakePlatform<'a> {
    fn running(version: Option<&str>, db: Option<&'a FakeDb>) -> Self {
        Self {
            deployed: RefCell::new(version.map(str::to_string)),
            calls: RefCell::new(Vec::new()),
            db,
            broken: None,
        }
    }

    fn call(&self, what: String) {
        self.calls.borrow_mut().push(what);
    }
}

impl Platform for FakePlatform<'_> {
    fn required_tools(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn build(&self, version: &str) -> Result<()> {
        self.call(format!("build {}", version));
        Ok(())
    }

    fn publish(&self, version: &str) -> Result<()> {
        self.call(format!("publish {}", version));
        Ok(())
    }

    fn current_version(&self, _profile: &EnvironmentProfile) -> Result<Option<String>> {
        Ok(self.deployed.borrow().clone())
    }

    fn apply(&self, _profile: &EnvironmentProfile, version: &str) -> Result<()> {
        self.call(format!("apply {}", version));
        if self.broken == Some(version) {
            return Err(Error::new(
                ErrorCode::DeployApplyFailed,
                format!("rollout of {} timed out", version),
                serde_json::Value::Null,
            ));
        }
        *self.deployed.borrow_mut() = Some(version.to_string());
        Ok(())
    }

    fn migrate(&self, _profile: &EnvironmentProfile, version: &str) -> Result<()> {
        self.call(format!("migrate {}", version));
        if let Some(db) = self.db {
            db.tables
                .borrow_mut()
                .insert("schema_migrations".to_string(), 1);
        }
        Ok(())
    }

    fn prune(&self) -> Result<Vec<String>> {
        self.call("prune".to_string());
        Ok(Vec::new())
    }
}

struct FakeProbe {
    healthy: bool,
}

impl HealthProbe for FakeProbe {
    fn check(&self, _url: &str) -> std::result::Result<(), String> {
        if self.healthy {
            Ok(())
        } else {
            Err("HTTP 503".to_string())
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    fail: bool,
    seen: RefCell<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, run: &DeploymentRun) -> Result<()> {
        self.seen.borrow_mut().push(notify::summary(run));
        if self.fail {
            Err(Error::internal_unexpected("webhook returned 500"))
        } else {
            Ok(())
        }
    }
}

struct FakeSource {
    clean: bool,
    branch: &'static str,
}

static MAIN: FakeSource = FakeSource {
    clean: true,
    branch: "main",
};

impl SourceTree for FakeSource {
    fn is_clean(&self) -> Result<bool> {
        Ok(self.clean)
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.branch.to_string())
    }

    fn head_commit(&self) -> Result<String> {
        Ok("abc1234".to_string())
    }
}

struct FixedGate {
    success: bool,
    calls: Cell<u32>,
}

impl FixedGate {
    fn passing() -> Self {
        Self {
            success: true,
            calls: Cell::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            success: false,
            calls: Cell::new(0),
        }
    }
}

fn test_result(success: bool) -> TestResult {
    TestResult {
        scope: "quick".to_string(),
        success,
        counts: Counts {
            passed: 10,
            failed: if success { 0 } else { 2 },
            skipped: 0,
            errors: 0,
        },
        coverage: None,
        lint: Vec::new(),
        suites: Vec::new(),
        warnings: Vec::new(),
    }
}

impl TestGate for FixedGate {
    fn run(&self, _options: &TestOptions) -> Result<TestResult> {
        self.calls.set(self.calls.get() + 1);
        Ok(test_result(self.success))
    }
}

/// Starts a second deployment to the same environment while the first holds the lock.
struct NestedRunGate<'a> {
    dirs: &'a Dirs,
    nested: RefCell<Option<Error>>,
}

impl TestGate for NestedRunGate<'_> {
    fn run(&self, _options: &TestOptions) -> Result<TestResult> {
        let db = FakeDb::with(&[("users", 1)]);
        let store = FakeStore::default();
        let platform = FakePlatform::running(Some("v1"), None);
        let gate = FixedGate::passing();
        let probe = FakeProbe { healthy: true };
        let outcome = deploy(
            self.dirs,
            deps(&db, &store, &platform, &gate, &probe),
            &profile(Environment::Staging),
            request("v3", RunFlags::default()),
        );
        *self.nested.borrow_mut() = outcome.err();
        Ok(test_result(true))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Dirs {
    _root: tempfile::TempDir,
    backups: PathBuf,
    locks: PathBuf,
    runs: PathBuf,
}

impl Dirs {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let backups = root.path().join("backups");
        let locks = root.path().join("locks");
        let runs = root.path().join("runs");
        std::fs::create_dir_all(&backups).unwrap();
        Self {
            _root: root,
            backups,
            locks,
            runs,
        }
    }

    fn backup_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.backups)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

struct Deps<'a> {
    db: &'a FakeDb,
    store: &'a FakeStore,
    platform: &'a dyn Platform,
    gate: &'a dyn TestGate,
    probe: &'a FakeProbe,
    notifier: Option<&'a dyn Notifier>,
    source: &'a dyn SourceTree,
}

/// No notifier, a clean checkout of the release branch.
fn deps<'a>(
    db: &'a FakeDb,
    store: &'a FakeStore,
    platform: &'a dyn Platform,
    gate: &'a dyn TestGate,
    probe: &'a FakeProbe,
) -> Deps<'a> {
    Deps {
        db,
        store,
        platform,
        gate,
        probe,
        notifier: None,
        source: &MAIN,
    }
}

fn profile(environment: Environment) -> EnvironmentProfile {
    EnvironmentProfile {
        environment,
        database: DatabaseTarget {
            host: "db.internal".to_string(),
            port: 5432,
            name: "hub".to_string(),
            user: "hub".to_string(),
            password: None,
        },
        kube_context: None,
        namespace: "hub".to_string(),
        base_url: Some("http://hub.test".to_string()),
    }
}

fn backup_settings(dir: &Path) -> BackupSettings {
    BackupSettings {
        directory: dir.to_path_buf(),
        retention_days: 0,
        s3_prefix: "backups".to_string(),
        passphrase: None,
        encrypt_timeout_secs: 30,
    }
}

fn request(version: &str, flags: RunFlags) -> DeployRequest {
    DeployRequest {
        version: Some(version.to_string()),
        mode: RunMode::Deploy,
        flags,
    }
}

fn deploy(
    dirs: &Dirs,
    deps: Deps<'_>,
    profile: &EnvironmentProfile,
    request: DeployRequest,
) -> Result<DeploymentRun> {
    let engine = BackupEngine::new(deps.db, deps.store, backup_settings(&dirs.backups));
    let settings = ControllerSettings {
        release_branch: "main".to_string(),
        health_path: "/health".to_string(),
        health: RetryPolicy {
            attempts: 2,
            backoff: Duration::ZERO,
        },
        locks_dir: dirs.locks.clone(),
        runs_dir: dirs.runs.clone(),
        test_options: TestOptions::default(),
        backup_options: BackupOptions {
            compress: true,
            ..BackupOptions::default()
        },
    };
    let controller = Controller::new(
        Collaborators {
            source: deps.source,
            tests: deps.gate,
            backups: &engine,
            platform: deps.platform,
            probe: deps.probe,
            notifier: deps.notifier,
        },
        settings,
    );
    controller.run(profile, request)
}

fn stages(run: &serde_json::Value) -> Vec<String> {
    run["transcript"]
        .as_array()
        .map(|records| {
            records
                .iter()
                .filter_map(|r| r["stage"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Backup and restore
// ---------------------------------------------------------------------------

#[test]
fn backup_then_restore_preserves_row_counts() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3), ("exercises", 2)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));
    let profile = profile(Environment::Development);

    let report = engine
        .backup(
            &profile,
            &BackupOptions {
                compress: true,
                ..BackupOptions::default()
            },
        )
        .unwrap();

    let artifact = &report.artifact;
    assert!(artifact.path.exists());
    let name = artifact.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("hub_development_"));
    assert!(name.ends_with(".sql.gz"));

    let meta: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(naming::sidecar_path(&artifact.path)).unwrap(),
    )
    .unwrap();
    assert_eq!(meta["compressed"], true);
    assert_eq!(meta["encrypted"], false);
    assert_eq!(meta["backup_type"], "full");
    assert_eq!(meta["environment"], "development");
    assert_eq!(meta["checksum"], artifact.checksum.as_str());

    db.replace(&[("users", 99), ("junk", 7)]);
    let restored = engine
        .restore(&profile, &artifact.path, Confirm::Forced)
        .unwrap();

    assert!(restored.checksum_verified);
    assert!(restored.metadata_present);
    assert!(restored.reset_schema);
    let tables = db.snapshot();
    assert_eq!(tables.get("users"), Some(&3));
    assert_eq!(tables.get("exercises"), Some(&2));
    assert!(!tables.contains_key("junk"));
}

#[test]
fn denied_restore_never_touches_the_database() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));
    let profile = profile(Environment::Staging);

    let report = engine.backup(&profile, &BackupOptions::default()).unwrap();
    db.replace(&[("users", 5)]);

    let err = engine
        .restore(&profile, &report.artifact.path, Confirm::Deny)
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::RestoreConfirmationDenied);
    assert_eq!(db.restores.get(), 0);
    assert_eq!(db.snapshot().get("users"), Some(&5));
}

#[test]
fn operator_refusal_is_a_denial() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));
    let profile = profile(Environment::Staging);
    let report = engine.backup(&profile, &BackupOptions::default()).unwrap();

    let asked = Cell::new(false);
    let ask = |prompt: &str| -> Result<bool> {
        asked.set(true);
        assert!(prompt.contains("hub"));
        Ok(false)
    };
    let err = engine
        .restore(&profile, &report.artifact.path, Confirm::Ask(&ask))
        .unwrap_err();

    assert!(asked.get());
    assert_eq!(err.code, ErrorCode::RestoreConfirmationDenied);
    assert_eq!(db.restores.get(), 0);
}

#[test]
fn tampered_artifact_is_rejected_before_restore() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));
    let profile = profile(Environment::Staging);
    let report = engine.backup(&profile, &BackupOptions::default()).unwrap();

    std::fs::write(&report.artifact.path, "INSERT users 0\n").unwrap();
    let err = engine
        .restore(&profile, &report.artifact.path, Confirm::Forced)
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::PreconditionFailed);
    assert_eq!(db.restores.get(), 0);
}

#[test]
fn upload_records_remote_uri_for_artifact_and_sidecar() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));

    let report = engine
        .backup(
            &profile(Environment::Production),
            &BackupOptions {
                compress: true,
                remote_bucket: Some("hub-backups".to_string()),
                ..BackupOptions::default()
            },
        )
        .unwrap();

    let uri = report.remote_uri.unwrap();
    assert!(uri.starts_with("s3://hub-backups/backups/production/hub_production_"));
    let uploads = store.uploads.borrow();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[1], format!("{}.meta", uri));
}

#[test]
fn retention_removes_only_artifacts_older_than_the_window() {
    let dirs = Dirs::new();
    let old = "hub_development_20200101_000000.sql.gz";
    let recent = naming::artifact_file_name(
        "hub",
        "development",
        Utc::now() - chrono::Duration::days(1),
        true,
        false,
    );
    let other_env = "hub_staging_20200101_000000.sql.gz";
    let other_db = "billing_development_20200101_000000.sql.gz";
    for name in [old, recent.as_str(), other_env, other_db] {
        std::fs::write(dirs.backups.join(name), "x").unwrap();
    }
    std::fs::write(dirs.backups.join(format!("{}.meta", old)), "{}").unwrap();

    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));
    let report = engine
        .backup(
            &profile(Environment::Development),
            &BackupOptions {
                compress: true,
                retention_days: Some(7),
                ..BackupOptions::default()
            },
        )
        .unwrap();

    assert_eq!(report.retention.retention_days, 7);
    assert_eq!(report.retention.removed_local.len(), 1);
    assert!(report.retention.removed_local[0].ends_with(old));

    let files = dirs.backup_files();
    assert!(!files.contains(&old.to_string()));
    assert!(!files.contains(&format!("{}.meta", old)));
    assert!(files.contains(&recent));
    assert!(files.contains(&other_env.to_string()));
    assert!(files.contains(&other_db.to_string()));
    let fresh = report.artifact.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(files.contains(&fresh));
}

#[test]
fn table_filtered_restore_replaces_only_its_tables() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3), ("exercises", 2)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));
    let profile = profile(Environment::Staging);

    let report = engine
        .backup(
            &profile,
            &BackupOptions {
                tables: vec!["users".to_string()],
                ..BackupOptions::default()
            },
        )
        .unwrap();

    db.replace(&[("users", 40), ("exercises", 9), ("progress", 1)]);
    let restored = engine
        .restore(&profile, &report.artifact.path, Confirm::Forced)
        .unwrap();

    assert!(!restored.reset_schema);
    let tables = db.snapshot();
    assert_eq!(tables.get("users"), Some(&3));
    assert_eq!(tables.get("exercises"), Some(&9));
    assert_eq!(tables.get("progress"), Some(&1));
}

#[test]
fn restore_without_sidecar_still_replays_over_existing_tables() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));
    let profile = profile(Environment::Staging);

    let report = engine.backup(&profile, &BackupOptions::default()).unwrap();
    std::fs::remove_file(naming::sidecar_path(&report.artifact.path)).unwrap();
    db.replace(&[("users", 8), ("sessions", 4)]);

    let restored = engine
        .restore(&profile, &report.artifact.path, Confirm::Forced)
        .unwrap();

    assert!(!restored.metadata_present);
    assert!(restored.mode.is_none());
    assert_eq!(db.snapshot().get("users"), Some(&3));
    assert_eq!(db.snapshot().get("sessions"), Some(&4));
}

#[test]
fn contradictory_table_filters_are_rejected_before_dumping() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));
    let profile = profile(Environment::Staging);

    let err = engine
        .backup(
            &profile,
            &BackupOptions {
                tables: vec!["users".to_string()],
                exclude: vec!["users".to_string()],
                ..BackupOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PreconditionFailed);
    assert_eq!(err.details["tables"][0], "users");

    let err = engine
        .backup(
            &profile,
            &BackupOptions {
                tables: vec!["users".to_string()],
                exclude: vec!["audit_log".to_string()],
                ..BackupOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    assert!(dirs.backup_files().is_empty());
}

#[test]
fn missing_dump_tool_fails_before_connecting() {
    let dirs = Dirs::new();
    let db = FakeDb {
        tools: vec!["nonexistent_pg_dump_xyz"],
        ..FakeDb::with(&[("users", 3)])
    };
    db.offline.set(true);
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));

    let err = engine
        .backup(&profile(Environment::Staging), &BackupOptions::default())
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::ToolingUnavailable);
    assert_eq!(err.details["tools"][0], "nonexistent_pg_dump_xyz");
    assert!(dirs.backup_files().is_empty());
}

#[test]
fn failed_dump_leaves_no_partial_artifact() {
    let dirs = Dirs::new();
    let db = FakeDb {
        broken_dump: true,
        ..FakeDb::with(&[("users", 3), ("exercises", 2)])
    };
    let store = FakeStore::default();
    let engine = BackupEngine::new(&db, &store, backup_settings(&dirs.backups));

    let err = engine
        .backup(
            &profile(Environment::Staging),
            &BackupOptions {
                compress: true,
                ..BackupOptions::default()
            },
        )
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::BackupFailed);
    assert!(dirs.backup_files().is_empty());
}

#[test]
fn encrypted_backup_round_trips_without_plaintext_on_disk() {
    if command::which("gpg").is_none() {
        return;
    }
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3), ("exercises", 2)]);
    let store = FakeStore::default();
    let settings = BackupSettings {
        passphrase: Some("correct horse battery".to_string()),
        ..backup_settings(&dirs.backups)
    };
    let engine = BackupEngine::new(&db, &store, settings);
    let profile = profile(Environment::Production);

    let report = engine
        .backup(
            &profile,
            &BackupOptions {
                compress: true,
                encrypt: true,
                ..BackupOptions::default()
            },
        )
        .unwrap();

    let name = report.artifact.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.ends_with(".sql.gz.gpg"));
    assert_eq!(dirs.backup_files(), vec![name.clone(), format!("{}.meta", name)]);
    let raw = std::fs::read(&report.artifact.path).unwrap();
    assert!(!String::from_utf8_lossy(&raw).contains("INSERT users"));

    db.replace(&[("users", 50)]);
    let restored = engine
        .restore(&profile, &report.artifact.path, Confirm::Forced)
        .unwrap();
    assert!(restored.pipeline.encrypted);
    assert_eq!(db.snapshot().get("users"), Some(&3));
    assert_eq!(db.snapshot().get("exercises"), Some(&2));
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

#[test]
fn successful_deploy_visits_every_stage_and_leaves_an_anchor() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), Some(&db));
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: true };
    let notifier = RecordingNotifier::default();

    let run = deploy(
        &dirs,
        Deps {
            notifier: Some(&notifier),
            ..deps(&db, &store, &platform, &gate, &probe)
        },
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        run.visited(),
        vec![
            Stage::Validating,
            Stage::Testing,
            Stage::BackingUp,
            Stage::Building,
            Stage::Deploying,
            Stage::Migrating,
            Stage::HealthChecking,
            Stage::Notifying,
            Stage::Cleaning,
            Stage::Done,
        ]
    );
    assert_eq!(run.previous_version.as_deref(), Some("v1"));
    assert!(run.backup_anchor.as_ref().unwrap().path.exists());
    assert_eq!(platform.deployed.borrow().as_deref(), Some("v2"));
    assert!(!lock::is_locked(&dirs.locks, "staging"));
    assert!(dirs.runs.join(format!("{}.json", run.run_id)).exists());
    let seen = notifier.seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("Deployment of v2 to staging succeeded"));
}

#[test]
fn notification_failure_does_not_fail_the_run() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), None);
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: true };
    let notifier = RecordingNotifier {
        fail: true,
        ..RecordingNotifier::default()
    };

    let run = deploy(
        &dirs,
        Deps {
            notifier: Some(&notifier),
            ..deps(&db, &store, &platform, &gate, &probe)
        },
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.warnings.iter().any(|w| w.contains("Notification failed")));
}

#[test]
fn failing_tests_stop_before_backup() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), None);
    let gate = FixedGate::failing();
    let probe = FakeProbe { healthy: true };

    let err = deploy(
        &dirs,
        deps(&db, &store, &platform, &gate, &probe),
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap_err();

    assert_eq!(err.code, ErrorCode::TestFailed);
    assert_eq!(err.details["stage"], "testing");
    assert_eq!(err.details["rollback"]["attempted"], false);
    let run = &err.details["run"];
    assert_eq!(run["status"], "failed");
    assert!(!stages(run).contains(&"backing_up".to_string()));
    assert!(dirs.backup_files().is_empty());
    assert!(platform.calls.borrow().is_empty());
    assert!(!lock::is_locked(&dirs.locks, "staging"));
}

#[test]
fn health_failure_restores_database_and_previous_version() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3), ("exercises", 2)]);
    let before = db.snapshot();
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), Some(&db));
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: false };

    let err = deploy(
        &dirs,
        deps(&db, &store, &platform, &gate, &probe),
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap_err();

    assert_eq!(err.code, ErrorCode::DeployHealthCheckFailed);
    assert_eq!(err.details["stage"], "health_checking");
    assert_eq!(err.details["rollback"]["attempted"], true);
    assert_eq!(err.details["rollback"]["outcome"]["reverted_to"], "v1");
    assert_eq!(err.details["run"]["status"], "rolled-back");
    assert_eq!(err.details["run"]["failed_stage"], "health_checking");

    assert_eq!(platform.deployed.borrow().as_deref(), Some("v1"));
    assert_eq!(db.restores.get(), 1);
    assert_eq!(db.snapshot(), before);
    assert!(!lock::is_locked(&dirs.locks, "staging"));
}

#[test]
fn forced_health_failure_is_only_a_warning() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), None);
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: false };

    let run = deploy(
        &dirs,
        deps(&db, &store, &platform, &gate, &probe),
        &profile(Environment::Staging),
        request(
            "v2",
            RunFlags {
                force: true,
                ..RunFlags::default()
            },
        ),
    )
    .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.warnings.iter().any(|w| w.contains("Health check failed")));
    assert_eq!(platform.deployed.borrow().as_deref(), Some("v2"));
}

#[test]
fn concurrent_run_on_same_environment_is_refused() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), None);
    let gate = NestedRunGate {
        dirs: &dirs,
        nested: RefCell::new(None),
    };
    let probe = FakeProbe { healthy: true };

    let run = deploy(
        &dirs,
        deps(&db, &store, &platform, &gate, &probe),
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap();

    let nested = gate.nested.borrow_mut().take().unwrap();
    assert_eq!(nested.code, ErrorCode::DeployAlreadyDeploying);
    assert_eq!(nested.details["holder"]["run_id"], run.run_id.as_str());

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(platform.deployed.borrow().as_deref(), Some("v2"));
    assert!(!lock::is_locked(&dirs.locks, "staging"));
}

#[test]
fn dry_run_plans_every_stage_without_mutation() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), Some(&db));
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: false };

    let run = deploy(
        &dirs,
        deps(&db, &store, &platform, &gate, &probe),
        &profile(Environment::Staging),
        request(
            "v2",
            RunFlags {
                dry_run: true,
                ..RunFlags::default()
            },
        ),
    )
    .unwrap();

    let visited = run.visited();
    for stage in [
        Stage::Validating,
        Stage::Testing,
        Stage::BackingUp,
        Stage::Building,
        Stage::Deploying,
        Stage::Migrating,
        Stage::HealthChecking,
    ] {
        assert!(visited.contains(&stage), "{} not visited", stage);
    }
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(gate.calls.get(), 0);
    assert!(platform.calls.borrow().is_empty());
    assert_eq!(platform.deployed.borrow().as_deref(), Some("v1"));
    assert!(dirs.backup_files().is_empty());
    assert!(!db.snapshot().contains_key("schema_migrations"));
}

#[test]
fn rollback_mode_reapplies_the_requested_version() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v2"), Some(&db));
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: true };

    let run = deploy(
        &dirs,
        deps(&db, &store, &platform, &gate, &probe),
        &profile(Environment::Staging),
        DeployRequest {
            version: Some("v1".to_string()),
            mode: RunMode::Rollback,
            flags: RunFlags::default(),
        },
    )
    .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(gate.calls.get(), 0);
    assert_eq!(platform.deployed.borrow().as_deref(), Some("v1"));
    assert_eq!(*platform.calls.borrow(), vec!["apply v1".to_string(), "prune".to_string()]);
    assert!(dirs.backup_files().is_empty());
}

#[test]
fn unreachable_database_fails_the_backup_stage() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    db.offline.set(true);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), Some(&db));
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: true };

    let err = deploy(
        &dirs,
        deps(&db, &store, &platform, &gate, &probe),
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap_err();

    assert_eq!(err.code, ErrorCode::BackupFailed);
    assert_eq!(err.code.exit_code(), 5);
    assert_eq!(err.details["cause"]["code"], "database.connection_failed");
    assert_eq!(err.details["stage"], "backing_up");
    assert_eq!(err.details["run"]["status"], "failed");
    assert!(platform.calls.borrow().is_empty());
    assert!(!lock::is_locked(&dirs.locks, "staging"));
}

#[test]
fn forced_deploy_continues_without_a_backup_anchor() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    db.offline.set(true);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), None);
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: true };

    let run = deploy(
        &dirs,
        deps(&db, &store, &platform, &gate, &probe),
        &profile(Environment::Staging),
        request(
            "v2",
            RunFlags {
                force: true,
                ..RunFlags::default()
            },
        ),
    )
    .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.backup_anchor.is_none());
    assert!(run.warnings.iter().any(|w| w.contains("without a rollback anchor")));
    assert_eq!(platform.deployed.borrow().as_deref(), Some("v2"));
}

#[test]
fn failed_revert_is_a_rollback_failure() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let before = db.snapshot();
    let store = FakeStore::default();
    let platform = FakePlatform {
        broken: Some("v1"),
        ..FakePlatform::running(Some("v1"), Some(&db))
    };
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: false };
    let notifier = RecordingNotifier::default();

    let err = deploy(
        &dirs,
        Deps {
            notifier: Some(&notifier),
            ..deps(&db, &store, &platform, &gate, &probe)
        },
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap_err();

    assert_eq!(err.code, ErrorCode::DeployRollbackFailed);
    assert_eq!(err.code.exit_code(), 7);
    assert_eq!(err.details["trigger"]["code"], "deploy.health_check_failed");
    assert_eq!(err.details["stage"], "health_checking");
    assert_eq!(err.details["run"]["status"], "failed");
    let outcome = &err.details["rollback"]["outcome"];
    assert_eq!(outcome["succeeded"], false);
    assert!(outcome["restored_backup"].is_string());

    // The database came back even though the revert did not.
    assert_eq!(db.snapshot(), before);
    assert_eq!(platform.deployed.borrow().as_deref(), Some("v2"));
    assert!(!lock::is_locked(&dirs.locks, "staging"));
    let seen = notifier.seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("failed"));
}

#[test]
fn rolled_back_run_is_announced() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), Some(&db));
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: false };
    let notifier = RecordingNotifier {
        fail: true,
        ..RecordingNotifier::default()
    };

    let err = deploy(
        &dirs,
        Deps {
            notifier: Some(&notifier),
            ..deps(&db, &store, &platform, &gate, &probe)
        },
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap_err();

    assert_eq!(err.code, ErrorCode::DeployHealthCheckFailed);
    assert_eq!(err.details["run"]["status"], "rolled-back");
    let seen = notifier.seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("rolled back"));
    let warnings = err.details["run"]["warnings"].as_array().unwrap();
    assert!(warnings
        .iter()
        .any(|w| w.as_str().unwrap_or("").contains("Notification failed")));
}

#[test]
fn production_requires_a_clean_release_branch() {
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), None);
    let gate = FixedGate::passing();
    let probe = FakeProbe { healthy: true };
    let notifier = RecordingNotifier::default();
    let dirty = FakeSource {
        clean: false,
        branch: "main",
    };
    let feature = FakeSource {
        clean: true,
        branch: "feature/login",
    };

    for (source, needle) in [(&dirty, "uncommitted"), (&feature, "feature/login")] {
        let dirs = Dirs::new();
        let err = deploy(
            &dirs,
            Deps {
                source,
                notifier: Some(&notifier),
                ..deps(&db, &store, &platform, &gate, &probe)
            },
            &profile(Environment::Production),
            request("v2", RunFlags::default()),
        )
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::PreconditionFailed);
        assert!(err.message.contains(needle), "{}", err.message);
        assert_eq!(err.details["stage"], "validating");
        assert!(!lock::is_locked(&dirs.locks, "production"));
    }
    assert_eq!(gate.calls.get(), 0);
    assert!(platform.calls.borrow().is_empty());
    assert!(notifier.seen.borrow().is_empty());

    // Staging does not care about the checkout.
    let dirs = Dirs::new();
    let run = deploy(
        &dirs,
        Deps {
            source: &dirty,
            ..deps(&db, &store, &platform, &gate, &probe)
        },
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[test]
fn failed_test_gate_is_announced() {
    let dirs = Dirs::new();
    let db = FakeDb::with(&[("users", 3)]);
    let store = FakeStore::default();
    let platform = FakePlatform::running(Some("v1"), None);
    let gate = FixedGate::failing();
    let probe = FakeProbe { healthy: true };
    let notifier = RecordingNotifier::default();

    let err = deploy(
        &dirs,
        Deps {
            notifier: Some(&notifier),
            ..deps(&db, &store, &platform, &gate, &probe)
        },
        &profile(Environment::Staging),
        request("v2", RunFlags::default()),
    )
    .unwrap_err();

    assert_eq!(err.code, ErrorCode::TestFailed);
    let seen = notifier.seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("failed"));
}
