//! Test orchestration: lint gate, suite selection, sharding and ephemeral services.

pub mod report;
pub mod services;

use serde::Serialize;
use std::path::PathBuf;
use std::thread;

use crate::config::{HubConfig, TestsConfig};
use crate::error::{Error, Result};
use crate::utils::command::{self, ProcessOutput, ProcessSpec};

pub use report::Counts;
use services::{AppInstance, DatabaseContainer};

/// Which tests to run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TestScope {
    #[default]
    Quick,
    Unit,
    Integration,
    Browser,
    Path(String),
}

impl TestScope {
    pub fn as_str(&self) -> &str {
        match self {
            TestScope::Quick => "quick",
            TestScope::Unit => "unit",
            TestScope::Integration => "integration",
            TestScope::Browser => "browser",
            TestScope::Path(path) => path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    pub scope: TestScope,
    pub coverage: bool,
    pub parallel: bool,
    pub verbose: bool,
    pub lint: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LintCheck {
    pub name: String,
    pub command: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteRun {
    pub command: String,
    pub exit_code: i32,
    pub counts: Counts,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub scope: String,
    pub success: bool,
    pub counts: Counts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lint: Vec<LintCheck>,
    pub suites: Vec<SuiteRun>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// The test gate as seen by the deployment controller.
pub trait TestGate {
    /// `Ok` with `success: false` when tests ran and failed; `Err` when they
    /// could not run or the lint gate rejected the tree.
    fn run(&self, options: &TestOptions) -> Result<TestResult>;
}

pub struct TestOrchestrator {
    config: TestsConfig,
    timeout_secs: u64,
    working_dir: Option<PathBuf>,
}

impl TestOrchestrator {
    pub fn new(config: &HubConfig) -> Self {
        let working_dir = config
            .tests
            .working_dir
            .as_ref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).to_string()));
        Self {
            config: config.tests.clone(),
            timeout_secs: config.timeouts.test_secs,
            working_dir,
        }
    }

    /// Run every lint check; fail with `test.lint_failed` if any of them did.
    fn lint(&self) -> Result<Vec<LintCheck>> {
        let mut checks = Vec::new();
        for lint in &self.config.lint {
            let Some((program, args)) = lint.command.split_first() else {
                continue;
            };
            let spec = self.spec(program, args.iter().cloned());
            log_status!("lint", "{}", spec.display());
            let output = command::execute(&spec)?;
            checks.push(LintCheck {
                name: lint.name.clone(),
                command: spec.display(),
                passed: output.success,
                output: if output.success {
                    String::new()
                } else {
                    output.error_text()
                },
            });
        }

        let failed: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect();
        if !failed.is_empty() {
            return Err(Error::lint_failed(failed).with_context("checks", &checks));
        }
        Ok(checks)
    }

    fn spec<I>(&self, program: &str, args: I) -> ProcessSpec
    where
        I: IntoIterator<Item = String>,
    {
        let mut spec = ProcessSpec::new(program)
            .args(args)
            .timeout_secs(self.timeout_secs);
        if let Some(dir) = &self.working_dir {
            spec = spec.current_dir(dir);
        }
        spec
    }

    /// Runner argument lists for the requested scope: one per shard, or a single one.
    fn invocations(&self, options: &TestOptions, warnings: &mut Vec<String>) -> Vec<Vec<String>> {
        let sharded = options.parallel
            && matches!(options.scope, TestScope::Unit | TestScope::Quick)
            && !self.config.unit_shards.is_empty();

        let mut flags = Vec::new();
        if options.verbose {
            flags.extend(self.config.verbose_args.iter().cloned());
        }
        if options.coverage {
            if sharded {
                warnings.push(
                    "Coverage is not collected for sharded runs; run without --parallel for a coverage figure"
                        .to_string(),
                );
            } else {
                flags.extend(self.config.coverage_args.iter().cloned());
            }
        }

        if sharded {
            return self
                .config
                .unit_shards
                .iter()
                .map(|shard| {
                    let mut args = vec![shard.clone()];
                    args.extend(flags.iter().cloned());
                    args
                })
                .collect();
        }

        let mut args: Vec<String> = match &options.scope {
            TestScope::Quick => self.config.quick_args.clone(),
            TestScope::Unit => self.config.unit_paths.clone(),
            TestScope::Integration => self.config.integration_paths.clone(),
            TestScope::Browser => self.config.browser_paths.clone(),
            TestScope::Path(path) => vec![path.clone()],
        };
        if options.parallel {
            args.extend(self.config.parallel_args.iter().cloned());
        }
        args.extend(flags);
        vec![args]
    }

    fn runner_spec(&self, args: Vec<String>, env: &[(String, String)]) -> Result<ProcessSpec> {
        let (program, base) = self
            .config
            .runner
            .split_first()
            .ok_or_else(|| Error::config_invalid_value("tests.runner", None, "runner command must not be empty"))?;
        let mut spec = self.spec(program, base.iter().cloned().chain(args));
        for (key, value) in env {
            spec = spec.env(key.clone(), value.clone());
        }
        Ok(spec)
    }

    /// Start the services a scope needs; returned guards must outlive the suite.
    fn start_services(&self, scope: &TestScope) -> Result<ServiceGuards> {
        let mut guards = ServiceGuards::default();
        match scope {
            TestScope::Integration => {
                let db = DatabaseContainer::start(&self.config.database_service)?;
                guards.env.push(("DATABASE_URL".to_string(), db.url().to_string()));
                guards.env.push(("TEST_DATABASE_URL".to_string(), db.url().to_string()));
                guards._database = Some(db);
            }
            TestScope::Browser => {
                let app = AppInstance::start(&self.config.app_service, self.working_dir.as_deref())?;
                guards.env.push(("BASE_URL".to_string(), app.url().to_string()));
                guards.env.push(("APP_URL".to_string(), app.url().to_string()));
                guards._app = Some(app);
            }
            _ => {}
        }
        Ok(guards)
    }
}

#[derive(Default)]
struct ServiceGuards {
    _database: Option<DatabaseContainer>,
    _app: Option<AppInstance>,
    env: Vec<(String, String)>,
}

fn failed_tests(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("FAILED "))
        .map(|rest| rest.split(" - ").next().unwrap_or(rest).trim().to_string())
        .collect()
}

fn suite_run(spec: &ProcessSpec, output: &ProcessOutput) -> SuiteRun {
    SuiteRun {
        command: spec.display(),
        exit_code: output.exit_code,
        counts: report::parse_counts(&output.stdout),
        failures: failed_tests(&output.stdout),
    }
}

/// Run shard invocations concurrently, one thread each.
fn execute_batch(specs: Vec<ProcessSpec>) -> Result<Vec<(ProcessSpec, ProcessOutput)>> {
    if specs.len() <= 1 {
        return specs
            .into_iter()
            .map(|spec| command::execute(&spec).map(|output| (spec, output)))
            .collect();
    }

    let handles: Vec<_> = specs
        .into_iter()
        .map(|spec| {
            thread::spawn(move || {
                let output = command::execute(&spec)?;
                Ok::<_, Error>((spec, output))
            })
        })
        .collect();

    // Every shard is joined before any error surfaces, so none outlives the call.
    let joined: Vec<Result<(ProcessSpec, ProcessOutput)>> = handles
        .into_iter()
        .map(|handle| {
            handle
                .join()
                .map_err(|_| Error::internal_unexpected("Test shard thread panicked"))?
        })
        .collect();
    joined.into_iter().collect()
}

impl TestGate for TestOrchestrator {
    fn run(&self, options: &TestOptions) -> Result<TestResult> {
        let lint = if options.lint { self.lint()? } else { Vec::new() };

        let mut warnings = Vec::new();
        let invocations = self.invocations(options, &mut warnings);

        let guards = self.start_services(&options.scope)?;
        let specs = invocations
            .into_iter()
            .map(|args| self.runner_spec(args, &guards.env))
            .collect::<Result<Vec<_>>>()?;

        log_status!(
            "test",
            "Running {} tests ({} invocation{})",
            options.scope.as_str(),
            specs.len(),
            if specs.len() == 1 { "" } else { "s" }
        );
        let outcomes = execute_batch(specs);
        drop(guards);
        let outcomes = outcomes?;

        let mut counts = Counts::default();
        let mut suites = Vec::with_capacity(outcomes.len());
        let mut coverage = None;
        for (spec, output) in &outcomes {
            let suite = suite_run(spec, output);
            counts.add(suite.counts);
            if options.coverage && outcomes.len() == 1 {
                coverage = report::parse_coverage(&output.stdout);
            }
            suites.push(suite);
        }
        let success = outcomes.iter().all(|(_, output)| output.success);

        log_status!(
            "test",
            "{}: {} passed, {} failed, {} skipped",
            if success { "Passed" } else { "Failed" },
            counts.passed,
            counts.failed,
            counts.skipped
        );

        Ok(TestResult {
            scope: options.scope.as_str().to_string(),
            success,
            counts,
            coverage,
            lint,
            suites,
            warnings,
        })
    }
}
