//! Image build/publish and cluster operations.

use crate::config::{DeployConfig, TimeoutsConfig};
use crate::environment::EnvironmentProfile;
use crate::error::{Error, ErrorCode, Result};
use crate::utils::command::{self, ProcessSpec};

/// Where deployable artifacts are built, stored and run.
pub trait Platform {
    fn required_tools(&self) -> Vec<&'static str>;

    /// Build and tag the image for `version`.
    fn build(&self, version: &str) -> Result<()>;

    /// Push the tagged image to the registry.
    fn publish(&self, version: &str) -> Result<()>;

    /// Version currently running in the environment, if it can be determined.
    fn current_version(&self, profile: &EnvironmentProfile) -> Result<Option<String>>;

    /// Point the environment at `version` and wait for the rollout.
    fn apply(&self, profile: &EnvironmentProfile, version: &str) -> Result<()>;

    /// Run schema migrations as a one-off job using `version`'s image.
    fn migrate(&self, profile: &EnvironmentProfile, version: &str) -> Result<()>;

    /// Remove stale local build artifacts; returns what was removed.
    fn prune(&self) -> Result<Vec<String>>;
}

/// Docker for images, kubectl for the cluster.
pub struct KubePlatform {
    deploy: DeployConfig,
    timeouts: TimeoutsConfig,
}

/// Keep interrupts and missing tools as they are; everything else is a stage failure.
fn as_stage_failure(err: Error, code: ErrorCode, message: String) -> Error {
    match err.code {
        ErrorCode::ProcessInterrupted | ErrorCode::ToolingUnavailable => err,
        _ => err.reclassify(code, message),
    }
}

/// Tag portion of an image reference (`registry:5000/app:v1` → `v1`).
pub fn image_tag(image: &str) -> Option<&str> {
    let (_, tag) = image.rsplit_once(':')?;
    (!tag.is_empty() && !tag.contains('/')).then_some(tag)
}

impl KubePlatform {
    pub fn new(deploy: DeployConfig, timeouts: TimeoutsConfig) -> Self {
        Self { deploy, timeouts }
    }

    fn kubectl(&self, profile: &EnvironmentProfile) -> ProcessSpec {
        let mut spec = ProcessSpec::new("kubectl");
        if let Some(context) = &profile.kube_context {
            spec = spec.arg("--context").arg(context);
        }
        spec.arg("--namespace").arg(&profile.namespace)
    }

    fn deployment_ref(&self) -> String {
        format!("deployment/{}", self.deploy.deployment)
    }

    /// One-off pod that the cluster itself kills once the migration timeout passes.
    fn migration_spec(&self, profile: &EnvironmentProfile, version: &str, job: &str) -> ProcessSpec {
        let mut spec = self
            .kubectl(profile)
            .args(["run", job, "--restart=Never", "--rm", "-i", "--quiet"])
            .arg(format!("--image={}", self.deploy.image_ref(version)));
        if self.timeouts.migration_secs > 0 {
            let overrides = serde_json::json!({
                "apiVersion": "v1",
                "spec": { "activeDeadlineSeconds": self.timeouts.migration_secs },
            });
            spec = spec.arg(format!("--overrides={}", overrides));
        }
        spec.args(["--command", "--"])
            .args(migration_args(&self.deploy.migration_command, profile))
            .timeout_secs(self.timeouts.migration_secs)
    }

    fn delete_pod(&self, profile: &EnvironmentProfile, job: &str) {
        let spec = self
            .kubectl(profile)
            .args(["delete", "pod", job, "--ignore-not-found", "--wait=false"])
            .timeout_secs(30)
            .cleanup();
        log_status!("migrate", "Deleting migration pod {}", job);
        match command::execute(&spec) {
            Ok(output) if output.success => {}
            Ok(output) => log_status!("migrate", "Could not delete pod {}: {}", job, output.error_text()),
            Err(e) => log_status!("migrate", "Could not delete pod {}: {}", job, e.message),
        }
    }
}

/// Migration command with `{environment}` filled in, so the job migrates the
/// database of the environment being deployed.
pub fn migration_args(command: &[String], profile: &EnvironmentProfile) -> Vec<String> {
    command
        .iter()
        .map(|arg| arg.replace("{environment}", profile.environment.as_str()))
        .collect()
}

impl Platform for KubePlatform {
    fn required_tools(&self) -> Vec<&'static str> {
        vec!["docker", "kubectl"]
    }

    fn build(&self, version: &str) -> Result<()> {
        let image = self.deploy.image_ref(version);
        let spec = ProcessSpec::new("docker")
            .args(["build", "-t"])
            .arg(&image)
            .arg("--label")
            .arg(format!("hubctl.version={}", version))
            .arg(&self.deploy.build_context)
            .timeout_secs(self.timeouts.build_secs);
        log_status!("build", "Building {}", image);
        command::execute_checked(&spec).map_err(|e| {
            as_stage_failure(e, ErrorCode::DeployBuildFailed, format!("Build of {} failed", image))
        })?;
        Ok(())
    }

    fn publish(&self, version: &str) -> Result<()> {
        let image = self.deploy.image_ref(version);
        let spec = ProcessSpec::new("docker")
            .arg("push")
            .arg(&image)
            .timeout_secs(self.timeouts.publish_secs);
        log_status!("build", "Publishing {}", image);
        command::execute_checked(&spec).map_err(|e| {
            as_stage_failure(e, ErrorCode::DeployBuildFailed, format!("Publishing {} failed", image))
        })?;
        Ok(())
    }

    fn current_version(&self, profile: &EnvironmentProfile) -> Result<Option<String>> {
        let jsonpath = format!(
            "jsonpath={{.spec.template.spec.containers[?(@.name==\"{}\")].image}}",
            self.deploy.container
        );
        let spec = self
            .kubectl(profile)
            .args(["get", "deployment"])
            .arg(&self.deploy.deployment)
            .arg("-o")
            .arg(jsonpath)
            .timeout_secs(self.timeouts.probe_secs.max(30));
        let output = command::execute(&spec)?;
        if !output.success {
            if output.stderr.contains("NotFound") {
                return Ok(None);
            }
            return Err(as_stage_failure(
                Error::command_failed(output.failure_details(&spec)),
                ErrorCode::DeployApplyFailed,
                "Could not read the deployed version".to_string(),
            ));
        }
        Ok(image_tag(output.stdout.trim()).map(str::to_string))
    }

    fn apply(&self, profile: &EnvironmentProfile, version: &str) -> Result<()> {
        let image = self.deploy.image_ref(version);
        let set_image = self
            .kubectl(profile)
            .args(["set", "image"])
            .arg(self.deployment_ref())
            .arg(format!("{}={}", self.deploy.container, image))
            .timeout_secs(self.timeouts.apply_secs);
        let failure = |e: Error| {
            as_stage_failure(
                e,
                ErrorCode::DeployApplyFailed,
                format!("Applying {} to {} failed", image, profile.environment),
            )
        };
        log_status!("deploy", "Setting {} to {}", self.deployment_ref(), image);
        command::execute_checked(&set_image).map_err(failure)?;

        let rollout = self
            .kubectl(profile)
            .args(["rollout", "status"])
            .arg(self.deployment_ref())
            .arg(format!("--timeout={}s", self.timeouts.apply_secs))
            .timeout_secs(self.timeouts.apply_secs + 30);
        command::execute_checked(&rollout).map_err(failure)?;
        Ok(())
    }

    fn migrate(&self, profile: &EnvironmentProfile, version: &str) -> Result<()> {
        let job = format!(
            "{}-migrate-{}",
            self.deploy.deployment,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let spec = self.migration_spec(profile, version, &job);
        log_status!("migrate", "Running migration job {}", job);
        let result = command::execute_checked(&spec);
        if result.is_err() {
            // The local client dying does not stop the pod.
            self.delete_pod(profile, &job);
        }
        result.map_err(|e| {
            as_stage_failure(
                e,
                ErrorCode::DeployMigrationFailed,
                format!("Migration job {} failed", job),
            )
        })?;
        Ok(())
    }

    fn prune(&self) -> Result<Vec<String>> {
        let spec = ProcessSpec::new("docker")
            .args(["image", "prune", "-f", "--filter", "label=hubctl.version"])
            .timeout_secs(self.timeouts.apply_secs);
        let output = command::execute_checked(&spec)?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("deleted: "))
            .map(str::to_string)
            .collect())
    }
}
