//! Ephemeral services scoped to one test invocation.
//!
//! Each service is a guard: dropping it tears the service down, so every exit
//! path (failure, timeout, interrupt) cleans up.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{AppServiceConfig, ServiceConfig};
use crate::error::{Error, Result};
use crate::interrupt;
use crate::utils::command::{self, ProcessSpec};
use crate::utils::http;

const READY_POLL: Duration = Duration::from_millis(500);
const DOCKER_TIMEOUT_SECS: u64 = 120;
const REMOVE_TIMEOUT_SECS: u64 = 30;

/// A throwaway PostgreSQL container.
pub struct DatabaseContainer {
    id: String,
    url: String,
}

impl DatabaseContainer {
    pub fn start(config: &ServiceConfig) -> Result<Self> {
        command::require_tools(&["docker"])?;

        let mut spec = ProcessSpec::new("docker")
            .args(["run", "-d", "--rm", "-p"])
            .arg(format!("{}:{}", config.port, config.container_port));
        for (key, value) in &config.env {
            spec = spec.arg("-e").arg(format!("{}={}", key, value));
        }
        let spec = spec.arg(&config.image).timeout_secs(DOCKER_TIMEOUT_SECS);

        log_status!("test", "Starting database container ({})", config.image);
        let output = command::execute_checked(&spec)?;
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(Error::test_failed(
                "docker run returned no container id",
                serde_json::json!({ "image": config.image }),
            ));
        }

        let user = config.env.get("POSTGRES_USER").map(String::as_str).unwrap_or("postgres");
        let password = config.env.get("POSTGRES_PASSWORD").map(String::as_str).unwrap_or("");
        let database = config.env.get("POSTGRES_DB").map(String::as_str).unwrap_or(user);
        let container = Self {
            id,
            url: format!(
                "postgresql://{}:{}@localhost:{}/{}",
                user, password, config.port, database
            ),
        };

        container.wait_ready(user, config.ready_timeout_secs)?;
        Ok(container)
    }

    fn wait_ready(&self, user: &str, timeout_secs: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            interrupt::check("database container startup")?;
            let probe = ProcessSpec::new("docker")
                .args(["exec", self.id.as_str(), "pg_isready", "-U", user])
                .timeout_secs(10);
            if command::execute(&probe).map(|o| o.success).unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::process_timeout("database container readiness", timeout_secs));
            }
            thread::sleep(READY_POLL);
        }
    }

    /// Connection URL exported to the test runner.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for DatabaseContainer {
    fn drop(&mut self) {
        let spec = removal_spec(&self.id);
        match command::execute(&spec) {
            Ok(output) if output.success => {
                log_status!("test", "Removed database container {}", short_id(&self.id))
            }
            Ok(output) => log_status!(
                "test",
                "Could not remove container {}: {}",
                short_id(&self.id),
                output.error_text()
            ),
            Err(e) => log_status!(
                "test",
                "Could not remove container {}: {}",
                short_id(&self.id),
                e.message
            ),
        }
    }
}

/// Bounded teardown that still runs once an interrupt has arrived.
fn removal_spec(id: &str) -> ProcessSpec {
    ProcessSpec::new("docker")
        .args(["rm", "-f", id])
        .timeout_secs(REMOVE_TIMEOUT_SECS)
        .cleanup()
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// A local application instance for browser tests.
pub struct AppInstance {
    child: Child,
    url: String,
}

impl AppInstance {
    pub fn start(config: &AppServiceConfig, working_dir: Option<&std::path::Path>) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| Error::config_invalid_value("tests.app_service.command", None, "empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("PORT", config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        log_status!("test", "Starting application on port {}", config.port);
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::tooling_unavailable(vec![program.clone()])
            } else {
                Error::internal_io(e.to_string(), Some("start application".to_string()))
            }
        })?;

        let mut instance = Self {
            child,
            url: format!("http://127.0.0.1:{}", config.port),
        };
        instance.wait_ready(&config.ready_path, config.ready_timeout_secs)?;
        Ok(instance)
    }

    fn wait_ready(&mut self, path: &str, timeout_secs: u64) -> Result<()> {
        let client = http::client(5)?;
        let url = http::join_url(&self.url, path);
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            interrupt::check("application startup")?;
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(Error::test_failed(
                    format!("Application exited during startup ({})", status),
                    serde_json::json!({ "url": url }),
                ));
            }
            if matches!(http::get_status(&client, &url), Ok(code) if http::is_success(code)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::process_timeout(&format!("readiness of {}", url), timeout_secs));
            }
            thread::sleep(READY_POLL);
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for AppInstance {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        log_status!("test", "Stopped application at {}", self.url);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn app_that_exits_early_fails_startup() {
        let config = AppServiceConfig {
            command: vec!["false".to_string()],
            port: 5999,
            env: Default::default(),
            ready_path: "/health".to_string(),
            ready_timeout_secs: 5,
        };
        let err = AppInstance::start(&config, None).err().unwrap();
        assert_eq!(err.code.as_str(), "test.failed");
    }

    #[test]
    fn missing_app_binary_is_tooling_error() {
        let config = AppServiceConfig {
            command: vec!["nonexistent_app_xyz".to_string()],
            port: 5998,
            env: Default::default(),
            ready_path: "/health".to_string(),
            ready_timeout_secs: 1,
        };
        let err = AppInstance::start(&config, None).err().unwrap();
        assert_eq!(err.code.as_str(), "tooling.unavailable");
    }

    #[test]
    fn container_removal_is_bounded_and_survives_interrupts() {
        let spec = removal_spec("0123456789abcdef");
        assert_eq!(spec.args, vec!["rm", "-f", "0123456789abcdef"]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(REMOVE_TIMEOUT_SECS)));
        assert!(spec.cleanup);
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
