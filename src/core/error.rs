use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalidJson,
    ConfigInvalidValue,

    ValidationMissingArgument,
    ValidationInvalidArgument,

    PreconditionFailed,
    ToolingUnavailable,
    DatabaseConnectionFailed,

    TestFailed,
    TestLintFailed,

    BackupFailed,
    BackupFileNotFound,
    RestoreConfirmationDenied,
    RestoreExecutionFailed,

    DeployBuildFailed,
    DeployApplyFailed,
    DeployMigrationFailed,
    DeployHealthCheckFailed,
    DeployRollbackFailed,
    DeployAlreadyDeploying,

    ProcessTimeout,
    ProcessInterrupted,
    CommandFailed,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::PreconditionFailed => "precondition.failed",
            ErrorCode::ToolingUnavailable => "tooling.unavailable",
            ErrorCode::DatabaseConnectionFailed => "database.connection_failed",

            ErrorCode::TestFailed => "test.failed",
            ErrorCode::TestLintFailed => "test.lint_failed",

            ErrorCode::BackupFailed => "backup.failed",
            ErrorCode::BackupFileNotFound => "backup.file_not_found",
            ErrorCode::RestoreConfirmationDenied => "restore.confirmation_denied",
            ErrorCode::RestoreExecutionFailed => "restore.execution_failed",

            ErrorCode::DeployBuildFailed => "deploy.build_failed",
            ErrorCode::DeployApplyFailed => "deploy.apply_failed",
            ErrorCode::DeployMigrationFailed => "deploy.migration_failed",
            ErrorCode::DeployHealthCheckFailed => "deploy.health_check_failed",
            ErrorCode::DeployRollbackFailed => "deploy.rollback_failed",
            ErrorCode::DeployAlreadyDeploying => "deploy.already_deploying",

            ErrorCode::ProcessTimeout => "process.timeout",
            ErrorCode::ProcessInterrupted => "process.interrupted",
            ErrorCode::CommandFailed => "process.command_failed",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    /// Process exit code for this failure class.
    ///
    /// Calling automation branches on these, so the mapping is part of the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCode::ConfigInvalidJson
            | ErrorCode::ConfigInvalidValue
            | ErrorCode::ValidationMissingArgument
            | ErrorCode::ValidationInvalidArgument => 2,

            ErrorCode::PreconditionFailed | ErrorCode::DeployAlreadyDeploying => 3,

            ErrorCode::TestFailed | ErrorCode::TestLintFailed => 4,

            ErrorCode::BackupFailed => 5,

            ErrorCode::DeployHealthCheckFailed => 6,

            ErrorCode::DeployRollbackFailed => 7,

            ErrorCode::ToolingUnavailable
            | ErrorCode::DatabaseConnectionFailed
            | ErrorCode::BackupFileNotFound
            | ErrorCode::RestoreConfirmationDenied
            | ErrorCode::RestoreExecutionFailed
            | ErrorCode::DeployBuildFailed
            | ErrorCode::DeployApplyFailed
            | ErrorCode::DeployMigrationFailed
            | ErrorCode::ProcessTimeout
            | ErrorCode::ProcessInterrupted
            | ErrorCode::CommandFailed
            | ErrorCode::InternalIoError
            | ErrorCode::InternalJsonError
            | ErrorCode::InternalUnexpected => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct MissingArgumentDetails {
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

fn empty_details() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            to_details(MissingArgumentDetails { args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            format!("Invalid argument: {}", problem),
            to_details(InvalidArgumentDetails {
                field: field.into(),
                problem,
                id,
                tried,
            }),
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        Self::new(
            ErrorCode::ConfigInvalidValue,
            format!("Invalid configuration value: {}", problem),
            to_details(ConfigInvalidValueDetails {
                key: key.into(),
                value,
                problem,
            }),
        )
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, message, empty_details())
    }

    /// A required environment variable is absent for the selected environment.
    pub fn precondition_missing_env(environment: &str, variables: Vec<String>) -> Self {
        Self::new(
            ErrorCode::PreconditionFailed,
            format!(
                "Environment '{}' is missing required settings: {}",
                environment,
                variables.join(", ")
            ),
            serde_json::json!({ "environment": environment, "variables": variables }),
        )
        .with_hint(format!(
            "Export the variables or add them under environments.{} in hubctl.json",
            environment
        ))
    }

    pub fn tooling_unavailable(tools: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ToolingUnavailable,
            format!("Required tools not found on PATH: {}", tools.join(", ")),
            serde_json::json!({ "tools": tools }),
        )
    }

    pub fn connection_failed(host: &str, port: u16, database: &str, reason: impl Into<String>) -> Self {
        let mut err = Self::new(
            ErrorCode::DatabaseConnectionFailed,
            format!("Cannot connect to database {} at {}:{}", database, host, port),
            serde_json::json!({
                "host": host,
                "port": port,
                "database": database,
                "reason": reason.into(),
            }),
        );
        err.retryable = Some(true);
        err
    }

    pub fn test_failed(message: impl Into<String>, details: Value) -> Self {
        Self::new(ErrorCode::TestFailed, message, details)
    }

    pub fn lint_failed(failed: Vec<String>) -> Self {
        Self::new(
            ErrorCode::TestLintFailed,
            format!("Lint gate failed: {}", failed.join(", ")),
            serde_json::json!({ "failed": failed }),
        )
    }

    pub fn backup_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackupFailed, message, empty_details())
    }

    pub fn backup_file_not_found(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::BackupFileNotFound,
            format!("Backup file not found: {}", path),
            serde_json::json!({ "path": path }),
        )
    }

    pub fn confirmation_denied(database: &str) -> Self {
        Self::new(
            ErrorCode::RestoreConfirmationDenied,
            format!("Restore of '{}' was not confirmed", database),
            serde_json::json!({ "database": database }),
        )
        .with_hint("Answer 'yes' at the prompt or pass --force")
    }

    pub fn restore_failed(details: CommandFailedDetails) -> Self {
        Self::new(
            ErrorCode::RestoreExecutionFailed,
            format!("Restore command exited with {}", details.exit_code),
            to_details(details),
        )
    }

    pub fn build_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeployBuildFailed, message, empty_details())
    }

    pub fn apply_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeployApplyFailed, message, empty_details())
    }

    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeployMigrationFailed, message, empty_details())
    }

    pub fn health_check_failed(url: &str, attempts: u32, last_error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::DeployHealthCheckFailed,
            format!("Health check failed after {} attempts: {}", attempts, url),
            serde_json::json!({
                "url": url,
                "attempts": attempts,
                "last_error": last_error.into(),
            }),
        )
    }

    pub fn rollback_failed(failures: Vec<String>) -> Self {
        Self::new(
            ErrorCode::DeployRollbackFailed,
            format!("Rollback failed: {}", failures.join("; ")),
            serde_json::json!({ "failures": failures }),
        )
        .with_hint("Inspect the environment manually; rollback is never retried automatically")
    }

    pub fn already_deploying(environment: &str, holder: Value) -> Self {
        Self::new(
            ErrorCode::DeployAlreadyDeploying,
            format!("Another deployment to '{}' is in progress", environment),
            serde_json::json!({ "environment": environment, "holder": holder }),
        )
        .with_hint("Wait for the active run to finish, or delete the lock file if it is stale")
    }

    pub fn process_timeout(command: &str, seconds: u64) -> Self {
        Self::new(
            ErrorCode::ProcessTimeout,
            format!("'{}' exceeded its {}s timeout", command, seconds),
            serde_json::json!({ "command": command, "timeout_secs": seconds }),
        )
    }

    pub fn interrupted(context: &str) -> Self {
        Self::new(
            ErrorCode::ProcessInterrupted,
            format!("Interrupted during {}", context),
            serde_json::json!({ "context": context }),
        )
    }

    pub fn command_failed(details: CommandFailedDetails) -> Self {
        Self::new(
            ErrorCode::CommandFailed,
            format!("'{}' exited with {}", details.command, details.exit_code),
            to_details(details),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalIoError,
            "IO error",
            to_details(InternalIoErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            serde_json::json!({ "error": error.into(), "context": context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    /// Re-tag an error under a different failure class, keeping the cause in details.
    pub fn reclassify(self, code: ErrorCode, message: impl Into<String>) -> Self {
        let cause = serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "details": self.details,
        });
        let mut err = Self::new(code, message, serde_json::json!({ "cause": cause }));
        err.hints = self.hints;
        err.retryable = self.retryable;
        err
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    /// Attach a key to the details object (turning non-object details into `{ "detail": .. }`).
    pub fn with_context(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        if !self.details.is_object() {
            let previous = std::mem::replace(&mut self.details, empty_details());
            if !previous.is_null() {
                self.details["detail"] = previous;
            }
        }
        if let Value::Object(map) = &mut self.details {
            map.insert(key.to_string(), value);
        }
        self
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal_io(err.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_gate_failures() {
        assert_eq!(ErrorCode::PreconditionFailed.exit_code(), 3);
        assert_eq!(ErrorCode::DeployAlreadyDeploying.exit_code(), 3);
        assert_eq!(ErrorCode::TestFailed.exit_code(), 4);
        assert_eq!(ErrorCode::TestLintFailed.exit_code(), 4);
        assert_eq!(ErrorCode::BackupFailed.exit_code(), 5);
        assert_eq!(ErrorCode::DeployHealthCheckFailed.exit_code(), 6);
        assert_eq!(ErrorCode::InternalUnexpected.exit_code(), 1);
    }

    #[test]
    fn with_context_adds_keys_to_details() {
        let err = Error::build_failed("docker build exited 1")
            .with_context("stage", "building")
            .with_context("run_id", "abc");
        assert_eq!(err.details["stage"], "building");
        assert_eq!(err.details["run_id"], "abc");
    }

    #[test]
    fn with_context_wraps_scalar_details() {
        let err = Error::new(ErrorCode::InternalUnexpected, "boom", Value::String("x".into()))
            .with_context("stage", "deploying");
        assert_eq!(err.details["detail"], "x");
        assert_eq!(err.details["stage"], "deploying");
    }

    #[test]
    fn reclassify_keeps_cause() {
        let err = Error::process_timeout("pg_dump", 30)
            .reclassify(ErrorCode::BackupFailed, "Backup failed");
        assert_eq!(err.code, ErrorCode::BackupFailed);
        assert_eq!(err.details["cause"]["code"], "process.timeout");
    }

    #[test]
    fn missing_env_lists_variables() {
        let err = Error::precondition_missing_env("staging", vec!["STAGING_DB_HOST".into()]);
        assert_eq!(err.code, ErrorCode::PreconditionFailed);
        assert!(err.message.contains("STAGING_DB_HOST"));
        assert_eq!(err.hints.len(), 1);
    }

    #[test]
    fn command_failure_details_use_snake_case_keys() {
        let err = Error::command_failed(CommandFailedDetails {
            command: "psql".into(),
            exit_code: 3,
            stdout: String::new(),
            stderr: "boom".into(),
        });
        assert_eq!(err.details["exit_code"], 3);
        assert!(err.details.get("exitCode").is_none());
    }
}
