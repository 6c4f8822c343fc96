//! The JSON envelope every subcommand prints on stdout.

use hubctl::error::Hint;
use hubctl::{Error, Result};
use serde::Serialize;
use std::io::{self, Write};

/// `{ "success", "command", "exit_code", "data" | "error" }`
#[derive(Debug, Serialize)]
pub struct CliResponse {
    pub success: bool,
    pub command: &'static str,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CliError>,
}

#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: &'static str,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Hint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl From<&Error> for CliError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code.as_str(),
            message: err.message.clone(),
            details: err.details.clone(),
            hints: err.hints.clone(),
            retryable: err.retryable,
        }
    }
}

impl CliResponse {
    /// A command that ran to completion. Data-level failures (a red test suite)
    /// still report `success: false` through a non-zero exit code.
    pub fn from_result(command: &'static str, result: Result<serde_json::Value>, exit_code: i32) -> Self {
        match result {
            Ok(data) => Self {
                success: exit_code == 0,
                command,
                exit_code,
                data: Some(data),
                error: None,
            },
            Err(err) => Self {
                success: false,
                command,
                exit_code,
                data: None,
                error: Some(CliError::from(&err)),
            },
        }
    }
}

/// Serialize a command's data and pick the process exit code.
///
/// Errors exit with their failure class (`ErrorCode::exit_code`).
pub fn map_cmd_result_to_json<T: Serialize>(
    result: Result<(T, i32)>,
) -> (Result<serde_json::Value>, i32) {
    match result {
        Ok((data, exit_code)) => match serde_json::to_value(data) {
            Ok(value) => (Ok(value), exit_code),
            Err(err) => {
                let err = Error::internal_json(err.to_string(), Some("serialize response".to_string()));
                let exit_code = err.code.exit_code();
                (Err(err), exit_code)
            }
        },
        Err(err) => {
            let exit_code = err.code.exit_code();
            (Err(err), exit_code)
        }
    }
}

pub fn print_json_result(
    command: &'static str,
    result: Result<serde_json::Value>,
    exit_code: i32,
) -> Result<()> {
    let response = CliResponse::from_result(command, result, exit_code);
    let payload = serde_json::to_string_pretty(&response)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize response".to_string())))?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    match writeln!(handle, "{}", payload) {
        Ok(()) => Ok(()),
        // Reader went away (`hubctl backups | head`).
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(Error::internal_io(e.to_string(), Some("write stdout".to_string()))),
    }
}
