//! Run notifications.

use reqwest::blocking::Client;
use serde_json::json;

use super::run::{DeploymentRun, RunStatus};
use crate::error::{Error, Result};
use crate::utils::http;

pub const WEBHOOK_ENV_VAR: &str = "HUBCTL_NOTIFY_WEBHOOK";

pub trait Notifier {
    fn notify(&self, run: &DeploymentRun) -> Result<()>;
}

/// Posts a JSON summary to a chat-style incoming webhook.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            client: http::client(timeout_secs)?,
        })
    }

    /// Webhook from `HUBCTL_NOTIFY_WEBHOOK`, else the configured one.
    pub fn from_env_or(configured: Option<&str>, timeout_secs: u64) -> Result<Option<Self>> {
        let url = std::env::var(WEBHOOK_ENV_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| configured.map(str::to_string));
        url.map(|url| Self::new(url, timeout_secs)).transpose()
    }
}

pub fn summary(run: &DeploymentRun) -> String {
    let outcome = match run.status {
        RunStatus::Running | RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::RolledBack => "rolled back",
    };
    format!(
        "Deployment of {} to {} {} (run {})",
        run.version_or_unknown(),
        run.environment,
        outcome,
        run.run_id
    )
}

impl Notifier for WebhookNotifier {
    fn notify(&self, run: &DeploymentRun) -> Result<()> {
        let payload = json!({
            "text": summary(run),
            "environment": run.environment,
            "version": run.version,
            "run_id": run.run_id,
            "warnings": run.warnings,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|e| Error::internal_io(e.to_string(), Some("send notification".to_string())))?;
        let status = response.status().as_u16();
        if !http::is_success(status) {
            return Err(Error::internal_io(
                format!("Webhook returned HTTP {}", status),
                Some("send notification".to_string()),
            ));
        }
        Ok(())
    }
}
