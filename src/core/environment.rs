//! Environment profiles.
//!
//! A profile is resolved once per invocation from `hubctl.json` seeds plus
//! `{PREFIX}_*` environment variables, then passed explicitly to every component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::{HubConfig, ProfileSeed};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub const ALL: [Environment; 3] = [
        Environment::Development,
        Environment::Staging,
        Environment::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// Prefix for per-environment variables (`DEV_DB_HOST`, `PROD_DB_USER`, ...).
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Environment::Development => "DEV",
            Environment::Staging => "STAGING",
            Environment::Production => "PROD",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(Error::validation_invalid_argument(
                "env",
                format!("Unknown environment '{}'", other),
                Some(other.to_string()),
                Some(Environment::ALL.iter().map(|e| e.as_str().to_string()).collect()),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseTarget {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentProfile {
    pub environment: Environment,
    pub database: DatabaseTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_context: Option<String>,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl EnvironmentProfile {
    /// Base URL, required by stages that talk to the running application.
    pub fn require_base_url(&self) -> Result<&str> {
        self.base_url.as_deref().ok_or_else(|| {
            Error::precondition_missing_env(
                self.environment.as_str(),
                vec![format!("{}_BASE_URL", self.environment.env_prefix())],
            )
        })
    }
}

const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_NAMESPACE: &str = "default";

/// Resolve a profile using the process environment.
pub fn resolve(environment: Environment, config: &HubConfig) -> Result<EnvironmentProfile> {
    resolve_with(environment, config, |key| std::env::var(key).ok())
}

/// Resolve a profile with an explicit variable lookup.
///
/// Host, database name and user must be non-empty; every missing one is
/// reported together. Values never fall back to another environment's seed.
pub fn resolve_with<F>(
    environment: Environment,
    config: &HubConfig,
    lookup: F,
) -> Result<EnvironmentProfile>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = environment.env_prefix();
    let empty = ProfileSeed::default();
    let seed = config
        .environments
        .get(environment.as_str())
        .unwrap_or(&empty);

    let var = |suffix: &str| -> Option<String> {
        lookup(&format!("{}_{}", prefix, suffix))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let host = var("DB_HOST").or_else(|| non_empty(&seed.db_host));
    let name = var("DB_NAME").or_else(|| non_empty(&seed.db_name));
    let user = var("DB_USER").or_else(|| non_empty(&seed.db_user));

    let mut missing = Vec::new();
    if host.is_none() {
        missing.push(format!("{}_DB_HOST", prefix));
    }
    if name.is_none() {
        missing.push(format!("{}_DB_NAME", prefix));
    }
    if user.is_none() {
        missing.push(format!("{}_DB_USER", prefix));
    }
    let (Some(host), Some(name), Some(user)) = (host, name, user) else {
        return Err(Error::precondition_missing_env(environment.as_str(), missing));
    };

    let port = match var("DB_PORT") {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            Error::config_invalid_value(
                format!("{}_DB_PORT", prefix),
                Some(raw.clone()),
                "port must be an integer between 1 and 65535",
            )
        })?,
        None => seed.db_port.unwrap_or(DEFAULT_DB_PORT),
    };

    Ok(EnvironmentProfile {
        environment,
        database: DatabaseTarget {
            host,
            port,
            name,
            user,
            password: var("DB_PASSWORD"),
        },
        kube_context: var("KUBE_CONTEXT").or_else(|| non_empty(&seed.kube_context)),
        namespace: var("NAMESPACE")
            .or_else(|| non_empty(&seed.namespace))
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        base_url: var("BASE_URL")
            .or_else(|| non_empty(&seed.base_url))
            .map(|url| url.trim_end_matches('/').to_string()),
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
