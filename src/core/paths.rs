use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Base hubctl state directory (~/.config/hubctl/ on all platforms)
pub fn hubctl() -> Result<PathBuf> {
    #[cfg(windows)]
    {
        let appdata = env::var("APPDATA").map_err(|_| {
            Error::internal_unexpected("APPDATA environment variable not set on Windows".to_string())
        })?;
        Ok(PathBuf::from(appdata).join("hubctl"))
    }

    #[cfg(not(windows))]
    {
        let home = env::var("HOME").map_err(|_| {
            Error::internal_unexpected(
                "HOME environment variable not set on Unix-like system".to_string(),
            )
        })?;
        Ok(PathBuf::from(home).join(".config").join("hubctl"))
    }
}

/// Global hubctl.json config file path
pub fn hubctl_json() -> Result<PathBuf> {
    Ok(hubctl()?.join("hubctl.json"))
}

/// Default backups directory
pub fn backups() -> Result<PathBuf> {
    Ok(hubctl()?.join("backups"))
}

/// Environment lock directory
pub fn locks() -> Result<PathBuf> {
    Ok(hubctl()?.join("locks"))
}

/// Deployment run records for one environment
pub fn runs(environment: &str) -> Result<PathBuf> {
    Ok(hubctl()?.join("runs").join(environment))
}
