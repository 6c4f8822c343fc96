//! Remote object storage for backup artifacts.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::path::Path;

use crate::config::TimeoutsConfig;
use crate::error::Result;
use crate::utils::command::{self, ProcessSpec};

pub const BUCKET_ENV_VAR: &str = "BACKUP_S3_BUCKET";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteObject {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

impl RemoteObject {
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Bucket-addressed object store.
pub trait ObjectStore {
    fn required_tools(&self) -> Vec<&'static str>;

    /// Upload a local file; returns the remote URI.
    fn upload(&self, bucket: &str, local: &Path, key: &str) -> Result<String>;

    /// Objects directly under `prefix` (a `/`-terminated "directory").
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>>;

    fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

/// `ObjectStore` driven through the `aws` CLI, inheriting its credential chain.
#[derive(Debug, Clone)]
pub struct AwsCli {
    pub timeout_secs: u64,
}

fn s3_uri(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket.trim_start_matches("s3://").trim_end_matches('/'), key)
}

impl AwsCli {
    pub fn from_timeouts(timeouts: &TimeoutsConfig) -> Self {
        Self {
            timeout_secs: timeouts.upload_secs,
        }
    }
}

impl ObjectStore for AwsCli {
    fn required_tools(&self) -> Vec<&'static str> {
        vec!["aws"]
    }

    fn upload(&self, bucket: &str, local: &Path, key: &str) -> Result<String> {
        let uri = s3_uri(bucket, key);
        let spec = ProcessSpec::new("aws")
            .args(["s3", "cp", "--only-show-errors"])
            .arg(local.to_string_lossy().to_string())
            .arg(&uri)
            .timeout_secs(self.timeout_secs);
        command::execute_checked(&spec)?;
        Ok(uri)
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        let spec = ProcessSpec::new("aws")
            .args(["s3", "ls"])
            .arg(s3_uri(bucket, prefix))
            .timeout_secs(self.timeout_secs);
        let output = command::execute(&spec)?;
        // `aws s3 ls` exits 1 when the prefix has no objects yet.
        if !output.success && output.stderr.trim().is_empty() && output.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let output = output.require_success(&spec)?;
        Ok(parse_listing(&output.stdout, prefix))
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let spec = ProcessSpec::new("aws")
            .args(["s3", "rm", "--only-show-errors"])
            .arg(s3_uri(bucket, key))
            .timeout_secs(self.timeout_secs);
        command::execute_checked(&spec)?;
        Ok(())
    }
}

/// Parse `aws s3 ls` lines: `2024-01-15 02:00:01      12345 name.sql.gz`.
/// Sub-prefix lines (`PRE dir/`) are skipped.
pub fn parse_listing(stdout: &str, prefix: &str) -> Vec<RemoteObject> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let date = parts.next()?;
            let time = parts.next()?;
            let size = parts.next()?.parse::<u64>().ok()?;
            let name = parts.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                return None;
            }
            let last_modified =
                NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive));
            Some(RemoteObject {
                key: format!("{}{}", prefix, name),
                last_modified,
                size,
            })
        })
        .collect()
}

pub fn resolve_bucket(explicit: Option<&str>, configured: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(BUCKET_ENV_VAR).ok())
        .or_else(|| configured.map(str::to_string))
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_parses_objects_and_skips_prefixes() {
        let stdout = "                           PRE archive/\n\
2024-01-15 02:00:01      12345 hub_staging_20240115_020000.sql.gz\n\
2024-01-15 02:00:02        310 hub_staging_20240115_020000.sql.gz.meta\n";
        let objects = parse_listing(stdout, "backups/staging/");
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, "backups/staging/hub_staging_20240115_020000.sql.gz");
        assert_eq!(objects[0].file_name(), "hub_staging_20240115_020000.sql.gz");
        assert_eq!(objects[0].size, 12345);
        assert!(objects[0].last_modified.is_some());
    }

    #[test]
    fn s3_uri_normalizes_bucket() {
        assert_eq!(s3_uri("s3://hub-backups/", "a/b.sql"), "s3://hub-backups/a/b.sql");
        assert_eq!(s3_uri("hub-backups", "a/b.sql"), "s3://hub-backups/a/b.sql");
    }

    #[test]
    fn explicit_bucket_wins() {
        assert_eq!(
            resolve_bucket(Some("cli-bucket"), Some("config-bucket")).as_deref(),
            Some("cli-bucket")
        );
        assert_eq!(resolve_bucket(Some("  "), None), None);
    }
}
