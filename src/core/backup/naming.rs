//! Artifact file names, sidecar paths and remote keys.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const META_SUFFIX: &str = ".meta";

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"_(\d{8}_\d{6})\.sql").expect("static pattern"))
}

/// `{database}_{environment}_{YYYYMMDD_HHMMSS}.sql[.gz][.gpg]`
pub fn artifact_file_name(
    database: &str,
    environment: &str,
    at: DateTime<Utc>,
    compressed: bool,
    encrypted: bool,
) -> String {
    let mut name = format!(
        "{}_{}_{}.sql",
        database,
        environment,
        at.format(TIMESTAMP_FORMAT)
    );
    if compressed {
        name.push_str(".gz");
    }
    if encrypted {
        name.push_str(".gpg");
    }
    name
}

/// Creation time embedded in an artifact file name.
pub fn parse_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let caps = timestamp_pattern().captures(file_name)?;
    let naive = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// True when `file_name` is a payload (not a sidecar) belonging to exactly this
/// database/environment. `app` in `staging` does not own `app_staging_staging_...`.
pub fn belongs_to(file_name: &str, database: &str, environment: &str) -> bool {
    let pattern = format!(
        r"^{}_{}_\d{{8}}_\d{{6}}\.sql(\.gz)?(\.gpg)?$",
        regex::escape(database),
        regex::escape(environment)
    );
    Regex::new(&pattern).is_ok_and(|re| re.is_match(file_name))
}

pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut raw = artifact.as_os_str().to_os_string();
    raw.push(META_SUFFIX);
    PathBuf::from(raw)
}

pub fn remote_key(prefix: &str, environment: &str, file_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", environment, file_name)
    } else {
        format!("{}/{}/{}", prefix, environment, file_name)
    }
}

/// Decode steps a payload needs before it is plain SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    pub compressed: bool,
    pub encrypted: bool,
}

impl Pipeline {
    /// Infer from suffixes: a trailing `.gpg` means decrypt, then a `.gz` means decompress.
    pub fn from_file_name(file_name: &str) -> Self {
        let (rest, encrypted) = match file_name.strip_suffix(".gpg") {
            Some(rest) => (rest, true),
            None => (file_name, false),
        };
        Self {
            compressed: rest.ends_with(".gz"),
            encrypted,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::from_file_name(&name)
    }
}
