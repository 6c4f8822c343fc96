//! Age-based cleanup of old artifacts, locally and in object storage.
//!
//! Every failure here is collected as a warning; retention never fails a backup.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::naming::{self, META_SUFFIX};
use super::storage::ObjectStore;

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionCandidate {
    pub name: String,
    /// Fallback age source when the name carries no timestamp (file mtime, object date).
    pub modified: Option<DateTime<Utc>>,
}

impl RetentionCandidate {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        naming::parse_timestamp(&self.name).or(self.modified)
    }
}

/// Names of candidates strictly older than `days`. Candidates with no known age are kept.
pub fn expired(candidates: &[RetentionCandidate], now: DateTime<Utc>, days: u32) -> Vec<String> {
    let window = Duration::days(i64::from(days));
    candidates
        .iter()
        .filter(|c| c.created_at().is_some_and(|created| now - created > window))
        .map(|c| c.name.clone())
        .collect()
}

/// Which artifacts a cleanup pass considers, and the cutoff it applies.
#[derive(Debug, Clone, Copy)]
pub struct RetentionScope<'a> {
    pub database: &'a str,
    pub environment: &'a str,
    pub days: u32,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionOutcome {
    pub retention_days: u32,
    pub removed_local: Vec<String>,
    pub removed_remote: Vec<String>,
    pub warnings: Vec<String>,
}

fn local_candidates(
    dir: &Path,
    database: &str,
    environment: &str,
) -> std::result::Result<Vec<(RetentionCandidate, PathBuf)>, String> {
    let pattern = format!(
        "{}/{}_{}_*.sql*",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(database),
        glob::Pattern::escape(environment)
    );
    let entries = glob::glob(&pattern).map_err(|e| format!("invalid retention pattern: {}", e))?;

    Ok(entries
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_string();
            if !naming::belongs_to(&name, database, environment) {
                return None;
            }
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            Some((RetentionCandidate { name, modified }, path))
        })
        .collect())
}

/// Remove local artifacts (and their sidecars) for one database/environment older than `days`.
pub fn prune_local(dir: &Path, scope: RetentionScope<'_>, outcome: &mut RetentionOutcome) {
    let candidates = match local_candidates(dir, scope.database, scope.environment) {
        Ok(candidates) => candidates,
        Err(warning) => {
            outcome.warnings.push(warning);
            return;
        }
    };
    let listed: Vec<RetentionCandidate> = candidates.iter().map(|(c, _)| c.clone()).collect();
    let doomed = expired(&listed, scope.now, scope.days);

    for (candidate, path) in candidates {
        if !doomed.contains(&candidate.name) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                let _ = std::fs::remove_file(naming::sidecar_path(&path));
                outcome.removed_local.push(path.display().to_string());
            }
            Err(e) => outcome
                .warnings
                .push(format!("Failed to remove {}: {}", path.display(), e)),
        }
    }
}

/// Remove remote artifacts (and sidecars) under `prefix` older than `days`.
pub fn prune_remote(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    scope: RetentionScope<'_>,
    outcome: &mut RetentionOutcome,
) {
    let objects = match store.list(bucket, prefix) {
        Ok(objects) => objects,
        Err(e) => {
            outcome
                .warnings
                .push(format!("Failed to list s3://{}/{}: {}", bucket, prefix, e.message));
            return;
        }
    };

    let candidates: Vec<RetentionCandidate> = objects
        .iter()
        .filter(|o| naming::belongs_to(o.file_name(), scope.database, scope.environment))
        .map(|o| RetentionCandidate {
            name: o.file_name().to_string(),
            modified: o.last_modified,
        })
        .collect();

    for name in expired(&candidates, scope.now, scope.days) {
        let Some(object) = objects.iter().find(|o| o.file_name() == name) else {
            continue;
        };
        match store.delete(bucket, &object.key) {
            Ok(()) => {
                let sidecar = format!("{}{}", object.key, META_SUFFIX);
                if objects.iter().any(|o| o.key == sidecar) {
                    if let Err(e) = store.delete(bucket, &sidecar) {
                        outcome
                            .warnings
                            .push(format!("Failed to remove {}: {}", sidecar, e.message));
                    }
                }
                outcome.removed_remote.push(object.key.clone());
            }
            Err(e) => outcome
                .warnings
                .push(format!("Failed to remove {}: {}", object.key, e.message)),
        }
    }
}
