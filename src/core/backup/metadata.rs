//! `.meta` sidecar records and payload checksums.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::naming::{self, Pipeline};
use super::{BackupArtifact, BackupMode};
use crate::error::{Error, Result};
use crate::utils::io;

const ALL_TABLES: &str = "all";
const NO_TABLES: &str = "none";

/// JSON document written next to every artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_date: String,
    pub environment: String,
    pub database_name: String,
    pub database_host: String,
    pub backup_type: String,
    pub compressed: bool,
    pub encrypted: bool,
    pub tables: String,
    pub excluded_tables: String,
    pub file_size: u64,
    pub checksum: String,
}

impl BackupMetadata {
    pub fn from_artifact(artifact: &BackupArtifact, database_host: &str) -> Self {
        Self {
            backup_date: artifact
                .created_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            environment: artifact.environment.clone(),
            database_name: artifact.database.clone(),
            database_host: database_host.to_string(),
            backup_type: artifact.mode.meta_label().to_string(),
            compressed: artifact.compressed,
            encrypted: artifact.encrypted,
            tables: join_or(&artifact.tables, ALL_TABLES),
            excluded_tables: join_or(&artifact.excluded_tables, NO_TABLES),
            file_size: artifact.size,
            checksum: artifact.checksum.clone(),
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            compressed: self.compressed,
            encrypted: self.encrypted,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.backup_date)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn mode(&self) -> Option<BackupMode> {
        BackupMode::from_meta_label(&self.backup_type)
    }

    pub fn table_list(&self) -> Vec<String> {
        split_or(&self.tables, ALL_TABLES)
    }

    pub fn excluded_list(&self) -> Vec<String> {
        split_or(&self.excluded_tables, NO_TABLES)
    }
}

fn join_or(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        empty.to_string()
    } else {
        items.join(",")
    }
}

fn split_or(raw: &str, empty: &str) -> Vec<String> {
    if raw == empty {
        return Vec::new();
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn write(artifact_path: &Path, meta: &BackupMetadata) -> Result<()> {
    let content = serde_json::to_string_pretty(meta)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize backup metadata".to_string())))?;
    io::write_file_atomic(&naming::sidecar_path(artifact_path), &content, "write backup metadata")
}

/// Read the sidecar for an artifact, `None` when it does not exist.
pub fn read(artifact_path: &Path) -> Result<Option<BackupMetadata>> {
    let path = naming::sidecar_path(artifact_path);
    if !path.exists() {
        return Ok(None);
    }
    let raw = io::read_file(&path, "read backup metadata")?;
    serde_json::from_str(&raw).map(Some).map_err(|e| {
        Error::internal_json(e.to_string(), Some(format!("parse {}", path.display())))
    })
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("open {}", path.display()))))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::internal_io(e.to_string(), Some(format!("hash {}", path.display()))))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Result of comparing an artifact against its sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub path: String,
    pub expected: String,
    pub actual: String,
    pub size_matches: bool,
    pub valid: bool,
}

pub fn verify(artifact_path: &Path) -> Result<Verification> {
    if !artifact_path.exists() {
        return Err(Error::backup_file_not_found(artifact_path.display().to_string()));
    }
    let meta = read(artifact_path)?.ok_or_else(|| {
        Error::precondition(format!(
            "No metadata sidecar for {}",
            artifact_path.display()
        ))
    })?;
    let actual = sha256_file(artifact_path)?;
    let size = std::fs::metadata(artifact_path)
        .map(|m| m.len())
        .map_err(|e| Error::internal_io(e.to_string(), Some("stat artifact".to_string())))?;
    let size_matches = size == meta.file_size;

    Ok(Verification {
        path: artifact_path.display().to_string(),
        valid: actual == meta.checksum && size_matches,
        expected: meta.checksum,
        actual,
        size_matches,
    })
}
