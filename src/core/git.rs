use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::utils::command;

/// Read-only view of the source checkout a deployment is built from.
pub trait SourceTree {
    /// True when the working tree has no uncommitted changes.
    fn is_clean(&self) -> Result<bool>;
    fn current_branch(&self) -> Result<String>;
    /// Abbreviated HEAD commit, used as the default release version.
    fn head_commit(&self) -> Result<String>;
}

/// The git repository in a directory on disk.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    path: PathBuf,
}

impl GitWorkspace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn current_dir() -> Result<Self> {
        let dir = std::env::current_dir().map_err(|e| {
            Error::internal_io(e.to_string(), Some("resolve working directory".to_string()))
        })?;
        Ok(Self::new(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn git(&self, args: &[&str], context: &str) -> Result<String> {
        command::run_in(&self.path, "git", args, context).map_err(|e| {
            Error::precondition(format!("{} failed: not a usable git checkout", context))
                .with_context("cause", e.details)
        })
    }
}

impl SourceTree for GitWorkspace {
    fn is_clean(&self) -> Result<bool> {
        // Empty porcelain output means clean; run directly so an empty stdout is not mistaken for failure.
        let output = Command::new("git")
            .args(["status", "--porcelain=v1"])
            .current_dir(&self.path)
            .output()
            .map_err(|e| Error::internal_io(e.to_string(), Some("git status".to_string())))?;

        if !output.status.success() {
            return Err(Error::precondition(format!(
                "git status failed in {}: {}",
                self.path.display(),
                command::error_text(&output)
            )));
        }
        Ok(output.stdout.is_empty())
    }

    fn current_branch(&self) -> Result<String> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"], "git branch")
    }

    fn head_commit(&self) -> Result<String> {
        self.git(&["rev-parse", "--short", "HEAD"], "get HEAD commit")
    }
}
