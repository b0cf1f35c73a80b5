use std::path::Path;

use crate::error::{Error, Result};
use crate::utils::command;

/// Local version-control operations the pipeline depends on.
///
/// The production implementation shells out to `git`; tests substitute a
/// fake to verify rollback round-trips without a real repository.
pub trait SourceControl: Send + Sync {
    /// Current revision of the working tree, or None if there is no
    /// checkout yet (first run, fresh workspace).
    fn current_revision(&self, dir: &Path) -> Option<String>;

    /// Update or create the working tree: pull when a checkout exists,
    /// clone otherwise.
    fn sync(&self, repo_url: &str, dir: &Path) -> Result<()>;

    /// Reset the working tree to a recorded revision.
    fn reset_hard(&self, dir: &Path, revision: &str) -> Result<()>;
}

pub struct GitCli;

impl SourceControl for GitCli {
    fn current_revision(&self, dir: &Path) -> Option<String> {
        if !dir.join(".git").exists() {
            return None;
        }
        command::run_in(dir, "git", &["rev-parse", "HEAD"], "git rev-parse").ok()
    }

    fn sync(&self, repo_url: &str, dir: &Path) -> Result<()> {
        if dir.join(".git").exists() {
            command::run_in(dir, "git", &["pull"], "git pull")
                .map_err(|e| Error::git_command_failed(e.to_string()))?;
        } else {
            command::run(
                "git",
                &["clone", repo_url, &dir.to_string_lossy()],
                "git clone",
            )
            .map_err(|e| Error::git_command_failed(e.to_string()))?;
        }
        Ok(())
    }

    fn reset_hard(&self, dir: &Path, revision: &str) -> Result<()> {
        command::run_in(dir, "git", &["reset", "--hard", revision], "git reset")
            .map_err(|e| Error::git_command_failed(e.to_string()))?;
        Ok(())
    }
}
