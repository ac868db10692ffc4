//! Repository acquisition: shallow git clone to a temporary directory.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use rapidflow_core::{Error, Result};

/// Shallow-clone a repository at the given branch into `dest`.
pub async fn clone_repository(repo_url: &str, branch: &str, dest: &Path) -> Result<()> {
    info!(repo_url, branch, dest = %dest.display(), "cloning repository");

    let output = Command::new("git")
        .args([
            "clone",
            "--depth",
            "1",
            "--branch",
            branch,
            repo_url,
            &dest.to_string_lossy(),
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Acquisition(format!("failed to spawn git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Acquisition(format!(
            "git clone of {repo_url} failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}
