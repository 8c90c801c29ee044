use std::path::{Path, PathBuf};

use tokio::task::spawn_blocking;

use super::repo::{command_output_detail, run_git_command_output_sync, run_git_command_sync};

/// Result of one `--no-ff` merge attempt.
///
/// A failed attempt leaves the checkout as git left it — conflict markers
/// stay in place for inspection. The caller decides whether to resolve or
/// abort.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Whether the merge committed cleanly.
    pub success: bool,
    /// Raw merge stdout.
    pub stdout: String,
    /// Raw merge stderr.
    pub stderr: String,
    /// Paths with unresolved conflicts, empty for non-conflict failures.
    pub conflicted_files: Vec<String>,
}

/// Merges a branch into the current checkout with `--no-ff`.
///
/// Never aborts on failure; the outcome reports conflicted paths instead.
///
/// # Errors
/// Returns an error only if the `git` binary cannot be invoked or conflict
/// state cannot be inspected afterwards.
pub async fn merge_no_ff(
    repo_path: PathBuf,
    branch: String,
    message: String,
) -> Result<MergeOutcome, String> {
    spawn_blocking(move || {
        let output = run_git_command_output_sync(
            &repo_path,
            &[
                "merge",
                "--no-ff",
                "--no-verify",
                "-m",
                message.as_str(),
                branch.as_str(),
            ],
        )?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            return Ok(MergeOutcome {
                success: true,
                stdout,
                stderr,
                conflicted_files: Vec::new(),
            });
        }

        Ok(MergeOutcome {
            success: false,
            stdout,
            stderr,
            conflicted_files: conflicted_files_sync(&repo_path)?,
        })
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Restores the checkout after a failed merge. Tolerates the case where no
/// merge is in progress, so it is safe to call on every failure path.
///
/// # Errors
/// Returns an error if git fails for a reason other than the absence of a
/// merge to abort.
pub async fn abort_merge(repo_path: PathBuf) -> Result<(), String> {
    spawn_blocking(move || {
        let output = run_git_command_output_sync(&repo_path, &["merge", "--abort"])?;
        if output.status.success() {
            return Ok(());
        }

        let detail = command_output_detail(&output.stdout, &output.stderr);
        if detail.contains("no merge to abort") || detail.contains("MERGE_HEAD missing") {
            return Ok(());
        }

        Err(format!("Git merge abort failed: {detail}"))
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Lists paths that still carry unresolved conflict entries.
///
/// # Errors
/// Returns an error if the index cannot be inspected.
pub async fn conflicted_files(repo_path: PathBuf) -> Result<Vec<String>, String> {
    spawn_blocking(move || conflicted_files_sync(&repo_path))
        .await
        .map_err(|error| format!("Join error: {error}"))?
}

fn conflicted_files_sync(repo_path: &Path) -> Result<Vec<String>, String> {
    let raw = run_git_command_sync(
        repo_path,
        &["diff", "--name-only", "--diff-filter=U"],
        "Failed to list conflicted files",
    )?;

    let mut paths: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    paths.sort();
    paths.dedup();

    Ok(paths)
}
