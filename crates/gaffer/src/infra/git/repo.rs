use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tokio::task::spawn_blocking;

/// Runs one git command and returns trimmed stdout.
///
/// # Errors
/// Returns an error if invoking `git` fails or the command exits with a
/// non-zero status. The error message starts with `error_prefix`.
pub(super) fn run_git_command_sync(
    dir: &Path,
    args: &[&str],
    error_prefix: &str,
) -> Result<String, String> {
    let output = run_git_command_output_sync(dir, args)?;

    if !output.status.success() {
        let detail = command_output_detail(&output.stdout, &output.stderr);

        return Err(format!("{error_prefix}: {detail}"));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Runs one git command and returns the raw output without status checks.
///
/// # Errors
/// Returns an error only if the `git` binary itself cannot be invoked.
pub(super) fn run_git_command_output_sync(dir: &Path, args: &[&str]) -> Result<Output, String> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|error| format!("Failed to execute git: {error}"))
}

/// Extracts the best human-readable error detail from command output.
pub(super) fn command_output_detail(stdout: &[u8], stderr: &[u8]) -> String {
    let stderr_text = String::from_utf8_lossy(stderr).trim().to_string();
    if !stderr_text.is_empty() {
        return stderr_text;
    }

    let stdout_text = String::from_utf8_lossy(stdout).trim().to_string();
    if !stdout_text.is_empty() {
        return stdout_text;
    }

    "Unknown git error".to_string()
}

/// Returns the repository root for `dir`, verifying it is inside a git
/// repository.
///
/// # Errors
/// Returns an error if `dir` is not inside a git working tree.
pub async fn repository_root(dir: PathBuf) -> Result<PathBuf, String> {
    spawn_blocking(move || {
        let root = run_git_command_sync(
            &dir,
            &["rev-parse", "--show-toplevel"],
            "Not a git repository",
        )?;
        if root.is_empty() {
            return Err("Git rev-parse --show-toplevel returned empty output".to_string());
        }

        Ok(PathBuf::from(root))
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Returns the commit hash the repository `HEAD` points at.
///
/// # Errors
/// Returns an error if `HEAD` cannot be resolved.
pub async fn head_commit(repo_path: PathBuf) -> Result<String, String> {
    spawn_blocking(move || {
        run_git_command_sync(&repo_path, &["rev-parse", "HEAD"], "Failed to resolve HEAD")
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Returns whether the working tree has staged or unstaged changes.
///
/// Untracked files count as changes.
///
/// # Errors
/// Returns an error if `git status` fails.
pub async fn has_uncommitted_changes(dir: PathBuf) -> Result<bool, String> {
    spawn_blocking(move || has_uncommitted_changes_sync(&dir))
        .await
        .map_err(|error| format!("Join error: {error}"))?
}

pub(super) fn has_uncommitted_changes_sync(dir: &Path) -> Result<bool, String> {
    let status = run_git_command_sync(
        dir,
        &["status", "--porcelain"],
        "Failed to read working tree status",
    )?;

    Ok(!status.is_empty())
}


#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::test_support::init_repo;
    use super::*;

    #[tokio::test]
    async fn test_repository_root_resolves_inside_repo() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        init_repo(dir.path());

        // Act
        let root = repository_root(dir.path().to_path_buf())
            .await
            .expect("failed to resolve root");

        // Assert
        let canonical_dir = dir.path().canonicalize().expect("failed to canonicalize");
        let canonical_root = root.canonicalize().expect("failed to canonicalize");
        assert_eq!(canonical_root, canonical_dir);
    }

    #[tokio::test]
    async fn test_repository_root_rejects_plain_directory() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");

        // Act
        let result = repository_root(dir.path().to_path_buf()).await;

        // Assert
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_head_commit_returns_full_hash() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        init_repo(dir.path());

        // Act
        let head = head_commit(dir.path().to_path_buf())
            .await
            .expect("failed to resolve head");

        // Assert
        assert_eq!(head.len(), 40);
        assert!(head.chars().all(|character| character.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_has_uncommitted_changes_detects_untracked_file() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        init_repo(dir.path());

        // Act
        let clean = has_uncommitted_changes(dir.path().to_path_buf())
            .await
            .expect("failed to check status");
        std::fs::write(dir.path().join("new.txt"), "data\n").expect("failed to write file");
        let dirty = has_uncommitted_changes(dir.path().to_path_buf())
            .await
            .expect("failed to check status");

        // Assert
        assert!(!clean);
        assert!(dirty);
    }
}
