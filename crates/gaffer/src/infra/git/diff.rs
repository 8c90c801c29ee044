//! Worktree diffing against the merge-base with the mainline.
//!
//! Uncommitted changes are included by staging everything into a temporary
//! index, so callers see committed and in-flight work as one patch.

use std::path::{Path, PathBuf};
use std::process::Command;

use tokio::task::spawn_blocking;
use uuid::Uuid;

use super::repo::{command_output_detail, run_git_command_sync};

/// Diffstat summary plus the set of changed paths for one worktree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffStat {
    /// Human-readable `--stat` summary.
    pub summary: String,
    /// Repository-relative changed paths, sorted and deduplicated.
    pub changed_paths: Vec<String>,
}

/// Returns the merge-base between the repository `HEAD` and a session
/// branch.
///
/// # Errors
/// Returns an error if either revision cannot be resolved.
pub async fn merge_base(repo_path: PathBuf, branch: String) -> Result<String, String> {
    spawn_blocking(move || merge_base_sync(&repo_path, &branch))
        .await
        .map_err(|error| format!("Join error: {error}"))?
}

/// Returns the unified diff of a worktree against its branch's merge-base,
/// including committed and uncommitted changes.
///
/// # Errors
/// Returns an error if the merge-base cannot be resolved or diffing fails.
pub async fn worktree_diff(
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch: String,
) -> Result<String, String> {
    spawn_blocking(move || {
        let base = merge_base_sync(&repo_path, &branch)?;
        with_temp_index(&worktree_path, |index| {
            run_indexed(
                &worktree_path,
                index,
                &["diff", "--cached", base.as_str()],
                "Failed to read worktree diff",
            )
        })
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Returns the diffstat summary and changed paths for a worktree.
///
/// # Errors
/// Returns an error if the merge-base cannot be resolved or diffing fails.
pub async fn worktree_stat(
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch: String,
) -> Result<DiffStat, String> {
    spawn_blocking(move || {
        let base = merge_base_sync(&repo_path, &branch)?;
        with_temp_index(&worktree_path, |index| {
            let summary = run_indexed(
                &worktree_path,
                index,
                &["diff", "--cached", "--stat", base.as_str()],
                "Failed to read worktree diffstat",
            )?;
            let paths = run_indexed(
                &worktree_path,
                index,
                &["diff", "--cached", "--name-only", base.as_str()],
                "Failed to read worktree changed paths",
            )?;

            Ok(DiffStat {
                summary,
                changed_paths: split_paths(&paths),
            })
        })
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Returns the repository-relative paths a session changed, committed or
/// not, sorted and deduplicated.
///
/// # Errors
/// Returns an error if the merge-base cannot be resolved or diffing fails.
pub async fn changed_files(
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch: String,
) -> Result<Vec<String>, String> {
    let stat = worktree_stat(repo_path, worktree_path, branch).await?;

    Ok(stat.changed_paths)
}

fn merge_base_sync(repo_path: &Path, branch: &str) -> Result<String, String> {
    run_git_command_sync(
        repo_path,
        &["merge-base", "HEAD", branch],
        "Failed to resolve merge base",
    )
}

fn split_paths(raw: &str) -> Vec<String> {
    let mut paths: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    paths.sort();
    paths.dedup();

    paths
}

/// Builds a throwaway index seeded from `HEAD` with everything staged, runs
/// `f` against it, and removes the index file afterwards.
fn with_temp_index<T>(
    worktree_path: &Path,
    f: impl FnOnce(&Path) -> Result<T, String>,
) -> Result<T, String> {
    let index_path = std::env::temp_dir().join(format!("gaffer-index-{}", Uuid::new_v4()));

    let result = (|| {
        run_indexed(
            worktree_path,
            &index_path,
            &["read-tree", "HEAD"],
            "Failed to seed temporary index",
        )?;
        run_indexed(
            worktree_path,
            &index_path,
            &["add", "-A"],
            "Failed to stage into temporary index",
        )?;

        f(&index_path)
    })();

    let _ = std::fs::remove_file(&index_path);

    result
}

fn run_indexed(
    worktree_path: &Path,
    index_path: &Path,
    args: &[&str],
    error_prefix: &str,
) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .env("GIT_INDEX_FILE", index_path)
        .current_dir(worktree_path)
        .output()
        .map_err(|error| format!("Failed to execute git: {error}"))?;

    if !output.status.success() {
        let detail = command_output_detail(&output.stdout, &output.stderr);

        return Err(format!("{error_prefix}: {detail}"));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::super::repo::test_support::{commit_all, init_repo};
    use super::super::worktree::create_worktree;
    use super::*;

    async fn repo_with_worktree(dir: &Path) -> PathBuf {
        init_repo(dir);
        let worktree_path = dir.join(".worktrees/s1");
        create_worktree(
            dir.to_path_buf(),
            worktree_path.clone(),
            "gaffer/s1".to_string(),
        )
        .await
        .expect("failed to create worktree");

        worktree_path
    }

    #[tokio::test]
    async fn test_changed_files_includes_committed_and_uncommitted() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let worktree_path = repo_with_worktree(dir.path()).await;
        std::fs::write(worktree_path.join("README.md"), "committed edit\n")
            .expect("failed to edit file");
        commit_all(&worktree_path, "edit readme");
        std::fs::write(worktree_path.join("uncommitted.txt"), "wip\n")
            .expect("failed to write file");

        // Act
        let files = changed_files(
            dir.path().to_path_buf(),
            worktree_path,
            "gaffer/s1".to_string(),
        )
        .await
        .expect("failed to list changed files");

        // Assert
        assert_eq!(files, vec!["README.md", "uncommitted.txt"]);
    }

    #[tokio::test]
    async fn test_worktree_diff_contains_both_change_kinds() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let worktree_path = repo_with_worktree(dir.path()).await;
        std::fs::write(worktree_path.join("README.md"), "committed edit\n")
            .expect("failed to edit file");
        commit_all(&worktree_path, "edit readme");
        std::fs::write(worktree_path.join("uncommitted.txt"), "wip\n")
            .expect("failed to write file");

        // Act
        let diff = worktree_diff(
            dir.path().to_path_buf(),
            worktree_path.clone(),
            "gaffer/s1".to_string(),
        )
        .await
        .expect("failed to read diff");

        // Assert
        assert!(diff.contains("committed edit"));
        assert!(diff.contains("uncommitted.txt"));
        // The temp index must not disturb the real one.
        let status = std::process::Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&worktree_path)
            .output()
            .expect("failed to run git status");
        let status_text = String::from_utf8_lossy(&status.stdout);
        assert!(status_text.contains("?? uncommitted.txt"));
    }

    #[tokio::test]
    async fn test_worktree_stat_reports_summary_for_clean_session() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let worktree_path = repo_with_worktree(dir.path()).await;

        // Act
        let stat = worktree_stat(
            dir.path().to_path_buf(),
            worktree_path,
            "gaffer/s1".to_string(),
        )
        .await
        .expect("failed to read stat");

        // Assert
        assert!(stat.changed_paths.is_empty());
        assert!(stat.summary.is_empty());
    }
}
