use std::path::PathBuf;

use tokio::task::spawn_blocking;

use super::repo::{
    command_output_detail, has_uncommitted_changes_sync, run_git_command_output_sync,
    run_git_command_sync,
};

/// One entry parsed from `git worktree list --porcelain`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute worktree path.
    pub path: PathBuf,
    /// Checked-out branch, `None` when the worktree is detached.
    pub branch: Option<String>,
    /// Commit hash the worktree `HEAD` points at.
    pub head: String,
}

/// Creates a new branch from the repository's current `HEAD` and attaches a
/// linked worktree at `worktree_path`.
///
/// Not idempotent: fails if the path or the branch already exists.
///
/// # Errors
/// Returns an error if invoking `git` fails or the worktree command exits
/// with a non-zero status.
pub async fn create_worktree(
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch_name: String,
) -> Result<(), String> {
    spawn_blocking(move || {
        if worktree_path.exists() {
            return Err(format!(
                "worktree_already_exists: {} is already present",
                worktree_path.display()
            ));
        }

        let worktree = worktree_path
            .to_str()
            .ok_or_else(|| "Worktree path is not valid UTF-8".to_string())?;
        run_git_command_sync(
            &repo_path,
            &["worktree", "add", "-b", branch_name.as_str(), worktree],
            "Git worktree command failed",
        )?;

        Ok(())
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Lists the repository's worktrees, including the main checkout.
///
/// # Errors
/// Returns an error if the porcelain listing cannot be read.
pub async fn list_worktrees(repo_path: PathBuf) -> Result<Vec<WorktreeInfo>, String> {
    spawn_blocking(move || {
        let raw = run_git_command_sync(
            &repo_path,
            &["worktree", "list", "--porcelain"],
            "Failed to list worktrees",
        )?;

        Ok(parse_worktree_porcelain(&raw))
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Force-removes a worktree and deletes its branch. Idempotent: a worktree
/// or branch that is already gone is not an error.
///
/// # Errors
/// Returns an error only when git fails for a reason other than the target
/// being absent.
pub async fn remove_worktree(
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch_name: String,
) -> Result<(), String> {
    spawn_blocking(move || {
        let worktree = worktree_path
            .to_str()
            .ok_or_else(|| "Worktree path is not valid UTF-8".to_string())?;

        let removal =
            run_git_command_output_sync(&repo_path, &["worktree", "remove", "--force", worktree])?;
        if !removal.status.success() {
            let detail = command_output_detail(&removal.stdout, &removal.stderr);
            if !is_missing_worktree_error(&detail) {
                return Err(format!("Git worktree remove failed: {detail}"));
            }
        }

        // Stale administrative entries block branch deletion after a manual
        // directory removal.
        let _ = run_git_command_output_sync(&repo_path, &["worktree", "prune"])?;

        let deletion =
            run_git_command_output_sync(&repo_path, &["branch", "-D", branch_name.as_str()])?;
        if !deletion.status.success() {
            let detail = command_output_detail(&deletion.stdout, &deletion.stderr);
            if !detail.contains("not found") {
                return Err(format!("Git branch delete failed: {detail}"));
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(&worktree_path)
                .map_err(|error| format!("Failed to remove worktree directory: {error}"))?;
        }

        Ok(())
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

/// Stages and commits any uncommitted changes in a worktree.
///
/// Hooks are skipped; the pipeline validates the tree by building and
/// testing the merged result instead.
///
/// Returns `true` when a commit was created and `false` when the tree was
/// already clean.
///
/// # Errors
/// Returns an error if staging or committing fails.
pub async fn auto_commit(worktree_path: PathBuf, message: String) -> Result<bool, String> {
    spawn_blocking(move || {
        if !has_uncommitted_changes_sync(&worktree_path)? {
            return Ok(false);
        }

        run_git_command_sync(&worktree_path, &["add", "-A"], "Failed to stage changes")?;

        // `git status --porcelain` can report intent-to-add entries that stage
        // to nothing; re-check the index before committing.
        let cached = run_git_command_output_sync(&worktree_path, &["diff", "--cached", "--quiet"])?;
        if cached.status.success() {
            return Ok(false);
        }

        run_git_command_sync(
            &worktree_path,
            &["commit", "--no-verify", "-m", message.as_str()],
            "Failed to commit changes",
        )?;

        Ok(true)
    })
    .await
    .map_err(|error| format!("Join error: {error}"))?
}

fn is_missing_worktree_error(detail: &str) -> bool {
    detail.contains("is not a working tree")
        || detail.contains("No such file or directory")
        || detail.contains("does not exist")
}

fn parse_worktree_porcelain(raw: &str) -> Vec<WorktreeInfo> {
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head = String::new();
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, head: &mut String, branch: &mut Option<String>| {
        if let Some(worktree_path) = path.take() {
            entries.push(WorktreeInfo {
                path: worktree_path,
                branch: branch.take(),
                head: std::mem::take(head),
            });
        }
    };

    for line in raw.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch);
        } else if let Some(value) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(value));
        } else if let Some(value) = line.strip_prefix("HEAD ") {
            head = value.to_string();
        } else if let Some(value) = line.strip_prefix("branch refs/heads/") {
            branch = Some(value.to_string());
        }
    }
    flush(&mut path, &mut head, &mut branch);

    entries
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::super::repo::test_support::init_repo;
    use super::*;

    #[tokio::test]
    async fn test_create_worktree_attaches_branch_checkout() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        init_repo(dir.path());
        let worktree_path = dir.path().join(".worktrees/s1");

        // Act
        create_worktree(
            dir.path().to_path_buf(),
            worktree_path.clone(),
            "gaffer/s1".to_string(),
        )
        .await
        .expect("failed to create worktree");
        let listed = list_worktrees(dir.path().to_path_buf())
            .await
            .expect("failed to list worktrees");

        // Assert
        assert!(worktree_path.join("README.md").exists());
        assert!(
            listed
                .iter()
                .any(|entry| entry.branch.as_deref() == Some("gaffer/s1"))
        );
    }

    #[tokio::test]
    async fn test_create_worktree_rejects_existing_path() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        init_repo(dir.path());
        let worktree_path = dir.path().join(".worktrees/s1");
        std::fs::create_dir_all(&worktree_path).expect("failed to create dir");

        // Act
        let result = create_worktree(
            dir.path().to_path_buf(),
            worktree_path,
            "gaffer/s1".to_string(),
        )
        .await;

        // Assert
        let error = result.expect_err("create should fail");
        assert!(error.contains("worktree_already_exists"));
    }

    #[tokio::test]
    async fn test_create_worktree_rejects_existing_branch() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        init_repo(dir.path());
        create_worktree(
            dir.path().to_path_buf(),
            dir.path().join(".worktrees/s1"),
            "gaffer/s1".to_string(),
        )
        .await
        .expect("failed to create first worktree");

        // Act
        let result = create_worktree(
            dir.path().to_path_buf(),
            dir.path().join(".worktrees/s2"),
            "gaffer/s1".to_string(),
        )
        .await;

        // Assert
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_remove_worktree_is_idempotent() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        init_repo(dir.path());
        let worktree_path = dir.path().join(".worktrees/s1");
        create_worktree(
            dir.path().to_path_buf(),
            worktree_path.clone(),
            "gaffer/s1".to_string(),
        )
        .await
        .expect("failed to create worktree");

        // Act
        remove_worktree(
            dir.path().to_path_buf(),
            worktree_path.clone(),
            "gaffer/s1".to_string(),
        )
        .await
        .expect("failed to remove worktree");
        let second = remove_worktree(
            dir.path().to_path_buf(),
            worktree_path.clone(),
            "gaffer/s1".to_string(),
        )
        .await;
        let listed = list_worktrees(dir.path().to_path_buf())
            .await
            .expect("failed to list worktrees");

        // Assert: no orphan entry survives a successful discard.
        assert!(second.is_ok());
        assert!(!worktree_path.exists());
        assert!(
            !listed
                .iter()
                .any(|entry| entry.branch.as_deref() == Some("gaffer/s1"))
        );
    }

    #[tokio::test]
    async fn test_auto_commit_commits_once_then_reports_clean() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        init_repo(dir.path());
        std::fs::write(dir.path().join("change.txt"), "edit\n").expect("failed to write file");

        // Act
        let first = auto_commit(dir.path().to_path_buf(), "session changes".to_string())
            .await
            .expect("failed to auto commit");
        let second = auto_commit(dir.path().to_path_buf(), "session changes".to_string())
            .await
            .expect("failed to auto commit twice");

        // Assert
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_parse_worktree_porcelain_handles_detached_entries() {
        // Arrange
        let raw = "worktree /repo\nHEAD 1111111111111111111111111111111111111111\nbranch refs/heads/main\n\nworktree /repo/.worktrees/s1\nHEAD 2222222222222222222222222222222222222222\ndetached\n";

        // Act
        let entries = parse_worktree_porcelain(raw);

        // Assert
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch, None);
        assert!(entries[1].head.starts_with("22222222"));
    }
}
