//! Git helpers for worktree-backed execution contexts.

use std::path::Path;
use std::process::Command;

/// True when `path` is inside a git working tree.
pub fn is_git_repo(path: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// `git worktree add --detach <path> HEAD`.
///
/// Detached so concurrent contexts never fight over a branch checkout.
pub fn worktree_add_detached(repo_path: &Path, worktree_path: &Path) -> Result<(), String> {
    let output = Command::new("git")
        .arg("worktree")
        .arg("add")
        .arg("--detach")
        .arg(worktree_path)
        .arg("HEAD")
        .current_dir(repo_path)
        .output()
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// `git worktree remove --force <path>`.
pub fn worktree_remove(repo_path: &Path, worktree_path: &Path) -> Result<(), String> {
    let output = Command::new("git")
        .arg("worktree")
        .arg("remove")
        .arg("--force")
        .arg(worktree_path)
        .current_dir(repo_path)
        .output()
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Drop administrative entries for worktrees whose directories are gone.
pub fn worktree_prune(repo_path: &Path) -> bool {
    Command::new("git")
        .args(["worktree", "prune"])
        .current_dir(repo_path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_directory_is_not_a_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
    }

    #[test]
    fn test_worktree_add_outside_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wt");
        assert!(worktree_add_detached(dir.path(), &target).is_err());
    }
}
