// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Git command runner
//!
//! Thin wrappers over the `git` binary for working-copy operations: clone,
//! branch, commit, and diff against a base commit.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::{Command, Output};

/// Run a git command in `repo_root` and return the raw output
pub fn run_git(args: &[&str], repo_root: &Path) -> Result<Output> {
    run_git_with_env(args, repo_root, &[])
}

/// [`run_git`] with extra environment variables for the child only
pub fn run_git_with_env(args: &[&str], repo_root: &Path, envs: &[(String, String)]) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .env("GIT_TERMINAL_PROMPT", "0")
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .output()
        .with_context(|| format!("Failed to execute: git {}", args.first().unwrap_or(&"")))
}

/// Run a git command, failing on a non-zero exit; returns trimmed stdout
pub fn run_git_checked(args: &[&str], repo_root: &Path) -> Result<String> {
    run_git_checked_with_env(args, repo_root, &[])
}

/// [`run_git_checked`] with extra environment variables for the child only
pub fn run_git_checked_with_env(args: &[&str], repo_root: &Path, envs: &[(String, String)]) -> Result<String> {
    let output = run_git_with_env(args, repo_root, envs)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let cmd = args.first().unwrap_or(&"");
        bail!("git {cmd} failed: {}", stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether `git` can be run at all
#[must_use]
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Clone `branch` of `url` into `dest`
pub fn clone(url: &str, branch: &str, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow::anyhow!("No parent directory for {}", dest.display()))?;
    let dest_str = dest.to_string_lossy();
    run_git_checked(
        &["clone", "--quiet", "--branch", branch, url, dest_str.as_ref()],
        parent,
    )
    .with_context(|| format!("Failed to clone branch {branch}"))?;
    Ok(())
}

/// Create and switch to `branch`
pub fn checkout_new_branch(repo_root: &Path, branch: &str) -> Result<()> {
    run_git_checked(&["checkout", "--quiet", "-b", branch], repo_root)?;
    Ok(())
}

/// Commit hash of HEAD
pub fn head_commit(repo_root: &Path) -> Result<String> {
    run_git_checked(&["rev-parse", "HEAD"], repo_root)
}

/// Stage everything and commit as the given author.
///
/// Returns `false` when there was nothing to commit.
pub fn commit_all(repo_root: &Path, message: &str, user_name: &str, user_email: &str) -> Result<bool> {
    run_git_checked(&["add", "-A"], repo_root)?;
    let staged = run_git(&["diff", "--cached", "--quiet"], repo_root)?;
    if staged.status.success() {
        return Ok(false);
    }

    let name = format!("user.name={user_name}");
    let email = format!("user.email={user_email}");
    run_git_checked(
        &["-c", &name, "-c", &email, "commit", "--quiet", "-m", message],
        repo_root,
    )?;
    Ok(true)
}

/// Paths changed between `base` and the working tree, including uncommitted
/// and untracked files
pub fn changed_files(repo_root: &Path, base: &str) -> Result<Vec<String>> {
    let mut files: Vec<String> = run_git_checked(&["diff", "--name-only", base], repo_root)?
        .lines()
        .map(String::from)
        .collect();
    files.extend(
        run_git_checked(&["ls-files", "--others", "--exclude-standard"], repo_root)?
            .lines()
            .map(String::from),
    );
    files.sort();
    files.dedup();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) {
        run_git_checked(&["init", "--quiet", "-b", "master"], dir).unwrap();
        fs::write(dir.join("README.md"), "hello\n").unwrap();
        commit_all(dir, "initial", "t", "t@example.org").unwrap();
    }

    #[test]
    fn test_commit_and_diff() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let base = head_commit(dir.path()).unwrap();

        assert!(!commit_all(dir.path(), "nothing", "t", "t@example.org").unwrap());

        fs::create_dir_all(dir.path().join("recipe")).unwrap();
        fs::write(dir.path().join("recipe/meta.yaml"), "x: 1\n").unwrap();
        assert!(commit_all(dir.path(), "add recipe", "t", "t@example.org").unwrap());
        fs::write(dir.path().join("untracked.txt"), "y\n").unwrap();

        assert_eq!(
            changed_files(dir.path(), &base).unwrap(),
            vec!["recipe/meta.yaml", "untracked.txt"]
        );
    }

    #[test]
    fn test_checked_reports_stderr() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let err = run_git_checked(&["rev-parse", "HEAD"], dir.path()).unwrap_err();
        assert!(err.to_string().starts_with("git rev-parse failed"));
    }
}
