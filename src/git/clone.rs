use log::{debug, info};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::error_handling::types::GitError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneOutcome {
    pub repo_url: String,
    pub target_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

fn url_pattern() -> Regex {
    // https/http/ssh/git/file schemes plus the scp-like git@host:path form.
    Regex::new(r"^(https?://\S+|ssh://\S+|git://\S+|file:///\S+|git@[\w.-]+:\S+)$").unwrap()
}

/// Derives `repo` from `https://host/owner/repo.git` style URLs.
fn derive_target_dir(repo_url: &str) -> String {
    let trimmed = repo_url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or("repository")
        .trim_end_matches(".git");
    if last.is_empty() {
        "repository".to_string()
    } else {
        last.to_string()
    }
}

/// Classifies git's stderr into the git error taxonomy.
fn classify_failure(repo_url: &str, branch: Option<&str>, stderr: &str) -> GitError {
    let lower = stderr.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("unable to access")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
    {
        return GitError::NetworkError(first_line(stderr));
    }
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("could not read password")
        || lower.contains("permission denied (publickey")
    {
        return GitError::AuthFailed(repo_url.to_string());
    }
    if lower.contains("remote branch") && lower.contains("not found")
        || lower.contains("could not find remote branch")
    {
        return GitError::BranchNotFound(branch.unwrap_or("").to_string());
    }
    if lower.contains("repository") && lower.contains("not found")
        || lower.contains("does not appear to be a git repository")
    {
        return GitError::RepositoryNotFound(repo_url.to_string());
    }
    if lower.contains("pathspec") || lower.contains("checkout") {
        return GitError::CheckoutFailed(first_line(stderr));
    }
    GitError::CloneFailed(first_line(stderr))
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("unknown git failure")
        .trim()
        .to_string()
}

/// Clones `repo_url` under `workspace`, optionally on `branch`.
pub async fn clone_repository(
    workspace: &Path,
    repo_url: &str,
    branch: Option<&str>,
    target_dir: Option<&str>,
) -> Result<CloneOutcome, GitError> {
    if !url_pattern().is_match(repo_url.trim()) {
        return Err(GitError::InvalidUrl(repo_url.to_string()));
    }

    let target: PathBuf = match target_dir {
        Some(dir) => {
            let dir_path = Path::new(dir);
            if dir_path.is_absolute() {
                dir_path.to_path_buf()
            } else {
                workspace.join(dir_path)
            }
        }
        None => workspace.join(derive_target_dir(repo_url)),
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CloneFailed(format!("cannot prepare {}: {}", parent.display(), e)))?;
    }

    let mut cmd = Command::new("git");
    cmd.arg("clone");
    if let Some(branch) = branch {
        cmd.arg("--branch").arg(branch);
    }
    cmd.arg(repo_url.trim()).arg(&target);
    // Never fall into an interactive credential prompt inside the sandbox.
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    debug!("Cloning {} into {}", repo_url, target.display());
    let output = cmd
        .output()
        .await
        .map_err(|e| GitError::CloneFailed(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("git clone failed: {}", stderr.trim_end());
        return Err(classify_failure(repo_url, branch, &stderr));
    }

    info!("Cloned {} into {}", repo_url, target.display());
    Ok(CloneOutcome {
        repo_url: repo_url.to_string(),
        target_dir: target.display().to_string(),
        branch: branch.map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(!url_pattern().is_match("not a url"));
        assert!(!url_pattern().is_match("ftp://example.com/repo.git"));
        assert!(url_pattern().is_match("https://example.com/owner/repo.git"));
        assert!(url_pattern().is_match("git@github.com:owner/repo.git"));
        assert!(url_pattern().is_match("ssh://git@host/repo.git"));
    }

    #[test]
    fn derives_directory_from_url() {
        assert_eq!(derive_target_dir("https://h/o/repo.git"), "repo");
        assert_eq!(derive_target_dir("git@h:o/repo.git"), "repo");
        assert_eq!(derive_target_dir("https://h/o/repo/"), "repo");
    }

    #[test]
    fn classifies_common_failures() {
        let err = classify_failure(
            "https://x/y.git",
            None,
            "fatal: could not resolve host: x",
        );
        assert!(matches!(err, GitError::NetworkError(_)));

        let err = classify_failure(
            "https://x/y.git",
            None,
            "fatal: Authentication failed for 'https://x/y.git'",
        );
        assert!(matches!(err, GitError::AuthFailed(_)));

        let err = classify_failure(
            "https://x/y.git",
            Some("dev"),
            "fatal: Remote branch dev not found in upstream origin",
        );
        assert!(matches!(err, GitError::BranchNotFound(_)));

        let err = classify_failure(
            "https://x/y.git",
            None,
            "remote: Repository not found.",
        );
        assert!(matches!(err, GitError::RepositoryNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_url_fails_before_spawning_git() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = clone_repository(dir.path(), "definitely not a url", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn clones_a_local_repository() {
        if !git_available() {
            return;
        }
        let origin = tempfile::TempDir::new().unwrap();
        let init = std::process::Command::new("git")
            .args(["init", "--bare", "seed.git"])
            .current_dir(origin.path())
            .output()
            .unwrap();
        assert!(init.status.success());

        let url = format!("file://{}", origin.path().join("seed.git").display());
        let dir = tempfile::TempDir::new().unwrap();
        let outcome = clone_repository(dir.path(), &url, None, Some("work"))
            .await
            .unwrap();
        assert!(outcome.target_dir.ends_with("work"));
        assert!(dir.path().join("work").is_dir());
    }
}
