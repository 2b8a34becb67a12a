//! Git-backed source provider.
//!
//! Runs the `git` CLI in the workspace directory. This is the only place the
//! repository is touched; the core crates consume the `SourceProvider` trait.

use async_trait::async_trait;
use capstan_core::{CommitId, ProviderError, ProviderResult, SourceProvider};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub struct GitSource {
    repo_dir: PathBuf,
}

impl GitSource {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        GitSource {
            repo_dir: repo_dir.into(),
        }
    }

    /// Run a git command and return trimmed stdout.
    async fn git(&self, args: &[&str]) -> ProviderResult<String> {
        debug!(args = ?args, "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|e| ProviderError::Source(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Source(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Resolve any ref to a commit id.
    pub async fn rev_parse(&self, reference: &str) -> ProviderResult<CommitId> {
        let sha = self.git(&["rev-parse", reference]).await?;
        if sha.is_empty() {
            return Err(ProviderError::Source(format!(
                "git rev-parse {reference} returned empty output"
            )));
        }
        Ok(CommitId::new(sha))
    }

    /// Current branch name, if not detached.
    pub async fn current_branch(&self) -> ProviderResult<Option<String>> {
        let name = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok((name != "HEAD").then_some(name))
    }

    /// Check out a clean working tree at the given ref.
    pub async fn checkout(&self, reference: &str) -> ProviderResult<CommitId> {
        self.git(&["checkout", "--force", reference]).await?;
        self.rev_parse("HEAD").await
    }

    /// Merge a change request ref into the current tree (always a merge
    /// commit, so the first-parent chain stays the target branch).
    pub async fn merge_no_ff(&self, reference: &str, message: &str) -> ProviderResult<CommitId> {
        self.git(&["merge", "--no-ff", "-m", message, reference])
            .await?;
        self.rev_parse("HEAD").await
    }

    /// Create an annotated tag.
    pub async fn create_tag(&self, tag: &str, message: &str) -> ProviderResult<()> {
        self.git(&["tag", "--annotate", "-m", message, tag]).await?;
        Ok(())
    }

    /// Tags matching a glob, sorted by version order.
    pub async fn list_tags(&self, pattern: &str) -> ProviderResult<Vec<String>> {
        let out = self
            .git(&["tag", "--list", "--sort=version:refname", pattern])
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Unbundle a git bundle into this repository.
    pub async fn unbundle(&self, bundle: &Path) -> ProviderResult<()> {
        let path = bundle.display().to_string();
        self.git(&["bundle", "unbundle", &path]).await?;
        Ok(())
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn head_commit(&self) -> ProviderResult<CommitId> {
        self.rev_parse("HEAD").await
    }

    async fn last_version_tag(&self) -> ProviderResult<Option<String>> {
        match self.git(&["describe", "--tags", "--abbrev=0"]).await {
            Ok(tag) if !tag.is_empty() => Ok(Some(tag)),
            Ok(_) => Ok(None),
            // No tag reachable is not an error here; the resolver decides.
            Err(_) => Ok(None),
        }
    }

    async fn commits_between(
        &self,
        base: Option<&CommitId>,
        target: &CommitId,
    ) -> ProviderResult<Vec<(CommitId, String)>> {
        let range = match base {
            Some(base) => format!("{base}..{target}"),
            None => target.to_string(),
        };
        // NUL-separated records: first line is the hash, the rest is the
        // full message (needed for footers).
        let out = self
            .git(&["log", "-z", "--reverse", "--format=%H%n%B", &range])
            .await?;

        let mut commits = Vec::new();
        for record in out.split('\0') {
            let record = record.trim_start_matches('\n');
            if record.is_empty() {
                continue;
            }
            let (hash, message) = record.split_once('\n').unwrap_or((record, ""));
            commits.push((CommitId::new(hash.trim()), message.trim_end().to_string()));
        }
        Ok(commits)
    }

    async fn changed_paths(
        &self,
        base: &CommitId,
        target: &CommitId,
    ) -> ProviderResult<Vec<PathBuf>> {
        let out = self
            .git(&[
                "diff",
                "--name-only",
                base.as_str(),
                target.as_str(),
            ])
            .await?;
        Ok(out.lines().map(PathBuf::from).collect())
    }

    async fn first_unique_commit(
        &self,
        branch_point: &CommitId,
        target: &CommitId,
    ) -> ProviderResult<CommitId> {
        // First-parent walk keeps the leftmost chain on diamond merges.
        let range = format!("{branch_point}..{target}");
        let out = self
            .git(&["rev-list", "--first-parent", "--reverse", &range])
            .await?;
        match out.lines().next() {
            Some(hash) => Ok(CommitId::new(hash.trim())),
            None => Ok(target.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "--initial-branch", "main"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(
            dir.path(),
            &["commit", "--allow-empty", "-m", "chore: initial commit"],
        );
        dir
    }

    #[tokio::test]
    async fn test_head_commit_is_hex() {
        let repo = make_repo();
        let source = GitSource::new(repo.path());
        let head = source.head_commit().await.unwrap();
        assert_eq!(head.as_str().len(), 40);
        assert!(head.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_commits_between_parses_full_messages() {
        let repo = make_repo();
        let source = GitSource::new(repo.path());
        let base = source.head_commit().await.unwrap();

        run_git(
            repo.path(),
            &[
                "commit",
                "--allow-empty",
                "-m",
                "feat: add gauge\n\nBREAKING CHANGE: old gauge removed",
            ],
        );
        run_git(repo.path(), &["commit", "--allow-empty", "-m", "fix: leak"]);
        let head = source.head_commit().await.unwrap();

        let commits = source.commits_between(Some(&base), &head).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert!(commits[0].1.starts_with("feat: add gauge"));
        assert!(commits[0].1.contains("BREAKING CHANGE"));
        assert_eq!(commits[1].1, "fix: leak");
    }

    #[tokio::test]
    async fn test_last_version_tag() {
        let repo = make_repo();
        let source = GitSource::new(repo.path());
        assert_eq!(source.last_version_tag().await.unwrap(), None);

        run_git(repo.path(), &["tag", "--annotate", "-m", "v1.0.0", "v1.0.0"]);
        assert_eq!(
            source.last_version_tag().await.unwrap(),
            Some("v1.0.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_current_branch() {
        let repo = make_repo();
        let source = GitSource::new(repo.path());
        assert_eq!(
            source.current_branch().await.unwrap(),
            Some("main".to_string())
        );
    }

    #[tokio::test]
    async fn test_first_unique_commit_walks_first_parent() {
        let repo = make_repo();
        let source = GitSource::new(repo.path());
        let base = source.head_commit().await.unwrap();

        run_git(repo.path(), &["commit", "--allow-empty", "-m", "fix: first"]);
        let first = source.head_commit().await.unwrap();
        run_git(repo.path(), &["commit", "--allow-empty", "-m", "fix: second"]);
        let head = source.head_commit().await.unwrap();

        let unique = source.first_unique_commit(&base, &head).await.unwrap();
        assert_eq!(unique, first);
    }
}
