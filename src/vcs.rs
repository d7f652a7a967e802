//! Version-control seam.
//!
//! Workers prepare task branches and the merge phase consumes them through
//! this trait; hosting-provider APIs (PR creation, review state) are out of
//! scope, so `pr_url_for_current_branch` may legitimately return `None`.

use anyhow::{Context, Result, bail};
use git2::build::CheckoutBuilder;
use git2::{BranchType, Repository, Signature};
use std::path::Path;
use std::sync::Mutex;

/// How to integrate a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Fast-forward when possible, merge commit otherwise.
    #[default]
    Merge,
    /// Refuse anything that is not a fast-forward.
    FastForwardOnly,
}

pub trait Vcs: Send + Sync {
    /// Cheap availability probe, run during the prerequisite check.
    fn available(&self) -> Result<()>;
    /// Create the branch off `base` if missing, then check it out.
    fn ensure_branch(&self, name: &str, base: &str) -> Result<()>;
    fn current_branch(&self) -> Result<String>;
    fn pr_url_for_current_branch(&self) -> Result<Option<String>>;
    fn merge(&self, branch: &str, strategy: MergeStrategy) -> Result<()>;
}

/// Local git repository via libgit2.
pub struct GitVcs {
    // Repository is Send but not Sync.
    repo: Mutex<Repository>,
}

impl GitVcs {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            repo: Mutex::new(repo),
        })
    }

    fn signature() -> Result<Signature<'static>> {
        Ok(Signature::now("foreman", "foreman@localhost")?)
    }
}

impl Vcs for GitVcs {
    fn available(&self) -> Result<()> {
        let repo = self.repo.lock().expect("git lock poisoned");
        repo.head().context("Git repository has no HEAD")?;
        Ok(())
    }

    fn ensure_branch(&self, name: &str, base: &str) -> Result<()> {
        let repo = self.repo.lock().expect("git lock poisoned");

        if repo.find_branch(name, BranchType::Local).is_err() {
            let base_commit = repo
                .find_branch(base, BranchType::Local)
                .with_context(|| format!("Base branch '{}' not found", base))?
                .get()
                .peel_to_commit()
                .context("Failed to resolve base commit")?;
            repo.branch(name, &base_commit, false)
                .with_context(|| format!("Failed to create branch '{}'", name))?;
        }

        repo.set_head(&format!("refs/heads/{}", name))
            .with_context(|| format!("Failed to switch HEAD to '{}'", name))?;
        let mut checkout = CheckoutBuilder::new();
        checkout.safe();
        repo.checkout_head(Some(&mut checkout))
            .context("Failed to check out branch")?;
        Ok(())
    }

    fn current_branch(&self) -> Result<String> {
        let repo = self.repo.lock().expect("git lock poisoned");
        let head = repo.head().context("Failed to read HEAD")?;
        head.shorthand()
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("HEAD is not on a branch"))
    }

    fn pr_url_for_current_branch(&self) -> Result<Option<String>> {
        // PR hosting integration is out of scope for the local backend.
        Ok(None)
    }

    fn merge(&self, branch: &str, strategy: MergeStrategy) -> Result<()> {
        let repo = self.repo.lock().expect("git lock poisoned");

        let their_branch = repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", branch))?;
        let their_commit = their_branch
            .get()
            .peel_to_commit()
            .context("Failed to resolve branch commit")?;
        let annotated = repo.find_annotated_commit(their_commit.id())?;

        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            return Ok(());
        }

        if analysis.is_fast_forward() {
            let refname = repo.head()?.name().map(String::from).context("detached HEAD")?;
            repo.find_reference(&refname)?
                .set_target(their_commit.id(), "fast-forward merge")?;
            repo.set_head(&refname)?;
            let mut checkout = CheckoutBuilder::new();
            checkout.force();
            repo.checkout_head(Some(&mut checkout))?;
            return Ok(());
        }

        if strategy == MergeStrategy::FastForwardOnly {
            bail!("Branch '{}' cannot be fast-forwarded", branch);
        }

        let mut checkout = CheckoutBuilder::new();
        checkout.safe();
        repo.merge(&[&annotated], None, Some(&mut checkout))?;
        let mut index = repo.index()?;
        if index.has_conflicts() {
            repo.cleanup_state()?;
            bail!("Merge of '{}' produced conflicts", branch);
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let head_commit = repo.head()?.peel_to_commit()?;
        let sig = Self::signature()?;
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("Merge branch '{}'", branch),
            &tree,
            &[&head_commit, &their_commit],
        )?;
        repo.cleanup_state()?;
        Ok(())
    }
}

/// Inert backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct NullVcs {
    pr_url: Option<String>,
}

impl NullVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A null backend that reports a fixed PR url for completions.
    pub fn with_pr_url(url: &str) -> Self {
        Self {
            pr_url: Some(url.to_string()),
        }
    }
}

impl Vcs for NullVcs {
    fn available(&self) -> Result<()> {
        Ok(())
    }

    fn ensure_branch(&self, _name: &str, _base: &str) -> Result<()> {
        Ok(())
    }

    fn current_branch(&self) -> Result<String> {
        Ok("main".to_string())
    }

    fn pr_url_for_current_branch(&self) -> Result<Option<String>> {
        Ok(self.pr_url.clone())
    }

    fn merge(&self, _branch: &str, _strategy: MergeStrategy) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let sig = Signature::now("test", "test@localhost").unwrap();
            let tree_id = {
                let mut index = repo.index().unwrap();
                index.write_tree().unwrap()
            };
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
        }
        repo
    }

    fn default_branch(repo: &Repository) -> String {
        repo.head().unwrap().shorthand().unwrap().to_string()
    }

    #[test]
    fn test_open_requires_repository() {
        let dir = tempdir().unwrap();
        assert!(GitVcs::open(dir.path()).is_err());
    }

    #[test]
    fn test_ensure_branch_creates_and_checks_out() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = default_branch(&repo);
        drop(repo);

        let vcs = GitVcs::open(dir.path()).unwrap();
        vcs.available().unwrap();
        vcs.ensure_branch("feature/auth", &base).unwrap();
        assert_eq!(vcs.current_branch().unwrap(), "feature/auth");

        // Idempotent on an existing branch.
        vcs.ensure_branch("feature/auth", &base).unwrap();
        assert_eq!(vcs.current_branch().unwrap(), "feature/auth");
    }

    #[test]
    fn test_ensure_branch_unknown_base() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());

        let vcs = GitVcs::open(dir.path()).unwrap();
        let err = vcs.ensure_branch("feature/x", "no-such-base").unwrap_err();
        assert!(err.to_string().contains("no-such-base"));
    }

    #[test]
    fn test_fast_forward_merge() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = default_branch(&repo);
        drop(repo);

        let vcs = GitVcs::open(dir.path()).unwrap();
        vcs.ensure_branch("feature/x", &base).unwrap();

        // Commit a file on the feature branch.
        std::fs::write(dir.path().join("x.txt"), "x").unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let sig = Signature::now("test", "test@localhost").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("x.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "add x", &tree, &[&parent])
            .unwrap();
        drop(tree);
        drop(parent);
        drop(repo);

        vcs.ensure_branch(&base, &base).unwrap();
        vcs.merge("feature/x", MergeStrategy::Merge).unwrap();
        assert!(dir.path().join("x.txt").exists());
    }

    #[test]
    fn test_merge_up_to_date_is_noop() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = default_branch(&repo);
        drop(repo);

        let vcs = GitVcs::open(dir.path()).unwrap();
        vcs.ensure_branch("feature/x", &base).unwrap();
        vcs.ensure_branch(&base, &base).unwrap();
        vcs.merge("feature/x", MergeStrategy::FastForwardOnly).unwrap();
    }

    #[test]
    fn test_null_vcs() {
        let vcs = NullVcs::with_pr_url("https://example.com/pr/1");
        vcs.available().unwrap();
        vcs.ensure_branch("feature/a", "main").unwrap();
        assert_eq!(vcs.current_branch().unwrap(), "main");
        assert_eq!(
            vcs.pr_url_for_current_branch().unwrap().as_deref(),
            Some("https://example.com/pr/1")
        );
        vcs.merge("feature/a", MergeStrategy::Merge).unwrap();
    }
}
