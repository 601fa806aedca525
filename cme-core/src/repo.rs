//! Repository manager
//!
//! One repository per object type under the storage root, each guarded by
//! its own async mutex. Locks are taken at public operation boundaries only:
//! every helper here that touches a working tree takes a [`RepoLock`] as
//! proof the caller already holds the type's lock, and none of them locks
//! again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{CmeError, Result};
use crate::runner::{CommandOutput, CommandRunner};
use crate::types::{Author, ENGINE_EMAIL, ENGINE_NAME, ObjectType, validate_branch_name};

/// Branch every repository is initialized on and returns to.
pub const MASTER: &str = "master";

const README: &str = "README";
const README_TEXT: &str = "Change Management Engine Repository\n";

/// Proof that the lock of one object type's repository is held. Owned, so
/// it can move into a task that outlives the request that took it.
pub struct RepoLock {
    object_type: ObjectType,
    _guard: OwnedMutexGuard<()>,
}

impl RepoLock {
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }
}

/// Owns the storage root and the per-type locks.
pub struct RepoManager {
    root: PathBuf,
    runner: CommandRunner,
    /// Indexed by the `ObjectType` discriminant.
    locks: [Arc<Mutex<()>>; ObjectType::ALL.len()],
}

impl RepoManager {
    pub fn new(root: impl Into<PathBuf>, runner: CommandRunner) -> Self {
        Self {
            root: root.into(),
            runner,
            locks: std::array::from_fn(|_| Arc::new(Mutex::new(()))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    /// Wait for exclusive access to one type's repository.
    pub async fn lock(&self, object_type: ObjectType) -> RepoLock {
        let guard = Arc::clone(&self.locks[object_type as usize])
            .lock_owned()
            .await;
        RepoLock {
            object_type,
            _guard: guard,
        }
    }

    /// Directory of the type's repository; fails if the storage root or the
    /// type directory is missing.
    pub fn repo_dir(&self, object_type: ObjectType) -> Result<PathBuf> {
        let dir = self.root.join(object_type.as_str());
        if !self.root.is_dir() || !dir.is_dir() {
            return Err(CmeError::NoRepo(object_type));
        }
        Ok(dir)
    }

    /// Whether the type's repository exists with at least one commit.
    pub async fn is_initialized(&self, object_type: ObjectType) -> bool {
        let dir = self.root.join(object_type.as_str());
        if !dir.join(".git").exists() {
            return false;
        }
        self.runner
            .run_captured(&dir, &["rev-parse", "--verify", "-q", "HEAD"])
            .await
            .map(|out| out.success())
            .unwrap_or(false)
    }

    /// Run a command in the locked repository and return stdout.
    pub async fn git(&self, lock: &RepoLock, args: &[&str]) -> Result<String> {
        let dir = self.repo_dir(lock.object_type)?;
        self.runner.run(&dir, args).await
    }

    /// Run a command in the locked repository, keeping stdout and stderr.
    pub async fn git_captured(&self, lock: &RepoLock, args: &[&str]) -> Result<CommandOutput> {
        let dir = self.repo_dir(lock.object_type)?;
        self.runner.run_captured(&dir, args).await
    }

    /// Create and initialize the repository if needed. Idempotent.
    pub async fn ensure_repo(&self, lock: &RepoLock) -> Result<PathBuf> {
        let object_type = lock.object_type;
        if !self.root.is_dir() {
            return Err(CmeError::NoRepo(object_type));
        }
        let dir = self.root.join(object_type.as_str());
        if !dir.is_dir() {
            create_private_dir(&dir)?;
        }
        if self.is_initialized(object_type).await {
            return Ok(dir);
        }

        tracing::info!("Initializing {} repository at {:?}", object_type, dir);
        let setup: [&[&str]; 6] = [
            &["init", "-q"],
            &["symbolic-ref", "HEAD", "refs/heads/master"],
            // Pushes must be able to update the checked-out branch.
            &["config", "receive.denyCurrentBranch", "ignore"],
            &["config", "user.name", ENGINE_NAME],
            &["config", "user.email", ENGINE_EMAIL],
            &["config", "commit.gpgsign", "false"],
        ];
        for args in setup {
            self.runner.run(&dir, args).await?;
        }

        tokio::fs::write(dir.join(README), README_TEXT).await?;
        self.runner.run(&dir, &["add", "--", README]).await?;
        self.runner
            .run(&dir, &["commit", "-q", "-m", "Initialize repository"])
            .await?;
        Ok(dir)
    }

    /// Hard-reset the working tree to HEAD and drop untracked files.
    pub async fn reset(&self, lock: &RepoLock) -> Result<()> {
        self.git(lock, &["reset", "-q", "--hard"]).await?;
        self.git(lock, &["clean", "-fdq"]).await?;
        Ok(())
    }

    /// Reset and return to master: the state every operation starts from and
    /// leaves behind.
    pub async fn restore(&self, lock: &RepoLock) -> Result<()> {
        self.reset(lock).await?;
        self.checkout(lock, MASTER).await
    }

    /// Best-effort [`restore`](Self::restore) on an error path.
    pub async fn restore_quietly(&self, lock: &RepoLock) {
        if let Err(e) = self.restore(lock).await {
            tracing::warn!("Failed to restore {} repository: {}", lock.object_type, e);
        }
    }

    pub async fn checkout(&self, lock: &RepoLock, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        self.git(lock, &["checkout", "-q", branch, "--"]).await?;
        Ok(())
    }

    /// Whether the working tree or index differs from HEAD.
    pub async fn is_dirty(&self, lock: &RepoLock) -> Result<bool> {
        let status = self.git(lock, &["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    /// Commit the index unconditionally.
    pub async fn commit(
        &self,
        lock: &RepoLock,
        message: &str,
        author: Option<&Author>,
    ) -> Result<String> {
        let mut args: Vec<String> = vec!["commit".into(), "-q".into(), "-m".into(), message.into()];
        if let Some(author) = author {
            args.push("--author".into());
            args.push(author.signature());
            args.push("--date".into());
            args.push(author.when.format("%Y-%m-%dT%H:%M:%S%:z").to_string());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(lock, &args).await?;
        self.head_commit(lock).await
    }

    /// Commit the index only if something changed. Returns the new commit id,
    /// or `None` for a no-op.
    pub async fn commit_if_dirty(
        &self,
        lock: &RepoLock,
        message: &str,
        author: Option<&Author>,
    ) -> Result<Option<String>> {
        if !self.is_dirty(lock).await? {
            return Ok(None);
        }
        self.commit(lock, message, author).await.map(Some)
    }

    /// Id of the commit HEAD points at.
    pub async fn head_commit(&self, lock: &RepoLock) -> Result<String> {
        let out = self.git(lock, &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    /// Every local branch except master.
    pub async fn branches(&self, lock: &RepoLock) -> Result<Vec<String>> {
        let out = self
            .git(lock, &["for-each-ref", "--format=%(refname:short)", "refs/heads/"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|b| !b.is_empty() && *b != MASTER)
            .map(String::from)
            .collect())
    }

    pub async fn create_branch(&self, lock: &RepoLock, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        self.git(lock, &["branch", branch]).await?;
        Ok(())
    }

    /// Force-delete a branch; master must be checked out.
    pub async fn delete_branch(&self, lock: &RepoLock, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        self.git(lock, &["branch", "-D", branch]).await?;
        Ok(())
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)?;
    Ok(())
}

/// Create the storage root if it does not exist yet.
pub(crate) fn ensure_root(path: &Path) -> Result<()> {
    if !path.is_dir() {
        create_private_dir(path)?;
    }
    Ok(())
}
