//! Git worktrees as reusable, lock-protected job sandboxes.
//!
//! [`WorktreeManager`] is a thin wrapper over `git worktree` run from the main
//! repository. It takes no locks: callers that use it directly must hold the
//! repository lock for structural changes and the worktree's own lock while
//! working inside it. [`WorktreePool`] folds both locks in and is what the
//! orchestrator uses.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::porcelain::{WorktreeEntry, parse_worktree_list};
use crate::core::sanitize::sanitize;
use crate::io::git::Git;
use crate::io::lock::FileLock;

/// How long a lease waits for another lease's structural change to finish.
pub const POOL_LOCK_WAIT: Duration = Duration::from_secs(30);

/// `git worktree` operations pinned to the main repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    git: Git,
}

impl WorktreeManager {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            git: Git::new(repo),
        }
    }

    pub fn repo(&self) -> &Path {
        self.git.workdir()
    }

    /// `git worktree add -b <branch> <path> [<base_ref>]`.
    #[instrument(skip_all, fields(path = %path.display(), branch, base_ref))]
    pub fn create(&self, path: &Path, branch: &str, base_ref: Option<&str>) -> Result<()> {
        if path.exists() {
            bail!("worktree path {} already exists", path.display());
        }
        let mut args: Vec<&OsStr> = vec![
            OsStr::new("worktree"),
            OsStr::new("add"),
            OsStr::new("-b"),
            OsStr::new(branch),
            path.as_os_str(),
        ];
        if let Some(base) = base_ref {
            args.push(OsStr::new(base));
        }
        self.git
            .run_checked(&args)
            .with_context(|| format!("create worktree {} on {branch}", path.display()))?;
        info!(path = %path.display(), branch, "created worktree");
        Ok(())
    }

    /// Attach an existing local branch: `git worktree add <path> <branch>`.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub fn create_for_branch(&self, path: &Path, branch: &str) -> Result<()> {
        if path.exists() {
            bail!("worktree path {} already exists", path.display());
        }
        let args = [
            OsStr::new("worktree"),
            OsStr::new("add"),
            path.as_os_str(),
            OsStr::new(branch),
        ];
        self.git
            .run_checked(&args)
            .with_context(|| format!("attach worktree {} to {branch}", path.display()))?;
        info!(path = %path.display(), branch, "attached worktree to existing branch");
        Ok(())
    }

    /// Remove a worktree. A directory that is already gone only needs its
    /// bookkeeping pruned.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn remove(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            debug!("worktree directory already gone, pruning");
            return self.prune();
        }
        let args = [
            OsStr::new("worktree"),
            OsStr::new("remove"),
            OsStr::new("--force"),
            path.as_os_str(),
        ];
        self.git
            .run_checked(&args)
            .with_context(|| format!("remove worktree {}", path.display()))?;
        info!(path = %path.display(), "removed worktree");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self
            .git
            .run_capture(&["worktree", "list", "--porcelain"])
            .context("list worktrees")?;
        Ok(parse_worktree_list(&out))
    }

    /// Registered entry for `path`, comparing symlink-resolved paths.
    pub fn find(&self, path: &Path) -> Result<Option<WorktreeEntry>> {
        let wanted = resolve(path);
        Ok(self
            .list()?
            .into_iter()
            .find(|entry| resolve(&entry.path) == wanted))
    }

    pub fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.find(path)?.is_some())
    }

    pub fn prune(&self) -> Result<()> {
        self.git
            .run_checked(&["worktree", "prune"])
            .context("prune worktrees")?;
        Ok(())
    }

    #[instrument(skip_all, fields(from = %from.display(), to = %to.display()))]
    pub fn move_to(&self, from: &Path, to: &Path) -> Result<()> {
        let args = [
            OsStr::new("worktree"),
            OsStr::new("move"),
            from.as_os_str(),
            to.as_os_str(),
        ];
        self.git
            .run_checked(&args)
            .with_context(|| format!("move worktree {} to {}", from.display(), to.display()))?;
        Ok(())
    }
}

/// Resolve symlinks when the path exists, otherwise use it as written.
fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Exclusive use of one slot's worktree. The slot lock is held until drop.
#[derive(Debug)]
pub struct WorktreeLease {
    slot: String,
    path: PathBuf,
    branch: String,
    created: bool,
    lock: FileLock,
}

impl WorktreeLease {
    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// True when this lease created the worktree rather than reusing one.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn git(&self) -> Git {
        Git::new(&self.path)
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Release the slot lock now instead of at drop.
    pub fn release(mut self) {
        self.lock.unlock();
    }
}

/// Pool of per-slot worktrees under one root directory.
#[derive(Debug, Clone)]
pub struct WorktreePool {
    manager: WorktreeManager,
    root: PathBuf,
    lock_dir: PathBuf,
}

impl WorktreePool {
    pub fn new(
        repo: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manager: WorktreeManager::new(repo),
            root: root.into(),
            lock_dir: lock_dir.into(),
        }
    }

    pub fn manager(&self) -> &WorktreeManager {
        &self.manager
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, slot: &str) -> PathBuf {
        self.root.join(sanitize(slot))
    }

    /// Lease the worktree for `slot`, creating or repairing it as needed.
    ///
    /// Fails with [`crate::io::lock::LockError::AlreadyHeld`] (inside the
    /// returned error) when another lease holds the slot.
    #[instrument(skip_all, fields(slot, branch, base_ref))]
    pub fn lease(&self, slot: &str, branch: &str, base_ref: Option<&str>) -> Result<WorktreeLease> {
        let path = self.slot_path(slot);
        let lock = self.slot_lock(slot)?;

        let created = {
            let _pool = self.pool_lock()?;
            self.prepare_slot(&path, branch, base_ref)?
        };

        let git = Git::new(&path);
        if !created {
            git.reset_hard(None)
                .with_context(|| format!("reset worktree {}", path.display()))?;
            git.clean_untracked()
                .with_context(|| format!("clean worktree {}", path.display()))?;
            let current = git.current_branch().ok();
            if current.as_deref() != Some(branch) {
                warn!(slot, ?current, branch, "reused worktree is on another branch, switching");
                if git.branch_exists(branch)? {
                    git.checkout(branch)?;
                } else {
                    git.checkout_new_branch(branch, base_ref)?;
                }
            }
        }

        debug!(slot, path = %path.display(), created, "worktree leased");
        Ok(WorktreeLease {
            slot: slot.to_string(),
            path,
            branch: branch.to_string(),
            created,
            lock,
        })
    }

    /// Remove the slot's worktree, logging instead of failing.
    #[instrument(skip_all, fields(slot))]
    pub fn retire(&self, slot: &str) {
        let path = self.slot_path(slot);
        if let Err(err) = self.try_retire(slot, &path) {
            warn!(
                slot,
                path = %path.display(),
                err = %format!("{err:#}"),
                "failed to retire worktree",
            );
        }
    }

    fn try_retire(&self, slot: &str, path: &Path) -> Result<()> {
        let _slot = self.slot_lock(slot)?;
        let _pool = self.pool_lock()?;
        if self.manager.exists(path)? || path.exists() {
            if let Err(err) = self.manager.remove(path) {
                warn!(
                    path = %path.display(),
                    err = %format!("{err:#}"),
                    "git worktree remove failed, deleting directory",
                );
                remove_dir(path)?;
            }
        }
        self.manager.prune()
    }

    pub fn list(&self) -> Result<Vec<WorktreeEntry>> {
        let _pool = self.pool_lock()?;
        self.manager.list()
    }

    pub fn prune(&self) -> Result<()> {
        let _pool = self.pool_lock()?;
        self.manager.prune()
    }

    /// Keyed on the resolved root so the lock name does not change once the
    /// slot directory exists.
    fn slot_lock(&self, slot: &str) -> Result<FileLock> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create worktree root {}", self.root.display()))?;
        let target = resolve(&self.root).join(sanitize(slot));
        Ok(FileLock::acquire(&self.lock_dir, target)?)
    }

    fn pool_lock(&self) -> Result<FileLock> {
        Ok(FileLock::acquire_within(
            &self.lock_dir,
            self.manager.repo(),
            POOL_LOCK_WAIT,
        )?)
    }

    /// Make the slot directory a registered worktree. Returns true when created.
    fn prepare_slot(&self, path: &Path, branch: &str, base_ref: Option<&str>) -> Result<bool> {
        let registered = self.manager.exists(path)?;
        let on_disk = path.exists();
        match (registered, on_disk) {
            (true, true) => return Ok(false),
            (true, false) => {
                debug!(path = %path.display(), "registered worktree missing on disk, pruning");
                self.manager.prune()?;
            }
            (false, true) => {
                warn!(path = %path.display(), "unregistered directory in worktree slot, deleting");
                remove_dir(path)?;
            }
            (false, false) => {}
        }

        if self.manager.git.branch_exists(branch)? {
            self.manager.create_for_branch(path, branch)?;
        } else {
            self.manager.create(path, branch, base_ref)?;
        }
        Ok(true)
    }
}

fn remove_dir(path: &Path) -> Result<()> {
    fs::remove_dir_all(path).with_context(|| format!("delete {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lock::LockError;
    use crate::test_support::TestRepo;

    fn pool(repo: &TestRepo) -> WorktreePool {
        WorktreePool::new(repo.path(), repo.worktree_root(), repo.lock_dir())
    }

    #[test]
    fn create_list_remove_round_trip() {
        let repo = TestRepo::new();
        let manager = WorktreeManager::new(repo.path());
        let path = repo.worktree_root().join("a");
        std::fs::create_dir_all(repo.worktree_root()).expect("mkdir");

        manager
            .create(&path, "job-42", Some("origin/main"))
            .expect("create");
        let entry = manager.find(&path).expect("find").expect("registered");
        assert_eq!(entry.branch.as_deref(), Some("job-42"));
        assert!(entry.commit.is_some());

        manager.remove(&path).expect("remove");
        assert!(!manager.exists(&path).expect("exists"));
        assert!(!path.exists());
    }

    #[test]
    fn create_refuses_existing_path() {
        let repo = TestRepo::new();
        let manager = WorktreeManager::new(repo.path());
        let path = repo.worktree_root().join("taken");
        std::fs::create_dir_all(&path).expect("mkdir");
        let err = manager.create(&path, "job-1", None).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn remove_of_missing_directory_prunes() {
        let repo = TestRepo::new();
        let manager = WorktreeManager::new(repo.path());
        let path = repo.worktree_root().join("gone");
        std::fs::create_dir_all(repo.worktree_root()).expect("mkdir");
        manager.create(&path, "job-3", None).expect("create");
        std::fs::remove_dir_all(&path).expect("rm");

        manager.remove(&path).expect("remove");
        assert!(!manager.exists(&path).expect("exists"));
    }

    #[test]
    fn exists_resolves_symlinks() {
        let repo = TestRepo::new();
        let manager = WorktreeManager::new(repo.path());
        let path = repo.worktree_root().join("real");
        std::fs::create_dir_all(repo.worktree_root()).expect("mkdir");
        manager.create(&path, "job-4", None).expect("create");

        let alias = repo.worktree_root().join("alias");
        std::os::unix::fs::symlink(&path, &alias).expect("symlink");
        assert!(manager.exists(&alias).expect("exists"));
    }

    #[test]
    fn move_relocates_worktree() {
        let repo = TestRepo::new();
        let manager = WorktreeManager::new(repo.path());
        let from = repo.worktree_root().join("from");
        let to = repo.worktree_root().join("to");
        std::fs::create_dir_all(repo.worktree_root()).expect("mkdir");
        manager.create(&from, "job-5", None).expect("create");

        manager.move_to(&from, &to).expect("move");
        assert!(manager.exists(&to).expect("exists"));
        assert!(!manager.exists(&from).expect("exists"));
    }

    #[test]
    fn lease_creates_then_reuses_clean() {
        let repo = TestRepo::new();
        let pool = pool(&repo);

        let lease = pool.lease("job-6", "job-6", Some("origin/main")).expect("lease");
        assert!(lease.created());
        std::fs::write(lease.path().join("scratch.txt"), "x").expect("write");
        std::fs::write(lease.path().join("README.md"), "dirty\n").expect("write");
        let path = lease.path().to_path_buf();
        drop(lease);

        let lease = pool.lease("job-6", "job-6", Some("origin/main")).expect("lease again");
        assert!(!lease.created());
        assert_eq!(lease.path(), path);
        assert!(!path.join("scratch.txt").exists());
        assert_eq!(
            std::fs::read_to_string(path.join("README.md")).expect("read"),
            "hello\n"
        );
    }

    #[test]
    fn second_lease_of_same_slot_fails_fast() {
        let repo = TestRepo::new();
        let pool = pool(&repo);

        let _held = pool.lease("job-7", "job-7", None).expect("lease");
        let err = pool.lease("job-7", "job-7", None).unwrap_err();
        let lock_err = err.downcast_ref::<LockError>().expect("lock error");
        assert!(lock_err.is_already_held());
    }

    #[test]
    fn lease_replaces_unregistered_directory() {
        let repo = TestRepo::new();
        let pool = pool(&repo);
        let path = pool.slot_path("job-8");
        std::fs::create_dir_all(&path).expect("mkdir");
        std::fs::write(path.join("leftover"), "x").expect("write");

        let lease = pool.lease("job-8", "job-8", None).expect("lease");
        assert!(lease.created());
        assert!(!path.join("leftover").exists());
        assert!(pool.manager().exists(&path).expect("exists"));
    }

    #[test]
    fn lease_recreates_missing_directory_on_surviving_branch() {
        let repo = TestRepo::new();
        let pool = pool(&repo);
        let lease = pool.lease("job-9", "job-9", None).expect("lease");
        let git = lease.git();
        std::fs::write(lease.path().join("work.txt"), "w\n").expect("write");
        git.add_all().expect("add");
        git.commit("work").expect("commit");
        let commit = git.latest_commit().expect("head");
        let path = lease.path().to_path_buf();
        drop(lease);
        std::fs::remove_dir_all(&path).expect("rm");

        let lease = pool.lease("job-9", "job-9", None).expect("lease again");
        assert!(lease.created());
        assert_eq!(lease.git().latest_commit().expect("head"), commit);
    }

    #[test]
    fn retire_removes_worktree() {
        let repo = TestRepo::new();
        let pool = pool(&repo);
        let path = pool.lease("job-10", "job-10", None).expect("lease").path().to_path_buf();

        pool.retire("job-10");
        assert!(!path.exists());
        assert!(!pool.manager().exists(&path).expect("exists"));
        // Retiring an unknown slot is a no-op.
        pool.retire("never-leased");
    }

    #[test]
    fn slot_names_are_sanitized() {
        let repo = TestRepo::new();
        let pool = pool(&repo);
        assert_eq!(
            pool.slot_path("team/job 1"),
            repo.worktree_root().join("team_sjob_w1")
        );
    }
}
