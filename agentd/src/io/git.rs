//! Git adapter scoped to one working directory.
//!
//! Every call is a `git` subprocess bounded by a deadline. Calls that touch
//! the network also disable credential prompts so a missing credential fails
//! fast instead of hanging the job.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::classifier::redact;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Deadline for purely local git commands.
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(120);
/// Deadline for commands that talk to a remote.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(180);

const OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;
const ORIGIN: &str = "origin";

const NO_PROMPT_ENV: &[(&str, &str)] = &[
    ("GIT_TERMINAL_PROMPT", "0"),
    ("GCM_INTERACTIVE", "never"),
    ("GIT_SSH_COMMAND", "ssh -o BatchMode=yes"),
];

#[derive(Debug, Error)]
pub enum GitError {
    #[error("{} is not a git repository", path.display())]
    NotARepository { path: PathBuf },

    #[error("repository at {} has no `origin` remote", path.display())]
    NoRemote { path: PathBuf },

    #[error("detached HEAD in {}", path.display())]
    DetachedHead { path: PathBuf },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` failed: {output}")]
    CommandFailed { command: String, output: String },
}

impl GitError {
    /// Combined output of a failed command, empty for other variants.
    pub fn output(&self) -> &str {
        match self {
            GitError::CommandFailed { output, .. } => output,
            _ => "",
        }
    }
}

/// Result of `git pull` when the failure is an expected branch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Updated,
    /// The branch has no upstream configured; nothing to pull.
    NoUpstream,
    /// The upstream branch was deleted on the remote (typically after merge).
    RemoteBranchDeleted,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    network_timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            network_timeout: NETWORK_TIMEOUT,
        }
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Fail with [`GitError::NotARepository`] unless the workdir is inside a repository.
    pub fn ensure_repository(&self) -> Result<()> {
        let out = self.run(&["rev-parse", "--git-dir"], false)?;
        if out.success() {
            return Ok(());
        }
        Err(GitError::NotARepository {
            path: self.workdir.clone(),
        }
        .into())
    }

    pub fn git_dir(&self) -> Result<PathBuf> {
        let raw = self.capture_line(&["rev-parse", "--git-dir"])?;
        let path = PathBuf::from(raw);
        Ok(if path.is_absolute() {
            path
        } else {
            self.workdir.join(path)
        })
    }

    pub fn toplevel(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(
            self.capture_line(&["rev-parse", "--show-toplevel"])?,
        ))
    }

    /// Current branch name; [`GitError::DetachedHead`] when not on a branch.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let name = self.capture_line(&["branch", "--show-current"])?;
        if name.is_empty() {
            warn!(workdir = %self.workdir.display(), "detached HEAD detected");
            return Err(GitError::DetachedHead {
                path: self.workdir.clone(),
            }
            .into());
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["branch", "--format=%(refname:short)"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.list_branches()?.iter().any(|b| b == branch))
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// `git checkout -b <branch> [<start>]`; without `start` the branch forks
    /// from `HEAD`.
    #[instrument(skip_all, fields(branch, start))]
    pub fn checkout_new_branch(&self, branch: &str, start: Option<&str>) -> Result<()> {
        let mut args = vec!["checkout", "-b", branch];
        args.extend(start);
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Rename the current branch.
    #[instrument(skip_all, fields(new_name))]
    pub fn rename_branch(&self, new_name: &str) -> Result<()> {
        self.run_checked(&["branch", "-m", new_name])?;
        Ok(())
    }

    /// `git reset --hard [target]`.
    #[instrument(skip_all, fields(target))]
    pub fn reset_hard(&self, target: Option<&str>) -> Result<()> {
        match target {
            Some(target) => self.run_checked(&["reset", "--hard", target])?,
            None => self.run_checked(&["reset", "--hard"])?,
        };
        Ok(())
    }

    /// Remove untracked files and directories (ignored files are kept).
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "."])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes. Returns `false` without committing when nothing is staged.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// `git push -u origin <branch>`.
    #[instrument(skip_all, fields(branch))]
    pub fn push(&self, branch: &str) -> Result<()> {
        self.run_network_checked(&["push", "-u", ORIGIN, branch])?;
        Ok(())
    }

    /// Pull the current branch, mapping expected upstream states to [`PullOutcome`].
    #[instrument(skip_all)]
    pub fn pull(&self) -> Result<PullOutcome> {
        let args = ["pull", "--no-rebase", "--no-edit"];
        let out = self.run(&args, true)?;
        if out.timed_out {
            return Err(self.timed_out(&args, self.network_timeout));
        }
        if out.success() {
            return Ok(PullOutcome::Updated);
        }
        let output = out.combined();
        if let Some(outcome) = classify_pull_failure(&output) {
            debug!(?outcome, "pull reported expected upstream state");
            return Ok(outcome);
        }
        Err(self.command_failed(&args, &output))
    }

    /// `git fetch [origin [branch]]`.
    #[instrument(skip_all, fields(branch))]
    pub fn fetch(&self, branch: Option<&str>) -> Result<()> {
        match branch {
            Some(branch) => self.run_network_checked(&["fetch", ORIGIN, branch])?,
            None => self.run_network_checked(&["fetch", ORIGIN])?,
        };
        Ok(())
    }

    /// Default branch of `origin`, read from the `HEAD branch:` line of `git remote show`.
    #[instrument(skip_all)]
    pub fn default_branch(&self) -> Result<String> {
        let out = self.run_network_checked(&["remote", "show", ORIGIN])?;
        parse_head_branch(&out.stdout_lossy()).with_context(|| {
            format!(
                "no default branch reported for origin of {}",
                self.workdir.display()
            )
        })
    }

    /// URL of `origin`; [`GitError::NoRemote`] when it is not configured.
    pub fn remote_url(&self) -> Result<String> {
        let out = self.run(&["remote", "get-url", ORIGIN], false)?;
        if !out.success() {
            return Err(GitError::NoRemote {
                path: self.workdir.clone(),
            }
            .into());
        }
        Ok(out.stdout_lossy().trim().to_string())
    }

    pub fn set_remote_url(&self, url: &str) -> Result<()> {
        self.run_checked(&["remote", "set-url", ORIGIN, url])?;
        Ok(())
    }

    /// `git remote -v` with credentials redacted.
    pub fn remotes(&self) -> Result<String> {
        Ok(redact(&self.run_capture(&["remote", "-v"])?))
    }

    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self.run_network_checked(&["ls-remote", "--heads", ORIGIN, branch])?;
        Ok(!out.stdout_lossy().trim().is_empty())
    }

    /// Probe that `origin` is reachable with the current credentials.
    #[instrument(skip_all)]
    pub fn check_remote_access(&self) -> Result<()> {
        self.run_network_checked(&["ls-remote", ORIGIN, "HEAD"])?;
        Ok(())
    }

    /// False for a repository with no commits yet.
    pub fn has_commits(&self) -> Result<bool> {
        Ok(self.run(&["rev-parse", "--verify", "HEAD"], false)?.success())
    }

    pub fn latest_commit(&self) -> Result<String> {
        self.capture_line(&["rev-parse", "HEAD"])
    }

    pub fn remote_commit(&self, branch: &str) -> Result<String> {
        self.capture_line(&["rev-parse", &format!("{ORIGIN}/{branch}")])
    }

    /// Run a local git command and return its stdout, failing on non-zero exit.
    pub fn run_capture<S: AsRef<OsStr>>(&self, args: &[S]) -> Result<String> {
        Ok(self.run_checked(args)?.stdout_lossy())
    }

    pub fn run_checked<S: AsRef<OsStr>>(&self, args: &[S]) -> Result<CommandOutput> {
        self.checked(args, false)
    }

    fn run_network_checked<S: AsRef<OsStr>>(&self, args: &[S]) -> Result<CommandOutput> {
        self.checked(args, true)
    }

    fn capture_line(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_capture(args)?.trim().to_string())
    }

    fn checked<S: AsRef<OsStr>>(&self, args: &[S], network: bool) -> Result<CommandOutput> {
        let out = self.run(args, network)?;
        if out.timed_out {
            let timeout = if network {
                self.network_timeout
            } else {
                LOCAL_TIMEOUT
            };
            return Err(self.timed_out(args, timeout));
        }
        if !out.success() {
            return Err(self.command_failed(args, &out.combined()));
        }
        Ok(out)
    }

    /// Spawn git; only spawn/wait failures are errors here.
    fn run<S: AsRef<OsStr>>(&self, args: &[S], network: bool) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let timeout = if network {
            cmd.envs(NO_PROMPT_ENV.iter().copied());
            self.network_timeout
        } else {
            LOCAL_TIMEOUT
        };
        debug!(command = %render_command(args), network, "running git");
        run_command_with_timeout(cmd, None, timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn {}", render_command(args)))
    }

    fn timed_out<S: AsRef<OsStr>>(&self, args: &[S], timeout: Duration) -> anyhow::Error {
        warn!(command = %render_command(args), "git command timed out");
        GitError::TimedOut {
            command: render_command(args),
            timeout,
        }
        .into()
    }

    fn command_failed<S: AsRef<OsStr>>(&self, args: &[S], output: &str) -> anyhow::Error {
        GitError::CommandFailed {
            command: render_command(args),
            output: redact(output),
        }
        .into()
    }
}

fn render_command<S: AsRef<OsStr>>(args: &[S]) -> String {
    let mut parts = vec!["git".to_string()];
    parts.extend(
        args.iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned()),
    );
    redact(&parts.join(" "))
}

fn classify_pull_failure(output: &str) -> Option<PullOutcome> {
    let lower = output.to_ascii_lowercase();
    if lower.contains("no tracking information") {
        return Some(PullOutcome::NoUpstream);
    }
    if lower.contains("no such ref was fetched") || lower.contains("couldn't find remote ref") {
        return Some(PullOutcome::RemoteBranchDeleted);
    }
    None
}

fn parse_head_branch(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("HEAD branch:"))
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "(unknown)")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_head_branch_line() {
        let out = "* remote origin\n  Fetch URL: /tmp/o.git\n  HEAD branch: main\n  Remote branch:\n";
        assert_eq!(parse_head_branch(out).as_deref(), Some("main"));
        assert_eq!(parse_head_branch("  HEAD branch: (unknown)\n"), None);
        assert_eq!(parse_head_branch(""), None);
    }

    #[test]
    fn classifies_pull_failures() {
        assert_eq!(
            classify_pull_failure(
                "There is no tracking information for the current branch.\nPlease specify which branch you want to merge with."
            ),
            Some(PullOutcome::NoUpstream)
        );
        assert_eq!(
            classify_pull_failure(
                "Your configuration specifies to merge with the ref 'refs/heads/job-1'\nfrom the remote, but no such ref was fetched."
            ),
            Some(PullOutcome::RemoteBranchDeleted)
        );
        assert_eq!(classify_pull_failure("fatal: unable to access"), None);
    }

    #[test]
    fn not_a_repository_is_typed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = Git::new(temp.path()).ensure_repository().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GitError>(),
            Some(GitError::NotARepository { .. })
        ));
    }

    #[test]
    fn reads_branch_commit_and_default_branch() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        assert_eq!(git.current_branch().expect("branch"), "main");
        assert!(git.has_commits().expect("has commits"));
        assert_eq!(git.latest_commit().expect("head").len(), 40);
        assert_eq!(git.default_branch().expect("default"), "main");
        assert_eq!(
            git.remote_commit("main").expect("remote"),
            git.latest_commit().expect("head")
        );
    }

    #[test]
    fn commit_push_and_remote_branch_lookup() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        git.checkout_new_branch("job-1", None).expect("branch");
        std::fs::write(repo.path().join("a.txt"), "a\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit("add a").expect("commit"));
        assert!(!git.commit("nothing").expect("noop commit"));

        assert!(!git.remote_branch_exists("job-1").expect("ls-remote"));
        git.push("job-1").expect("push");
        assert!(git.remote_branch_exists("job-1").expect("ls-remote"));
        assert_eq!(git.pull().expect("pull"), PullOutcome::Updated);
    }

    #[test]
    fn pull_without_upstream_is_not_an_error() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        git.checkout_new_branch("local-only", None).expect("branch");
        assert_eq!(git.pull().expect("pull"), PullOutcome::NoUpstream);
    }

    #[test]
    fn pull_after_remote_delete_reports_it() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        git.checkout_new_branch("job-2", None).expect("branch");
        git.push("job-2").expect("push");
        repo.delete_remote_branch("job-2");
        assert_eq!(git.pull().expect("pull"), PullOutcome::RemoteBranchDeleted);
    }

    #[test]
    fn reset_and_clean_restore_pristine_tree() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        std::fs::write(repo.path().join("README.md"), "changed\n").expect("write");
        std::fs::create_dir_all(repo.path().join("junk")).expect("mkdir");
        std::fs::write(repo.path().join("junk").join("x"), "x").expect("write");

        git.reset_hard(None).expect("reset");
        git.clean_untracked().expect("clean");

        assert_eq!(
            std::fs::read_to_string(repo.path().join("README.md")).expect("read"),
            "hello\n"
        );
        assert!(!repo.path().join("junk").exists());
    }

    #[test]
    fn rename_and_delete_branches() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        git.checkout_new_branch("old", None).expect("branch");
        git.rename_branch("new").expect("rename");
        assert_eq!(git.current_branch().expect("branch"), "new");
        git.checkout("main").expect("checkout");
        git.delete_branch("new").expect("delete");
        assert!(!git.branch_exists("new").expect("list"));
    }

    #[test]
    fn missing_remote_is_typed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let status = Command::new("git")
            .args(["init", "-q"])
            .current_dir(temp.path())
            .status()
            .expect("git init");
        assert!(status.success());
        let err = Git::new(temp.path()).remote_url().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GitError>(),
            Some(GitError::NoRemote { .. })
        ));
    }

    #[test]
    fn failures_carry_redacted_command() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        let err = git
            .run_checked(&["fetch", "https://user:pw@127.0.0.1:1/none.git"])
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("https://***@127.0.0.1:1/none.git"), "{text}");
        assert!(!text.contains("user:pw"));
    }
}
