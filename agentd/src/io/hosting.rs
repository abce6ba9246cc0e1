//! Pull request operations through the `gh` CLI.
//!
//! `gh` runs with the host's credentials (it is not sandboxed) and its working
//! directory pinned to the job's worktree so it resolves the right repository.
//! Each call is deadline-bound and retried on transient failures.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::classifier::{is_transient, redact};
use crate::core::title::fit_title;
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::retry::RetryPolicy;

pub const DEFAULT_GH_TIMEOUT: Duration = Duration::from_secs(60);
const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum HostingError {
    #[error("`{program}` is not installed or not on PATH")]
    NotInstalled { program: String },

    #[error("gh is not authenticated; run `gh auth login`\n{output}")]
    NotAuthenticated { output: String },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },
}

impl HostingError {
    pub fn is_transient(&self) -> bool {
        match self {
            HostingError::TimedOut { .. } => true,
            HostingError::CommandFailed { output, .. } => is_transient(output),
            _ => false,
        }
    }
}

fn is_transient_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HostingError>()
        .is_some_and(HostingError::is_transient)
}

/// Field readable with `gh pr view --json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrField {
    Url,
    Title,
    Body,
    State,
}

impl PrField {
    pub fn as_str(self) -> &'static str {
        match self {
            PrField::Url => "url",
            PrField::Title => "title",
            PrField::Body => "body",
            PrField::State => "state",
        }
    }
}

/// A pull request opened for a job branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// The hosting operations the orchestrator needs.
pub trait PullRequestHost: Send + Sync {
    /// Number of the open pull request whose head is `branch`, if any.
    fn find_pull_request(&self, workdir: &Path, branch: &str) -> Result<Option<u64>>;

    fn open_pull_request(
        &self,
        workdir: &Path,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<PullRequest>;
}

/// `gh` wrapper.
#[derive(Debug, Clone)]
pub struct GhCli {
    program: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GhCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("gh"),
            workdir: workdir.into(),
            timeout: DEFAULT_GH_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Use a different executable (tests point this at a script).
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Same settings, different working directory.
    pub fn in_dir(&self, workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            ..self.clone()
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// First line of `gh --version`.
    pub fn version(&self) -> Result<String> {
        let out = self.call(&["--version"])?;
        Ok(out.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Fail with [`HostingError::NotAuthenticated`] unless `gh` has credentials.
    #[instrument(skip_all)]
    pub fn auth_status(&self) -> Result<()> {
        match self.call(&["auth", "status"]) {
            Ok(_) => Ok(()),
            Err(err) => match err.downcast::<HostingError>() {
                Ok(HostingError::CommandFailed { output, .. }) => {
                    Err(HostingError::NotAuthenticated { output }.into())
                }
                Ok(other) => Err(other.into()),
                Err(err) => Err(err),
            },
        }
    }

    /// Open a pull request from the current branch and return its URL.
    ///
    /// Titles over the platform limit are cut and the remainder moved into
    /// the body.
    #[instrument(skip_all, fields(base))]
    pub fn create_pr(&self, title: &str, body: &str, base: &str) -> Result<String> {
        let fitted = fit_title(title, body);
        if !fitted.overflow.is_empty() {
            debug!(overflow_chars = fitted.overflow.chars().count(), "title truncated");
        }
        let out = self.call(&[
            "pr",
            "create",
            "--title",
            &fitted.title,
            "--body",
            &fitted.body,
            "--base",
            base,
        ])?;
        let url = out
            .lines()
            .map(str::trim)
            .rfind(|line| line.starts_with("http"))
            .ok_or_else(|| HostingError::UnexpectedOutput {
                command: "gh pr create".to_string(),
                output: out.clone(),
            })?
            .to_string();
        info!(url = %url, "opened pull request");
        Ok(url)
    }

    /// One field of the pull request for `selector` (branch, number or URL).
    pub fn pr_view_field(&self, selector: &str, field: PrField) -> Result<String> {
        let jq = format!(".{}", field.as_str());
        let out = self.call(&["pr", "view", selector, "--json", field.as_str(), "--jq", &jq])?;
        Ok(out.trim_end_matches('\n').to_string())
    }

    /// Set a pull request title, moving any overflow to the top of its body.
    #[instrument(skip_all, fields(selector))]
    pub fn edit_title(&self, selector: &str, title: &str) -> Result<()> {
        let fitted = fit_title(title, "");
        self.call(&["pr", "edit", selector, "--title", &fitted.title])?;
        if !fitted.overflow.is_empty() {
            let body = self.pr_view_field(selector, PrField::Body)?;
            let merged = fit_title(title, &body);
            self.edit_body(selector, &merged.body)?;
        }
        Ok(())
    }

    pub fn edit_body(&self, selector: &str, body: &str) -> Result<()> {
        self.call(&["pr", "edit", selector, "--body", body])?;
        Ok(())
    }

    /// Number of the open pull request with head `branch`.
    pub fn find_pr_number(&self, branch: &str) -> Result<Option<u64>> {
        #[derive(Deserialize)]
        struct Entry {
            number: u64,
        }
        let out = self.call(&["pr", "list", "--head", branch, "--json", "number"])?;
        if out.trim().is_empty() {
            return Ok(None);
        }
        let entries: Vec<Entry> = serde_json::from_str(out.trim())
            .with_context(|| format!("parse gh pr list output: {}", out.trim()))?;
        Ok(entries.first().map(|e| e.number))
    }

    /// Run `gh` with retry; returns stdout.
    fn call(&self, args: &[&str]) -> Result<String> {
        self.retry
            .run(|| self.call_once(args), is_transient_error)
    }

    fn call_once(&self, args: &[&str]) -> Result<String> {
        let command = self.display(args);
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GH_PROMPT_DISABLED", "1")
            .env("NO_COLOR", "1");
        debug!(command = %command, "running gh");
        let out = match run_command_with_timeout(cmd, None, self.timeout, OUTPUT_LIMIT_BYTES) {
            Ok(out) => out,
            Err(err) if is_not_found(&err) => {
                return Err(HostingError::NotInstalled {
                    program: self.program.display().to_string(),
                }
                .into());
            }
            Err(err) => return Err(err).with_context(|| format!("spawn {command}")),
        };
        check(command, self.timeout, out)
    }

    fn display(&self, args: &[&str]) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(args.iter().map(|a| a.to_string()));
        redact(&parts.join(" "))
    }
}

fn check(command: String, timeout: Duration, out: CommandOutput) -> Result<String> {
    if out.timed_out {
        return Err(HostingError::TimedOut { command, timeout }.into());
    }
    if !out.status.success() {
        return Err(HostingError::CommandFailed {
            command,
            output: redact(&out.combined()),
        }
        .into());
    }
    Ok(out.stdout_lossy())
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
    })
}

/// Trailing number of a pull request URL (`.../pull/17` → 17).
pub fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

impl PullRequestHost for GhCli {
    fn find_pull_request(&self, workdir: &Path, branch: &str) -> Result<Option<u64>> {
        self.in_dir(workdir).find_pr_number(branch)
    }

    fn open_pull_request(
        &self,
        workdir: &Path,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<PullRequest> {
        let url = self.in_dir(workdir).create_pr(title, body, base)?;
        let number = pr_number_from_url(&url).ok_or_else(|| HostingError::UnexpectedOutput {
            command: "gh pr create".to_string(),
            output: url.clone(),
        })?;
        Ok(PullRequest { number, url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeGh;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryPolicy::default()
        }
    }

    fn gh(fake: &FakeGh) -> GhCli {
        GhCli::new(fake.dir())
            .with_program(fake.program())
            .with_retry(fast_retry())
    }

    #[test]
    fn version_and_auth() {
        let fake = FakeGh::new();
        let gh = gh(&fake);
        assert_eq!(gh.version().expect("version"), "gh version 2.50.0 (fake)");
        gh.auth_status().expect("auth");
    }

    #[test]
    fn create_pr_truncates_long_titles() {
        let fake = FakeGh::new();
        let title = "t".repeat(300);
        let url = gh(&fake).create_pr(&title, "body", "main").expect("create");
        assert_eq!(url, "https://github.com/acme/widgets/pull/17");

        let call = fake.calls().into_iter().find(|c| c.starts_with("pr create")).expect("call");
        assert!(call.contains(&format!("--title {}...", "t".repeat(253))));
        assert!(call.contains("--base main"));
    }

    #[test]
    fn find_pr_number_parses_json() {
        let fake = FakeGh::new().with_pr_list("[{\"number\":17}]");
        assert_eq!(gh(&fake).find_pr_number("job-1").expect("find"), Some(17));

        let fake = FakeGh::new();
        assert_eq!(gh(&fake).find_pr_number("job-1").expect("find"), None);
    }

    #[test]
    fn transient_failures_are_retried() {
        let fake = FakeGh::new().fail_first(2, "dial tcp 140.82.112.6:443: i/o timeout");
        gh(&fake).version().expect("eventually succeeds");
        assert_eq!(fake.calls().len(), 3);
    }

    #[test]
    fn auth_failures_are_not_retried() {
        let fake = FakeGh::new().fail_first(5, "HTTP 401: Bad credentials");
        let err = gh(&fake).auth_status().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HostingError>(),
            Some(HostingError::NotAuthenticated { .. })
        ));
        assert_eq!(fake.calls().len(), 1);
    }

    #[test]
    fn missing_binary_is_not_installed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = GhCli::new(temp.path())
            .with_program(temp.path().join("no-gh"))
            .version()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HostingError>(),
            Some(HostingError::NotInstalled { .. })
        ));
    }

    #[test]
    fn host_trait_returns_number_and_url() {
        let fake = FakeGh::new();
        let host = gh(&fake);
        let pr = host
            .open_pull_request(fake.dir(), "title", "body", "main")
            .expect("open");
        assert_eq!(pr.number, 17);
        assert!(pr.url.ends_with("/pull/17"));
    }

    #[test]
    fn parses_pr_numbers_from_urls() {
        assert_eq!(pr_number_from_url("https://github.com/o/r/pull/5"), Some(5));
        assert_eq!(pr_number_from_url("https://github.com/o/r/pull/5/"), Some(5));
        assert_eq!(pr_number_from_url("https://github.com/o/r"), None);
    }
}
