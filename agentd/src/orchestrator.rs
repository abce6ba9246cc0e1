//! Turn orchestration: lease a worktree, run the assistant, publish, record.
//!
//! Each job owns one worktree slot named after its id. A turn holds the slot
//! lock from lease to release, so turns for the same job never overlap while
//! different jobs proceed in parallel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::AgentConfig;
use crate::core::classifier::redact;
use crate::core::sanitize::sanitize;
use crate::io::git::{Git, PullOutcome};
use crate::io::hosting::{GhCli, PullRequest, PullRequestHost};
use crate::io::lock::LockError;
use crate::io::sandbox::Sandbox;
use crate::io::state_store::{
    ExecutionMode, Job, JobStateStore, JobStatus, MessageKind, QueuedMessage,
};
use crate::io::worktree::{WorktreeLease, WorktreePool};
use crate::output::Transcript;
use crate::session::{AssistantCli, SessionRequest, SessionRunner};

/// Mode for jobs first seen through the queue.
pub const DEFAULT_MODE: ExecutionMode = ExecutionMode::Mutating;

/// One upstream message to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub job_id: String,
    pub message_id: String,
    pub kind: MessageKind,
    pub text: String,
    /// Link back to the upstream message, copied into the PR body.
    pub link: String,
    pub mode: ExecutionMode,
}

impl TurnRequest {
    pub fn from_message(message: &QueuedMessage, mode: ExecutionMode) -> Self {
        Self {
            job_id: message.job_id.clone(),
            message_id: message.message_id.clone(),
            kind: message.kind,
            text: message.text.clone(),
            link: message.link.clone(),
            mode,
        }
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    /// Job record as persisted at the end of the turn.
    pub job: Job,
    pub transcript: Transcript,
    /// True when the turn produced a commit that was pushed.
    pub committed: bool,
    /// Pull request opened by this turn.
    pub pull_request: Option<PullRequest>,
}

/// Result of dispatching the next queued message of one job.
#[derive(Debug)]
pub struct DispatchResult {
    pub job_id: String,
    pub result: Result<Option<TurnOutcome>>,
}

pub struct Orchestrator {
    config: AgentConfig,
    store: JobStateStore,
    pool: WorktreePool,
    runner: Arc<dyn SessionRunner>,
    host: Arc<dyn PullRequestHost>,
    default_branch: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(
        config: AgentConfig,
        store: JobStateStore,
        runner: Arc<dyn SessionRunner>,
        host: Arc<dyn PullRequestHost>,
    ) -> Self {
        let pool = WorktreePool::new(&config.repo, &config.worktree_root, config.lock_dir());
        Self {
            config,
            store,
            pool,
            runner,
            host,
            default_branch: Mutex::new(None),
        }
    }

    /// Wire up the real assistant CLI and `gh` from configuration.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let (store, _) = JobStateStore::open(&config.state_path, config.agent_id())?;
        let runner = AssistantCli::new(config.assistant.kind, Sandbox::new(config.sandbox_config()))
            .with_program(config.assistant.program())
            .with_output_limit(config.output_limit_bytes);
        let host = GhCli::new(&config.repo)
            .with_timeout(config.gh_timeout())
            .with_retry(config.retry.clone());
        Ok(Self::new(config, store, Arc::new(runner), Arc::new(host)))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStateStore {
        &self.store
    }

    pub fn pool(&self) -> &WorktreePool {
        &self.pool
    }

    /// Queue an upstream message. Returns false for a duplicate message id.
    pub fn enqueue(&self, message: QueuedMessage) -> Result<bool> {
        self.store.enqueue_message(message)
    }

    /// Run one turn for `request.job_id`.
    ///
    /// Fails with [`LockError::AlreadyHeld`] (inside the error) while another
    /// turn holds the job's worktree; the job record is left untouched then.
    #[instrument(skip_all, fields(job_id = %request.job_id, message_id = %request.message_id))]
    pub fn run_turn(&self, request: &TurnRequest) -> Result<TurnOutcome> {
        let default_branch = self.default_branch()?;
        let base_ref = format!("origin/{default_branch}");
        let branch = match self.store.get_job(&request.job_id) {
            Some(job) => job.branch,
            None => self.branch_for(&request.job_id),
        };
        let lease = self.pool.lease(&request.job_id, &branch, Some(&base_ref))?;

        // Read under the lease: a turn that just finished may have recorded
        // a session or pull request since the branch lookup above.
        let mut job = self
            .store
            .get_job(&request.job_id)
            .unwrap_or_else(|| Job::new(&request.job_id, branch, request.mode));
        job.status = JobStatus::InProgress;
        job.mode = request.mode;
        job.processing_message_id = request.message_id.clone();
        job.message_link = request.link.clone();
        self.store.update_job(job.clone())?;

        match self.execute(request, &job, &lease, &default_branch) {
            Ok(outcome) => {
                lease.release();
                Ok(outcome)
            }
            Err(err) => {
                self.record_failure(&job.job_id, &err);
                Err(err)
            }
        }
    }

    /// Run the oldest queued message of `job_id`, if any.
    ///
    /// The message is dequeued once the turn finishes, successfully or not.
    /// A turn refused because the job's worktree is busy leaves it queued.
    #[instrument(skip_all, fields(job_id))]
    pub fn dispatch_next(&self, job_id: &str) -> Result<Option<TurnOutcome>> {
        let Some(message) = self.store.next_queued_for_job(job_id) else {
            return Ok(None);
        };
        let mode = self.store.get_job(job_id).map_or(DEFAULT_MODE, |job| job.mode);
        let request = TurnRequest::from_message(&message, mode);

        let result = self.run_turn(&request);
        if let Err(err) = &result
            && is_busy(err)
        {
            debug!(message_id = %message.message_id, "job busy, message stays queued");
            return result.map(Some);
        }
        if let Err(err) = self.store.dequeue_message(&message.message_id) {
            warn!(
                message_id = %message.message_id,
                err = %format!("{err:#}"),
                "failed to dequeue message",
            );
        }
        result.map(Some)
    }

    /// Dispatch one message for every job with queued work, running up to
    /// `max_concurrent_jobs` jobs at a time.
    pub fn run_queued(&self) -> Vec<DispatchResult> {
        let mut job_ids: Vec<String> = Vec::new();
        for message in self.store.list_queued_messages() {
            if !job_ids.contains(&message.job_id) {
                job_ids.push(message.job_id);
            }
        }
        info!(jobs = job_ids.len(), "dispatching queued messages");

        let mut results = Vec::with_capacity(job_ids.len());
        for chunk in job_ids.chunks(self.config.max_concurrent_jobs.max(1)) {
            let chunk_results: Vec<DispatchResult> = std::thread::scope(|s| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|job_id| (job_id, s.spawn(move || self.dispatch_next(job_id))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(job_id, handle)| DispatchResult {
                        job_id: job_id.clone(),
                        result: handle
                            .join()
                            .unwrap_or_else(|_| Err(anyhow!("dispatch for job {job_id} panicked"))),
                    })
                    .collect()
            });
            results.extend(chunk_results);
        }
        results
    }

    /// Retire the job's worktree and forget the job and its queued messages.
    #[instrument(skip_all, fields(job_id))]
    pub fn resolve_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.pool.retire(job_id);
        let removed = self.store.remove_job(job_id)?;
        info!(found = removed.is_some(), "job resolved");
        Ok(removed)
    }

    fn execute(
        &self,
        request: &TurnRequest,
        job: &Job,
        lease: &WorktreeLease,
        default_branch: &str,
    ) -> Result<TurnOutcome> {
        let git = lease.git().with_network_timeout(self.config.git_network_timeout());
        sync_with_remote(&git, default_branch)?;

        let resume_session = match request.kind {
            MessageKind::FollowUp => job.session_id.clone(),
            MessageKind::NewConversation => None,
        };
        let session = SessionRequest {
            workdir: lease.path().to_path_buf(),
            prompt: request.text.clone(),
            resume_session,
            mode: request.mode,
            transcript_path: self.transcript_path(request),
            timeout: Some(self.config.session_timeout()),
        };
        let transcript = self.runner.run(&session)?;
        let final_text = transcript.final_text().unwrap_or_default().to_string();

        let (committed, pull_request) = match request.mode {
            ExecutionMode::Mutating => {
                self.publish(&git, job, request, &final_text, default_branch)?
            }
            ExecutionMode::ReadOnly => (false, None),
        };

        let session_id = transcript.session_id().map(str::to_string);
        let pr_number = pull_request.as_ref().map(|pr| pr.number.to_string());
        let job = self
            .store
            .update_job_with(&job.job_id, |job| {
                if session_id.is_some() {
                    job.session_id = session_id;
                }
                if pr_number.is_some() {
                    job.pr_id = pr_number;
                }
                job.last_message = final_text;
                job.processing_message_id.clear();
                job.status = JobStatus::Completed;
            })?
            .with_context(|| format!("job {} was removed during its turn", job.job_id))?;

        info!(committed, pr = ?job.pr_id, session_id = ?job.session_id, "turn completed");
        Ok(TurnOutcome {
            job,
            transcript,
            committed,
            pull_request,
        })
    }

    /// Commit and push the turn's changes, opening a pull request on the
    /// first turn that pushes anything.
    fn publish(
        &self,
        git: &Git,
        job: &Job,
        request: &TurnRequest,
        final_text: &str,
        default_branch: &str,
    ) -> Result<(bool, Option<PullRequest>)> {
        git.add_all()?;
        if !git.commit(&commit_message(request))? {
            debug!("no changes to commit");
            return Ok((false, None));
        }
        git.push(&job.branch)?;

        if job.pr_id.is_some() {
            return Ok((true, None));
        }
        if let Some(number) = self.host.find_pull_request(git.workdir(), &job.branch)? {
            debug!(number, "pull request already open");
            return Ok((
                true,
                Some(PullRequest {
                    number,
                    url: String::new(),
                }),
            ));
        }
        let pr = self.host.open_pull_request(
            git.workdir(),
            &pr_title(request),
            &pr_body(request, final_text),
            default_branch,
        )?;
        info!(number = pr.number, url = %pr.url, "opened pull request");
        Ok((true, Some(pr)))
    }

    fn record_failure(&self, job_id: &str, err: &anyhow::Error) {
        warn!(job_id, err = %format!("{err:#}"), "turn failed");
        let summary = format!("turn failed: {}", redact(&format!("{err:#}")));
        if let Err(store_err) = self.store.update_job_with(job_id, |job| {
            job.last_message = summary;
            job.processing_message_id.clear();
        }) {
            warn!(job_id, err = %format!("{store_err:#}"), "failed to record turn failure");
        }
    }

    fn default_branch(&self) -> Result<String> {
        if let Some(branch) = self.config.default_branch() {
            return Ok(branch.to_string());
        }
        let mut cached = self.default_branch.lock();
        if let Some(branch) = cached.as_ref() {
            return Ok(branch.clone());
        }
        let branch = Git::new(&self.config.repo)
            .with_network_timeout(self.config.git_network_timeout())
            .default_branch()?;
        *cached = Some(branch.clone());
        Ok(branch)
    }

    fn branch_for(&self, job_id: &str) -> String {
        format!("{}{}", self.config.branch_prefix, sanitize(job_id))
    }

    fn transcript_path(&self, request: &TurnRequest) -> PathBuf {
        self.config
            .transcript_dir
            .join(sanitize(&request.job_id))
            .join(format!("{}.jsonl", sanitize(&request.message_id)))
    }
}

/// Bring the leased branch up to date; a branch deleted upstream falls back
/// to the default branch.
fn sync_with_remote(git: &Git, default_branch: &str) -> Result<()> {
    match git.pull()? {
        PullOutcome::Updated => {}
        PullOutcome::NoUpstream => debug!("branch has no upstream yet"),
        PullOutcome::RemoteBranchDeleted => {
            warn!(default_branch, "remote branch deleted, resetting to default branch");
            git.fetch(Some(default_branch))?;
            git.reset_hard(Some(&format!("origin/{default_branch}")))?;
        }
    }
    Ok(())
}

fn is_busy(err: &anyhow::Error) -> bool {
    err.downcast_ref::<LockError>()
        .is_some_and(LockError::is_already_held)
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
}

fn commit_message(request: &TurnRequest) -> String {
    match first_line(&request.text) {
        "" => format!("agentd: update for {}", request.job_id),
        line => format!("agentd: {line}"),
    }
}

fn pr_title(request: &TurnRequest) -> String {
    match first_line(&request.text) {
        "" => format!("agentd: {}", request.job_id),
        line => line.to_string(),
    }
}

fn pr_body(request: &TurnRequest, final_text: &str) -> String {
    let mut body = final_text.trim().to_string();
    if !request.link.is_empty() {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str("Requested in ");
        body.push_str(&request.link);
    }
    body
}
