//! Durable job and message-queue state.
//!
//! The whole state lives in one JSON file. Every mutation is applied to a copy
//! of the in-memory state, written to disk atomically, and only then made
//! visible, all while holding the write lock. A crash therefore leaves either
//! the previous or the new file, never a torn one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed,
}

/// Whether a job may change the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    ReadOnly,
    Mutating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    NewConversation,
    FollowUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub branch: String,
    /// Assistant session to resume on follow-ups.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Pull request number, once one exists.
    #[serde(default)]
    pub pr_id: Option<String>,
    /// Last message the agent sent back upstream.
    #[serde(default)]
    pub last_message: String,
    /// Upstream message currently being processed.
    #[serde(default)]
    pub processing_message_id: String,
    #[serde(default)]
    pub message_link: String,
    pub status: JobStatus,
    pub mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: impl Into<String>, branch: impl Into<String>, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            branch: branch.into(),
            session_id: None,
            pr_id: None,
            last_message: String::new(),
            processing_message_id: String::new(),
            message_link: String::new(),
            status: JobStatus::InProgress,
            mode,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub job_id: String,
    pub kind: MessageKind,
    pub text: String,
    #[serde(default)]
    pub link: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(
        message_id: impl Into<String>,
        job_id: impl Into<String>,
        kind: MessageKind,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            job_id: job_id.into(),
            kind,
            text: text.into(),
            link: String::new(),
            enqueued_at: Utc::now(),
        }
    }
}

/// On-disk shape of the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub agent_id: String,
    #[serde(default)]
    pub jobs: BTreeMap<String, Job>,
    #[serde(default)]
    pub queued_messages: BTreeMap<String, QueuedMessage>,
}

impl PersistedState {
    fn new(agent_id: String) -> Self {
        Self {
            agent_id,
            jobs: BTreeMap::new(),
            queued_messages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No state file existed; a new one was written.
    Fresh,
    /// State was read from an existing file.
    Restored,
}

#[derive(Debug)]
pub struct JobStateStore {
    path: PathBuf,
    state: RwLock<PersistedState>,
}

impl JobStateStore {
    /// Load the store from `path`, creating it when absent.
    ///
    /// `agent_id` overrides the persisted id; a fresh store without one gets a
    /// random UUID. A present but undecodable file is an error.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, agent_id: Option<&str>) -> Result<(Self, LoadOutcome)> {
        let path = path.as_ref().to_path_buf();
        let (mut state, outcome) = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read state {}", path.display()))?;
            let state: PersistedState = serde_json::from_str(&contents)
                .with_context(|| format!("parse state {}", path.display()))?;
            (state, LoadOutcome::Restored)
        } else {
            let id = agent_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            (PersistedState::new(id), LoadOutcome::Fresh)
        };

        let mut dirty = outcome == LoadOutcome::Fresh;
        if let Some(id) = agent_id
            && state.agent_id != id
        {
            warn!(
                persisted = %state.agent_id,
                configured = id,
                "agent id changed by configuration",
            );
            state.agent_id = id.to_string();
            dirty = true;
        }
        if dirty {
            write_state(&path, &state)?;
        }

        info!(
            ?outcome,
            agent_id = %state.agent_id,
            jobs = state.jobs.len(),
            queued = state.queued_messages.len(),
            "job state loaded"
        );
        Ok((
            Self {
                path,
                state: RwLock::new(state),
            },
            outcome,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn agent_id(&self) -> String {
        self.state.read().agent_id.clone()
    }

    /// Insert or replace a job, stamping `updated_at`.
    pub fn update_job(&self, mut job: Job) -> Result<()> {
        job.updated_at = Utc::now();
        debug!(job_id = %job.job_id, status = ?job.status, "updating job");
        self.mutate(|state| {
            state.jobs.insert(job.job_id.clone(), job);
        })
    }

    /// Apply `f` to an existing job. Returns the updated job, or `None` if absent.
    pub fn update_job_with(&self, job_id: &str, f: impl FnOnce(&mut Job)) -> Result<Option<Job>> {
        self.mutate(|state| {
            let job = state.jobs.get_mut(job_id)?;
            f(job);
            job.updated_at = Utc::now();
            Some(job.clone())
        })
    }

    /// Remove a job together with any messages still queued for it.
    pub fn remove_job(&self, job_id: &str) -> Result<Option<Job>> {
        debug!(job_id, "removing job");
        self.mutate(|state| {
            state.queued_messages.retain(|_, msg| msg.job_id != job_id);
            state.jobs.remove(job_id)
        })
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.state.read().jobs.get(job_id).cloned()
    }

    /// All jobs ordered by id.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.state.read().jobs.values().cloned().collect()
    }

    /// Queue a message. Returns false when a message with the same id was
    /// already queued, leaving the existing one untouched.
    pub fn enqueue_message(&self, message: QueuedMessage) -> Result<bool> {
        if self
            .state
            .read()
            .queued_messages
            .contains_key(&message.message_id)
        {
            debug!(message_id = %message.message_id, "message already queued");
            return Ok(false);
        }
        self.mutate(|state| {
            if state.queued_messages.contains_key(&message.message_id) {
                return false;
            }
            state
                .queued_messages
                .insert(message.message_id.clone(), message);
            true
        })
    }

    pub fn dequeue_message(&self, message_id: &str) -> Result<Option<QueuedMessage>> {
        if !self.state.read().queued_messages.contains_key(message_id) {
            return Ok(None);
        }
        self.mutate(|state| state.queued_messages.remove(message_id))
    }

    /// Queued messages, oldest first (ties broken by id).
    pub fn list_queued_messages(&self) -> Vec<QueuedMessage> {
        let mut messages: Vec<QueuedMessage> =
            self.state.read().queued_messages.values().cloned().collect();
        messages.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        messages
    }

    /// Oldest message queued for `job_id`, without removing it.
    pub fn next_queued_for_job(&self, job_id: &str) -> Option<QueuedMessage> {
        self.list_queued_messages()
            .into_iter()
            .find(|msg| msg.job_id == job_id)
    }

    /// Apply `f` to a copy of the state, persist it, then publish it.
    fn mutate<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> Result<R> {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        let result = f(&mut next);
        write_state(&self.path, &next)?;
        *guard = next;
        Ok(result)
    }
}

/// Pretty JSON to a sibling temp file, fsync, rename over the target.
fn write_state(path: &Path, state: &PersistedState) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
    buf.push('\n');

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create temp state {}", tmp_path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("write temp state {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync temp state {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    if let Ok(dir) = File::open(parent)
        && let Err(err) = dir.sync_all()
    {
        debug!(err = %err, "failed to sync state directory");
    }
    Ok(())
}
