//! Assistant session abstraction.
//!
//! The [`SessionRunner`] trait decouples the orchestrator from the assistant
//! backend. [`AssistantCli`] drives the Claude or Codex CLI through the
//! sandbox; tests use scripted runners that replay canned output without
//! spawning anything.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::io::sandbox::{Sandbox, SandboxCommand, session_timeout};
use crate::io::state_store::ExecutionMode;
use crate::output::{Transcript, parse_file};

/// Parameters for one assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Worktree the assistant runs in.
    pub workdir: PathBuf,
    pub prompt: String,
    /// Session to continue; `None` starts a new conversation.
    pub resume_session: Option<String>,
    pub mode: ExecutionMode,
    /// Raw stdout is streamed here as it arrives.
    pub transcript_path: PathBuf,
    /// Requested deadline; never shorter than the session default.
    pub timeout: Option<Duration>,
}

/// Abstraction over assistant backends.
pub trait SessionRunner: Send + Sync {
    /// Run one turn and return its decoded output.
    fn run(&self, request: &SessionRequest) -> Result<Transcript>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantKind {
    Claude,
    Codex,
}

impl AssistantKind {
    pub fn default_program(self) -> &'static str {
        match self {
            AssistantKind::Claude => "claude",
            AssistantKind::Codex => "codex",
        }
    }
}

/// Command-line arguments for one turn.
pub fn build_args(kind: AssistantKind, request: &SessionRequest) -> Vec<String> {
    let mut args = Vec::new();
    match kind {
        AssistantKind::Claude => {
            args.extend(["-p".to_string(), request.prompt.clone()]);
            args.extend(["--output-format", "stream-json", "--verbose"].map(String::from));
            if let Some(session) = &request.resume_session {
                args.extend(["--resume".to_string(), session.clone()]);
            }
            let permission = match request.mode {
                ExecutionMode::ReadOnly => "plan",
                ExecutionMode::Mutating => "bypassPermissions",
            };
            args.extend(["--permission-mode".to_string(), permission.to_string()]);
        }
        AssistantKind::Codex => {
            args.push("exec".to_string());
            if let Some(session) = &request.resume_session {
                args.extend(["resume".to_string(), session.clone()]);
            }
            let sandbox = match request.mode {
                ExecutionMode::ReadOnly => "read-only",
                ExecutionMode::Mutating => "workspace-write",
            };
            args.extend(["--json", "--sandbox", sandbox].map(String::from));
            args.push(request.prompt.clone());
        }
    }
    args
}

/// Runs the Claude or Codex CLI inside the sandbox.
#[derive(Debug, Clone)]
pub struct AssistantCli {
    kind: AssistantKind,
    program: String,
    sandbox: Sandbox,
    output_limit_bytes: usize,
}

impl AssistantCli {
    pub fn new(kind: AssistantKind, sandbox: Sandbox) -> Self {
        Self {
            kind,
            program: kind.default_program().to_string(),
            sandbox,
            output_limit_bytes: crate::io::sandbox::DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn kind(&self) -> AssistantKind {
        self.kind
    }
}

impl SessionRunner for AssistantCli {
    #[instrument(
        skip_all,
        fields(
            kind = ?self.kind,
            workdir = %request.workdir.display(),
            resume = request.resume_session.is_some(),
        )
    )]
    fn run(&self, request: &SessionRequest) -> Result<Transcript> {
        let timeout = session_timeout(request.timeout);
        info!(timeout_secs = timeout.as_secs(), mode = ?request.mode, "starting assistant session");

        let cmd = SandboxCommand::new(&self.program, &request.workdir, timeout)
            .args(build_args(self.kind, request))
            .stream_to(&request.transcript_path)
            .output_limit(self.output_limit_bytes);
        self.sandbox
            .run(&cmd)
            .with_context(|| format!("run {} session", self.program))?;

        let transcript = parse_file(&request.transcript_path)?;
        if let Some(result) = transcript.result()
            && result.is_error
        {
            warn!(subtype = ?result.subtype, "assistant reported an error result");
        }
        info!(
            messages = transcript.len(),
            session_id = transcript.session_id().unwrap_or(""),
            "assistant session finished"
        );
        Ok(transcript)
    }
}
