//! Agent configuration (`agentd.toml`).
//!
//! Loaded once at startup and passed by reference into constructors. The
//! sandbox section can be overridden from the environment so deployments can
//! switch execution user or proxy without editing the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::lock::default_lock_dir;
use crate::io::retry::RetryPolicy;
use crate::io::sandbox::{DEFAULT_DENIED_ENV, SandboxConfig};
use crate::session::AssistantKind;

/// Environment variable pointing at the config file.
pub const CONFIG_PATH_ENV: &str = "AGENTD_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "agentd.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Stable agent identity; empty means keep the persisted (or a new random) id.
    pub agent_id: String,

    /// Main repository checkout the worktrees are attached to.
    pub repo: PathBuf,

    /// Directory holding one worktree per job slot.
    pub worktree_root: PathBuf,

    /// JSON file with job and queue state.
    pub state_path: PathBuf,

    /// Raw assistant output, one file per turn.
    pub transcript_dir: PathBuf,

    /// Lock file directory; empty means `<temp>/agentd-locks`.
    pub lock_dir: PathBuf,

    /// Base branch for new job branches and pull requests; empty means ask `origin`.
    pub default_branch: String,

    /// Prefix for job branch names.
    pub branch_prefix: String,

    pub session_timeout_secs: u64,
    pub git_network_timeout_secs: u64,
    pub gh_timeout_secs: u64,

    /// In-memory bound on captured subprocess output.
    pub output_limit_bytes: usize,

    /// Upper bound on jobs run at once by `run_queued`.
    pub max_concurrent_jobs: usize,

    pub assistant: AssistantConfig,
    pub sandbox: SandboxSection,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssistantConfig {
    pub kind: AssistantKind,
    /// Executable to run; empty means `claude` or `codex` from PATH.
    pub program: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            kind: AssistantKind::Claude,
            program: String::new(),
        }
    }
}

impl AssistantConfig {
    pub fn program(&self) -> &str {
        if self.program.trim().is_empty() {
            self.kind.default_program()
        } else {
            &self.program
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxSection {
    /// OS user sessions run as; empty means the current user.
    pub exec_user: String,
    pub proxy_url: String,
    /// Extra variable names removed on top of the built-in deny-list.
    pub extra_denied_env: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            repo: PathBuf::from("."),
            worktree_root: PathBuf::from(".agentd/worktrees"),
            state_path: PathBuf::from(".agentd/state.json"),
            transcript_dir: PathBuf::from(".agentd/transcripts"),
            lock_dir: PathBuf::new(),
            default_branch: String::new(),
            branch_prefix: "agentd/".to_string(),
            session_timeout_secs: 60 * 60,
            git_network_timeout_secs: 180,
            gh_timeout_secs: 60,
            output_limit_bytes: 1024 * 1024,
            max_concurrent_jobs: 4,
            assistant: AssistantConfig::default(),
            sandbox: SandboxSection::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.repo.as_os_str().is_empty() {
            return Err(anyhow!("repo must be set"));
        }
        if self.worktree_root.as_os_str().is_empty() {
            return Err(anyhow!("worktree_root must be set"));
        }
        if self.state_path.as_os_str().is_empty() {
            return Err(anyhow!("state_path must be set"));
        }
        if self.session_timeout_secs == 0 {
            return Err(anyhow!("session_timeout_secs must be > 0"));
        }
        if self.git_network_timeout_secs == 0 {
            return Err(anyhow!("git_network_timeout_secs must be > 0"));
        }
        if self.gh_timeout_secs == 0 {
            return Err(anyhow!("gh_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow!("max_concurrent_jobs must be > 0"));
        }
        self.retry.validate()
    }

    /// Apply `AGENTD_EXEC_USER` / `AGENTD_PROXY_URL` when set and non-empty.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let from_env = SandboxConfig::from_lookup(&lookup);
        if let Some(user) = from_env.exec_user {
            self.sandbox.exec_user = user;
        }
        if let Some(proxy) = from_env.proxy_url {
            self.sandbox.proxy_url = proxy;
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.trim().to_string());
        let mut denied_env: Vec<String> =
            DEFAULT_DENIED_ENV.iter().map(|s| s.to_string()).collect();
        for name in &self.sandbox.extra_denied_env {
            if !denied_env.contains(name) {
                denied_env.push(name.clone());
            }
        }
        SandboxConfig {
            exec_user: non_empty(&self.sandbox.exec_user),
            proxy_url: non_empty(&self.sandbox.proxy_url),
            denied_env,
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        if self.lock_dir.as_os_str().is_empty() {
            default_lock_dir()
        } else {
            self.lock_dir.clone()
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        let id = self.agent_id.trim();
        (!id.is_empty()).then_some(id)
    }

    pub fn default_branch(&self) -> Option<&str> {
        let branch = self.default_branch.trim();
        (!branch.is_empty()).then_some(branch)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn git_network_timeout(&self) -> Duration {
        Duration::from_secs(self.git_network_timeout_secs)
    }

    pub fn gh_timeout(&self) -> Duration {
        Duration::from_secs(self.gh_timeout_secs)
    }
}

/// Config path from `AGENTD_CONFIG`, else `agentd.toml` in the working directory.
pub fn config_path(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup(CONFIG_PATH_ENV)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Load the config named by the environment and apply environment overrides.
pub fn load_from_env() -> Result<AgentConfig> {
    let lookup = |name: &str| std::env::var(name).ok();
    let mut cfg = load_config(&config_path(lookup))?;
    cfg.apply_env_overrides(lookup);
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
