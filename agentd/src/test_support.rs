//! Test-only fixtures: a throwaway repository with a bare `origin`, a fake
//! `gh` executable, and a scripted assistant session.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::output::{Transcript, parse_file};
use crate::session::{SessionRequest, SessionRunner};

/// A clone on branch `main` with one pushed commit (`README.md` = `hello\n`).
///
/// Layout under one temp dir: `origin.git/`, `repo/`, `worktrees/`,
/// `locks/`, `state.json`.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin.git");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&origin).expect("mkdir origin");
        fs::create_dir_all(&repo).expect("mkdir repo");

        git(&origin, &["init", "-q", "--bare"]);
        git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        git(&repo, &["init", "-q"]);
        git(&repo, &["checkout", "-q", "-b", "main"]);
        git(&repo, &["config", "user.name", "agentd test"]);
        git(&repo, &["config", "user.email", "agentd@example.com"]);
        git(&repo, &["config", "commit.gpgsign", "false"]);
        fs::write(repo.join("README.md"), "hello\n").expect("write readme");
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "initial"]);
        let origin_url = origin.to_string_lossy().into_owned();
        git(&repo, &["remote", "add", "origin", &origin_url]);
        git(&repo, &["push", "-q", "-u", "origin", "main"]);

        Self { temp }
    }

    /// The working clone.
    pub fn path(&self) -> PathBuf {
        self.temp.path().join("repo")
    }

    /// The bare remote.
    pub fn origin(&self) -> PathBuf {
        self.temp.path().join("origin.git")
    }

    pub fn worktree_root(&self) -> PathBuf {
        self.temp.path().join("worktrees")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.temp.path().join("locks")
    }

    pub fn state_path(&self) -> PathBuf {
        self.temp.path().join("state.json")
    }

    pub fn transcript_dir(&self) -> PathBuf {
        self.temp.path().join("transcripts")
    }

    /// Delete a branch on the remote behind the clone's back.
    pub fn delete_remote_branch(&self, branch: &str) {
        git(&self.origin(), &["branch", "-D", branch]);
    }

    /// Branch names present on the remote.
    pub fn remote_branches(&self) -> Vec<String> {
        let out = Command::new("git")
            .args(["for-each-ref", "--format=%(refname:short)", "refs/heads"])
            .current_dir(self.origin())
            .output()
            .expect("git for-each-ref");
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stderr)
    );
}

const FAKE_GH_SCRIPT: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "$*" | tr '\n' ' ' >> "$dir/calls.log"
echo >> "$dir/calls.log"
if [ -f "$dir/fail_remaining" ]; then
  n="$(cat "$dir/fail_remaining")"
  if [ "$n" -gt 0 ]; then
    echo $((n - 1)) > "$dir/fail_remaining"
    cat "$dir/fail_message" >&2
    exit 1
  fi
fi
case "$1" in
  --version) echo "gh version 2.50.0 (fake)" ;;
  auth) echo "Logged in to github.com" >&2 ;;
  pr)
    case "$2" in
      create) echo "https://github.com/acme/widgets/pull/17" ;;
      list) cat "$dir/pr_list.json" ;;
      view) echo "https://github.com/acme/widgets/pull/17" ;;
      edit) ;;
      *) echo "unknown pr command: $2" >&2; exit 1 ;;
    esac
    ;;
  *) echo "unknown command: $1" >&2; exit 1 ;;
esac
"#;

/// A shell script standing in for `gh`. Every call is appended to a log
/// (one line per call, embedded newlines flattened).
pub struct FakeGh {
    temp: TempDir,
}

impl FakeGh {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = temp.path().join("gh");
        fs::write(&program, FAKE_GH_SCRIPT).expect("write fake gh");
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).expect("chmod fake gh");
        fs::write(temp.path().join("pr_list.json"), "[]").expect("write pr list");
        Self { temp }
    }

    /// JSON printed by `gh pr list`.
    pub fn with_pr_list(self, json: &str) -> Self {
        fs::write(self.temp.path().join("pr_list.json"), json).expect("write pr list");
        self
    }

    /// Fail the next `count` calls with `stderr` and exit status 1.
    pub fn fail_first(self, count: u32, stderr: &str) -> Self {
        fs::write(self.temp.path().join("fail_remaining"), count.to_string())
            .expect("write fail counter");
        fs::write(self.temp.path().join("fail_message"), stderr).expect("write fail message");
        self
    }

    pub fn dir(&self) -> &Path {
        self.temp.path()
    }

    pub fn program(&self) -> PathBuf {
        self.temp.path().join("gh")
    }

    /// Arguments of every call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.temp.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(|line| line.trim_end().to_string())
            .collect()
    }
}

impl Default for FakeGh {
    fn default() -> Self {
        Self::new()
    }
}

type SessionHook = Box<dyn Fn(&SessionRequest) + Send + Sync>;

/// Replays canned JSON lines instead of spawning an assistant.
///
/// The lines are written to the request's transcript path and parsed back,
/// so the orchestrator sees exactly what a real run would leave on disk.
pub struct ScriptedSession {
    lines: Vec<String>,
    files: Vec<(PathBuf, String)>,
    hook: Option<SessionHook>,
    requests: Mutex<Vec<SessionRequest>>,
}

impl ScriptedSession {
    pub fn new(lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            files: Vec::new(),
            hook: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A successful Claude turn answering `text` in session `session_id`.
    pub fn claude_reply(session_id: &str, text: &str) -> Self {
        let assistant = serde_json::json!({
            "type": "assistant",
            "session_id": session_id,
            "message": {"content": [{"type": "text", "text": text}]},
        });
        let result = serde_json::json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "session_id": session_id,
            "result": text,
            "num_turns": 1,
        });
        Self::new([
            format!(r#"{{"type":"system","subtype":"init","session_id":"{session_id}"}}"#),
            assistant.to_string(),
            result.to_string(),
        ])
    }

    /// Write `contents` to `relative` inside the workdir during the run.
    pub fn with_file(mut self, relative: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.push((relative.into(), contents.into()));
        self
    }

    /// Call `hook` while the session is "running" (worktree leased).
    pub fn with_hook(mut self, hook: impl Fn(&SessionRequest) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn requests(&self) -> Vec<SessionRequest> {
        self.requests.lock().clone()
    }
}

impl SessionRunner for ScriptedSession {
    fn run(&self, request: &SessionRequest) -> Result<Transcript> {
        self.requests.lock().push(request.clone());
        if let Some(parent) = request.transcript_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }
        let mut body = self.lines.join("\n");
        body.push('\n');
        fs::write(&request.transcript_path, body).with_context(|| {
            format!("write transcript {}", request.transcript_path.display())
        })?;
        for (relative, contents) in &self.files {
            let path = request.workdir.join(relative);
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(hook) = &self.hook {
            hook(request);
        }
        parse_file(&request.transcript_path)
    }
}
