//! Helpers for running child processes with timeouts and bounded output.
//!
//! Children are started in their own process group so a timeout can take
//! down everything they spawned, not just the direct child.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, with truncation notices, for diagnostics.
    pub fn combined(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        buf.push_str(&self.stdout_truncated_notice("command"));
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        buf.push_str(&self.stderr_truncated_notice("command"));
        buf.trim_end().to_string()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_with_stream(cmd, stdin, timeout, output_limit_bytes, None)
}

/// Run a command with a timeout, optionally streaming stdout to a file.
///
/// If `stream_path` is `Some`, each stdout line is appended to the file as it
/// arrives (flushed per line), with no limit on line length. The in-memory copy
/// in `CommandOutput` is still bounded by `output_limit_bytes`.
#[instrument(
    skip_all,
    fields(timeout_secs = timeout.as_secs(), output_limit_bytes, streaming = stream_path.is_some())
)]
pub fn run_command_with_stream(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    stream_path: Option<&Path>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    // Prepare stream file before spawning so a bad path never leaves an orphan child.
    let stream_file = match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(Mutex::new(BufWriter::new(file)))
        }
        None => None,
    };
    let stream_file = Arc::new(stream_file);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stream_clone = stream_file.clone();
    let stdout_handle = thread::spawn(move || {
        read_stream_limited_with_tee(stdout, output_limit_bytes, stream_clone)
    });
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Fed from its own thread so a child that writes before reading cannot
    // stall us ahead of the deadline. Dropping the handle closes the pipe.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(err) = child_stdin.write_all(&input) {
                    // The child may legitimately exit before reading its input.
                    warn!(err = %err, "failed to write child stdin");
                }
            }))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        debug!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn kill_process_group(child: &mut Child) -> Result<()> {
    let pgid = Pid::from_raw(child.id() as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(errno) => {
            warn!(err = %errno, "killpg failed, killing direct child only");
            child.kill().context("kill command")
        }
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream with a size limit, optionally tee-ing every line to a file.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    stream_file: Arc<Option<Mutex<BufWriter<File>>>>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *stream_file
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert_eq!(out.combined(), "out\nerr");
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command_with_timeout(
            Command::new("cat"),
            Some(b"hello"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert_eq!(out.stdout, b"hello");
    }

    #[test]
    fn deadline_holds_when_child_writes_before_reading_stdin() {
        let input = vec![b'x'; 1024 * 1024];
        let start = Instant::now();
        let out = run_command_with_timeout(
            sh("head -c 1000000 /dev/zero; sleep 30; cat >/dev/null"),
            Some(&input),
            Duration::from_secs(1),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(out.stdout.len(), 1024);
    }

    #[test]
    fn large_stdin_is_fully_delivered() {
        let input = vec![b'y'; 512 * 1024];
        let out = run_command_with_timeout(
            sh("head -c 1000000 /dev/zero; wc -c"),
            Some(&input),
            Duration::from_secs(10),
            2 * 1024 * 1024,
        )
        .expect("run");
        assert!(out.success());
        assert!(out.stdout_lossy().trim_end().ends_with("524288"));
    }

    #[test]
    fn bounds_captured_output() {
        let out = run_command_with_timeout(
            sh("head -c 5000 /dev/zero"),
            None,
            Duration::from_secs(10),
            100,
        )
        .expect("run");
        assert_eq!(out.stdout.len(), 100);
        assert_eq!(out.stdout_truncated, 4900);
        assert!(out.combined().contains("truncated 4900 bytes"));
    }

    #[test]
    fn timeout_kills_whole_process_group() {
        let start = Instant::now();
        // The background sleep keeps stdout open; only a group kill lets the
        // reader threads finish promptly.
        let out = run_command_with_timeout(
            sh("sleep 30 & sleep 30"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn streams_stdout_lines_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("logs").join("stream.jsonl");
        let out = run_command_with_stream(
            sh("printf 'a\\nb\\n'"),
            None,
            Duration::from_secs(10),
            1,
            Some(&stream),
        )
        .expect("run");
        assert_eq!(std::fs::read_to_string(&stream).expect("read"), "a\nb\n");
        assert_eq!(out.stdout, b"a");
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command_with_timeout(
            Command::new("/definitely/not/a/binary"),
            None,
            Duration::from_secs(1),
            10,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
