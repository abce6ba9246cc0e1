//! Operator CLI for the agent.
//!
//! Inspects and maintains the state the agent keeps on this host: the
//! worktree pool, the job store and queue, and assistant transcripts. Also
//! drains the queue and runs preflight checks against git, `gh`, and the
//! assistant CLI.

use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::time::Duration;

use agentd::config::{AgentConfig, config_path, load_from_env, write_config};
use agentd::exit_codes;
use agentd::io::git::Git;
use agentd::io::hosting::GhCli;
use agentd::io::lock::LockError;
use agentd::io::process::run_command_with_timeout;
use agentd::io::state_store::JobStateStore;
use agentd::io::worktree::WorktreePool;
use agentd::logging;
use agentd::orchestrator::Orchestrator;
use agentd::output::{ParsedMessage, parse_file};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(30);
const PREFLIGHT_OUTPUT_LIMIT: usize = 64 * 1024;

#[derive(Parser)]
#[command(
    name = "agentd",
    version,
    about = "Runs coding-assistant sessions in pooled git worktrees"
)]
struct Cli {
    /// Log agentd's own progress at info level (ignored when RUST_LOG is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered worktrees of the configured repository.
    Worktrees,
    /// Drop worktree registrations whose directories are gone.
    Prune,
    /// List tracked jobs.
    Jobs {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// List queued messages, oldest first.
    Queue,
    /// Run one queued message for every job that has one.
    Dispatch,
    /// Retire a job's worktree and forget the job.
    Resolve { job_id: String },
    /// Decode an assistant transcript file.
    Parse {
        file: PathBuf,
        /// Print every decoded message as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check git, remote access, `gh`, and the assistant CLI.
    Check,
    /// Print the effective configuration as TOML.
    Config {
        /// Write it to the config path instead.
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("{:#}", err);
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Parse { file, json } = &cli.command {
        return cmd_parse(file, *json);
    }
    let cfg = load_from_env()?;
    cfg.validate()?;
    match cli.command {
        Command::Worktrees => cmd_worktrees(&cfg),
        Command::Prune => pool(&cfg).prune(),
        Command::Jobs { json } => cmd_jobs(&cfg, json),
        Command::Queue => cmd_queue(&cfg),
        Command::Dispatch => cmd_dispatch(cfg),
        Command::Resolve { job_id } => cmd_resolve(cfg, &job_id),
        Command::Check => cmd_check(&cfg),
        Command::Config { write } => cmd_config(&cfg, write),
        Command::Parse { .. } => Ok(()),
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    let busy = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<LockError>())
        .any(LockError::is_already_held);
    if busy {
        exit_codes::BUSY
    } else {
        exit_codes::FAILURE
    }
}

fn pool(cfg: &AgentConfig) -> WorktreePool {
    WorktreePool::new(&cfg.repo, &cfg.worktree_root, cfg.lock_dir())
}

fn open_store(cfg: &AgentConfig) -> Result<JobStateStore> {
    let (store, _) = JobStateStore::open(&cfg.state_path, cfg.agent_id())?;
    Ok(store)
}

fn cmd_worktrees(cfg: &AgentConfig) -> Result<()> {
    for entry in pool(cfg).list()? {
        let commit = entry.commit.as_deref().map_or("-", |c| &c[..c.len().min(12)]);
        let branch = match (&entry.branch, entry.bare, entry.detached) {
            (Some(branch), _, _) => branch.clone(),
            (None, true, _) => "(bare)".to_string(),
            (None, _, true) => "(detached)".to_string(),
            (None, false, false) => "-".to_string(),
        };
        let mut flags = Vec::new();
        if entry.locked {
            flags.push("locked");
        }
        if entry.prunable {
            flags.push("prunable");
        }
        println!(
            "{}\t{}\t{}\t{}",
            entry.path.display(),
            branch,
            commit,
            flags.join(",")
        );
    }
    Ok(())
}

fn cmd_jobs(cfg: &AgentConfig, json: bool) -> Result<()> {
    let jobs = open_store(cfg)?.list_jobs();
    if json {
        println!("{}", serde_json::to_string_pretty(&jobs).context("serialize jobs")?);
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}\t{:?}\t{:?}\t{}\tpr={}\tsession={}",
            job.job_id,
            job.status,
            job.mode,
            job.branch,
            job.pr_id.as_deref().unwrap_or("-"),
            job.session_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn cmd_queue(cfg: &AgentConfig) -> Result<()> {
    for message in open_store(cfg)?.list_queued_messages() {
        println!(
            "{}\t{}\t{:?}\t{}\t{}",
            message.enqueued_at.to_rfc3339(),
            message.job_id,
            message.kind,
            message.message_id,
            first_line(&message.text)
        );
    }
    Ok(())
}

fn cmd_dispatch(cfg: AgentConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(cfg)?;
    let mut failed = 0usize;
    for dispatch in orchestrator.run_queued() {
        match dispatch.result {
            Ok(Some(outcome)) => println!(
                "{}\tok\tcommitted={}\tpr={}",
                dispatch.job_id,
                outcome.committed,
                outcome.job.pr_id.as_deref().unwrap_or("-")
            ),
            Ok(None) => println!("{}\tidle", dispatch.job_id),
            Err(err) => {
                failed += 1;
                println!("{}\terror\t{:#}", dispatch.job_id, err);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} job(s) failed");
    }
    Ok(())
}

fn cmd_resolve(cfg: AgentConfig, job_id: &str) -> Result<()> {
    let orchestrator = Orchestrator::from_config(cfg)?;
    match orchestrator.resolve_job(job_id)? {
        Some(_) => println!("resolved {job_id}"),
        None => println!("no job {job_id}; worktree retired"),
    }
    Ok(())
}

fn cmd_parse(file: &Path, json: bool) -> Result<()> {
    let transcript = parse_file(file)?;
    if json {
        for message in transcript.messages() {
            println!("{}", serde_json::to_string(message).context("serialize message")?);
        }
        return Ok(());
    }
    println!("messages: {}", transcript.len());
    println!("session: {}", transcript.session_id().unwrap_or("-"));
    println!("unknown: {}", transcript.unknown_count());
    if let Some(result) = transcript.result() {
        println!(
            "result: {} error={} turns={} cost_usd={}",
            result.subtype.as_deref().unwrap_or("-"),
            result.is_error,
            result.num_turns.map_or("-".to_string(), |n| n.to_string()),
            result.total_cost_usd.map_or("-".to_string(), |c| format!("{c:.4}")),
        );
    }
    if transcript.plan_request().is_some() {
        println!("plan requested: yes");
    }
    if let Some(text) = transcript.final_text() {
        println!("final:\n{text}");
    }
    let unknown_types: Vec<&str> = transcript
        .messages()
        .iter()
        .filter(|m| matches!(m, ParsedMessage::Unknown(_)))
        .map(ParsedMessage::type_tag)
        .collect();
    if !unknown_types.is_empty() {
        println!("unknown types: {}", unknown_types.join(", "));
    }
    Ok(())
}

fn cmd_check(cfg: &AgentConfig) -> Result<()> {
    let git = Git::new(&cfg.repo).with_network_timeout(cfg.git_network_timeout());
    let gh = GhCli::new(&cfg.repo)
        .with_timeout(cfg.gh_timeout())
        .with_retry(cfg.retry.clone());
    let program = cfg.assistant.program().to_string();

    let checks: Vec<(&str, Result<String>)> = vec![
        ("git repository", git.ensure_repository().map(|()| cfg.repo.display().to_string())),
        ("git remote access", git.check_remote_access().and_then(|()| git.remote_url())),
        ("gh installed", gh.version()),
        ("gh authenticated", gh.auth_status().map(|()| String::new())),
        ("assistant cli", assistant_version(&program)),
    ];

    let mut failed = 0usize;
    for (name, result) in checks {
        match result {
            Ok(detail) => println!("ok    {name}\t{}", first_line(&detail)),
            Err(err) => {
                failed += 1;
                println!("FAIL  {name}\t{:#}", err);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} preflight check(s) failed");
    }
    Ok(())
}

fn assistant_version(program: &str) -> Result<String> {
    let mut cmd = ProcessCommand::new(program);
    cmd.arg("--version");
    let out = run_command_with_timeout(cmd, None, PREFLIGHT_TIMEOUT, PREFLIGHT_OUTPUT_LIMIT)
        .with_context(|| format!("run {program} --version"))?;
    if !out.success() {
        bail!("{program} --version failed: {}", out.combined());
    }
    Ok(out.stdout_lossy().trim().to_string())
}

fn cmd_config(cfg: &AgentConfig, write: bool) -> Result<()> {
    if write {
        let path = config_path(|name| std::env::var(name).ok());
        write_config(&path, cfg)?;
        println!("wrote {}", path.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(cfg).context("serialize config")?);
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
