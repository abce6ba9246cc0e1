//! Diagnostic tracing for the agent.
//!
//! Library code only emits `tracing` events; the binary installs the
//! subscriber once at startup. Job outcomes are persisted by the state store
//! and transcripts, so nothing here is part of the agent's durable output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const QUIET: &str = "warn";
const VERBOSE: &str = "warn,agentd=info";

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { VERBOSE } else { QUIET }
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `warn`, or agentd's own `info` events
/// too when `verbose`.
///
/// # Example
/// ```bash
/// RUST_LOG=agentd::io::worktree=debug agentd dispatch
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .compact(),
        )
        .init();
}
