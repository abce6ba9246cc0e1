//! Host-resident agent that runs AI coding-assistant sessions against a git
//! repository on behalf of remote jobs.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: pure helpers (name sanitizing, porcelain parsing, shell
//!   quoting, error classification, title fitting). No I/O.
//! - **[`io`]**: side effects. Advisory locks, the process sandbox, git and
//!   `gh` wrappers, the worktree pool, and the durable job state store.
//! - **[`output`]**: decoding of the assistant's JSON-lines stream.
//!
//! [`orchestrator`] ties these together into job turns; [`session`] is the
//! seam to the assistant CLI.

pub mod config;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
