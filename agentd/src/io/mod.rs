//! Side-effecting building blocks: locks, subprocesses, git, `gh`, and state.

pub mod git;
pub mod hosting;
pub mod lock;
pub mod process;
pub mod retry;
pub mod sandbox;
pub mod state_store;
pub mod worktree;
