//! Stable exit codes for `agentd` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed: bad config, git or `gh` failure, or any other error.
pub const FAILURE: i32 = 1;
/// A worktree or repository lock is held by another process.
pub const BUSY: i32 = 2;
