//! Parser for `git worktree list --porcelain`.
//!
//! Each entry is a block of `key [value]` lines separated by a blank line.
//! Only `worktree` is guaranteed; `HEAD`, `branch`, `detached`, `bare`,
//! `locked` and `prunable` may or may not appear, and git may add new
//! attributes in the future, so unknown keys are ignored.

use std::path::PathBuf;

/// One entry of the worktree listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name (`refs/heads/` stripped). `None` for detached or bare.
    pub branch: Option<String>,
    /// Commit hash checked out in the worktree. `None` for bare repositories.
    pub commit: Option<String>,
    pub bare: bool,
    pub detached: bool,
    pub locked: bool,
    pub prunable: bool,
}

/// Parse the full porcelain output into entries, in listing order.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for raw in output.lines() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }

        let (key, value) = match line.split_once(' ') {
            Some((key, value)) => (key, value),
            None => (line, ""),
        };

        if key == "worktree" {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(value),
                ..WorktreeEntry::default()
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            // Attribute before any `worktree` line; nothing to attach it to.
            continue;
        };
        match key {
            "HEAD" => entry.commit = Some(value.to_string()),
            "branch" => {
                let name = value.strip_prefix("refs/heads/").unwrap_or(value);
                entry.branch = Some(name.to_string());
            }
            "detached" => entry.detached = true,
            "bare" => entry.bare = true,
            "locked" => entry.locked = true,
            "prunable" => entry.prunable = true,
            _ => {}
        }
    }

    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}
