//! Deterministic mapping from filesystem paths to lock-file names.
//!
//! The mapping is injective for names up to [`MAX_NAME_LEN`]: every byte that
//! is not passed through verbatim is rewritten to an escape sequence starting
//! with `_`, and `_` itself is doubled, so two different inputs never collide.
//! Longer names keep a readable prefix plus a digest of the full input.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

/// Name used when the input carries no alphanumeric content at all. Escaped
/// output never starts with `_r`, so no real path can map to it.
pub const EMPTY_PLACEHOLDER: &str = "_root";

/// Longest sanitized name emitted before switching to prefix + digest.
pub const MAX_NAME_LEN: usize = 200;

const DIGEST_PREFIX_LEN: usize = 160;
const DIGEST_HEX_LEN: usize = 16;

/// Sanitize a path string into a name that is safe as a single file name and
/// inert when pasted into a shell.
pub fn sanitize(input: &str) -> String {
    if !input.bytes().any(|b| b.is_ascii_alphanumeric()) {
        return EMPTY_PLACEHOLDER.to_string();
    }

    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' => out.push(byte as char),
            b'_' => out.push_str("__"),
            b'/' => out.push_str("_s"),
            b'\\' => out.push_str("_b"),
            b':' => out.push_str("_c"),
            b' ' => out.push_str("_w"),
            other => out.push_str(&format!("_x{other:02X}")),
        }
    }

    if out.len() <= MAX_NAME_LEN {
        return out;
    }

    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    // Escaped output is pure ASCII, so any byte offset is a char boundary.
    format!("{}-{}", &out[..DIGEST_PREFIX_LEN], &digest[..DIGEST_HEX_LEN])
}

/// Lexically normalize a path: collapse duplicate separators, drop `.`
/// components and trailing separators. `..` is kept as written because
/// resolving it lexically is wrong in the presence of symlinks.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() && !path.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// Sanitize a path after normalizing its spelling.
pub fn sanitize_path(path: &Path) -> String {
    sanitize(&normalize_lexically(path).to_string_lossy())
}
