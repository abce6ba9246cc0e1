//! POSIX shell quoting for commands handed to `bash -c`.

/// Quote a single argument so the shell passes it through verbatim.
///
/// Every argument is wrapped in single quotes (even "safe" ones) so the
/// rendered command never depends on the shell's word-splitting or globbing.
pub fn quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for ch in arg.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote a program and its arguments into one shell word list.
pub fn join<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(quote(program));
    parts.extend(args.iter().map(|arg| quote(arg.as_ref())));
    parts.join(" ")
}

/// Render a `NAME=value` assignment with the value quoted.
///
/// Names are emitted unquoted, so callers must only pass names that are valid
/// shell identifiers (see [`is_valid_env_name`]).
pub fn env_assignment(name: &str, value: &str) -> String {
    format!("{name}={}", quote(value))
}

/// True when `name` is a portable environment variable name.
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
