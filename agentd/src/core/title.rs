//! Pull request title length handling.

/// Hosting platforms reject titles longer than this many characters.
pub const MAX_TITLE_CHARS: usize = 256;

const ELLIPSIS: &str = "...";
const OVERFLOW_SEPARATOR: &str = "\n\n---\n\n";

/// Title and body ready to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FittedTitle {
    pub title: String,
    pub body: String,
    /// Text cut from the title; empty when the title already fit.
    pub overflow: String,
}

/// Fit a title into [`MAX_TITLE_CHARS`], moving the cut suffix into the body.
///
/// Lengths are counted in characters, not bytes, so multi-byte titles are
/// never split inside a code point.
pub fn fit_title(title: &str, body: &str) -> FittedTitle {
    if title.chars().count() <= MAX_TITLE_CHARS {
        return FittedTitle {
            title: title.to_string(),
            body: body.to_string(),
            overflow: String::new(),
        };
    }

    let keep = MAX_TITLE_CHARS - ELLIPSIS.len();
    let split_at = title
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(title.len());
    let (head, overflow) = title.split_at(split_at);

    FittedTitle {
        title: format!("{head}{ELLIPSIS}"),
        body: format!("{overflow}{OVERFLOW_SEPARATOR}{body}"),
        overflow: overflow.to_string(),
    }
}
