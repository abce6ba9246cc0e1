//! Size limiting applied to raw output lines before JSON decoding.
//!
//! Assistant streams occasionally carry multi-megabyte tool results or
//! base64 screenshots on a single line. Oversized string values under a few
//! well-known keys are shortened in place, working directly on the JSON text
//! so the line never has to be decoded at full size. The result is still
//! valid JSON whenever the input was.

use std::borrow::Cow;

/// Base64 image payloads above this size are replaced by a placeholder.
pub const MAX_IMAGE_DATA_BYTES: usize = 64 * 1024;
/// Text fields above this size are truncated.
pub const MAX_TEXT_FIELD_BYTES: usize = 128 * 1024;

/// `text` covers tool results in block form (`"content":[{"type":"text",...}]`).
const TEXT_KEYS: &[&[u8]] = &[
    b"content",
    b"text",
    b"stdout",
    b"stderr",
    b"aggregated_output",
];
const IMAGE_KEY: &[u8] = b"data";

/// Shorten oversized values in one JSON line. Lines that cannot contain an
/// oversized value are returned borrowed and untouched.
pub fn limit_line(line: &[u8]) -> Cow<'_, [u8]> {
    if line.len() <= MAX_IMAGE_DATA_BYTES {
        return Cow::Borrowed(line);
    }

    let mut out: Option<Vec<u8>> = None;
    let mut copied = 0usize;
    let mut i = 0usize;

    while i < line.len() {
        if line[i] != b'"' {
            i += 1;
            continue;
        }
        let Some(key_end) = string_end(line, i) else {
            break;
        };
        let key = &line[i + 1..key_end];
        let mut j = skip_ws(line, key_end + 1);
        if j >= line.len() || line[j] != b':' {
            i = key_end + 1;
            continue;
        }
        j = skip_ws(line, j + 1);
        if j >= line.len() || line[j] != b'"' {
            i = j;
            continue;
        }
        let Some(value_end) = string_end(line, j) else {
            break;
        };
        let value = &line[j + 1..value_end];

        let replacement = if key == IMAGE_KEY && value.len() > MAX_IMAGE_DATA_BYTES {
            Some(format!("[image data omitted: {} bytes]", value.len()).into_bytes())
        } else if TEXT_KEYS.contains(&key) && value.len() > MAX_TEXT_FIELD_BYTES {
            let keep = safe_cut(value, MAX_TEXT_FIELD_BYTES);
            let mut shortened = value[..keep].to_vec();
            shortened.extend_from_slice(
                format!("\\n[truncated: original {} bytes]", value.len()).as_bytes(),
            );
            Some(shortened)
        } else {
            None
        };

        if let Some(replacement) = replacement {
            let buf = out.get_or_insert_with(|| Vec::with_capacity(line.len().min(1 << 20)));
            buf.extend_from_slice(&line[copied..=j]);
            buf.extend_from_slice(&replacement);
            copied = value_end;
        }
        i = value_end + 1;
    }

    match out {
        Some(mut buf) => {
            buf.extend_from_slice(&line[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(line),
    }
}

/// Index of the closing quote of the string starting at `start`.
fn string_end(line: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < line.len() {
        match line[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn skip_ws(line: &[u8], mut i: usize) -> usize {
    while i < line.len() && matches!(line[i], b' ' | b'\t' | b'\r' | b'\n') {
        i += 1;
    }
    i
}

/// Largest prefix length `<= limit` of an escaped JSON string body that ends
/// neither inside an escape sequence (surrogate pairs count as one) nor
/// inside a UTF-8 code point.
fn safe_cut(value: &[u8], limit: usize) -> usize {
    let mut i = 0usize;
    while i < value.len() {
        let unit = if value[i] == b'\\' {
            escape_len(value, i)
        } else {
            utf8_len(value[i])
        };
        if i + unit > limit {
            break;
        }
        i += unit;
    }
    i.min(value.len())
}

fn escape_len(value: &[u8], i: usize) -> usize {
    if value.get(i + 1) != Some(&b'u') {
        return 2;
    }
    let is_high_surrogate = value
        .get(i + 2..i + 6)
        .and_then(|hex| std::str::from_utf8(hex).ok())
        .and_then(|hex| u16::from_str_radix(hex, 16).ok())
        .is_some_and(|code| (0xD800..=0xDBFF).contains(&code));
    if is_high_surrogate && value.get(i + 6..i + 8) == Some(b"\\u".as_slice()) {
        12
    } else {
        6
    }
}

fn utf8_len(lead: u8) -> usize {
    match lead {
        0xF0..=0xF7 => 4,
        0xE0..=0xEF => 3,
        0xC0..=0xDF => 2,
        _ => 1,
    }
}
