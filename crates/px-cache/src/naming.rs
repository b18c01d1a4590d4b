//! Deterministic on-disk names for cache entries.

use sha2::{Digest, Sha256};

/// Number of hex digits appended to sanitized components.
const DIGEST_HEX_LEN: usize = 8;

/// Joins the video id and settings key. Never appears in the id component.
const SEPARATOR: char = '_';

/// Base filename (without extension) for `(video_id, settings_key)`.
///
/// Safe components are used verbatim, giving `{video_id}_{settings_key}`.
/// An id containing `_` is sanitized, so the first `_` of a name always ends
/// the id and `("a_b", "c")` cannot collide with `("a", "b_c")`.
pub fn entry_name(video_id: &str, settings_key: &str) -> String {
    format!("{}{SEPARATOR}{}", sanitize(video_id, false), sanitize(settings_key, true))
}

fn is_safe_char(c: char, allow_separator: bool) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-') || (allow_separator && c == SEPARATOR)
}

fn is_safe(s: &str, allow_separator: bool) -> bool {
    !s.is_empty() && !s.starts_with('.') && s.len() <= 96 && s.chars().all(|c| is_safe_char(c, allow_separator))
}

/// Make `s` filesystem-safe. Unsafe input has offending characters
/// replaced and a SHA-256 prefix appended, so distinct inputs never map to
/// the same name.
fn sanitize(s: &str, allow_separator: bool) -> String {
    if is_safe(s, allow_separator) {
        return s.to_string();
    }

    let mut cleaned: String = s
        .chars()
        .map(|c| if c != '.' && is_safe_char(c, allow_separator) { c } else { '-' })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        cleaned.push('x');
    }

    let digest = Sha256::digest(s.as_bytes());
    let hash = hex::encode(digest);
    format!("{cleaned}-{}", &hash[..DIGEST_HEX_LEN])
}
