//! Shared utilities for confab.

pub mod base16;
pub mod markup;
pub mod text;
pub mod time;
pub mod uri;

pub use base16::{base16_decode, base16_encode, base16_encode_chunked};
pub use markup::{escape_text, linkify, strip_html, unescape_html, unescape_text};
pub use text::{has_word, salvage_utf8, strcasecmp, strip_unprintables};
pub use time::{date_format_full, date_format_long, date_format_short, str_to_time};
pub use uri::{email_is_valid, uri_escape_for_open, url_decode, url_encode};

/// Replace all occurrences of `find` in `s` with `replace`.
pub fn strreplace(s: &str, find: &str, replace: &str) -> String {
    s.replace(find, replace)
}

/// Case-insensitive substring search. Returns the byte offset of the first
/// match, comparing ASCII case-insensitively the way the classic libc
/// extension does.
pub fn strcasestr(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.len() > h.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| {
        h[i..i + n.len()]
            .iter()
            .zip(n)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

/// Render a duration in seconds as a coarse human-readable string
/// ("3 hours, 7 minutes").
pub fn str_seconds_to_string(mut secs: u64) -> String {
    let days = secs / (60 * 60 * 24);
    secs %= 60 * 60 * 24;
    let hours = secs / (60 * 60);
    secs %= 60 * 60;
    let mins = secs / 60;
    secs %= 60;

    let unit = |n: u64, one: &str, many: &str| {
        if n == 1 {
            format!("{n} {one}")
        } else {
            format!("{n} {many}")
        }
    };

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(unit(days, "day", "days"));
    }
    if hours > 0 {
        parts.push(unit(hours, "hour", "hours"));
    }
    if mins > 0 {
        parts.push(unit(mins, "minute", "minutes"));
    }
    if parts.is_empty() {
        parts.push(unit(secs, "second", "seconds"));
    }
    parts.join(", ")
}

/// Zero a sensitive string in place, then drop it.
///
/// Best effort: the bytes the allocation held are overwritten before the
/// buffer is freed. Callers must not rely on copies the compiler or
/// collections made earlier.
pub fn str_wipe(mut s: String) {
    // SAFETY: writing zero bytes in place keeps the buffer valid UTF-8,
    // and we truncate before any other code can observe it.
    unsafe {
        for b in s.as_mut_vec().iter_mut() {
            *b = 0;
        }
    }
    s.clear();
}

/// Generate a random type-4 UUID string.
pub fn uuid_random() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strcasestr() {
        assert_eq!(strcasestr("Hello World", "world"), Some(6));
        assert_eq!(strcasestr("Hello World", "WORLD"), Some(6));
        assert_eq!(strcasestr("Hello", "lo"), Some(3));
        assert_eq!(strcasestr("Hello", "xyz"), None);
        assert_eq!(strcasestr("", "a"), None);
        assert_eq!(strcasestr("abc", ""), Some(0));
    }

    #[test]
    fn test_seconds_to_string() {
        assert_eq!(str_seconds_to_string(0), "0 seconds");
        assert_eq!(str_seconds_to_string(1), "1 second");
        assert_eq!(str_seconds_to_string(61), "1 minute");
        assert_eq!(str_seconds_to_string(3660), "1 hour, 1 minute");
        assert_eq!(str_seconds_to_string(90000), "1 day, 1 hour");
    }

    #[test]
    fn test_uuid_random_shape() {
        let u = uuid_random();
        assert_eq!(u.len(), 36);
        // Version nibble is 4 for a type-4 UUID.
        assert_eq!(u.as_bytes()[14], b'4');
    }

    #[test]
    fn test_strreplace() {
        assert_eq!(strreplace("a-b-c", "-", "+"), "a+b+c");
    }
}
