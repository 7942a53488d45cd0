//! Text sanitation helpers: UTF-8 salvage, case-insensitive comparison,
//! word matching.

use std::borrow::Cow;
use std::cmp::Ordering;

/// Interpret bytes as text, guessing the encoding: valid UTF-8 is taken
/// as-is, anything else falls back to Latin-1 (which never fails).
pub fn try_convert(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

/// Replace invalid UTF-8 sequences with `?`, preserving every valid run.
pub fn salvage_utf8(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                // SAFETY: from_utf8 validated everything up to `valid`.
                out.push_str(unsafe { std::str::from_utf8_unchecked(&rest[..valid]) });
                out.push('?');
                let skip = valid + e.error_len().unwrap_or(rest.len() - valid);
                rest = &rest[skip..];
                if rest.is_empty() {
                    return out;
                }
            }
        }
    }
}

/// Drop control characters that have no business in a message body, keeping
/// tab, newline and carriage return.
pub fn strip_unprintables(text: &str) -> String {
    text.chars()
        .filter(|&c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

/// Case-insensitive comparison via full case folding, ordering the folded
/// forms lexicographically.
pub fn strcasecmp(a: &str, b: &str) -> Ordering {
    let fold = |s: &str| s.chars().flat_map(char::to_lowercase).collect::<String>();
    fold(a).cmp(&fold(b))
}

/// Whether `word` appears in `text` bounded by non-alphanumeric characters,
/// compared case-insensitively. Used for nick-mention highlighting.
pub fn has_word(text: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let text_l = text.to_lowercase();
    let word_l = word.to_lowercase();
    let mut start = 0;
    while let Some(pos) = text_l[start..].find(&word_l) {
        let begin = start + pos;
        let end = begin + word_l.len();
        let before_ok = text_l[..begin]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = text_l[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = end;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_convert_utf8() {
        assert_eq!(try_convert("héllo".as_bytes()), "héllo");
    }

    #[test]
    fn test_try_convert_latin1() {
        // 0xE9 is 'é' in Latin-1, invalid as a lone UTF-8 byte.
        assert_eq!(try_convert(b"caf\xe9"), "café");
    }

    #[test]
    fn test_salvage() {
        assert_eq!(salvage_utf8(b"ok"), "ok");
        assert_eq!(salvage_utf8(b"a\xffb"), "a?b");
        assert_eq!(salvage_utf8(b"\xff\xfe"), "??");
        assert_eq!(salvage_utf8("héllo".as_bytes()), "héllo");
    }

    #[test]
    fn test_strip_unprintables() {
        assert_eq!(strip_unprintables("a\x07b\tc\nd"), "ab\tc\nd");
    }

    #[test]
    fn test_strcasecmp() {
        assert_eq!(strcasecmp("Hello", "hello"), Ordering::Equal);
        assert_eq!(strcasecmp("ÅBC", "åbc"), Ordering::Equal);
        assert_eq!(strcasecmp("abc", "abd"), Ordering::Less);
    }

    #[test]
    fn test_has_word() {
        assert!(has_word("hey Alice, hi", "alice"));
        assert!(has_word("alice", "Alice"));
        assert!(!has_word("malice aforethought", "alice"));
        assert!(!has_word("alice2000 here", "alice"));
        assert!(has_word("ping alice!", "alice"));
    }
}
