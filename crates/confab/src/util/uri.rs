//! URI escaping and address validation.

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Decode percent-escapes. Malformed escapes are passed through verbatim;
/// invalid UTF-8 in the decoded bytes is salvaged with `?`.
pub fn url_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(h) = std::str::from_utf8(hex) {
                    if let Ok(b) = u8::from_str_radix(h, 16) {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    super::text::salvage_utf8(&out)
}

/// Minimal RFC-2822-shaped address check: one `@`, non-empty dot-atom local
/// part, domain with at least one dot and no empty labels.
pub fn email_is_valid(addr: &str) -> bool {
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    let local_ok = local.split('.').all(|atom| {
        !atom.is_empty()
            && atom.bytes().all(|b| {
                b.is_ascii_alphanumeric()
                    || matches!(
                        b,
                        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'/'
                            | b'=' | b'?' | b'^' | b'_' | b'`' | b'{' | b'|' | b'}' | b'~'
                    )
            })
    });
    let labels: Vec<&str> = domain.split('.').collect();
    let domain_ok = labels.len() >= 2
        && labels.iter().all(|l| {
            !l.is_empty()
                && l.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
                && !l.starts_with('-')
                && !l.ends_with('-')
        });
    local_ok && domain_ok
}

/// Escape a URI so it can be handed to a shell-invoked opener: percent-encode
/// everything that is not URI-safe, including quotes and spaces.
pub fn uri_escape_for_open(uri: &str) -> String {
    let mut out = String::with_capacity(uri.len());
    for &b in uri.as_bytes() {
        let safe = is_unreserved(b)
            || matches!(
                b,
                b':' | b'/' | b'?' | b'#' | b'[' | b']' | b'@' | b'!' | b'$' | b'&' | b'('
                    | b')' | b'*' | b'+' | b',' | b';' | b'=' | b'%'
            );
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(url_encode("a b&c"), "a%20b%26c");
        assert_eq!(url_encode("safe-._~"), "safe-._~");
    }

    #[test]
    fn test_decode() {
        assert_eq!(url_decode("a%20b%26c"), "a b&c");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn test_round_trip() {
        for s in ["hello world", "über café", "a/b?c=d&e", "100% sure"] {
            assert_eq!(url_decode(&url_encode(s)), s);
        }
    }

    #[test]
    fn test_email() {
        assert!(email_is_valid("user@example.com"));
        assert!(email_is_valid("first.last+tag@sub.example.org"));
        assert!(!email_is_valid("no-at-sign"));
        assert!(!email_is_valid("@example.com"));
        assert!(!email_is_valid("user@"));
        assert!(!email_is_valid("user@localhost"));
        assert!(!email_is_valid("user@-bad.com"));
        assert!(!email_is_valid("us er@example.com"));
    }

    #[test]
    fn test_escape_for_open() {
        assert_eq!(
            uri_escape_for_open("xmpp:u@h?body=hi there'"),
            "xmpp:u@h?body=hi%20there%27"
        );
    }
}
