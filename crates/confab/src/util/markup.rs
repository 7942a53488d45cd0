//! HTML-ish markup helpers: escaping, stripping, linkifying, slicing.
//!
//! Protocols exchange a constrained HTML subset; these functions are the
//! shared translation layer between plain text and that subset. They are
//! forgiving about malformed input: broken markup is passed through rather
//! than rejected.

/// Escape `<`, `>`, `&` and `"` so arbitrary text can be embedded in markup.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Decode a single entity starting at `&`. Returns the decoded text and the
/// byte length of the entity (including `&` and `;`), or `None` when the
/// input is not a recognized entity.
fn decode_entity(s: &str) -> Option<(char, usize)> {
    let semi = s[..s.len().min(12)].find(';')?;
    let body = &s[1..semi];
    let c = match body {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        _ => {
            let num = body.strip_prefix('#')?;
            let cp = if let Some(hex) = num.strip_prefix(['x', 'X']) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                num.parse::<u32>().ok()?
            };
            char::from_u32(cp)?
        }
    };
    Some((c, semi + 1))
}

/// Replace HTML entities with the characters they name. Unknown entities are
/// left untouched.
pub fn unescape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match decode_entity(rest) {
            Some((c, len)) => {
                out.push(c);
                rest = &rest[len..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Like [`unescape_text`], but additionally converts `<br>` (any spelling)
/// to a newline. This is the inverse used when displaying a message body
/// as plain text.
pub fn unescape_html(html: &str) -> String {
    let mut plain = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(pos) = rest.find('<') {
        plain.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let lower = rest.to_ascii_lowercase();
        if lower.starts_with("<br>") {
            plain.push('\n');
            rest = &rest[4..];
        } else if lower.starts_with("<br/>") {
            plain.push('\n');
            rest = &rest[5..];
        } else if lower.starts_with("<br />") {
            plain.push('\n');
            rest = &rest[6..];
        } else {
            plain.push('<');
            rest = &rest[1..];
        }
    }
    plain.push_str(rest);
    unescape_text(&plain)
}

/// Strip all tags, converting `<br>` to newlines. Entities are preserved.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(pos) = rest.find('<') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match rest.find('>') {
            Some(end) => {
                let tag = &rest[1..end];
                let name = tag
                    .trim_start_matches('/')
                    .split([' ', '\t', '\n', '/'])
                    .next()
                    .unwrap_or("");
                if name.eq_ignore_ascii_case("br") {
                    out.push('\n');
                }
                rest = &rest[end + 1..];
            }
            None => {
                // Unterminated tag: pass the rest through verbatim.
                out.push_str(rest);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_url_char(c: char) -> bool {
    c.is_alphanumeric()
        || matches!(
            c,
            '-' | '.' | '_' | '~' | ':' | '/' | '?' | '#' | '[' | ']' | '@' | '!' | '$' | '&'
                | '\'' | '(' | ')' | '*' | '+' | ',' | ';' | '=' | '%'
        )
}

fn trim_url(url: &str) -> &str {
    // Trailing punctuation is almost always sentence structure, not URL.
    url.trim_end_matches(['.', ',', '?', '!', ';', ':', ')', '\'', '"'])
}

/// Wrap plain-text URLs and e-mail addresses in anchors. Text already inside
/// a tag or an existing anchor is left alone.
pub fn linkify(text: &str) -> String {
    const SCHEMES: [&str; 4] = ["http://", "https://", "ftp://", "www."];

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'outer: while !rest.is_empty() {
        if rest.starts_with('<') {
            // Copy a whole tag (and anchor bodies wholesale).
            let end = rest.find('>').map(|i| i + 1).unwrap_or(rest.len());
            let tag = &rest[..end];
            out.push_str(tag);
            rest = &rest[end..];
            if tag.to_ascii_lowercase().starts_with("<a ") {
                if let Some(close) = rest.to_ascii_lowercase().find("</a>") {
                    out.push_str(&rest[..close + 4]);
                    rest = &rest[close + 4..];
                }
            }
            continue;
        }

        for scheme in SCHEMES {
            if rest.len() >= scheme.len() && rest[..scheme.len()].eq_ignore_ascii_case(scheme) {
                let end = rest.find(|c| !is_url_char(c)).unwrap_or(rest.len());
                let url = trim_url(&rest[..end]);
                if url.len() > scheme.len() {
                    let href = if scheme == "www." {
                        format!("http://{url}")
                    } else {
                        url.to_string()
                    };
                    out.push_str(&format!("<a href=\"{href}\">{url}</a>"));
                    rest = &rest[url.len()..];
                    continue 'outer;
                }
            }
        }

        // E-mail: backtrack from '@' over the local part already emitted.
        if rest.starts_with('@') {
            let local_start = out
                .rfind(|c: char| !(c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '+')))
                .map(|i| i + 1)
                .unwrap_or(0);
            let local = out[local_start..].to_string();
            let domain_end = rest[1..]
                .find(|c: char| !(c.is_alphanumeric() || matches!(c, '.' | '-')))
                .map(|i| i + 1)
                .unwrap_or(rest.len());
            let domain = trim_url(&rest[1..domain_end]);
            if !local.is_empty() && domain.contains('.') {
                let addr = format!("{local}@{domain}");
                out.truncate(local_start);
                out.push_str(&format!("<a href=\"mailto:{addr}\">{addr}</a>"));
                rest = &rest[1 + domain.len()..];
                continue;
            }
        }

        let mut chars = rest.chars();
        out.push(chars.next().unwrap());
        rest = chars.as_str();
    }
    out
}

/// Extract a CSS property value from an inline `style` attribute body.
pub fn get_css_property(style: &str, prop: &str) -> Option<String> {
    for decl in style.split(';') {
        let (name, value) = decl.split_once(':')?;
        if name.trim().eq_ignore_ascii_case(prop) {
            return Some(value.trim().trim_matches(['\'', '"']).to_string());
        }
    }
    None
}

/// Whether the first strong directional character in (markup-stripped) text
/// is right-to-left.
pub fn is_rtl(text: &str) -> bool {
    for c in strip_html(text).chars() {
        let cp = c as u32;
        // Hebrew, Arabic, Syriac, Thaana blocks plus Arabic presentation forms.
        if (0x0590..=0x08FF).contains(&cp)
            || (0xFB1D..=0xFDFF).contains(&cp)
            || (0xFE70..=0xFEFF).contains(&cp)
        {
            return true;
        }
        if c.is_alphabetic() {
            return false;
        }
    }
    false
}

/// One lexical item of constrained HTML.
enum Token<'a> {
    /// A tag, with its name and whether it closes.
    Tag { raw: &'a str, name: String, closing: bool, void: bool },
    /// A single visible character (an entity counts as one).
    Visible(&'a str),
}

fn tokenize(html: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = html;
    while !rest.is_empty() {
        if rest.starts_with('<') {
            if let Some(end) = rest.find('>') {
                let raw = &rest[..end + 1];
                let body = &raw[1..raw.len() - 1];
                let closing = body.starts_with('/');
                let name = body
                    .trim_start_matches('/')
                    .split([' ', '\t', '\n', '/'])
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                let void = body.ends_with('/') || matches!(name.as_str(), "br" | "img" | "hr");
                tokens.push(Token::Tag { raw, name, closing, void });
                rest = &rest[end + 1..];
                continue;
            }
        }
        if rest.starts_with('&') {
            if let Some((_, len)) = decode_entity(rest) {
                tokens.push(Token::Visible(&rest[..len]));
                rest = &rest[len..];
                continue;
            }
        }
        let len = rest.chars().next().unwrap().len_utf8();
        tokens.push(Token::Visible(&rest[..len]));
        rest = &rest[len..];
    }
    tokens
}

/// Slice markup by visible character offsets `[x, y)`, keeping formatting
/// balanced: tags open at `x` are re-opened at the front, tags still open at
/// `y` are closed at the back.
pub fn slice(html: &str, x: usize, y: usize) -> String {
    let mut open: Vec<(&str, String)> = Vec::new();
    let mut out = String::new();
    let mut started = false;
    let mut seen = 0usize;

    for token in tokenize(html) {
        if seen >= y {
            break;
        }
        match token {
            Token::Tag { raw, name, closing, void } => {
                if !closing && !void {
                    open.push((raw, name));
                } else if closing {
                    if let Some(i) = open.iter().rposition(|(_, n)| *n == name) {
                        open.remove(i);
                    }
                }
                if started {
                    out.push_str(raw);
                }
            }
            Token::Visible(s) => {
                if seen >= x {
                    if !started {
                        for (raw, _) in &open {
                            out.push_str(raw);
                        }
                        started = true;
                    }
                    out.push_str(s);
                }
                seen += 1;
            }
        }
    }
    if !started && x == 0 {
        for (raw, _) in &open {
            out.push_str(raw);
        }
    }
    for (_, name) in open.iter().rev() {
        out.push_str(&format!("</{name}>"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_unescape_round_trip() {
        for s in ["plain", "a < b & c > d", "\"quoted\"", "日本語 & more"] {
            assert_eq!(unescape_text(&escape_text(s)), s);
        }
    }

    #[test]
    fn test_unescape_numeric() {
        assert_eq!(unescape_text("&#65;&#x42;"), "AB");
        assert_eq!(unescape_text("&bogus;"), "&bogus;");
        assert_eq!(unescape_text("lone & ampersand"), "lone & ampersand");
    }

    #[test]
    fn test_unescape_html_br() {
        assert_eq!(unescape_html("line<br>break"), "line\nbreak");
        assert_eq!(unescape_html("a<BR/>b&amp;c"), "a\nb&c");
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<b>bold</b> text"), "bold text");
        assert_eq!(strip_html("a<br>b"), "a\nb");
        assert_eq!(strip_html("broken <tag"), "broken <tag");
    }

    #[test]
    fn test_linkify_http() {
        assert_eq!(
            linkify("see http://example.com/x for details"),
            "see <a href=\"http://example.com/x\">http://example.com/x</a> for details"
        );
    }

    #[test]
    fn test_linkify_www_and_trailing_punctuation() {
        assert_eq!(
            linkify("visit www.example.com."),
            "visit <a href=\"http://www.example.com\">www.example.com</a>."
        );
    }

    #[test]
    fn test_linkify_email() {
        assert_eq!(
            linkify("mail me@example.com please"),
            "mail <a href=\"mailto:me@example.com\">me@example.com</a> please"
        );
    }

    #[test]
    fn test_linkify_skips_existing_anchor() {
        let s = "<a href=\"http://x.org\">http://x.org</a>";
        assert_eq!(linkify(s), s);
    }

    #[test]
    fn test_get_css_property() {
        assert_eq!(
            get_css_property("color: red; font-size: 12px", "font-size"),
            Some("12px".into())
        );
        assert_eq!(get_css_property("color: red", "size"), None);
    }

    #[test]
    fn test_is_rtl() {
        assert!(is_rtl("שלום"));
        assert!(is_rtl("<b>مرحبا</b>"));
        assert!(!is_rtl("hello"));
        assert!(!is_rtl("123 hello"));
    }

    #[test]
    fn test_slice_plain() {
        assert_eq!(slice("hello world", 0, 5), "hello");
        assert_eq!(slice("hello world", 6, 11), "world");
    }

    #[test]
    fn test_slice_recloses_tags() {
        assert_eq!(slice("<b>bold</b> plain", 0, 4), "<b>bold</b>");
        assert_eq!(slice("<b>bold</b> plain", 2, 7), "<b>ld</b> pl");
    }

    #[test]
    fn test_slice_counts_entities_as_one() {
        assert_eq!(slice("a&amp;b", 0, 3), "a&amp;b");
        assert_eq!(slice("a&amp;b", 1, 2), "&amp;");
    }
}
