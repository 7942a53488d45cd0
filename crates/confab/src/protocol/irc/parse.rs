//! IRC line parsing (RFC 1459 framing) via winnow.

use winnow::ascii::space1;
use winnow::combinator::{opt, preceded};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::{rest, take_while};

type PResult<T> = Result<T, ErrMode<ContextError>>;

/// One parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct IrcMsg {
    /// Sender prefix without the leading `:`.
    pub prefix: Option<String>,
    /// Command word or numeric reply code, uppercased.
    pub command: String,
    /// Middle parameters plus the trailing parameter, in order.
    pub params: Vec<String>,
}

impl IrcMsg {
    /// Nick portion of the prefix (`nick!user@host`).
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split(['!', '@']).next().unwrap_or(prefix))
    }

    pub fn param(&self, i: usize) -> &str {
        self.params.get(i).map(String::as_str).unwrap_or("")
    }
}

fn word<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(1.., |c: char| c != ' ' && c != '\r' && c != '\n').parse_next(input)
}

fn message(input: &mut &str) -> PResult<IrcMsg> {
    let prefix = opt(preceded(':', word)).parse_next(input)?;
    let _ = opt(space1).parse_next(input)?;
    let command = word.parse_next(input)?;

    let mut params = Vec::new();
    loop {
        if opt(space1).parse_next(input)?.is_none() {
            break;
        }
        if input.starts_with(':') {
            let trailing: &str = preceded(':', rest).parse_next(input)?;
            params.push(trailing.to_string());
            break;
        }
        match opt(word).parse_next(input)? {
            Some(w) => params.push(w.to_string()),
            None => break,
        }
    }

    Ok(IrcMsg {
        prefix: prefix.map(str::to_string),
        command: command.to_ascii_uppercase(),
        params,
    })
}

/// Parse one line (without its CRLF).
pub(super) fn parse_line(line: &str) -> Option<IrcMsg> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return None;
    }
    message.parse(trimmed).ok()
}

/// Whether a message target names a channel rather than a user.
pub(super) fn is_channel(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

/// Split a CTCP ACTION out of a PRIVMSG body (`\x01ACTION waves\x01`).
pub(super) fn ctcp_action(body: &str) -> Option<&str> {
    body.strip_prefix("\u{1}ACTION ")?.strip_suffix('\u{1}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privmsg() {
        let msg = parse_line(":alice!alice@example.net PRIVMSG bob :hello there").unwrap();
        assert_eq!(msg.nick(), Some("alice"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, ["bob", "hello there"]);
    }

    #[test]
    fn test_no_prefix() {
        let msg = parse_line("PING :irc.example.net").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.param(0), "irc.example.net");
    }

    #[test]
    fn test_numeric_with_params() {
        let msg = parse_line(":server 303 mynick :alice bob carol").unwrap();
        assert_eq!(msg.command, "303");
        assert_eq!(msg.param(0), "mynick");
        assert_eq!(msg.param(1), "alice bob carol");
    }

    #[test]
    fn test_command_case_normalized() {
        let msg = parse_line(":x privmsg y :z").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn test_empty_trailing() {
        let msg = parse_line(":x TOPIC #chan :").unwrap();
        assert_eq!(msg.params, ["#chan", ""]);
    }

    #[test]
    fn test_crlf_stripped() {
        let msg = parse_line("PING :x\r\n").unwrap();
        assert_eq!(msg.param(0), "x");
    }

    #[test]
    fn test_garbage() {
        assert!(parse_line("").is_none());
        assert!(parse_line("\r\n").is_none());
    }

    #[test]
    fn test_is_channel() {
        assert!(is_channel("#rust"));
        assert!(is_channel("&local"));
        assert!(!is_channel("alice"));
    }

    #[test]
    fn test_ctcp_action() {
        assert_eq!(ctcp_action("\u{1}ACTION waves\u{1}"), Some("waves"));
        assert_eq!(ctcp_action("plain text"), None);
    }
}
