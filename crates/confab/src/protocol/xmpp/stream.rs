//! Stanza framing for the XMPP stream.
//!
//! The stream is one endless XML document; stanzas are its depth-1
//! children. This scanner finds complete top-level elements in the byte
//! stream and hands each one to the tree parser. The `<stream:stream>`
//! header itself never closes, so it is recognized specially, as is the
//! closing `</stream:stream>`.

use std::collections::HashMap;

use crate::util::markup::unescape_text;
use crate::xml::{self, Element, XmlError};

/// One framing-level event.
#[derive(Debug)]
pub(super) enum StreamEvent {
    /// `<stream:stream …>` opened; attributes included.
    Open(HashMap<String, String>),
    /// A complete depth-1 stanza.
    Stanza(Element),
    /// `</stream:stream>`.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    Text,
    Tag,
    TagQuote(u8),
    Comment,
    CData,
}

/// Incremental stanza scanner. Feed bytes, drain events.
pub(super) struct StanzaReader {
    buf: Vec<u8>,
    /// Scan cursor into `buf`.
    pos: usize,
    /// Byte offset where the current stanza started.
    stanza_start: usize,
    depth: usize,
    state: ScanState,
    saw_open: bool,
}

impl StanzaReader {
    pub(super) fn new() -> StanzaReader {
        StanzaReader {
            buf: Vec::new(),
            pos: 0,
            stanza_start: 0,
            depth: 0,
            state: ScanState::Text,
            saw_open: false,
        }
    }

    /// Forget everything; used across STARTTLS stream restarts.
    pub(super) fn reset(&mut self) {
        *self = StanzaReader::new();
    }

    pub(super) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete event, if the buffer holds one.
    pub(super) fn next_event(&mut self) -> Result<Option<StreamEvent>, XmlError> {
        let Some(tag) = self.scan_next_tag()? else {
            return Ok(None);
        };
        match tag {
            Scanned::OpenHeader(end) => {
                let raw =
                    String::from_utf8_lossy(&self.buf[self.stanza_start..end]).into_owned();
                self.consume(end);
                self.saw_open = true;
                Ok(Some(StreamEvent::Open(parse_header_attrs(&raw))))
            }
            Scanned::CloseStream(end) => {
                self.consume(end);
                Ok(Some(StreamEvent::Close))
            }
            Scanned::Stanza(end) => {
                let raw =
                    String::from_utf8_lossy(&self.buf[self.stanza_start..end]).into_owned();
                self.consume(end);
                let element = xml::parse_document(raw.trim())?;
                Ok(Some(StreamEvent::Stanza(element)))
            }
        }
    }

    fn consume(&mut self, end: usize) {
        self.buf.drain(..end);
        self.pos = 0;
        self.stanza_start = 0;
        self.depth = 0;
    }

    /// Advance the scanner until a depth-0 boundary is found.
    fn scan_next_tag(&mut self) -> Result<Option<Scanned>, XmlError> {
        while self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            match self.state {
                ScanState::Text => {
                    if b == b'<' {
                        if self.depth == 0 {
                            // Whitespace keepalives between stanzas.
                            self.stanza_start = self.pos;
                        }
                        if self.buf[self.pos..].starts_with(b"<!--") {
                            self.state = ScanState::Comment;
                        } else if self.buf[self.pos..].starts_with(b"<![CDATA[") {
                            self.state = ScanState::CData;
                        } else {
                            self.state = ScanState::Tag;
                        }
                    }
                    self.pos += 1;
                }
                ScanState::Tag => match b {
                    b'"' | b'\'' => {
                        self.state = ScanState::TagQuote(b);
                        self.pos += 1;
                    }
                    b'>' => {
                        self.state = ScanState::Text;
                        self.pos += 1;
                        if let Some(event) = self.tag_closed()? {
                            return Ok(Some(event));
                        }
                    }
                    _ => self.pos += 1,
                },
                ScanState::TagQuote(q) => {
                    if b == q {
                        self.state = ScanState::Tag;
                    }
                    self.pos += 1;
                }
                ScanState::Comment => {
                    if self.buf[..self.pos + 1].ends_with(b"-->") {
                        self.state = ScanState::Text;
                    }
                    self.pos += 1;
                }
                ScanState::CData => {
                    if self.buf[..self.pos + 1].ends_with(b"]]>") {
                        self.state = ScanState::Text;
                    }
                    self.pos += 1;
                }
            }
        }
        Ok(None)
    }

    /// A `>` ended a tag; classify it and track depth. `self.pos` is just
    /// past the `>`.
    fn tag_closed(&mut self) -> Result<Option<Scanned>, XmlError> {
        let tag = &self.buf[self.stanza_start.max(0)..self.pos];
        let inner_start = tag.iter().position(|&b| b == b'<').unwrap_or(0);
        let tag = &tag[inner_start..];

        if tag.starts_with(b"<?") || tag.starts_with(b"<!") {
            return Ok(None);
        }

        let closing = tag.starts_with(b"</");
        let self_closing = tag.ends_with(b"/>");

        if !self.saw_open && !closing && self.depth == 0 {
            let name_ok = tag.starts_with(b"<stream:stream") || tag.starts_with(b"<stream ");
            if name_ok && !self_closing {
                return Ok(Some(Scanned::OpenHeader(self.pos)));
            }
        }
        if closing && (tag.starts_with(b"</stream:stream") || tag.starts_with(b"</stream>")) {
            if self.depth == 0 {
                return Ok(Some(Scanned::CloseStream(self.pos)));
            }
        }

        if closing {
            if self.depth == 0 {
                return Err(XmlError::Malformed("unbalanced close tag".into()));
            }
            self.depth -= 1;
            if self.depth == 0 {
                return Ok(Some(Scanned::Stanza(self.pos)));
            }
        } else if self_closing {
            if self.depth == 0 {
                return Ok(Some(Scanned::Stanza(self.pos)));
            }
        } else {
            if self.depth == 0 {
                // A depth-1 stanza opens here; remember where it began.
                let start = self.pos - tag.len();
                self.stanza_start = start;
            }
            self.depth += 1;
        }
        Ok(None)
    }
}

enum Scanned {
    OpenHeader(usize),
    CloseStream(usize),
    Stanza(usize),
}

/// Pull `name="value"` pairs out of the raw stream header.
fn parse_header_attrs(raw: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = raw;
    while let Some(eq) = rest.find('=') {
        let name: String = rest[..eq]
            .rsplit(|c: char| c.is_whitespace() || c == '<')
            .next()
            .unwrap_or("")
            .to_string();
        rest = rest[eq + 1..].trim_start();
        let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            continue;
        };
        let Some(end) = rest[1..].find(quote) else {
            break;
        };
        let value = unescape_text(&rest[1..1 + end]);
        if !name.is_empty() {
            attrs.insert(name, value);
        }
        rest = &rest[end + 2..];
    }
    attrs
}
