//! SAX-driven tree builder on top of quick-xml.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::tree::Element;
use super::{Result, XmlError};

struct Scope {
    element: Element,
    prefixes: Vec<(String, String)>,
    default_ns: Option<String>,
}

struct Builder {
    stack: Vec<Scope>,
    root: Option<Element>,
}

impl Builder {
    fn new() -> Builder {
        Builder { stack: Vec::new(), root: None }
    }

    fn lookup_prefix(&self, scope_prefixes: &[(String, String)], prefix: &str) -> Option<String> {
        scope_prefixes
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.clone())
            .or_else(|| {
                self.stack
                    .iter()
                    .rev()
                    .flat_map(|s| s.prefixes.iter().rev())
                    .find(|(p, _)| p == prefix)
                    .map(|(_, uri)| uri.clone())
            })
    }

    fn inherited_default(&self) -> Option<String> {
        self.stack.last().and_then(|s| s.default_ns.clone())
    }

    fn open(&mut self, start: &BytesStart<'_>) -> Result<Scope> {
        let raw = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let (prefix, local) = match raw.split_once(':') {
            Some((p, l)) => (Some(p.to_string()), l.to_string()),
            None => (None, raw),
        };

        let mut element = Element::new(local);
        element.prefix = prefix.clone();

        let mut default_ns = self.inherited_default();
        let mut prefixes: Vec<(String, String)> = Vec::new();

        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| XmlError::Malformed(e.to_string()))?
                .into_owned();
            if key == "xmlns" {
                default_ns = Some(value.clone());
                element.set_namespace(value);
            } else if let Some(p) = key.strip_prefix("xmlns:") {
                element.declare_prefix(p, value.clone());
                prefixes.push((p.to_string(), value));
            } else {
                match key.split_once(':') {
                    Some((p, name)) => element.set_attrib_prefixed(p, name, value),
                    None => element.set_attrib(key, value),
                }
            }
        }

        element.set_default_namespace(default_ns.clone());
        match &prefix {
            Some(p) => {
                if let Some(uri) = self.lookup_prefix(&prefixes, p) {
                    element.set_namespace(uri);
                }
            }
            None => {
                if element.namespace().is_none() {
                    if let Some(ns) = &default_ns {
                        element.set_namespace(ns.clone());
                    }
                }
            }
        }

        Ok(Scope { element, prefixes, default_ns })
    }

    fn close(&mut self, qname: &[u8]) -> Result<()> {
        let scope = self.stack.pop().ok_or(XmlError::NoRoot)?;
        let expected = match &scope.element.prefix {
            Some(p) => format!("{p}:{}", scope.element.name),
            None => scope.element.name.clone(),
        };
        let got = String::from_utf8_lossy(qname).into_owned();
        if expected != got {
            return Err(XmlError::MismatchedClose { expected, got });
        }
        match self.stack.last_mut() {
            Some(parent) => {
                parent.element.append_child(scope.element);
            }
            None => self.root = Some(scope.element),
        }
        Ok(())
    }
}

/// Parse a complete UTF-8 XML document into an element tree.
///
/// Any parse error invalidates the whole tree: there is no partial result.
pub fn parse_document(input: &str) -> Result<Element> {
    let mut reader = Reader::from_str(input);
    let mut builder = Builder::new();

    loop {
        match reader.read_event() {
            Err(e) => return Err(XmlError::Malformed(e.to_string())),
            Ok(Event::Start(start)) => {
                let scope = builder.open(&start)?;
                builder.stack.push(scope);
            }
            Ok(Event::Empty(start)) => {
                let scope = builder.open(&start)?;
                builder.stack.push(scope);
                let qname = start.name().as_ref().to_vec();
                builder.close(&qname)?;
                if builder.stack.is_empty() && builder.root.is_some() {
                    break;
                }
            }
            Ok(Event::End(end)) => {
                builder.close(end.name().as_ref())?;
                if builder.stack.is_empty() {
                    break;
                }
            }
            Ok(Event::Text(text)) => {
                let data = text
                    .unescape()
                    .map_err(|e| XmlError::Malformed(e.to_string()))?;
                if let Some(scope) = builder.stack.last_mut() {
                    if !data.is_empty() {
                        scope.element.insert_data(data.into_owned());
                    }
                }
            }
            Ok(Event::CData(cdata)) => {
                let data = String::from_utf8_lossy(&cdata.into_inner()).into_owned();
                if let Some(scope) = builder.stack.last_mut() {
                    scope.element.insert_data(data);
                }
            }
            Ok(Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_)) => {}
            Ok(Event::Eof) => {
                if builder.root.is_none() {
                    return Err(if builder.stack.is_empty() {
                        XmlError::NoRoot
                    } else {
                        XmlError::UnexpectedEof
                    });
                }
                break;
            }
        }
    }

    builder.root.ok_or(XmlError::NoRoot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let root = parse_document("<message to=\"a@b\"><body>hi</body></message>").unwrap();
        assert_eq!(root.name, "message");
        assert_eq!(root.get_attrib("to"), Some("a@b"));
        assert_eq!(root.get_child("body").unwrap().get_data(), "hi");
    }

    #[test]
    fn test_parse_default_namespace() {
        let root =
            parse_document("<iq xmlns=\"jabber:client\"><query xmlns=\"jabber:iq:roster\"/></iq>")
                .unwrap();
        assert_eq!(root.namespace(), Some("jabber:client"));
        let q = root.get_child("query").unwrap();
        assert_eq!(q.namespace(), Some("jabber:iq:roster"));
        assert!(root.get_child_ns("query", "jabber:iq:roster").is_some());
    }

    #[test]
    fn test_parse_prefixed() {
        let root = parse_document(
            "<stream:features xmlns:stream=\"http://etherx.jabber.org/streams\"/>",
        )
        .unwrap();
        assert_eq!(root.name, "features");
        assert_eq!(root.prefix.as_deref(), Some("stream"));
        assert_eq!(root.namespace(), Some("http://etherx.jabber.org/streams"));
    }

    #[test]
    fn test_parse_entities() {
        let root = parse_document("<m a=\"x&amp;y\">1 &lt; 2</m>").unwrap();
        assert_eq!(root.get_attrib("a"), Some("x&y"));
        assert_eq!(root.get_data(), "1 < 2");
    }

    #[test]
    fn test_parse_cdata() {
        let root = parse_document("<m><![CDATA[<not markup>]]></m>").unwrap();
        assert_eq!(root.get_data(), "<not markup>");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_document("<a><b></a></b>").is_err());
        assert!(parse_document("").is_err());
        assert!(parse_document("<unclosed>").is_err());
    }

    #[test]
    fn test_round_trip() {
        let docs = [
            "<a/>",
            "<a b=\"c\"/>",
            "<iq xmlns=\"jabber:client\" type=\"get\"><query xmlns=\"jabber:iq:roster\"/></iq>",
            "<m>text<inner/>more</m>",
            "<m a=\"1 &amp; 2\">x &lt; y</m>",
        ];
        for doc in docs {
            let tree = parse_document(doc).unwrap();
            let serialized = tree.to_xml();
            let reparsed = parse_document(&serialized).unwrap();
            assert_eq!(tree, reparsed, "round trip failed for {doc}");
        }
    }
}
