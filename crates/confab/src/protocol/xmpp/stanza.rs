//! Stanza and stream error parsing, plus small builders.

use crate::protocol::ConnectionError;
use crate::xml::Element;

pub(super) const NS_CLIENT: &str = "jabber:client";
pub(super) const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub(super) const NS_STANZA_ERR: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub(super) const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub(super) const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub(super) const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub(super) const NS_ROSTER: &str = "jabber:iq:roster";
pub(super) const NS_PING: &str = "urn:xmpp:ping";
pub(super) const NS_CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
pub(super) const NS_MUC: &str = "http://jabber.org/protocol/muc";
pub(super) const NS_MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub(super) const NS_CAPS: &str = "http://jabber.org/protocol/caps";
pub(super) const NS_ATTENTION: &str = "urn:xmpp:attention";
pub(super) const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// The stable stanza-level error sub-taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaError {
    BadRequest,
    Conflict,
    Forbidden,
    ItemNotFound,
    NotAllowed,
    NotAuthorized,
    RecipientUnavailable,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    UnexpectedRequest,
    UndefinedCondition,
}

impl StanzaError {
    fn from_condition(name: &str) -> StanzaError {
        match name {
            "bad-request" => StanzaError::BadRequest,
            "conflict" => StanzaError::Conflict,
            "forbidden" => StanzaError::Forbidden,
            "item-not-found" => StanzaError::ItemNotFound,
            "not-allowed" => StanzaError::NotAllowed,
            "not-authorized" => StanzaError::NotAuthorized,
            "recipient-unavailable" => StanzaError::RecipientUnavailable,
            "registration-required" => StanzaError::RegistrationRequired,
            "remote-server-not-found" => StanzaError::RemoteServerNotFound,
            "remote-server-timeout" => StanzaError::RemoteServerTimeout,
            "resource-constraint" => StanzaError::ResourceConstraint,
            "service-unavailable" => StanzaError::ServiceUnavailable,
            "unexpected-request" => StanzaError::UnexpectedRequest,
            _ => StanzaError::UndefinedCondition,
        }
    }
}

/// A parsed `<error>` child: the taxonomy entry plus any human text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStanzaError {
    pub error: StanzaError,
    pub text: Option<String>,
}

/// Parse the `<error>` child of a stanza, if present.
pub fn parse_stanza_error(stanza: &Element) -> Option<ParsedStanzaError> {
    let error_el = stanza.get_child("error")?;
    let mut error = StanzaError::UndefinedCondition;
    let mut text = None;
    for child in error_el.child_elements() {
        if child.name == "text" {
            let t = child.get_data();
            if !t.is_empty() {
                text = Some(t);
            }
        } else {
            error = StanzaError::from_condition(&child.name);
        }
    }
    Some(ParsedStanzaError { error, text })
}

/// Map a `<stream:error>` element onto the connection taxonomy.
///
/// `<redirect>` has no settled policy; it is reported as a network error
/// after being logged by the caller.
pub(super) fn stream_error_to_connection_error(error_el: &Element) -> ConnectionError {
    let condition = error_el
        .child_elements()
        .map(|c| c.name.clone())
        .find(|n| n != "text")
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = error_el
        .get_child("text")
        .map(|t| t.get_data())
        .filter(|t| !t.is_empty());

    match condition.as_str() {
        "conflict" => ConnectionError::NameInUse,
        "host-unknown" | "host-gone" | "improper-addressing" => ConnectionError::InvalidUsername,
        "not-authorized" => {
            ConnectionError::AuthenticationFailed(text.unwrap_or_else(|| "Not authorized".into()))
        }
        "policy-violation" | "restricted-xml" | "unsupported-encoding" => {
            ConnectionError::OtherError(text.unwrap_or(condition))
        }
        other => ConnectionError::NetworkError(
            text.unwrap_or_else(|| format!("stream error: {other}")),
        ),
    }
}

/// `<iq type="…" id="…">` builder.
pub(super) fn build_iq(iq_type: &str, id: &str) -> Element {
    let mut iq = Element::new_with_ns("iq", NS_CLIENT);
    iq.set_attrib("type", iq_type);
    iq.set_attrib("id", id);
    iq
}

/// `<message to="…" type="chat">` with body (and optional chat state).
pub(super) fn build_message(to: &str, msg_type: &str, body: &str) -> Element {
    let mut message = Element::new_with_ns("message", NS_CLIENT);
    message.set_attrib("to", to);
    message.set_attrib("type", msg_type);
    message.new_child("body").insert_data(body);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;

    #[test]
    fn test_parse_stanza_error() {
        let stanza = parse_document(
            "<iq type=\"error\"><error type=\"cancel\">\
             <item-not-found xmlns=\"urn:ietf:params:xml:ns:xmpp-stanzas\"/>\
             <text xmlns=\"urn:ietf:params:xml:ns:xmpp-stanzas\">gone</text>\
             </error></iq>",
        )
        .unwrap();
        let parsed = parse_stanza_error(&stanza).unwrap();
        assert_eq!(parsed.error, StanzaError::ItemNotFound);
        assert_eq!(parsed.text.as_deref(), Some("gone"));
    }

    #[test]
    fn test_unknown_condition_is_undefined() {
        let stanza = parse_document(
            "<iq type=\"error\"><error><made-up-condition/></error></iq>",
        )
        .unwrap();
        assert_eq!(
            parse_stanza_error(&stanza).unwrap().error,
            StanzaError::UndefinedCondition
        );
    }

    #[test]
    fn test_no_error_child() {
        let stanza = parse_document("<iq type=\"result\"/>").unwrap();
        assert!(parse_stanza_error(&stanza).is_none());
    }

    #[test]
    fn test_stream_conflict_is_name_in_use() {
        let el = parse_document("<error><conflict/></error>").unwrap();
        assert_eq!(
            stream_error_to_connection_error(&el),
            ConnectionError::NameInUse
        );
    }

    #[test]
    fn test_stream_error_text_carried() {
        let el =
            parse_document("<error><system-shutdown/><text>going down</text></error>").unwrap();
        assert_eq!(
            stream_error_to_connection_error(&el),
            ConnectionError::NetworkError("going down".into())
        );
    }

    #[test]
    fn test_builders() {
        let iq = build_iq("get", "ping1");
        assert_eq!(iq.get_attrib("type"), Some("get"));
        assert_eq!(iq.get_attrib("id"), Some("ping1"));
        let msg = build_message("juliet@example.net", "chat", "hello");
        assert_eq!(msg.get_child("body").unwrap().get_data(), "hello");
    }
}
