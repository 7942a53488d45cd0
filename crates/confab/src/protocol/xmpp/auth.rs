//! SASL mechanism chain and the legacy `jabber:iq:auth` fallback.
//!
//! Mechanisms negotiate by priority: the highest-priority mechanism both
//! sides support wins. Each mechanism sees the challenge/success/failure
//! exchange abstractly; the stream layer only shuttles base64 blobs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;

use crate::xml::Element;

pub(super) const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Why authentication stopped.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(super) enum AuthError {
    /// The server rejected the credentials.
    #[error("not authorized")]
    NotAuthorized,

    /// No mechanism both sides support.
    #[error("no usable authentication mechanism")]
    NoMechanism,

    /// The server sent something the mechanism cannot process.
    #[error("malformed authentication exchange: {0}")]
    Malformed(String),

    /// Misc server-reported failure condition.
    #[error("authentication failed: {0}")]
    Failed(String),
}

/// One pluggable SASL mechanism.
pub(super) trait SaslMechanism: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Negotiation priority; the highest usable mechanism is chosen.
    fn priority(&self) -> i32;

    /// Whether this mechanism can run given the session's circumstances.
    fn usable(&self, have_password: bool, encrypted: bool, allow_plaintext: bool) -> bool;

    /// Begin; returns the initial response payload, if any.
    fn start(&mut self, username: &str, password: &str) -> Option<Vec<u8>>;

    /// Respond to a server challenge.
    fn handle_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError>;

    /// The server reported success; verify any final data.
    fn handle_success(&mut self) -> Result<(), AuthError> {
        Ok(())
    }

    /// Map a `<failure>` condition element name to an error.
    fn handle_failure(&self, condition: &str) -> AuthError {
        match condition {
            "not-authorized" | "credentials-expired" => AuthError::NotAuthorized,
            "invalid-mechanism" | "mechanism-too-weak" => AuthError::NoMechanism,
            other => AuthError::Failed(other.to_string()),
        }
    }

    /// Drop any sensitive intermediate state.
    fn dispose(&mut self) {}
}

/// RFC 4616 PLAIN. Low priority: only a last resort, and refused entirely
/// on unencrypted streams unless the account opted in.
#[derive(Debug)]
pub(super) struct Plain {
    scratch: Option<Vec<u8>>,
}

impl Plain {
    pub(super) fn new() -> Plain {
        Plain { scratch: None }
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn usable(&self, have_password: bool, encrypted: bool, allow_plaintext: bool) -> bool {
        have_password && (encrypted || allow_plaintext)
    }

    fn start(&mut self, username: &str, password: &str) -> Option<Vec<u8>> {
        let mut payload = Vec::with_capacity(username.len() + password.len() + 2);
        payload.push(0);
        payload.extend_from_slice(username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(password.as_bytes());
        self.scratch = Some(payload.clone());
        Some(payload)
    }

    fn handle_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(AuthError::Malformed("PLAIN expects no challenge".into()))
    }

    fn dispose(&mut self) {
        if let Some(mut scratch) = self.scratch.take() {
            scratch.fill(0);
        }
    }
}

/// SASL EXTERNAL: identity proven by the TLS layer.
#[derive(Debug)]
pub(super) struct External;

impl SaslMechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn usable(&self, _have_password: bool, encrypted: bool, _allow_plaintext: bool) -> bool {
        encrypted
    }

    fn start(&mut self, username: &str, _password: &str) -> Option<Vec<u8>> {
        Some(username.as_bytes().to_vec())
    }

    fn handle_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(Vec::new())
    }
}

/// The full chain, priority-descending.
fn all_mechanisms() -> Vec<Box<dyn SaslMechanism>> {
    vec![Box::new(External), Box::new(Plain::new())]
}

/// Pick the best mechanism the server offered that we can use.
pub(super) fn choose_mechanism(
    offered: &[String],
    have_password: bool,
    encrypted: bool,
    allow_plaintext: bool,
) -> Result<Box<dyn SaslMechanism>, AuthError> {
    let mut candidates: Vec<Box<dyn SaslMechanism>> = all_mechanisms()
        .into_iter()
        .filter(|m| offered.iter().any(|o| o == m.name()))
        .filter(|m| m.usable(have_password, encrypted, allow_plaintext))
        .collect();
    candidates.sort_by_key(|m| std::cmp::Reverse(m.priority()));
    candidates.into_iter().next().ok_or(AuthError::NoMechanism)
}

/// `<auth mechanism="…">initial</auth>`
pub(super) fn build_auth(mechanism: &str, initial: Option<&[u8]>) -> Element {
    let mut auth = Element::new_with_ns("auth", NS_SASL);
    auth.set_attrib("mechanism", mechanism);
    match initial {
        Some(data) if !data.is_empty() => auth.insert_data(B64.encode(data)),
        Some(_) => auth.insert_data("="),
        None => {}
    }
    auth
}

/// `<response>…</response>`
pub(super) fn build_response(payload: &[u8]) -> Element {
    let mut response = Element::new_with_ns("response", NS_SASL);
    if payload.is_empty() {
        response.insert_data("=");
    } else {
        response.insert_data(B64.encode(payload));
    }
    response
}

/// Decode the text payload of a challenge/success element.
pub(super) fn decode_payload(el: &Element) -> Result<Vec<u8>, AuthError> {
    let text = el.get_data();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    B64.decode(text)
        .map_err(|e| AuthError::Malformed(format!("bad base64: {e}")))
}

/// Condition name inside a `<failure>` element.
pub(super) fn failure_condition(el: &Element) -> String {
    el.child_elements()
        .map(|c| c.name.clone())
        .find(|n| n != "text")
        .unwrap_or_else(|| "not-authorized".to_string())
}

/// Legacy pre-SASL auth: `jabber:iq:auth` with plaintext password. Only
/// offered when the server presents no SASL mechanisms, and only used when
/// the account explicitly allows plaintext auth.
pub(super) fn build_legacy_auth(
    username: &str,
    password: &str,
    resource: &str,
    id: &str,
) -> Element {
    let mut iq = Element::new_with_ns("iq", "jabber:client");
    iq.set_attrib("type", "set");
    iq.set_attrib("id", id);
    let query = iq.new_child("query");
    query.set_namespace("jabber:iq:auth");
    query.new_child("username").insert_data(username);
    query.new_child("password").insert_data(password);
    query.new_child("resource").insert_data(resource);
    iq
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_payload() {
        let mut plain = Plain::new();
        let payload = plain.start("romeo", "juliet").unwrap();
        assert_eq!(payload, b"\0romeo\0juliet");
        plain.dispose();
    }

    #[test]
    fn test_plain_requires_encryption_or_optin() {
        let plain = Plain::new();
        assert!(plain.usable(true, true, false));
        assert!(plain.usable(true, false, true));
        assert!(!plain.usable(true, false, false));
        assert!(!plain.usable(false, true, true));
    }

    #[test]
    fn test_external_preferred_over_plain() {
        let mech = choose_mechanism(&offered(&["PLAIN", "EXTERNAL"]), true, true, false).unwrap();
        assert_eq!(mech.name(), "EXTERNAL");
    }

    #[test]
    fn test_plain_chosen_when_only_option() {
        let mech = choose_mechanism(&offered(&["PLAIN", "SCRAM-SHA-1"]), true, true, false)
            .unwrap();
        assert_eq!(mech.name(), "PLAIN");
    }

    #[test]
    fn test_no_mechanism() {
        let err = choose_mechanism(&offered(&["SCRAM-SHA-1"]), true, true, false).unwrap_err();
        assert_eq!(err, AuthError::NoMechanism);
        let err = choose_mechanism(&offered(&["PLAIN"]), true, false, false).unwrap_err();
        assert_eq!(err, AuthError::NoMechanism);
    }

    #[test]
    fn test_build_auth_element() {
        let el = build_auth("PLAIN", Some(b"\0user\0pass"));
        let xml = el.to_xml();
        assert!(xml.starts_with("<auth xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\""));
        assert!(xml.contains("mechanism=\"PLAIN\""));
        let decoded = decode_payload(&el).unwrap();
        assert_eq!(decoded, b"\0user\0pass");
    }

    #[test]
    fn test_failure_condition_parse() {
        let el = crate::xml::parse_document(
            "<failure xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"><not-authorized/></failure>",
        )
        .unwrap();
        assert_eq!(failure_condition(&el), "not-authorized");
        let plain = Plain::new();
        assert_eq!(
            plain.handle_failure(&failure_condition(&el)),
            AuthError::NotAuthorized
        );
    }

    #[test]
    fn test_legacy_auth_shape() {
        let iq = build_legacy_auth("romeo", "secret", "home", "auth1");
        let q = iq.get_child("query").unwrap();
        assert_eq!(q.namespace(), Some("jabber:iq:auth"));
        assert_eq!(q.get_child("username").unwrap().get_data(), "romeo");
        assert_eq!(q.get_child("resource").unwrap().get_data(), "home");
    }
}
