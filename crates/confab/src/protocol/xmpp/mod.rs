//! XMPP (Jabber).
//!
//! Stream establishment follows RFC 6120: open the stream, read features,
//! STARTTLS per the account's encryption policy, authenticate through the
//! SASL chain (or legacy `jabber:iq:auth` against pre-SASL servers), bind a
//! resource, request the session, fetch the roster, send initial presence.
//! Two timers keep the session honest: a whitespace keepalive after
//! [`INACTIVITY_SECS`] of quiet, and an application-level ping that faults
//! the connection when no pong arrives within [`PING_FAULT_SECS`].

mod auth;
mod roster;
mod stanza;
mod stream;

pub use stanza::{ParsedStanzaError, StanzaError, parse_stanza_error};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use self::auth::{AuthError, SaslMechanism};
use self::stanza::*;
use self::stream::{StanzaReader, StreamEvent};
use crate::account::{Account, Status, StatusPrimitive, StatusType};
use crate::conversation::TypingState;
use crate::core::{Core, CoreInner};
use crate::debug;
use crate::eventloop::SourceId;
use crate::media::caps as mediacaps;
use crate::net::{QueuedOutputStream, TlsPolicy, TlsSession};
use crate::protocol::{
    AccountOption, AttentionOps, AttentionType, ChatField, ChatOps, ImOps, MediaOps, Protocol,
    RoomlistOps, ServerOps, UserSplit, XferOps, connection::Connection,
    connection::ConnectionError,
};
use crate::signals::SignalBus;
use crate::xfer::{Xfer, XferDirection, XferHooks};
use crate::xml::Element;

pub const DEFAULT_PORT: u16 = 5222;
pub const LEGACY_SSL_PORT: u16 = 5223;
/// Send an application ping after this much inbound silence.
pub const PING_IDLE_SECS: u64 = 60;
/// Fault the connection when a ping goes unanswered this long.
pub const PING_FAULT_SECS: u64 = 120;
/// Send whitespace after this much inbound silence.
pub const INACTIVITY_SECS: u64 = 120;

/// Stream establishment states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JabberState {
    Offline,
    Connecting,
    Initializing,
    InitializingEncryption,
    Authenticating,
    PostAuth,
    Connected,
}

/// Parsed `user@domain/resource`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Jid {
    pub user: Option<String>,
    pub domain: String,
    pub resource: Option<String>,
}

impl Jid {
    pub(crate) fn parse(raw: &str) -> Option<Jid> {
        let (bare, resource) = match raw.split_once('/') {
            Some((b, r)) => (b, Some(r.to_string())),
            None => (raw, None),
        };
        let (user, domain) = match bare.split_once('@') {
            Some((u, d)) => (Some(u.to_string()), d),
            None => (None, bare),
        };
        if domain.is_empty() {
            return None;
        }
        Some(Jid { user, domain: domain.to_string(), resource })
    }

    pub(crate) fn bare(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.domain),
            None => self.domain.clone(),
        }
    }
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid out-buffer; gethostname NUL-terminates on
    // success for lengths below the buffer size.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
    if rc != 0 {
        return "confab".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

struct Session {
    core: Weak<CoreInner>,
    conn: Connection,
    account: Account,
    jid: Jid,
    resource: String,
    state: Cell<JabberState>,
    tls_planned: bool,
    encrypted: Cell<bool>,
    out: RefCell<Option<QueuedOutputStream>>,
    next_id: Cell<u64>,
    /// Outstanding pings: id → fault timer.
    pending_pings: RefCell<HashMap<String, SourceId>>,
    inactivity_timer: Cell<Option<SourceId>>,
    /// Full JID → media caps mask, learned from presence.
    resources: RefCell<HashMap<String, u32>>,
    /// Rooms we are joining/joined: room bare JID → our nick.
    rooms: RefCell<HashMap<String, String>>,
    /// Pending roomlist fetch: the disco iq id. Doubles as the progress
    /// flag.
    roomlist_iq: RefCell<Option<String>>,
    closed: Cell<bool>,
}

impl Session {
    fn core(&self) -> Option<Core> {
        self.core.upgrade().map(Core::from_inner)
    }

    fn signals(&self) -> Option<SignalBus> {
        self.core().map(|c| c.signals().clone())
    }

    fn next_id(&self) -> String {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        format!("confab{id}")
    }

    fn set_state(&self, state: JabberState) {
        self.state.set(state);
        let total = if self.tls_planned { 9 } else { 5 };
        let (text, step) = match state {
            JabberState::Offline => return,
            JabberState::Connecting => ("Connecting", 1),
            JabberState::Initializing => ("Initializing stream", 2),
            JabberState::InitializingEncryption => ("Initializing SSL/TLS", 3),
            JabberState::Authenticating => ("Authenticating", if self.encrypted.get() { 6 } else { 3 }),
            JabberState::PostAuth => ("Re-initializing stream", if self.encrypted.get() { 7 } else { 4 }),
            JabberState::Connected => {
                self.conn.update_progress("Connected", total, total);
                return;
            }
        };
        self.conn.update_progress(text, step, total);
    }

    /// Serialize and queue a stanza on the established stream, running the
    /// sending-text signal first so plugins can rewrite it.
    fn queue_element(&self, el: &Element) {
        let mut text = el.to_xml();
        if let Some(signals) = self.signals() {
            let mut event = RawTextEvent { text };
            let _ = signals.emit("xmpp-sending-text", &mut event);
            text = event.text;
        }
        self.queue_raw(text.as_bytes());
    }

    fn queue_raw(&self, bytes: &[u8]) {
        if let Some(out) = self.out.borrow().as_ref() {
            if let Err(e) = out.queue(bytes.to_vec()) {
                debug::error("xmpp", &format!("write failed: {e}"));
                self.conn.error(ConnectionError::NetworkError(e.to_string()));
            }
        }
    }
}

/// Raw text crossing the stream, mutable by plugins.
pub struct RawTextEvent {
    pub text: String,
}

/// A stanza arriving, before default handling. Vetoing consumes it.
pub struct StanzaEvent {
    pub account: Account,
    pub stanza: Element,
}

/// The XMPP protocol implementation.
#[derive(Default)]
pub struct XmppProtocol {
    tls: TlsSession,
}

impl XmppProtocol {
    pub fn new() -> XmppProtocol {
        Self::default()
    }

    fn session(conn: &Connection) -> Option<Rc<Session>> {
        conn.with_proto_data::<Rc<Session>, _>(Rc::clone)
    }
}

fn register_protocol_signals(bus: &SignalBus) {
    let _ = bus.register::<RawTextEvent>("xmpp-sending-text");
    let _ = bus.register::<RawTextEvent>("xmpp-receiving-text");
    let _ = bus.register::<StanzaEvent>("xmpp-receiving-message");
    let _ = bus.register::<StanzaEvent>("xmpp-receiving-iq");
    let _ = bus.register::<StanzaEvent>("xmpp-receiving-presence");
}

impl Protocol for XmppProtocol {
    fn id(&self) -> &str {
        "xmpp"
    }

    fn name(&self) -> &str {
        "XMPP"
    }

    fn list_icon(&self, _account: Option<&Account>) -> &str {
        "jabber"
    }

    fn account_options(&self) -> Vec<AccountOption> {
        vec![
            AccountOption::string(
                "encryption",
                "Connection security",
                "opportunistic_tls",
            ),
            AccountOption::bool("auth_plain_in_clear", "Allow plaintext auth over unencrypted streams", false),
            AccountOption::string("connect_server", "Connect server", ""),
            AccountOption::string("conference_server", "Conference server", ""),
            AccountOption::int("port", "Connect port", DEFAULT_PORT as i64),
        ]
    }

    fn user_splits(&self) -> Vec<UserSplit> {
        vec![
            UserSplit { label: "Domain".into(), separator: '@', default: "example.org".into() },
            UserSplit { label: "Resource".into(), separator: '/', default: "Home".into() },
        ]
    }

    fn status_types(&self, _account: &Account) -> Vec<StatusType> {
        vec![
            StatusType::new(StatusPrimitive::Available, "available", "Available"),
            StatusType::new(StatusPrimitive::Away, "away", "Away"),
            StatusType::new(StatusPrimitive::ExtendedAway, "xa", "Extended away"),
            StatusType::new(StatusPrimitive::DoNotDisturb, "dnd", "Do not disturb"),
            StatusType::new(StatusPrimitive::Invisible, "invisible", "Invisible"),
            StatusType::new(StatusPrimitive::Offline, "offline", "Offline")
                .with_user_settable(false),
            StatusType::new(StatusPrimitive::Tune, "tune", "Tune").with_user_settable(false),
        ]
    }

    fn login(&self, core: &Core, connection: &Connection) {
        let Some(account) = connection.account() else {
            return;
        };
        register_protocol_signals(core.signals());

        let Some(jid) = Jid::parse(account.username()) else {
            connection.error(ConnectionError::InvalidUsername);
            return;
        };
        if jid.user.is_none() {
            connection.error(ConnectionError::InvalidUsername);
            return;
        }

        let resource = jid
            .resource
            .clone()
            .unwrap_or_else(|| "__HOSTNAME__".to_string())
            .replace("__HOSTNAME__", &local_hostname());

        let policy = match account.get_string("encryption", "opportunistic_tls").as_str() {
            "none" => TlsPolicy::Disabled,
            "require_tls" => TlsPolicy::Required,
            "old_ssl" => TlsPolicy::Legacy,
            _ => TlsPolicy::Opportunistic,
        };

        let session = Rc::new(Session {
            core: core.downgrade(),
            conn: connection.clone(),
            account: account.clone(),
            jid,
            resource,
            state: Cell::new(JabberState::Offline),
            tls_planned: policy != TlsPolicy::Disabled,
            encrypted: Cell::new(false),
            out: RefCell::new(None),
            next_id: Cell::new(0),
            pending_pings: RefCell::new(HashMap::new()),
            inactivity_timer: Cell::new(None),
            resources: RefCell::new(HashMap::new()),
            rooms: RefCell::new(HashMap::new()),
            roomlist_iq: RefCell::new(None),
            closed: Cell::new(false),
        });
        connection.set_proto_data(Box::new(Rc::clone(&session)));

        let tls = self.tls.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = login_task(Rc::clone(&session), tls, policy).await {
                if !session.closed.get() {
                    session.conn.error(e);
                }
            }
        });
    }

    fn close(&self, connection: &Connection) {
        let Some(session) = Self::session(connection) else {
            return;
        };
        debug::info(
            "xmpp",
            &format!("closing stream in state {:?}", session.state.get()),
        );
        session.closed.set(true);
        if let Some(out) = session.out.borrow_mut().take() {
            let _ = out.queue(&b"</stream:stream>"[..]);
            tokio::task::spawn_local(async move {
                let _ = out.graceful_close().await;
            });
        }
        if let Some(core) = session.core() {
            if let Some(id) = session.inactivity_timer.take() {
                core.event_loop().cancel(id);
            }
            for (_, timer) in session.pending_pings.borrow_mut().drain() {
                core.event_loop().cancel(timer);
            }
        }
        connection.take_proto_data();
    }

    fn server_ops(&self) -> Option<&dyn ServerOps> {
        Some(self)
    }

    fn im_ops(&self) -> Option<&dyn ImOps> {
        Some(self)
    }

    fn chat_ops(&self) -> Option<&dyn ChatOps> {
        Some(self)
    }

    fn xfer_ops(&self) -> Option<&dyn XferOps> {
        Some(self)
    }

    fn media_ops(&self) -> Option<&dyn MediaOps> {
        Some(self)
    }

    fn attention_ops(&self) -> Option<&dyn AttentionOps> {
        Some(self)
    }

    fn roomlist_ops(&self) -> Option<&dyn RoomlistOps> {
        Some(self)
    }
}

// Login and stream driving -------------------------------------------------

type NegResult<T> = std::result::Result<T, ConnectionError>;

async fn login_task(
    session: Rc<Session>,
    tls: TlsSession,
    policy: TlsPolicy,
) -> NegResult<()> {
    session.set_state(JabberState::Connecting);
    let tcp = connect_endpoint(&session, policy).await?;

    let mut reader = StanzaReader::new();
    if policy == TlsPolicy::Legacy {
        session.set_state(JabberState::InitializingEncryption);
        let tls_stream = crate::net::handshake(&tls, tcp, &session.jid.domain)
            .await
            .map_err(|e| ConnectionError::from(crate::net::Error::Tls(e)))?;
        session.encrypted.set(true);
        session.set_state(JabberState::Initializing);
        let mut stream = tls_stream;
        let features = open_stream(&session, &mut stream, &mut reader).await?;
        return establish(session, stream, reader, features).await;
    }

    session.set_state(JabberState::Initializing);
    let mut tcp = tcp;
    let features = open_stream(&session, &mut tcp, &mut reader).await?;

    let starttls_offered = features.get_child("starttls").is_some();
    let want_tls = matches!(policy, TlsPolicy::Opportunistic | TlsPolicy::Required);

    if policy == TlsPolicy::Required && !starttls_offered {
        return Err(ConnectionError::EncryptionError(
            "You require encryption, but it is not available on this server.".into(),
        ));
    }

    if starttls_offered && want_tls {
        session.set_state(JabberState::InitializingEncryption);
        write_all(&mut tcp, Element::new_with_ns("starttls", NS_TLS).to_xml().as_bytes())
            .await?;
        let reply = read_stanza(&session, &mut tcp, &mut reader).await?;
        if reply.name != "proceed" {
            return Err(ConnectionError::EncryptionError(
                "The server refused to start encryption.".into(),
            ));
        }
        reader.reset();
        let tls_stream = crate::net::handshake(&tls, tcp, &session.jid.domain)
            .await
            .map_err(|e| ConnectionError::from(crate::net::Error::Tls(e)))?;
        session.encrypted.set(true);
        let mut stream = tls_stream;
        let features = open_stream(&session, &mut stream, &mut reader).await?;
        return establish(session, stream, reader, features).await;
    }

    establish(session, tcp, reader, features).await
}

/// Resolve SRV targets (falling back to the bare domain) and connect.
async fn connect_endpoint(session: &Session, policy: TlsPolicy) -> NegResult<TcpStream> {
    let Some(core) = session.core() else {
        return Err(ConnectionError::OtherError("core is gone".into()));
    };
    let account = &session.account;

    let default_port = if policy == TlsPolicy::Legacy { LEGACY_SSL_PORT } else { DEFAULT_PORT };
    let port = account.get_int("port", default_port as i64) as u16;
    let connect_server = account.get_string("connect_server", "");

    let mut targets: Vec<(String, u16)> = Vec::new();
    if !connect_server.is_empty() {
        targets.push((connect_server, port));
    } else if policy != TlsPolicy::Legacy {
        match crate::resolver::resolve_srv_async("xmpp-client", "tcp", &session.jid.domain).await
        {
            Ok(srv) => {
                targets.extend(srv.into_iter().map(|t| (t.host, t.port)));
            }
            Err(e) => {
                // SRV trouble is not fatal: bootstrap from the bare domain.
                debug::warning("xmpp", &format!("SRV lookup failed: {e}"));
            }
        }
    }
    if targets.is_empty() {
        targets.push((session.jid.domain.clone(), port));
    }

    let mut last: Option<crate::net::Error> = None;
    for (host, port) in targets {
        match core.connector().connect(&host, port).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug::info("xmpp", &format!("{host}:{port} failed: {e}"));
                last = Some(e);
            }
        }
    }
    Err(last
        .map(ConnectionError::from)
        .unwrap_or_else(|| ConnectionError::NetworkError("no servers to try".into())))
}

async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> NegResult<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| ConnectionError::NetworkError(e.to_string()))
}

/// Write the stream header and read `<stream:stream>` + `<features>`.
async fn open_stream<S: AsyncRead + AsyncWrite + Unpin>(
    session: &Session,
    stream: &mut S,
    reader: &mut StanzaReader,
) -> NegResult<Element> {
    let header = format!(
        "<stream:stream to=\"{}\" xmlns=\"{NS_CLIENT}\" \
         xmlns:stream=\"{NS_STREAMS}\" version=\"1.0\">",
        crate::util::escape_text(&session.jid.domain)
    );
    write_all(stream, header.as_bytes()).await?;

    loop {
        match next_event(session, stream, reader).await? {
            StreamEvent::Open(_) => break,
            StreamEvent::Stanza(el) => {
                return Err(unexpected_stanza(&el));
            }
            StreamEvent::Close => {
                return Err(ConnectionError::NetworkError("stream closed".into()));
            }
        }
    }
    // A features element with no mechanisms routes auth the legacy way.
    match read_stanza(session, stream, reader).await {
        Ok(el) if el.name == "features" => Ok(el),
        Ok(el) => Err(unexpected_stanza(&el)),
        Err(e) => Err(e),
    }
}

fn unexpected_stanza(el: &Element) -> ConnectionError {
    if el.name == "error" {
        debug_redirect(el);
        stream_error_to_connection_error(el)
    } else {
        ConnectionError::NetworkError(format!("unexpected <{}>", el.name))
    }
}

fn debug_redirect(el: &Element) {
    if el.get_child("see-other-host").is_some() || el.get_child("redirect").is_some() {
        debug::info("xmpp", "ignoring stream redirect");
    }
}

async fn next_event<S: AsyncRead + Unpin>(
    session: &Session,
    stream: &mut S,
    reader: &mut StanzaReader,
) -> NegResult<StreamEvent> {
    loop {
        match reader.next_event() {
            Ok(Some(event)) => return Ok(event),
            Ok(None) => {}
            Err(e) => {
                return Err(ConnectionError::NetworkError(format!("XML stream error: {e}")));
            }
        }
        let mut buf = [0u8; 4096];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| ConnectionError::NetworkError(e.to_string()))?;
        if n == 0 {
            return Err(ConnectionError::NetworkError("Server closed the connection".into()));
        }
        session.conn.mark_received();
        if let Some(signals) = session.signals() {
            let mut event = RawTextEvent {
                text: String::from_utf8_lossy(&buf[..n]).into_owned(),
            };
            let _ = signals.emit("xmpp-receiving-text", &mut event);
        }
        reader.push(&buf[..n]);
    }
}

async fn read_stanza<S: AsyncRead + Unpin>(
    session: &Session,
    stream: &mut S,
    reader: &mut StanzaReader,
) -> NegResult<Element> {
    match next_event(session, stream, reader).await? {
        StreamEvent::Stanza(el) => Ok(el),
        StreamEvent::Close => Err(ConnectionError::NetworkError("stream closed".into())),
        StreamEvent::Open(_) => Err(ConnectionError::NetworkError("unexpected stream restart".into())),
    }
}

/// Authenticate, bind, start the steady-state loop.
async fn establish<S>(
    session: Rc<Session>,
    mut stream: S,
    mut reader: StanzaReader,
    features: Element,
) -> NegResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    session.set_state(JabberState::Authenticating);

    let mechanisms: Vec<String> = features
        .get_child("mechanisms")
        .map(|m| m.children_named("mechanism").map(|c| c.get_data()).collect())
        .unwrap_or_default();

    let allow_plaintext = session.account.get_bool("auth_plain_in_clear", false);
    let password = session.account.password().unwrap_or_default();

    let features = if !mechanisms.is_empty() {
        sasl_authenticate(&session, &mut stream, &mut reader, &mechanisms, &password, allow_plaintext)
            .await?;
        session.set_state(JabberState::PostAuth);
        reader.reset();
        open_stream(&session, &mut stream, &mut reader).await?
    } else {
        legacy_authenticate(&session, &mut stream, &mut reader, &password, allow_plaintext)
            .await?;
        session.set_state(JabberState::PostAuth);
        features
    };

    if features.get_child("bind").is_some() {
        let id = session.next_id();
        let mut bind_iq = build_iq("set", &id);
        let bind = bind_iq.new_child("bind");
        bind.set_namespace(NS_BIND);
        bind.new_child("resource").insert_data(&session.resource);
        write_all(&mut stream, bind_iq.to_xml().as_bytes()).await?;
        let reply = read_stanza(&session, &mut stream, &mut reader).await?;
        if reply.get_attrib("type") == Some("error") {
            let parsed = parse_stanza_error(&reply);
            return Err(match parsed.map(|p| p.error) {
                Some(StanzaError::Conflict) => ConnectionError::NameInUse,
                _ => ConnectionError::OtherError("resource binding failed".into()),
            });
        }
        if let Some(jid) = reply
            .get_child("bind")
            .and_then(|b| b.get_child("jid"))
            .map(|j| j.get_data())
        {
            session.conn.set_display_name(jid);
        }
    }

    if features.get_child("session").is_some() {
        let id = session.next_id();
        let mut session_iq = build_iq("set", &id);
        session_iq.new_child("session").set_namespace(NS_SESSION);
        write_all(&mut stream, session_iq.to_xml().as_bytes()).await?;
        let _ = read_stanza(&session, &mut stream, &mut reader).await?;
    }

    // Steady state: split the stream, queue writes, pump reads.
    let (read_half, write_half) = tokio::io::split(stream);
    *session.out.borrow_mut() = Some(QueuedOutputStream::new(write_half));

    let roster_ver = {
        let ver = session.account.get_string("roster-ver", "");
        if ver.is_empty() { None } else { Some(ver) }
    };
    session.queue_element(&roster::build_roster_get(
        &session.next_id(),
        roster_ver.as_deref(),
    ));
    session.queue_element(&Element::new_with_ns("presence", NS_CLIENT));

    session.set_state(JabberState::Connected);
    session.conn.set_connected();
    start_inactivity_timer(&session);

    tokio::task::spawn_local(read_loop(session, read_half, reader));
    Ok(())
}

async fn sasl_authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    session: &Session,
    stream: &mut S,
    reader: &mut StanzaReader,
    mechanisms: &[String],
    password: &str,
    allow_plaintext: bool,
) -> NegResult<()> {
    let mut mech = auth::choose_mechanism(
        mechanisms,
        !password.is_empty(),
        session.encrypted.get(),
        allow_plaintext,
    )
    .map_err(map_auth_error)?;

    debug::info("xmpp", &format!("authenticating via {}", mech.name()));
    let user = session.jid.user.clone().unwrap_or_default();
    let initial = mech.start(&user, password);
    let auth_el = auth::build_auth(mech.name(), initial.as_deref());
    write_all(stream, auth_el.to_xml().as_bytes()).await?;

    let result = loop {
        let el = read_stanza(session, stream, reader).await?;
        match el.name.as_str() {
            "challenge" => {
                let payload = auth::decode_payload(&el).map_err(map_auth_error)?;
                match mech.handle_challenge(&payload) {
                    Ok(response) => {
                        write_all(stream, auth::build_response(&response).to_xml().as_bytes())
                            .await?;
                    }
                    Err(e) => break Err(e),
                }
            }
            "success" => break mech.handle_success(),
            "failure" => {
                let condition = auth::failure_condition(&el);
                break Err(mech.handle_failure(&condition));
            }
            "error" => {
                mech.dispose();
                return Err(unexpected_stanza(&el));
            }
            other => {
                debug::warning("xmpp", &format!("ignoring <{other}> during auth"));
            }
        }
    };
    mech.dispose();
    result.map_err(map_auth_error)
}

fn map_auth_error(e: AuthError) -> ConnectionError {
    match e {
        AuthError::NotAuthorized => {
            ConnectionError::AuthenticationFailed("Not authorized".into())
        }
        AuthError::NoMechanism => ConnectionError::AuthenticationImpossible,
        AuthError::Malformed(m) | AuthError::Failed(m) => {
            ConnectionError::AuthenticationFailed(m)
        }
    }
}

async fn legacy_authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    session: &Session,
    stream: &mut S,
    reader: &mut StanzaReader,
    password: &str,
    allow_plaintext: bool,
) -> NegResult<()> {
    if password.is_empty() {
        return Err(ConnectionError::AuthenticationFailed("No password".into()));
    }
    if !session.encrypted.get() && !allow_plaintext {
        return Err(ConnectionError::AuthenticationImpossible);
    }
    debug::info("xmpp", "falling back to legacy jabber:iq:auth");
    let id = session.next_id();
    let user = session.jid.user.clone().unwrap_or_default();
    let iq = auth::build_legacy_auth(&user, password, &session.resource, &id);
    write_all(stream, iq.to_xml().as_bytes()).await?;
    loop {
        let el = read_stanza(session, stream, reader).await?;
        if el.name != "iq" || el.get_attrib("id") != Some(id.as_str()) {
            continue;
        }
        return match el.get_attrib("type") {
            Some("result") => Ok(()),
            _ => Err(ConnectionError::AuthenticationFailed(
                parse_stanza_error(&el)
                    .and_then(|p| p.text)
                    .unwrap_or_else(|| "Authentication failed".into()),
            )),
        };
    }
}

fn start_inactivity_timer(session: &Rc<Session>) {
    let Some(core) = session.core() else {
        return;
    };
    let weak = Rc::downgrade(session);
    let id = core
        .event_loop()
        .schedule_after_seconds(INACTIVITY_SECS, move || {
            let Some(session) = weak.upgrade() else {
                return false;
            };
            if session.closed.get() || !session.conn.is_connected() {
                return false;
            }
            if session.conn.idle_seconds() >= INACTIVITY_SECS {
                debug::misc("xmpp", "sending whitespace keepalive");
                session.queue_raw(b" ");
            }
            true
        });
    session.inactivity_timer.set(Some(id));
}

async fn read_loop<S: AsyncRead + Unpin>(
    session: Rc<Session>,
    mut stream: S,
    mut reader: StanzaReader,
) {
    loop {
        let event = next_event(&session, &mut stream, &mut reader).await;
        if session.closed.get() {
            return;
        }
        match event {
            Ok(StreamEvent::Stanza(el)) => dispatch_stanza(&session, el),
            Ok(StreamEvent::Open(_)) => {
                debug::warning("xmpp", "unexpected mid-session stream restart");
            }
            Ok(StreamEvent::Close) => {
                session
                    .conn
                    .error(ConnectionError::NetworkError("Server closed the stream".into()));
                return;
            }
            Err(e) => {
                session.conn.error(e);
                return;
            }
        }
    }
}

fn dispatch_stanza(session: &Rc<Session>, el: Element) {
    if el.name == "error" {
        debug_redirect(&el);
        session.conn.error(stream_error_to_connection_error(&el));
        return;
    }

    let signal = match el.name.as_str() {
        "message" => Some("xmpp-receiving-message"),
        "iq" => Some("xmpp-receiving-iq"),
        "presence" => Some("xmpp-receiving-presence"),
        _ => None,
    };
    if let (Some(signal), Some(signals)) = (signal, session.signals()) {
        let mut event = StanzaEvent {
            account: session.account.clone(),
            stanza: el.clone(),
        };
        if signals.emit(signal, &mut event).unwrap_or(false) {
            return;
        }
    }

    match el.name.as_str() {
        "message" => handle_message(session, &el),
        "presence" => handle_presence(session, &el),
        "iq" => handle_iq(session, &el),
        other => {
            // One bad or unknown stanza never kills the stream.
            debug::info("xmpp", &format!("ignoring <{other}> stanza"));
        }
    }
}

fn handle_message(session: &Rc<Session>, el: &Element) {
    let Some(core) = session.core() else {
        return;
    };
    let Some(from) = el.get_attrib("from").and_then(Jid::parse) else {
        return;
    };
    let msg_type = el.get_attrib("type").unwrap_or("normal");

    if msg_type == "groupchat" {
        let room = from.bare();
        let Some(id) = core
            .with_conversations(|c| c.find_chat_by_name(&session.account, &room))
            .and_then(|conv| conv.chat_id())
        else {
            return;
        };
        if let Some(subject) = el.get_child("subject") {
            if let Some(conv) = core.with_conversations(|c| c.find_chat(&session.account, id)) {
                conv.set_topic(Some(subject.get_data()));
            }
        }
        if let Some(body) = el.get_child("body") {
            let nick = from.resource.clone().unwrap_or_default();
            core.got_chat_in(&session.conn, id, &nick, &body.get_data());
        }
        return;
    }

    if msg_type == "error" {
        if let Some(parsed) = parse_stanza_error(el) {
            debug::warning(
                "xmpp",
                &format!("message to {} failed: {:?}", from.bare(), parsed.error),
            );
        }
        return;
    }

    // Chat states ride on their own children.
    if let Some(state) = chat_state_of(el) {
        core.got_typing(&session.conn, &from.bare(), state);
    }
    // A buzz usually arrives as a bodyless headline.
    if el.get_child_ns("attention", NS_ATTENTION).is_some() {
        handle_attention(session, &core, &from.bare());
    }
    if let Some(body) = el.get_child("body") {
        core.got_im(&session.conn, &from.bare(), &body.get_data(), 0);
    }
}

/// The peer demanded attention: surface it in their conversation.
fn handle_attention(session: &Rc<Session>, core: &Core, who: &str) {
    let description = core
        .protocols()
        .find(session.account.protocol_id())
        .and_then(|p| p.attention_ops().map(|a| a.types()))
        .and_then(|types| types.into_iter().next())
        .map(|t| t.incoming_description)
        .unwrap_or_else(|| "%s has buzzed you!".to_string());
    let text = description.replace("%s", who);
    debug::info("xmpp", &format!("attention from {who}"));

    let conv = core.with_conversations(|c| c.ensure_im(&session.account, who));
    conv.push_system(text);
    if let Some(msg) = conv.last_message() {
        core.conversation_ui().wrote_message(&conv, &msg);
    }
}

fn chat_state_of(el: &Element) -> Option<TypingState> {
    for child in el.child_elements() {
        if child.namespace() != Some(NS_CHATSTATES) {
            continue;
        }
        return Some(match child.name.as_str() {
            "composing" => TypingState::Typing,
            "paused" => TypingState::Typed,
            _ => TypingState::NotTyping,
        });
    }
    None
}

fn handle_presence(session: &Rc<Session>, el: &Element) {
    let Some(core) = session.core() else {
        return;
    };
    let Some(from) = el.get_attrib("from").and_then(Jid::parse) else {
        return;
    };
    let bare = from.bare();
    let presence_type = el.get_attrib("type").unwrap_or("available");

    // Room presence?
    let nick_in_room = session.rooms.borrow().get(&bare).cloned();
    if let Some(our_nick) = nick_in_room {
        handle_muc_presence(session, &core, &bare, &our_nick, &from, el, presence_type);
        return;
    }

    match presence_type {
        "available" => {
            let primitive = match el.get_child("show").map(|s| s.get_data()).as_deref() {
                Some("away") => StatusPrimitive::Away,
                Some("xa") => StatusPrimitive::ExtendedAway,
                Some("dnd") => StatusPrimitive::DoNotDisturb,
                _ => StatusPrimitive::Available,
            };
            let mut status = Status::new(primitive);
            if let Some(message) = el.get_child("status").map(|s| s.get_data()) {
                if !message.is_empty() {
                    status = status.with_message(message);
                }
            }
            if let Some(full) = el.get_attrib("from") {
                session
                    .resources
                    .borrow_mut()
                    .insert(full.to_string(), media_caps_of(el));
            }
            core.got_buddy_status(&session.account, &bare, status);
        }
        "unavailable" => {
            if let Some(full) = el.get_attrib("from") {
                session.resources.borrow_mut().remove(full);
            }
            // The buddy is offline only when the last resource goes.
            let prefix = format!("{bare}/");
            let any_left = session
                .resources
                .borrow()
                .keys()
                .any(|k| k.starts_with(&prefix) || k == &bare);
            if !any_left {
                core.got_buddy_status(
                    &session.account,
                    &bare,
                    Status::new(StatusPrimitive::Offline),
                );
            }
        }
        "subscribe" => {
            // Auto-answer according to privacy; a richer UI would prompt.
            let reply_type = if core.privacy_check(&session.account, &bare) {
                "subscribed"
            } else {
                "unsubscribed"
            };
            let mut reply = Element::new_with_ns("presence", NS_CLIENT);
            reply.set_attrib("to", &bare);
            reply.set_attrib("type", reply_type);
            session.queue_element(&reply);
        }
        _ => {}
    }
}

/// Legacy Google-style caps advertised in presence.
fn media_caps_of(el: &Element) -> u32 {
    let mut mask = mediacaps::NONE;
    for child in el.child_elements() {
        if child.name == "c" && child.namespace() == Some(NS_CAPS) {
            let ext = child.get_attrib("ext").unwrap_or("");
            if ext.split_whitespace().any(|e| e == "voice-v1") {
                mask |= mediacaps::AUDIO;
            }
            if ext.split_whitespace().any(|e| e == "video-v1") {
                mask |= mediacaps::VIDEO;
            }
        }
    }
    mask
}

#[allow(clippy::too_many_arguments)]
fn handle_muc_presence(
    session: &Rc<Session>,
    core: &Core,
    room: &str,
    our_nick: &str,
    from: &Jid,
    el: &Element,
    presence_type: &str,
) {
    let nick = from.resource.clone().unwrap_or_default();
    let is_self = nick == our_nick
        || el
            .get_child_ns("x", NS_MUC_USER)
            .map(|x| {
                x.children_named("status")
                    .any(|s| s.get_attrib("code") == Some("110"))
            })
            .unwrap_or(false);

    let conv = core.with_conversations(|c| c.find_chat_by_name(&session.account, room));
    match presence_type {
        "available" => {
            let conv = match conv {
                Some(conv) => conv,
                None if is_self => core.got_joined_chat(&session.conn, room, our_nick),
                None => return,
            };
            conv.add_user(&nick, 0);
        }
        "unavailable" => {
            let Some(conv) = conv else {
                return;
            };
            if is_self {
                let id = conv.chat_id().unwrap_or(0);
                session.rooms.borrow_mut().remove(room);
                core.got_chat_left(&session.conn, id);
            } else {
                conv.remove_user(&nick);
            }
        }
        "error" => {
            if let Some(parsed) = parse_stanza_error(el) {
                debug::warning("xmpp", &format!("MUC error in {room}: {:?}", parsed.error));
            }
            if conv.is_none() {
                session.rooms.borrow_mut().remove(room);
            }
        }
        _ => {}
    }
}

fn handle_iq(session: &Rc<Session>, el: &Element) {
    let Some(core) = session.core() else {
        return;
    };
    let iq_type = el.get_attrib("type").unwrap_or("get");
    let id = el.get_attrib("id").unwrap_or("");

    match iq_type {
        "result" => {
            // A pong?
            if let Some(timer) = session.pending_pings.borrow_mut().remove(id) {
                core.event_loop().cancel(timer);
                debug::misc("xmpp", "pong received");
                return;
            }
            let roomlist_pending =
                session.roomlist_iq.borrow().as_deref() == Some(id);
            if roomlist_pending {
                session.roomlist_iq.borrow_mut().take();
                if let Some(query) = el.get_child_ns("query", NS_DISCO_ITEMS) {
                    handle_roomlist_result(session, query);
                } else {
                    emit_roomlist_done(session, false);
                }
                return;
            }
            if let Some(query) = el.get_child_ns("query", NS_ROSTER) {
                roster::apply_roster(&core, &session.account, query);
            }
        }
        "set" => {
            if let Some(query) = el.get_child_ns("query", NS_ROSTER) {
                roster::apply_roster(&core, &session.account, query);
                let mut reply = build_iq("result", id);
                if let Some(from) = el.get_attrib("from") {
                    reply.set_attrib("to", from);
                }
                session.queue_element(&reply);
            }
        }
        "get" => {
            if el.get_child_ns("ping", NS_PING).is_some() {
                let mut reply = build_iq("result", id);
                if let Some(from) = el.get_attrib("from") {
                    reply.set_attrib("to", from);
                }
                session.queue_element(&reply);
            } else {
                // Politely decline features we do not implement.
                let mut reply = build_iq("error", id);
                if let Some(from) = el.get_attrib("from") {
                    reply.set_attrib("to", from);
                }
                let error = reply.new_child("error");
                error.set_attrib("type", "cancel");
                error
                    .new_child("service-unavailable")
                    .set_namespace(NS_STANZA_ERR);
                session.queue_element(&reply);
            }
        }
        "error" => {
            if let Some(timer) = session.pending_pings.borrow_mut().remove(id) {
                core.event_loop().cancel(timer);
            }
            let roomlist_pending =
                session.roomlist_iq.borrow().as_deref() == Some(id);
            if roomlist_pending {
                session.roomlist_iq.borrow_mut().take();
                emit_roomlist_done(session, true);
            }
            if let Some(parsed) = parse_stanza_error(el) {
                debug::info("xmpp", &format!("iq {id} failed: {:?}", parsed.error));
            }
        }
        _ => {}
    }
}

// Capability implementations -----------------------------------------------

impl ServerOps for XmppProtocol {
    fn set_status(&self, account: &Account, status: &Status) {
        let Some(conn) = account.connection() else {
            return;
        };
        let Some(session) = Self::session(&conn) else {
            return;
        };
        let mut presence = Element::new_with_ns("presence", NS_CLIENT);
        match status.primitive {
            StatusPrimitive::Offline => {
                presence.set_attrib("type", "unavailable");
            }
            StatusPrimitive::Invisible => {
                presence.set_attrib("type", "invisible");
            }
            StatusPrimitive::Away => {
                presence.new_child("show").insert_data("away");
            }
            StatusPrimitive::ExtendedAway => {
                presence.new_child("show").insert_data("xa");
            }
            StatusPrimitive::DoNotDisturb => {
                presence.new_child("show").insert_data("dnd");
            }
            _ => {}
        }
        if let Some(message) = status.message() {
            presence.new_child("status").insert_data(message);
        }
        session.queue_element(&presence);
    }

    fn add_buddy(&self, gc: &Connection, buddy: &crate::account::Buddy, group: &str) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let iq = roster::build_roster_set(
            &session.next_id(),
            buddy.name(),
            buddy.local_alias().as_deref(),
            &[group],
        );
        session.queue_element(&iq);
        let mut subscribe = Element::new_with_ns("presence", NS_CLIENT);
        subscribe.set_attrib("to", buddy.name());
        subscribe.set_attrib("type", "subscribe");
        session.queue_element(&subscribe);
    }

    fn remove_buddy(&self, gc: &Connection, buddy: &crate::account::Buddy, _group: &str) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let mut iq = build_iq("set", &session.next_id());
        let query = iq.new_child("query");
        query.set_namespace(NS_ROSTER);
        let item = query.new_child("item");
        item.set_attrib("jid", buddy.name());
        item.set_attrib("subscription", "remove");
        session.queue_element(&iq);
    }

    fn alias_buddy(&self, gc: &Connection, who: &str, alias: Option<&str>) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let Some(core) = session.core() else {
            return;
        };
        let groups = core.with_blist(|b| {
            b.find_buddy(&session.account, who)
                .map(|buddy| {
                    b.groups_of(&buddy)
                        .into_iter()
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        });
        let group_refs: Vec<&str> = groups.iter().map(String::as_str).collect();
        let iq = roster::build_roster_set(&session.next_id(), who, alias, &group_refs);
        session.queue_element(&iq);
    }

    fn group_buddy(&self, gc: &Connection, who: &str, _old: &str, new: &str) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let iq = roster::build_roster_set(&session.next_id(), who, None, &[new]);
        session.queue_element(&iq);
    }

    fn keepalive(&self, gc: &Connection) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        if gc.idle_seconds() < PING_IDLE_SECS {
            return;
        }
        let Some(core) = session.core() else {
            return;
        };
        let id = session.next_id();
        let mut ping = build_iq("get", &id);
        ping.set_attrib("to", &session.jid.domain);
        ping.new_child("ping").set_namespace(NS_PING);
        session.queue_element(&ping);

        let conn = gc.clone();
        let ping_id = id.clone();
        let weak = Rc::downgrade(&session);
        let timer = core
            .event_loop()
            .schedule_after_seconds(PING_FAULT_SECS, move || {
                if let Some(session) = weak.upgrade() {
                    if session.pending_pings.borrow_mut().remove(&ping_id).is_some() {
                        conn.error(ConnectionError::NetworkError(
                            "Ping timeout".into(),
                        ));
                    }
                }
                false
            });
        session.pending_pings.borrow_mut().insert(id, timer);
    }

    fn keepalive_interval(&self) -> Option<u64> {
        Some(PING_IDLE_SECS)
    }

    fn send_raw(&self, gc: &Connection, buf: &[u8]) -> i32 {
        let Some(session) = Self::session(gc) else {
            return -(libc::ENOTCONN);
        };
        session.queue_raw(buf);
        buf.len() as i32
    }
}

impl ImOps for XmppProtocol {
    fn send(&self, gc: &Connection, who: &str, message: &str, _flags: u32) -> i32 {
        let Some(session) = Self::session(gc) else {
            return -(libc::ENOTCONN);
        };
        let mut el = build_message(who, "chat", message);
        el.new_child("active").set_namespace(NS_CHATSTATES);
        session.queue_element(&el);
        message.len() as i32
    }

    fn send_typing(&self, gc: &Connection, who: &str, state: TypingState) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let mut el = Element::new_with_ns("message", NS_CLIENT);
        el.set_attrib("to", who);
        el.set_attrib("type", "chat");
        let state_name = match state {
            TypingState::Typing => "composing",
            TypingState::Typed => "paused",
            TypingState::NotTyping => "active",
        };
        el.new_child(state_name).set_namespace(NS_CHATSTATES);
        session.queue_element(&el);
    }
}

impl ChatOps for XmppProtocol {
    fn info(&self) -> Vec<ChatField> {
        vec![
            ChatField { id: "room".into(), label: "Room".into(), required: true, secret: false },
            ChatField { id: "server".into(), label: "Server".into(), required: true, secret: false },
            ChatField { id: "handle".into(), label: "Handle".into(), required: true, secret: false },
            ChatField {
                id: "password".into(),
                label: "Password".into(),
                required: false,
                secret: true,
            },
        ]
    }

    fn info_defaults(&self, gc: &Connection, room: &str) -> HashMap<String, String> {
        let mut defaults = HashMap::new();
        if let Some((room_part, server)) = room.split_once('@') {
            defaults.insert("room".into(), room_part.to_string());
            defaults.insert("server".into(), server.to_string());
        } else {
            defaults.insert("room".into(), room.to_string());
        }
        if let Some(session) = Self::session(gc) {
            let nick = session.jid.user.clone().unwrap_or_default();
            defaults.insert("handle".into(), nick);
        }
        defaults
    }

    fn join(&self, gc: &Connection, components: &HashMap<String, String>) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let (Some(room), Some(server), Some(handle)) = (
            components.get("room"),
            components.get("server"),
            components.get("handle"),
        ) else {
            debug::error("xmpp", "chat join missing room/server/handle");
            return;
        };
        let room_jid = format!("{room}@{server}");
        session
            .rooms
            .borrow_mut()
            .insert(room_jid.clone(), handle.clone());

        let mut presence = Element::new_with_ns("presence", NS_CLIENT);
        presence.set_attrib("to", format!("{room_jid}/{handle}"));
        let x = presence.new_child("x");
        x.set_namespace(NS_MUC);
        if let Some(password) = components.get("password").filter(|p| !p.is_empty()) {
            x.new_child("password").insert_data(password);
        }
        session.queue_element(&presence);
    }

    fn leave(&self, gc: &Connection, id: i32) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let Some(core) = session.core() else {
            return;
        };
        let Some(conv) = core.with_conversations(|c| c.find_chat(&session.account, id)) else {
            return;
        };
        let nick = conv.chat_nick().unwrap_or_default();
        let mut presence = Element::new_with_ns("presence", NS_CLIENT);
        presence.set_attrib("to", format!("{}/{nick}", conv.name()));
        presence.set_attrib("type", "unavailable");
        session.queue_element(&presence);
    }

    fn send(&self, gc: &Connection, id: i32, message: &str, _flags: u32) -> i32 {
        let Some(session) = Self::session(gc) else {
            return -(libc::ENOTCONN);
        };
        let Some(core) = session.core() else {
            return -(libc::ENOTCONN);
        };
        let Some(conv) = core.with_conversations(|c| c.find_chat(&session.account, id)) else {
            return -(libc::EINVAL);
        };
        let el = build_message(conv.name(), "groupchat", message);
        session.queue_element(&el);
        message.len() as i32
    }

    fn invite(&self, gc: &Connection, id: i32, who: &str, message: &str) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let Some(core) = session.core() else {
            return;
        };
        let Some(conv) = core.with_conversations(|c| c.find_chat(&session.account, id)) else {
            return;
        };
        let mut el = Element::new_with_ns("message", NS_CLIENT);
        el.set_attrib("to", conv.name());
        let x = el.new_child("x");
        x.set_namespace(NS_MUC_USER);
        let invite = x.new_child("invite");
        invite.set_attrib("to", who);
        if !message.is_empty() {
            invite.new_child("reason").insert_data(message);
        }
        session.queue_element(&el);
    }

    fn set_topic(&self, gc: &Connection, id: i32, topic: &str) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let Some(core) = session.core() else {
            return;
        };
        let Some(conv) = core.with_conversations(|c| c.find_chat(&session.account, id)) else {
            return;
        };
        let mut el = Element::new_with_ns("message", NS_CLIENT);
        el.set_attrib("to", conv.name());
        el.set_attrib("type", "groupchat");
        el.new_child("subject").insert_data(topic);
        session.queue_element(&el);
    }

    fn get_name(&self, components: &HashMap<String, String>) -> Option<String> {
        Some(format!(
            "{}@{}",
            components.get("room")?,
            components.get("server")?
        ))
    }
}

impl XferOps for XmppProtocol {
    fn can_receive(&self, gc: &Connection, who: &str) -> bool {
        let Some(session) = Self::session(gc) else {
            return false;
        };
        // We can offer a file only to someone with a live resource.
        let prefix = format!("{who}/");
        session
            .resources
            .borrow()
            .keys()
            .any(|k| k.starts_with(&prefix) || k == who)
    }

    fn new_xfer(&self, gc: &Connection, who: &str) -> Option<Xfer> {
        let session = Self::session(gc)?;
        let core = session.core()?;
        let xfer = core.new_xfer(&session.account, XferDirection::Send, who);
        let init_session = Rc::downgrade(&session);
        let cancel_session = Rc::downgrade(&session);
        let peer = who.to_string();
        let cancel_peer = peer.clone();
        xfer.set_hooks(XferHooks {
            init: Some(Box::new(move |xfer: &Xfer| {
                let Some(session) = init_session.upgrade() else {
                    return;
                };
                let mut iq = build_iq("set", &session.next_id());
                iq.set_attrib("to", &peer);
                let si = iq.new_child("si");
                si.set_namespace("http://jabber.org/protocol/si");
                si.set_attrib("profile", "http://jabber.org/protocol/si/profile/file-transfer");
                let file = si.new_child("file");
                file.set_namespace("http://jabber.org/protocol/si/profile/file-transfer");
                if let Some(name) = xfer.remote_filename() {
                    file.set_attrib("name", name);
                }
                file.set_attrib("size", xfer.size().to_string());
                session.queue_element(&iq);
            })),
            cancel_send: Some(Box::new(move |_xfer: &Xfer| {
                if cancel_session.upgrade().is_some() {
                    debug::info("xmpp", &format!("cancelling transfer to {cancel_peer}"));
                }
            })),
            ..Default::default()
        });
        Some(xfer)
    }

    fn send_file(&self, gc: &Connection, who: &str, filename: Option<&str>) {
        if let Some(xfer) = self.new_xfer(gc, who) {
            if let Some(filename) = filename {
                xfer.set_local_filename(filename);
            }
            xfer.request();
        }
    }
}

impl MediaOps for XmppProtocol {
    fn get_caps(&self, account: &Account, who: &str) -> u32 {
        let Some(conn) = account.connection() else {
            return mediacaps::NONE;
        };
        let Some(session) = Self::session(&conn) else {
            return mediacaps::NONE;
        };
        let prefix = format!("{who}/");
        let mut mask = mediacaps::NONE;
        for (jid, caps) in session.resources.borrow().iter() {
            if jid.starts_with(&prefix) || jid == who {
                mask |= caps;
            }
        }
        if mask & mediacaps::AUDIO_VIDEO != 0 {
            mask |= mediacaps::MODIFY_SESSION;
        }
        mask
    }

    fn initiate(&self, account: &Account, who: &str, media_type: u32) -> bool {
        debug::info(
            "xmpp",
            &format!("media initiate to {who} (type {media_type:#x}) requested"),
        );
        let _ = account;
        // Session negotiation belongs to an external media stack; the core
        // only reports that the attempt is possible.
        true
    }
}

impl AttentionOps for XmppProtocol {
    fn types(&self) -> Vec<AttentionType> {
        vec![AttentionType {
            id: "buzz".into(),
            name: "Buzz".into(),
            incoming_description: "%s has buzzed you!".into(),
        }]
    }

    fn send_attention(&self, gc: &Connection, who: &str, _type_id: &str) -> bool {
        let Some(session) = Self::session(gc) else {
            return false;
        };
        let mut el = Element::new_with_ns("message", NS_CLIENT);
        el.set_attrib("to", who);
        el.set_attrib("type", "headline");
        el.new_child("attention").set_namespace(NS_ATTENTION);
        session.queue_element(&el);
        true
    }
}

impl RoomlistOps for XmppProtocol {
    fn get_list(&self, gc: &Connection) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        if session.roomlist_iq.borrow().is_some() {
            // A fetch is already running.
            return;
        }
        let service = {
            let configured = session.account.get_string("conference_server", "");
            if configured.is_empty() {
                format!("conference.{}", session.jid.domain)
            } else {
                configured
            }
        };
        let id = session.next_id();
        let mut iq = build_iq("get", &id);
        iq.set_attrib("to", &service);
        iq.new_child("query").set_namespace(NS_DISCO_ITEMS);
        *session.roomlist_iq.borrow_mut() = Some(id);
        debug::info("xmpp", &format!("fetching room list from {service}"));
        session.queue_element(&iq);
    }

    fn cancel(&self, gc: &Connection) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        if session.roomlist_iq.borrow_mut().take().is_some() {
            emit_roomlist_done(&session, true);
        }
    }

    fn in_progress(&self, gc: &Connection) -> bool {
        Self::session(gc).is_some_and(|s| s.roomlist_iq.borrow().is_some())
    }
}

/// Parse `disco#items` children into rooms.
fn parse_disco_rooms(query: &Element) -> Vec<crate::protocol::Room> {
    query
        .children_named("item")
        .filter_map(|item| {
            let jid = item.get_attrib("jid")?;
            Some(crate::protocol::Room {
                name: jid.to_string(),
                description: item.get_attrib("name").map(str::to_string),
                user_count: None,
            })
        })
        .collect()
}

fn handle_roomlist_result(session: &Rc<Session>, query: &Element) {
    let Some(signals) = session.signals() else {
        return;
    };
    let rooms = parse_disco_rooms(query);
    debug::info("xmpp", &format!("room list has {} entries", rooms.len()));
    for room in rooms {
        let mut event = crate::protocol::RoomlistRoomEvent {
            account: session.account.clone(),
            room,
        };
        let _ = signals.emit("roomlist-room-add", &mut event);
    }
    emit_roomlist_done(session, false);
}

fn emit_roomlist_done(session: &Rc<Session>, cancelled: bool) {
    if let Some(signals) = session.signals() {
        let mut event = crate::protocol::RoomlistDoneEvent {
            account: session.account.clone(),
            cancelled,
        };
        let _ = signals.emit("roomlist-done", &mut event);
    }
}

// URI handling ---------------------------------------------------------------

/// What an `xmpp:` URI asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriAction {
    /// Open (and optionally prefill) a conversation.
    Message { jid: String, body: Option<String> },
    /// Add to the roster.
    Roster { jid: String },
    /// Join a chat room.
    Join { room: String },
}

/// Parse an `xmpp:` URI: `xmpp:user@host?body=…`, `?roster`, `?join`, with
/// an optional `account=` selector.
pub fn parse_uri(uri: &str) -> Option<(UriAction, Option<String>)> {
    let rest = uri.strip_prefix("xmpp:")?;
    let (target, query) = match rest.split_once('?') {
        Some((t, q)) => (t, Some(q)),
        None => (rest, None),
    };
    let target = crate::util::url_decode(target);
    if target.is_empty() {
        return None;
    }

    let mut account = None;
    let mut body = None;
    let mut action_word = None;
    if let Some(query) = query {
        for (i, part) in query.split([';', '&']).enumerate() {
            match part.split_once('=') {
                Some(("account", v)) => account = Some(crate::util::url_decode(v)),
                Some(("body", v)) => body = Some(crate::util::url_decode(v)),
                Some(_) => {}
                None if i == 0 && !part.is_empty() => action_word = Some(part),
                None => {}
            }
        }
    }

    let action = match action_word {
        Some("roster") => UriAction::Roster { jid: target },
        Some("join") => UriAction::Join { room: target },
        _ => UriAction::Message { jid: target, body },
    };
    Some((action, account))
}

/// Dispatch an `xmpp:` URI against the selected (or first connected) XMPP
/// account.
pub fn handle_uri(core: &Core, uri: &str) -> bool {
    let Some((action, account_sel)) = parse_uri(uri) else {
        return false;
    };
    let account = match account_sel {
        Some(username) => core.find_account("xmpp", &username),
        None => core.first_connected_account("xmpp"),
    };
    let Some(account) = account.filter(|a| a.is_connected()) else {
        debug::warning("xmpp", "no connected account for URI");
        return false;
    };

    match action {
        UriAction::Message { jid, body } => {
            core.with_conversations(|c| c.ensure_im(&account, &jid));
            if let Some(body) = body {
                core.send_im(&account, &jid, &body);
            }
            true
        }
        UriAction::Roster { jid } => {
            core.add_buddy(&account, &jid, "Buddies");
            true
        }
        UriAction::Join { room } => {
            let Some(conn) = account.connection() else {
                return false;
            };
            let Some(protocol) = core.protocols().find("xmpp") else {
                return false;
            };
            let Some(chat) = protocol.chat_ops() else {
                return false;
            };
            let components = chat.info_defaults(&conn, &room);
            chat.join(&conn, &components);
            true
        }
    }
}
