//! IRC.
//!
//! A line protocol: connect, optionally `PASS`, then `USER`/`NICK`, then
//! dispatch inbound lines by command through a table. Buddy presence rides
//! on batched `ISON` polls (each request line capped at
//! [`ISON_LINE_MAX`] bytes of names, one batch outstanding at a time); the
//! first reply seeds presence silently so sign-on floods don't greet every
//! login. A `PING` keepalive goes out after [`PING_IDLE_SECS`] of quiet.

mod parse;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tokio::io::{AsyncRead, AsyncReadExt};

use self::parse::{IrcMsg, ctcp_action, is_channel, parse_line};
use crate::account::{Account, Status, StatusPrimitive, StatusType};
use crate::core::{Core, CoreInner};
use crate::debug;
use crate::eventloop::SourceId;
use crate::net::{QueuedOutputStream, TlsSession};
use crate::protocol::{
    AccountOption, ChatField, ChatOps, ImOps, Protocol, ServerOps,
    connection::Connection, connection::ConnectionError, connflags,
};
use crate::signals::SignalBus;
use crate::util::text::salvage_utf8;

pub const DEFAULT_PORT: u16 = 6667;
pub const DEFAULT_TLS_PORT: u16 = 6697;
/// Cap on the name payload of a single `ISON` line.
pub const ISON_LINE_MAX: usize = 450;
/// Rebuild the ISON poll this often.
pub const BLIST_INTERVAL_SECS: u64 = 60;
/// Send `PING` after this much inbound silence.
pub const PING_IDLE_SECS: u64 = 60;

struct IrcBuddy {
    online: bool,
    /// Seen in the reply to the current ISON batch.
    seen: bool,
}

struct Session {
    core: Weak<CoreInner>,
    conn: Connection,
    account: Account,
    nick: RefCell<String>,
    out: RefCell<Option<QueuedOutputStream>>,
    /// Lowercased nick → presence bookkeeping.
    buddies: RefCell<HashMap<String, IrcBuddy>>,
    /// ISON request lines waiting their turn; one in flight at a time.
    ison_queue: RefCell<Vec<String>>,
    ison_in_flight: Cell<bool>,
    /// The first ISON round seeds presence without sign-on events.
    bootstrap_done: Cell<bool>,
    blist_timer: Cell<Option<SourceId>>,
    closed: Cell<bool>,
}

impl Session {
    fn core(&self) -> Option<Core> {
        self.core.upgrade().map(Core::from_inner)
    }

    fn send_line(&self, line: &str) {
        let mut event = RawLineEvent { line: line.to_string() };
        if let Some(core) = self.core() {
            let _ = core.signals().emit("irc-sending-text", &mut event);
        }
        if let Some(out) = self.out.borrow().as_ref() {
            let mut framed = event.line;
            framed.push_str("\r\n");
            if let Err(e) = out.queue(framed.into_bytes()) {
                debug::error("irc", &format!("write failed: {e}"));
                self.conn.error(ConnectionError::NetworkError(e.to_string()));
            }
        }
    }
}

/// A raw IRC line crossing the wire, mutable by plugins.
pub struct RawLineEvent {
    pub line: String,
}

/// The IRC protocol implementation.
#[derive(Default)]
pub struct IrcProtocol {
    tls: TlsSession,
}

impl IrcProtocol {
    pub fn new() -> IrcProtocol {
        Self::default()
    }

    fn session(conn: &Connection) -> Option<Rc<Session>> {
        conn.with_proto_data::<Rc<Session>, _>(Rc::clone)
    }
}

fn register_protocol_signals(bus: &SignalBus) {
    let _ = bus.register::<RawLineEvent>("irc-sending-text");
    let _ = bus.register::<RawLineEvent>("irc-receiving-text");
}

/// Split a buddy list into ISON request lines, each under the byte cap.
fn build_ison_batches(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    for name in names {
        if !current.is_empty() && current.len() + name.len() + 1 > ISON_LINE_MAX {
            batches.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&name);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

impl Protocol for IrcProtocol {
    fn id(&self) -> &str {
        "irc"
    }

    fn name(&self) -> &str {
        "IRC"
    }

    fn list_icon(&self, _account: Option<&Account>) -> &str {
        "irc"
    }

    fn account_options(&self) -> Vec<AccountOption> {
        vec![
            AccountOption::int("port", "Port", DEFAULT_PORT as i64),
            AccountOption::bool("ssl", "Use TLS", false),
            AccountOption::string("realname", "Real name", ""),
            AccountOption::string("username", "Ident name", ""),
        ]
    }

    fn user_splits(&self) -> Vec<crate::protocol::UserSplit> {
        vec![crate::protocol::UserSplit {
            label: "Server".into(),
            separator: '@',
            default: "irc.libera.chat".into(),
        }]
    }

    fn status_types(&self, _account: &Account) -> Vec<StatusType> {
        vec![
            StatusType::new(StatusPrimitive::Available, "available", "Available"),
            StatusType::new(StatusPrimitive::Away, "away", "Away"),
            StatusType::new(StatusPrimitive::Offline, "offline", "Offline")
                .with_user_settable(false),
        ]
    }

    fn login(&self, core: &Core, connection: &Connection) {
        let Some(account) = connection.account() else {
            return;
        };
        register_protocol_signals(core.signals());
        connection.set_flags(connflags::NO_NEWLINES | connflags::AUTO_RESPONDER);

        let (nick, server) = match account.username().split_once('@') {
            Some((n, s)) => (n.to_string(), s.to_string()),
            None => {
                connection.error(ConnectionError::InvalidUsername);
                return;
            }
        };

        let session = Rc::new(Session {
            core: core.downgrade(),
            conn: connection.clone(),
            account: account.clone(),
            nick: RefCell::new(nick),
            out: RefCell::new(None),
            buddies: RefCell::new(HashMap::new()),
            ison_queue: RefCell::new(Vec::new()),
            ison_in_flight: Cell::new(false),
            bootstrap_done: Cell::new(false),
            blist_timer: Cell::new(None),
            closed: Cell::new(false),
        });
        connection.set_proto_data(Box::new(Rc::clone(&session)));

        let tls = self.tls.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = login_task(Rc::clone(&session), tls, server).await {
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
        session.send_line("QUIT :leaving");
        session.closed.set(true);
        if let Some(out) = session.out.borrow_mut().take() {
            tokio::task::spawn_local(async move {
                let _ = out.graceful_close().await;
            });
        }
        if let Some(core) = session.core() {
            if let Some(id) = session.blist_timer.take() {
                core.event_loop().cancel(id);
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
}

async fn login_task(
    session: Rc<Session>,
    tls: TlsSession,
    server: String,
) -> Result<(), ConnectionError> {
    let Some(core) = session.core() else {
        return Err(ConnectionError::OtherError("core is gone".into()));
    };
    let account = &session.account;
    let use_tls = account.get_bool("ssl", false);
    let default_port = if use_tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
    let port = account.get_int("port", default_port as i64) as u16;

    session.conn.update_progress("Connecting", 1, 2);
    let tcp = core
        .connector()
        .connect(&server, port)
        .await
        .map_err(ConnectionError::from)?;

    if use_tls {
        let stream = crate::net::handshake(&tls, tcp, &server)
            .await
            .map_err(|e| ConnectionError::from(crate::net::Error::Tls(e)))?;
        start_session(session, stream).await
    } else {
        start_session(session, tcp).await
    }
}

async fn start_session<S>(session: Rc<Session>, stream: S) -> Result<(), ConnectionError>
where
    S: AsyncRead + tokio::io::AsyncWrite + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    *session.out.borrow_mut() = Some(QueuedOutputStream::new(write_half));

    let account = &session.account;
    session.conn.update_progress("Registering", 2, 2);
    if let Some(password) = account.password().filter(|p| !p.is_empty()) {
        session.send_line(&format!("PASS {password}"));
    }
    let ident = {
        let configured = account.get_string("username", "");
        if configured.is_empty() { session.nick.borrow().clone() } else { configured }
    };
    let realname = {
        let configured = account.get_string("realname", "");
        if configured.is_empty() { ident.clone() } else { configured }
    };
    session.send_line(&format!("USER {ident} * * :{realname}"));
    session.send_line(&format!("NICK {}", session.nick.borrow()));

    tokio::task::spawn_local(read_loop(session, read_half));
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(session: Rc<Session>, mut stream: R) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => {
                if !session.closed.get() {
                    session
                        .conn
                        .error(ConnectionError::NetworkError("Server closed the connection".into()));
                }
                return;
            }
            Ok(n) => n,
            Err(e) => {
                if !session.closed.get() {
                    session.conn.error(ConnectionError::NetworkError(e.to_string()));
                }
                return;
            }
        };
        if session.closed.get() {
            return;
        }
        session.conn.mark_received();
        buf.extend_from_slice(&chunk[..n]);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
            let line = salvage_utf8(&line_bytes);
            if let Some(core) = session.core() {
                let mut event = RawLineEvent { line: line.clone() };
                let _ = core.signals().emit("irc-receiving-text", &mut event);
            }
            if let Some(msg) = parse_line(&line) {
                dispatch(&session, msg);
            }
            if session.closed.get() {
                return;
            }
        }
    }
}

fn dispatch(session: &Rc<Session>, msg: IrcMsg) {
    match msg.command.as_str() {
        "001" => handle_welcome(session, &msg),
        "303" => handle_ison_reply(session, &msg),
        "332" => handle_topic_numeric(session, &msg),
        "353" => handle_names(session, &msg),
        "433" => {
            if !session.conn.is_connected() {
                session.conn.error(ConnectionError::NameInUse);
            }
        }
        "464" => {
            session.account.purge_unsaved_password();
            session
                .conn
                .error(ConnectionError::AuthenticationFailed("Password incorrect".into()));
        }
        "PING" => session.send_line(&format!("PONG :{}", msg.param(0))),
        "PONG" => {}
        "PRIVMSG" => handle_privmsg(session, &msg),
        "NOTICE" => handle_notice(session, &msg),
        "JOIN" => handle_join(session, &msg),
        "PART" => handle_part(session, &msg),
        "KICK" => handle_kick(session, &msg),
        "QUIT" => handle_quit(session, &msg),
        "NICK" => handle_nick(session, &msg),
        "TOPIC" => handle_topic(session, &msg),
        "ERROR" => {
            if !session.closed.get() {
                session
                    .conn
                    .error(ConnectionError::NetworkError(msg.param(0).to_string()));
            }
        }
        _ => {
            debug::misc("irc", &format!("unhandled command {}", msg.command));
        }
    }
}

fn handle_welcome(session: &Rc<Session>, msg: &IrcMsg) {
    // The server tells us our accepted nick in the 001 target.
    if !msg.param(0).is_empty() {
        *session.nick.borrow_mut() = msg.param(0).to_string();
    }
    session.conn.set_display_name(msg.param(0));
    session.conn.set_connected();
    seed_buddies(session);
    schedule_blist_poll(session);
    run_ison_round(session);
}

fn seed_buddies(session: &Rc<Session>) {
    let Some(core) = session.core() else {
        return;
    };
    let mut buddies = session.buddies.borrow_mut();
    for buddy in core.with_blist(|b| b.account_buddies(&session.account)) {
        buddies.insert(
            buddy.name().to_lowercase(),
            IrcBuddy { online: false, seen: false },
        );
    }
}

fn schedule_blist_poll(session: &Rc<Session>) {
    let Some(core) = session.core() else {
        return;
    };
    let weak = Rc::downgrade(session);
    let id = core
        .event_loop()
        .schedule_after_seconds(BLIST_INTERVAL_SECS, move || {
            let Some(session) = weak.upgrade() else {
                return false;
            };
            if session.closed.get() || !session.conn.is_connected() {
                return false;
            }
            run_ison_round(&session);
            true
        });
    session.blist_timer.set(Some(id));
}

/// Build this round's ISON batches and dispatch the first.
fn run_ison_round(session: &Rc<Session>) {
    if session.ison_in_flight.get() || !session.ison_queue.borrow().is_empty() {
        // The previous round is still draining.
        return;
    }
    let batches = build_ison_batches(session.buddies.borrow().keys().cloned());
    if batches.is_empty() {
        return;
    }
    for buddy in session.buddies.borrow_mut().values_mut() {
        buddy.seen = false;
    }
    *session.ison_queue.borrow_mut() = batches;
    dispatch_next_ison(session);
}

fn dispatch_next_ison(session: &Rc<Session>) {
    let next = {
        let mut queue = session.ison_queue.borrow_mut();
        if queue.is_empty() { None } else { Some(queue.remove(0)) }
    };
    match next {
        Some(batch) => {
            session.ison_in_flight.set(true);
            session.send_line(&format!("ISON :{batch}"));
        }
        None => {
            // Round complete: anyone unseen has signed off.
            finish_ison_round(session);
        }
    }
}

fn handle_ison_reply(session: &Rc<Session>, msg: &IrcMsg) {
    {
        let mut buddies = session.buddies.borrow_mut();
        for nick in msg.param(1).split_whitespace() {
            if let Some(buddy) = buddies.get_mut(&nick.to_lowercase()) {
                buddy.seen = true;
            }
        }
    }
    session.ison_in_flight.set(false);
    dispatch_next_ison(session);
}

fn finish_ison_round(session: &Rc<Session>) {
    let Some(core) = session.core() else {
        return;
    };
    let bootstrap = !session.bootstrap_done.get();
    session.bootstrap_done.set(true);

    let mut changes: Vec<(String, bool)> = Vec::new();
    {
        let mut buddies = session.buddies.borrow_mut();
        for (nick, buddy) in buddies.iter_mut() {
            if buddy.seen != buddy.online {
                buddy.online = buddy.seen;
                changes.push((nick.clone(), buddy.online));
            }
        }
    }

    for (nick, online) in changes {
        let primitive = if online { StatusPrimitive::Available } else { StatusPrimitive::Offline };
        if bootstrap {
            // Presence bootstrap: no sign-on notices for the initial state.
            if let Some(buddy) = core.with_blist(|b| b.find_buddy(&session.account, &nick)) {
                buddy.with_presence_mut(|p| p.set_status(Status::new(primitive)));
            }
        } else {
            core.got_buddy_status(&session.account, &nick, Status::new(primitive));
        }
    }
}

fn handle_privmsg(session: &Rc<Session>, msg: &IrcMsg) {
    let Some(core) = session.core() else {
        return;
    };
    let Some(nick) = msg.nick() else {
        return;
    };
    let target = msg.param(0);
    let body = msg.param(1);
    let body = match ctcp_action(body) {
        Some(action) => format!("/me {action}"),
        None => body.to_string(),
    };

    if is_channel(target) {
        let Some(conv) =
            core.with_conversations(|c| c.find_chat_by_name(&session.account, target))
        else {
            return;
        };
        if let Some(id) = conv.chat_id() {
            core.got_chat_in(&session.conn, id, nick, &body);
        }
    } else {
        core.got_im(&session.conn, nick, &body, 0);
    }
}

fn handle_notice(session: &Rc<Session>, msg: &IrcMsg) {
    let Some(core) = session.core() else {
        return;
    };
    if let Some(nick) = msg.nick() {
        core.got_im(
            &session.conn,
            nick,
            msg.param(1),
            crate::conversation::flags::NOTIFY,
        );
    }
}

fn handle_join(session: &Rc<Session>, msg: &IrcMsg) {
    let Some(core) = session.core() else {
        return;
    };
    let Some(nick) = msg.nick() else {
        return;
    };
    let channel = msg.param(0);
    if nick.eq_ignore_ascii_case(&session.nick.borrow()) {
        core.got_joined_chat(&session.conn, channel, &session.nick.borrow());
        return;
    }
    if let Some(conv) = core.with_conversations(|c| c.find_chat_by_name(&session.account, channel))
    {
        conv.add_user(nick, 0);
    }
}

fn handle_part(session: &Rc<Session>, msg: &IrcMsg) {
    let Some(core) = session.core() else {
        return;
    };
    let Some(nick) = msg.nick() else {
        return;
    };
    let channel = msg.param(0);
    let Some(conv) = core.with_conversations(|c| c.find_chat_by_name(&session.account, channel))
    else {
        return;
    };
    if nick.eq_ignore_ascii_case(&session.nick.borrow()) {
        if let Some(id) = conv.chat_id() {
            core.got_chat_left(&session.conn, id);
        }
    } else {
        conv.remove_user(nick);
    }
}

fn handle_kick(session: &Rc<Session>, msg: &IrcMsg) {
    let Some(core) = session.core() else {
        return;
    };
    let channel = msg.param(0);
    let victim = msg.param(1);
    let Some(conv) = core.with_conversations(|c| c.find_chat_by_name(&session.account, channel))
    else {
        return;
    };
    if victim.eq_ignore_ascii_case(&session.nick.borrow()) {
        conv.push_system(format!("You have been kicked from {channel}"));
        if let Some(id) = conv.chat_id() {
            core.got_chat_left(&session.conn, id);
        }
    } else {
        conv.remove_user(victim);
    }
}

fn handle_quit(session: &Rc<Session>, msg: &IrcMsg) {
    let Some(core) = session.core() else {
        return;
    };
    let Some(nick) = msg.nick() else {
        return;
    };
    core.with_conversations(|c| {
        for conv in c.iter().filter(|c| c.is_chat()) {
            conv.remove_user(nick);
        }
    });
}

fn handle_nick(session: &Rc<Session>, msg: &IrcMsg) {
    let Some(core) = session.core() else {
        return;
    };
    let Some(old) = msg.nick() else {
        return;
    };
    let new = msg.param(0);
    if old.eq_ignore_ascii_case(&session.nick.borrow()) {
        *session.nick.borrow_mut() = new.to_string();
        session.conn.set_display_name(new);
    }
    core.with_conversations(|c| {
        for conv in c.iter().filter(|c| c.is_chat()) {
            conv.rename_user(old, new);
        }
    });
}

fn handle_topic_numeric(session: &Rc<Session>, msg: &IrcMsg) {
    set_channel_topic(session, msg.param(1), msg.param(2));
}

fn handle_topic(session: &Rc<Session>, msg: &IrcMsg) {
    set_channel_topic(session, msg.param(0), msg.param(1));
}

fn set_channel_topic(session: &Rc<Session>, channel: &str, topic: &str) {
    if let Some(core) = session.core() {
        if let Some(conv) =
            core.with_conversations(|c| c.find_chat_by_name(&session.account, channel))
        {
            conv.set_topic(Some(topic.to_string()));
        }
    }
}

fn handle_names(session: &Rc<Session>, msg: &IrcMsg) {
    let Some(core) = session.core() else {
        return;
    };
    // :server 353 nick = #chan :nick1 @nick2 +nick3
    let channel = msg.param(2);
    let Some(conv) = core.with_conversations(|c| c.find_chat_by_name(&session.account, channel))
    else {
        return;
    };
    for name in msg.param(3).split_whitespace() {
        let (flags, nick) = match name.chars().next() {
            Some('@') => (crate::conversation::cbflags::OP, &name[1..]),
            Some('+') => (crate::conversation::cbflags::VOICE, &name[1..]),
            Some('%') => (crate::conversation::cbflags::HALFOP, &name[1..]),
            _ => (0, name),
        };
        conv.add_user(nick, flags);
    }
}

// Capability implementations -----------------------------------------------

impl ServerOps for IrcProtocol {
    fn set_status(&self, account: &Account, status: &Status) {
        let Some(conn) = account.connection() else {
            return;
        };
        let Some(session) = Self::session(&conn) else {
            return;
        };
        match status.primitive {
            StatusPrimitive::Away | StatusPrimitive::ExtendedAway | StatusPrimitive::DoNotDisturb => {
                let message = status.message().unwrap_or("Away");
                session.send_line(&format!("AWAY :{message}"));
            }
            _ => session.send_line("AWAY"),
        }
    }

    fn add_buddy(&self, gc: &Connection, buddy: &crate::account::Buddy, _group: &str) {
        if let Some(session) = Self::session(gc) {
            session.buddies.borrow_mut().insert(
                buddy.name().to_lowercase(),
                IrcBuddy { online: false, seen: false },
            );
            // Probe just this one so presence shows up promptly.
            session.send_line(&format!("ISON :{}", buddy.name()));
            session.ison_in_flight.set(true);
        }
    }

    fn remove_buddy(&self, gc: &Connection, buddy: &crate::account::Buddy, _group: &str) {
        if let Some(session) = Self::session(gc) {
            session.buddies.borrow_mut().remove(&buddy.name().to_lowercase());
        }
    }

    fn keepalive(&self, gc: &Connection) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        if gc.idle_seconds() >= PING_IDLE_SECS {
            session.send_line(&format!("PING :{}", crate::conversation::now_epoch()));
        }
    }

    fn keepalive_interval(&self) -> Option<u64> {
        Some(PING_IDLE_SECS)
    }

    fn send_raw(&self, gc: &Connection, buf: &[u8]) -> i32 {
        let Some(session) = Self::session(gc) else {
            return -(libc::ENOTCONN);
        };
        session.send_line(salvage_utf8(buf).trim_end_matches(['\r', '\n']));
        buf.len() as i32
    }
}

impl ImOps for IrcProtocol {
    fn send(&self, gc: &Connection, who: &str, message: &str, _flags: u32) -> i32 {
        let Some(session) = Self::session(gc) else {
            return -(libc::ENOTCONN);
        };
        // The wire cannot carry newlines: one PRIVMSG per line.
        for line in message.split('\n').filter(|l| !l.is_empty()) {
            if let Some(action) = line.strip_prefix("/me ") {
                session.send_line(&format!("PRIVMSG {who} :\u{1}ACTION {action}\u{1}"));
            } else {
                session.send_line(&format!("PRIVMSG {who} :{line}"));
            }
        }
        message.len() as i32
    }
}

impl ChatOps for IrcProtocol {
    fn info(&self) -> Vec<ChatField> {
        vec![
            ChatField {
                id: "channel".into(),
                label: "Channel".into(),
                required: true,
                secret: false,
            },
            ChatField {
                id: "password".into(),
                label: "Password".into(),
                required: false,
                secret: true,
            },
        ]
    }

    fn info_defaults(&self, _gc: &Connection, room: &str) -> HashMap<String, String> {
        let mut defaults = HashMap::new();
        let channel = if is_channel(room) { room.to_string() } else { format!("#{room}") };
        defaults.insert("channel".into(), channel);
        defaults
    }

    fn join(&self, gc: &Connection, components: &HashMap<String, String>) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let Some(channel) = components.get("channel") else {
            return;
        };
        match components.get("password").filter(|p| !p.is_empty()) {
            Some(password) => session.send_line(&format!("JOIN {channel} {password}")),
            None => session.send_line(&format!("JOIN {channel}")),
        }
    }

    fn leave(&self, gc: &Connection, id: i32) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let Some(core) = session.core() else {
            return;
        };
        if let Some(conv) = core.with_conversations(|c| c.find_chat(&session.account, id)) {
            session.send_line(&format!("PART {}", conv.name()));
        }
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
        for line in message.split('\n').filter(|l| !l.is_empty()) {
            session.send_line(&format!("PRIVMSG {} :{line}", conv.name()));
        }
        // IRC does not echo our own channel messages.
        let nick = session.nick.borrow().clone();
        core.got_chat_in(gc, id, &nick, message);
        message.len() as i32
    }

    fn set_topic(&self, gc: &Connection, id: i32, topic: &str) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let Some(core) = session.core() else {
            return;
        };
        if let Some(conv) = core.with_conversations(|c| c.find_chat(&session.account, id)) {
            session.send_line(&format!("TOPIC {} :{topic}", conv.name()));
        }
    }

    fn get_name(&self, components: &HashMap<String, String>) -> Option<String> {
        components.get("channel").cloned()
    }
}
