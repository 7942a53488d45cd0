//! Gadu-Gadu.
//!
//! A binary event protocol driven entirely by fd watches: every readiness
//! wakeup drains packets off the non-blocking socket, decodes each into a
//! typed event, and demultiplexes on the event kind to update roster,
//! presence, messaging and typing state. Writes drain through a small
//! queue, with a write watch armed only while the socket is saturated.
//!
//! Typing notifications carry a random nonzero length while composing and
//! zero when stopped, rate-limited to one per second.

mod proto;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Instant;

use rand::Rng;
use zerocopy::FromBytes;

use self::proto::*;
use crate::account::{Account, Buddy, Status, StatusPrimitive, StatusType};
use crate::conversation::TypingState;
use crate::core::{Core, CoreInner};
use crate::debug;
use crate::eventloop::{Cond, SourceId};
use crate::protocol::{
    AccountOption, ImOps, Protocol, ServerOps, connection::Connection,
    connection::ConnectionError,
};
use crate::signals::SignalBus;

pub const DEFAULT_SERVER: &str = "ntserver.gadu-gadu.pl";
pub const DEFAULT_PORT: u16 = 8074;
/// Minimum gap between typing notifications.
pub const TYPING_SUPPRESS_MS: u128 = 1000;

/// Largest body we accept before declaring the stream corrupt.
const MAX_PACKET_LEN: usize = 1 << 20;

/// Per-buddy protocol data: the numeric identity. Created at most once per
/// buddy and dropped through the buddy-free hook.
struct GgBuddyData {
    uin: u32,
}

struct Session {
    core: Weak<CoreInner>,
    conn: Connection,
    account: Account,
    uin: u32,
    /// The non-blocking socket; all I/O goes through fd watches.
    socket: RefCell<Option<std::net::TcpStream>>,
    read_watch: Cell<Option<SourceId>>,
    /// Write watch plus the duplicated descriptor it observes (the kernel
    /// object is shared; the duplicate keeps reactor registrations apart).
    write_watch: Cell<Option<(SourceId, RawFd)>>,
    outq: RefCell<VecDeque<Vec<u8>>>,
    inbuf: RefCell<Vec<u8>>,
    logged_in: Cell<bool>,
    next_seq: Cell<u32>,
    /// Last typing notification: when, and whether it said "typing".
    last_typing: RefCell<Option<(Instant, bool)>>,
    /// uin → display nick, seeded from the buddy list.
    nicks: RefCell<HashMap<u32, String>>,
    closed: Cell<bool>,
}

impl Session {
    fn core(&self) -> Option<Core> {
        self.core.upgrade().map(Core::from_inner)
    }

    fn fd(&self) -> Option<RawFd> {
        self.socket.borrow().as_ref().map(|s| s.as_raw_fd())
    }

    fn nick_of(&self, uin: u32) -> String {
        self.nicks
            .borrow()
            .get(&uin)
            .cloned()
            .unwrap_or_else(|| uin.to_string())
    }

    fn uin_of(&self, who: &str) -> Option<u32> {
        if let Ok(uin) = who.parse::<u32>() {
            return Some(uin);
        }
        self.nicks
            .borrow()
            .iter()
            .find(|(_, nick)| nick.eq_ignore_ascii_case(who))
            .map(|(uin, _)| *uin)
    }
}

/// A raw packet crossing the wire.
pub struct PacketEvent {
    pub data: Vec<u8>,
}

/// The Gadu-Gadu protocol implementation.
#[derive(Default)]
pub struct GgProtocol;

impl GgProtocol {
    pub fn new() -> GgProtocol {
        Self::default()
    }

    fn session(conn: &Connection) -> Option<Rc<Session>> {
        conn.with_proto_data::<Rc<Session>, _>(Rc::clone)
    }

    /// Get-or-insert the per-buddy data. Allocation happens at most once
    /// per buddy.
    fn ensure_buddy_data(buddy: &Buddy) -> u32 {
        if !buddy.has_proto_data() {
            let uin = buddy.name().parse::<u32>().unwrap_or(0);
            buddy.init_proto_data(Box::new(GgBuddyData { uin }));
        }
        buddy
            .with_proto_data::<GgBuddyData, _>(|d| d.uin)
            .unwrap_or(0)
    }
}

fn register_protocol_signals(bus: &SignalBus) {
    let _ = bus.register::<PacketEvent>("gg-sending-packet");
    let _ = bus.register::<PacketEvent>("gg-receiving-packet");
}

fn status_to_primitive(status: u32) -> StatusPrimitive {
    match status {
        GG_STATUS_AVAIL => StatusPrimitive::Available,
        GG_STATUS_BUSY => StatusPrimitive::Away,
        GG_STATUS_INVISIBLE => StatusPrimitive::Invisible,
        _ => StatusPrimitive::Offline,
    }
}

fn primitive_to_status(primitive: StatusPrimitive) -> u32 {
    match primitive {
        StatusPrimitive::Available => GG_STATUS_AVAIL,
        StatusPrimitive::Away
        | StatusPrimitive::ExtendedAway
        | StatusPrimitive::DoNotDisturb => GG_STATUS_BUSY,
        StatusPrimitive::Invisible => GG_STATUS_INVISIBLE,
        _ => GG_STATUS_NOT_AVAIL,
    }
}

impl Protocol for GgProtocol {
    fn id(&self) -> &str {
        "gg"
    }

    fn name(&self) -> &str {
        "Gadu-Gadu"
    }

    fn list_icon(&self, _account: Option<&Account>) -> &str {
        "gadu-gadu"
    }

    fn account_options(&self) -> Vec<AccountOption> {
        vec![
            AccountOption::string("server", "Server", DEFAULT_SERVER),
            AccountOption::int("port", "Port", DEFAULT_PORT as i64),
        ]
    }

    fn status_types(&self, _account: &Account) -> Vec<StatusType> {
        vec![
            StatusType::new(StatusPrimitive::Available, "available", "Available"),
            StatusType::new(StatusPrimitive::Away, "busy", "Busy"),
            StatusType::new(StatusPrimitive::Invisible, "invisible", "Invisible"),
            StatusType::new(StatusPrimitive::Offline, "offline", "Offline")
                .with_user_settable(false),
        ]
    }

    fn login(&self, core: &Core, connection: &Connection) {
        let Some(account) = connection.account() else {
            return;
        };
        register_protocol_signals(core.signals());

        let Ok(uin) = account.username().parse::<u32>() else {
            connection.error(ConnectionError::InvalidUsername);
            return;
        };

        let session = Rc::new(Session {
            core: core.downgrade(),
            conn: connection.clone(),
            account: account.clone(),
            uin,
            socket: RefCell::new(None),
            read_watch: Cell::new(None),
            write_watch: Cell::new(None),
            outq: RefCell::new(VecDeque::new()),
            inbuf: RefCell::new(Vec::new()),
            logged_in: Cell::new(false),
            next_seq: Cell::new(1),
            last_typing: RefCell::new(None),
            nicks: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
        });
        connection.set_proto_data(Box::new(Rc::clone(&session)));

        tokio::task::spawn_local(async move {
            if let Err(e) = login_task(Rc::clone(&session)).await {
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
        teardown(&session);
        connection.take_proto_data();
    }

    fn buddy_free(&self, buddy: &Buddy) {
        if buddy.take_proto_data().is_some() {
            debug::misc("gg", &format!("freed buddy data for {}", buddy.name()));
        }
    }

    fn server_ops(&self) -> Option<&dyn ServerOps> {
        Some(self)
    }

    fn im_ops(&self) -> Option<&dyn ImOps> {
        Some(self)
    }
}

fn teardown(session: &Session) {
    session.closed.set(true);
    if let Some(core) = session.core() {
        if let Some(id) = session.read_watch.take() {
            core.event_loop().cancel(id);
        }
        if let Some((id, dup_fd)) = session.write_watch.take() {
            core.event_loop().cancel(id);
            // SAFETY: dup_fd was created by dup() below and is ours.
            unsafe { libc::close(dup_fd) };
        }
    }
    session.outq.borrow_mut().clear();
    session.socket.borrow_mut().take();
}

async fn login_task(session: Rc<Session>) -> Result<(), ConnectionError> {
    let Some(core) = session.core() else {
        return Err(ConnectionError::OtherError("core is gone".into()));
    };
    let account = &session.account;
    let server = account.get_string("server", DEFAULT_SERVER);
    let port = account.get_int("port", DEFAULT_PORT as i64) as u16;

    session.conn.update_progress("Connecting", 1, 2);
    let stream = core
        .connector()
        .connect(&server, port)
        .await
        .map_err(ConnectionError::from)?;

    // Hand the socket to the fd-watch machinery: deregister it from the
    // async reactor and keep it non-blocking.
    let std_stream = stream
        .into_std()
        .map_err(|e| ConnectionError::NetworkError(e.to_string()))?;
    std_stream
        .set_nonblocking(true)
        .map_err(|e| ConnectionError::NetworkError(e.to_string()))?;
    let fd = std_stream.as_raw_fd();
    *session.socket.borrow_mut() = Some(std_stream);

    session.conn.update_progress("Reading data", 2, 2);
    let weak = Rc::downgrade(&session);
    let watch = core
        .event_loop()
        .watch_fd(fd, Cond::READ, move |fd, _cond| {
            if let Some(session) = weak.upgrade() {
                handle_readable(&session, fd);
            }
        })
        .map_err(|e| ConnectionError::NetworkError(e.to_string()))?;
    session.read_watch.set(Some(watch));
    Ok(())
}

/// Queue a packet and flush as far as the socket allows.
fn send_packet(session: &Rc<Session>, packet: Vec<u8>) {
    if session.closed.get() {
        return;
    }
    if let Some(core) = session.core() {
        let mut event = PacketEvent { data: packet.clone() };
        let _ = core.signals().emit("gg-sending-packet", &mut event);
        session.outq.borrow_mut().push_back(event.data);
    } else {
        session.outq.borrow_mut().push_back(packet);
    }
    flush_out(session);
}

fn flush_out(session: &Rc<Session>) {
    let Some(fd) = session.fd() else {
        return;
    };
    loop {
        let front = session.outq.borrow_mut().pop_front();
        let Some(mut chunk) = front else {
            // Drained: the write watch has nothing left to do.
            if let (Some(core), Some((id, dup_fd))) =
                (session.core(), session.write_watch.take())
            {
                core.event_loop().cancel(id);
                // SAFETY: dup_fd is the duplicate we created when arming.
                unsafe { libc::close(dup_fd) };
            }
            return;
        };
        // SAFETY: fd is our open socket; chunk is a live buffer.
        let n = unsafe {
            libc::write(fd, chunk.as_ptr() as *const libc::c_void, chunk.len())
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                session.outq.borrow_mut().push_front(chunk);
                arm_write_watch(session);
                return;
            }
            debug::error("gg", &format!("write failed: {err}"));
            fail(session, ConnectionError::NetworkError(err.to_string()));
            return;
        }
        let n = n as usize;
        if n < chunk.len() {
            chunk.drain(..n);
            session.outq.borrow_mut().push_front(chunk);
            arm_write_watch(session);
            return;
        }
    }
}

fn arm_write_watch(session: &Rc<Session>) {
    if session.write_watch.get().is_some() {
        return;
    }
    let (Some(core), Some(fd)) = (session.core(), session.fd()) else {
        return;
    };
    // The read watch already owns this fd's reactor slot; watch a
    // duplicate, which shares the socket but registers independently.
    // SAFETY: fd is our open socket.
    let dup_fd = unsafe { libc::dup(fd) };
    if dup_fd < 0 {
        return;
    }
    let weak = Rc::downgrade(session);
    match core.event_loop().watch_fd(dup_fd, Cond::WRITE, move |_fd, _cond| {
        if let Some(session) = weak.upgrade() {
            flush_out(&session);
        }
    }) {
        Ok(id) => session.write_watch.set(Some((id, dup_fd))),
        Err(_) => {
            // SAFETY: dup_fd is ours and unused.
            unsafe { libc::close(dup_fd) };
        }
    }
}

fn fail(session: &Rc<Session>, error: ConnectionError) {
    if session.closed.get() {
        return;
    }
    teardown(session);
    session.conn.error(error);
}

/// The fd-readiness entry point: drain the socket, decode packets,
/// demultiplex events.
fn handle_readable(session: &Rc<Session>, fd: RawFd) {
    if session.closed.get() {
        return;
    }
    let mut chunk = [0u8; 4096];
    // SAFETY: fd is our open socket; chunk is a valid buffer.
    let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
    if n == 0 {
        fail(session, ConnectionError::NetworkError("Server closed the connection".into()));
        return;
    }
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return;
        }
        fail(session, ConnectionError::NetworkError(err.to_string()));
        return;
    }
    session.conn.mark_received();
    session.inbuf.borrow_mut().extend_from_slice(&chunk[..n as usize]);

    loop {
        let packet = {
            let mut inbuf = session.inbuf.borrow_mut();
            if inbuf.len() < GG_HEADER_LEN {
                break;
            }
            let Ok(header) = GgHeader::read_from_bytes(&inbuf[..GG_HEADER_LEN]) else {
                break;
            };
            let body_len = header.length.get() as usize;
            if body_len > MAX_PACKET_LEN {
                drop(inbuf);
                fail(session, ConnectionError::NetworkError("oversized packet".into()));
                return;
            }
            let total = GG_HEADER_LEN + body_len;
            if inbuf.len() < total {
                break;
            }
            let packet: Vec<u8> = inbuf.drain(..total).collect();
            packet
        };

        if let Some(core) = session.core() {
            let mut event = PacketEvent { data: packet.clone() };
            let _ = core.signals().emit("gg-receiving-packet", &mut event);
        }

        let kind = GgHeader::read_from_bytes(&packet[..GG_HEADER_LEN])
            .map(|h| h.kind.get())
            .unwrap_or(0);
        match parse_event(kind, &packet[GG_HEADER_LEN..]) {
            Ok(Some(event)) => handle_event(session, event),
            Ok(None) => {
                debug::misc("gg", &format!("ignoring packet kind {kind:#x}"));
            }
            Err(e) => {
                // One broken packet is dropped; the stream carries on.
                debug::warning("gg", &format!("bad packet {kind:#x}: {e}"));
            }
        }
        if session.closed.get() {
            return;
        }
    }
}

fn handle_event(session: &Rc<Session>, event: GgEvent) {
    let Some(core) = session.core() else {
        return;
    };
    match event {
        GgEvent::Welcome { seed } => {
            debug::misc("gg", &format!("welcome, seed {seed:#x}"));
            let password = session.account.password().unwrap_or_default();
            let status = primitive_to_status(
                session.account.with_presence(|p| p.active_status().primitive),
            );
            let status = if status == GG_STATUS_NOT_AVAIL { GG_STATUS_AVAIL } else { status };
            send_packet(session, build_login(session.uin, &password, status));
        }
        GgEvent::LoginOk => {
            session.logged_in.set(true);
            // Upload the notify list so the server feeds us presence.
            let buddies = core.with_blist(|b| b.account_buddies(&session.account));
            let mut uins = Vec::with_capacity(buddies.len());
            for buddy in &buddies {
                let uin = GgProtocol::ensure_buddy_data(buddy);
                if uin != 0 {
                    uins.push(uin);
                    session
                        .nicks
                        .borrow_mut()
                        .insert(uin, buddy.alias());
                }
            }
            if !uins.is_empty() {
                send_packet(session, build_notify(&uins));
            }
            session.conn.set_connected();
        }
        GgEvent::LoginFailed => {
            session.account.purge_unsaved_password();
            fail(
                session,
                ConnectionError::AuthenticationFailed("Incorrect password".into()),
            );
        }
        GgEvent::NotifyReply(entries) => {
            for (uin, status) in entries {
                let nick = session.nick_of(uin);
                core.got_buddy_status(
                    &session.account,
                    &nick,
                    Status::new(status_to_primitive(status)),
                );
            }
        }
        GgEvent::Status { uin, status } => {
            let nick = session.nick_of(uin);
            core.got_buddy_status(
                &session.account,
                &nick,
                Status::new(status_to_primitive(status)),
            );
        }
        GgEvent::RecvMsg { uin, seq, text } => {
            debug::misc("gg", &format!("message {seq} from {uin}"));
            let nick = session.nick_of(uin);
            core.got_im(&session.conn, &nick, &text, 0);
        }
        GgEvent::TypingNotify { uin, length } => {
            let nick = session.nick_of(uin);
            let state = if length > 0 { TypingState::Typing } else { TypingState::NotTyping };
            core.got_typing(&session.conn, &nick, state);
        }
        GgEvent::Pong => {
            debug::misc("gg", "pong");
        }
        GgEvent::Disconnecting => {
            fail(
                session,
                ConnectionError::NetworkError("The server is closing the session".into()),
            );
        }
    }
}

impl ServerOps for GgProtocol {
    fn set_status(&self, account: &Account, status: &Status) {
        let Some(conn) = account.connection() else {
            return;
        };
        let Some(session) = Self::session(&conn) else {
            return;
        };
        let wire = primitive_to_status(status.primitive);
        send_packet(&session, build_new_status(wire, status.message()));
    }

    fn add_buddy(&self, gc: &Connection, buddy: &Buddy, _group: &str) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let uin = Self::ensure_buddy_data(buddy);
        if uin == 0 {
            debug::warning("gg", &format!("buddy {} has no numeric id", buddy.name()));
            return;
        }
        session.nicks.borrow_mut().insert(uin, buddy.alias());
        let uins: Vec<u32> = session.nicks.borrow().keys().copied().collect();
        send_packet(&session, build_notify(&uins));
    }

    fn remove_buddy(&self, gc: &Connection, buddy: &Buddy, _group: &str) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        if let Some(uin) = session.uin_of(buddy.name()) {
            session.nicks.borrow_mut().remove(&uin);
            let uins: Vec<u32> = session.nicks.borrow().keys().copied().collect();
            send_packet(&session, build_notify(&uins));
        }
    }

    fn keepalive(&self, gc: &Connection) {
        if let Some(session) = Self::session(gc) {
            send_packet(&session, build_ping());
        }
    }

    fn keepalive_interval(&self) -> Option<u64> {
        Some(60)
    }

    fn send_raw(&self, gc: &Connection, buf: &[u8]) -> i32 {
        let Some(session) = Self::session(gc) else {
            return -(libc::ENOTCONN);
        };
        send_packet(&session, buf.to_vec());
        buf.len() as i32
    }
}

impl ImOps for GgProtocol {
    fn send(&self, gc: &Connection, who: &str, message: &str, _flags: u32) -> i32 {
        let Some(session) = Self::session(gc) else {
            return -(libc::ENOTCONN);
        };
        if !session.logged_in.get() {
            return -(libc::ENOTCONN);
        }
        let Some(uin) = session.uin_of(who) else {
            return -(libc::EINVAL);
        };
        let seq = session.next_seq.get();
        session.next_seq.set(seq + 1);
        send_packet(&session, build_send_msg(uin, seq, message));
        message.len() as i32
    }

    fn send_typing(&self, gc: &Connection, who: &str, state: TypingState) {
        let Some(session) = Self::session(gc) else {
            return;
        };
        let Some(uin) = session.uin_of(who) else {
            return;
        };
        let typing = state == TypingState::Typing;

        // At most one notification per second in the same direction.
        let now = Instant::now();
        if let Some((last, was_typing)) = *session.last_typing.borrow() {
            if was_typing == typing && now.duration_since(last).as_millis() < TYPING_SUPPRESS_MS {
                return;
            }
        }
        *session.last_typing.borrow_mut() = Some((now, typing));

        let length: u16 = if typing {
            rand::thread_rng().gen_range(1..=100)
        } else {
            0
        };
        send_packet(&session, build_typing(uin, length));
    }
}
