//! The per-account connection object and its state machine.
//!
//! A connection exists only while its account is connecting or connected;
//! the account owns it strongly and the connection points back weakly.
//! Over its whole lifetime a connection reports exactly one terminal event:
//! either signed-on or a connection error.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use crate::account::{Account, WeakAccount};
use crate::debug;
use crate::eventloop::SourceId;

/// Connection capability flags.
pub mod connflags {
    /// Messages may carry HTML markup.
    pub const HTML: u32 = 1 << 0;
    /// The wire cannot carry newlines in messages.
    pub const NO_NEWLINES: u32 = 1 << 1;
    /// Inline images are not supported.
    pub const NO_IMAGES: u32 = 1 << 2;
    /// Custom emoji/smiley upload is supported.
    pub const CUSTOM_EMOJI: u32 = 1 << 3;
    /// Messages sent while away are auto-responses.
    pub const AUTO_RESPONDER: u32 = 1 << 4;
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// The closed connection error taxonomy. Terminal: after one of these the
/// connection returns to offline.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("{0}")]
    NetworkError(String),

    #[error("invalid username")]
    InvalidUsername,

    #[error("{0}")]
    AuthenticationFailed(String),

    #[error("authentication is impossible: no mutually supported mechanism")]
    AuthenticationImpossible,

    #[error("SSL support is unavailable")]
    NoSslSupport,

    #[error("{0}")]
    EncryptionError(String),

    #[error("name in use")]
    NameInUse,

    #[error("invalid account settings")]
    InvalidSettings,

    #[error("the server certificate was not provided")]
    CertNotProvided,

    #[error("the server certificate is not trusted")]
    CertUntrusted,

    #[error("the server certificate has expired")]
    CertExpired,

    #[error("the server certificate is self-signed")]
    CertSelfSigned,

    #[error("certificate error: {0}")]
    CertOther(String),

    #[error("{0}")]
    OtherError(String),
}

impl ConnectionError {
    /// Whether automatic reconnection is ever reasonable. Certificate and
    /// configuration problems are not going to fix themselves.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionError::NetworkError(_))
    }
}

impl From<crate::net::Error> for ConnectionError {
    fn from(e: crate::net::Error) -> ConnectionError {
        use crate::net::TlsError;
        match e {
            crate::net::Error::Tls(tls) => match tls {
                TlsError::CertUntrusted => ConnectionError::CertUntrusted,
                TlsError::CertExpired => ConnectionError::CertExpired,
                TlsError::CertSelfSigned => ConnectionError::CertSelfSigned,
                TlsError::CertOther(m) => ConnectionError::CertOther(m),
                TlsError::BadServerName(m) => {
                    ConnectionError::EncryptionError(format!("invalid server name: {m}"))
                }
                TlsError::Handshake(e) => ConnectionError::EncryptionError(e.to_string()),
            },
            other => ConnectionError::NetworkError(other.to_string()),
        }
    }
}

/// Callbacks the core installs to surface connection events. Protocols call
/// the [`Connection`] methods; these fan out to the UI and the signal bus.
pub trait ConnectionUiOps {
    fn update_progress(&self, _conn: &Connection, _text: &str, _step: usize, _total: usize) {}
    fn connected(&self, _conn: &Connection) {}
    fn disconnected(&self, _conn: &Connection) {}
    fn report_error(&self, _conn: &Connection, _error: &ConnectionError) {}
}

struct NoopUi;

impl ConnectionUiOps for NoopUi {}

struct ConnInner {
    account: WeakAccount,
    state: Cell<ConnectionState>,
    flags: Cell<u32>,
    display_name: RefCell<String>,
    last_received: Cell<Instant>,
    keepalive_timer: Cell<Option<SourceId>>,
    /// Guard for the one-terminal-event invariant.
    terminal_emitted: Cell<bool>,
    ui: RefCell<Rc<dyn ConnectionUiOps>>,
    proto_data: RefCell<Option<Box<dyn Any>>>,
    /// Ids of chats the session has joined.
    chats: RefCell<Vec<i32>>,
    next_chat_id: Cell<i32>,
}

/// Handle to a live (or dying) connection. Clones share state.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnInner>,
}

impl Connection {
    pub fn new(account: &Account) -> Connection {
        Connection {
            inner: Rc::new(ConnInner {
                account: account.downgrade(),
                state: Cell::new(ConnectionState::Connecting),
                flags: Cell::new(0),
                display_name: RefCell::new(account.username().to_string()),
                last_received: Cell::new(Instant::now()),
                keepalive_timer: Cell::new(None),
                terminal_emitted: Cell::new(false),
                ui: RefCell::new(Rc::new(NoopUi)),
                proto_data: RefCell::new(None),
                chats: RefCell::new(Vec::new()),
                next_chat_id: Cell::new(1),
            }),
        }
    }

    /// The owning account, while it still exists.
    pub fn account(&self) -> Option<Account> {
        self.inner.account.upgrade()
    }

    pub fn same(&self, other: &Connection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn flags(&self) -> u32 {
        self.inner.flags.get()
    }

    pub fn set_flags(&self, flags: u32) {
        self.inner.flags.set(flags);
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub fn display_name(&self) -> String {
        self.inner.display_name.borrow().clone()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        *self.inner.display_name.borrow_mut() = name.into();
    }

    pub(crate) fn set_ui_ops(&self, ui: Rc<dyn ConnectionUiOps>) {
        *self.inner.ui.borrow_mut() = ui;
    }

    // Inbound activity tracking -------------------------------------------

    /// Note that bytes arrived; keepalive decisions key off this.
    pub fn mark_received(&self) {
        self.inner.last_received.set(Instant::now());
    }

    /// Seconds since the last inbound data.
    pub fn idle_seconds(&self) -> u64 {
        self.inner.last_received.get().elapsed().as_secs()
    }

    pub(crate) fn keepalive_timer(&self) -> Option<SourceId> {
        self.inner.keepalive_timer.get()
    }

    pub(crate) fn set_keepalive_timer(&self, id: Option<SourceId>) {
        self.inner.keepalive_timer.set(id);
    }

    // Progress and terminal events ----------------------------------------

    /// Publish login progress to the UI.
    pub fn update_progress(&self, text: &str, step: usize, total: usize) {
        debug::info(
            "connection",
            &format!("{}: {text} ({step}/{total})", self.display_name()),
        );
        let ui = self.inner.ui.borrow().clone();
        ui.update_progress(self, text, step, total);
    }

    /// Transition to `Connected` and emit the signed-on event. A second
    /// call, or a call after an error, is ignored.
    pub fn set_connected(&self) {
        if self.inner.terminal_emitted.replace(true) {
            debug::warning("connection", "duplicate terminal event suppressed");
            return;
        }
        self.inner.state.set(ConnectionState::Connected);
        self.mark_received();
        debug::info("connection", &format!("{} signed on", self.display_name()));
        let ui = self.inner.ui.borrow().clone();
        ui.connected(self);
    }

    /// Report a terminal error and fall back to `Disconnected`. Only the
    /// first error of a connection's lifetime is reported.
    pub fn error(&self, error: ConnectionError) {
        if self.inner.terminal_emitted.replace(true) {
            debug::warning(
                "connection",
                &format!("suppressing secondary error: {error}"),
            );
            return;
        }
        self.inner.state.set(ConnectionState::Disconnected);
        debug::error(
            "connection",
            &format!("{}: {error}", self.display_name()),
        );
        let ui = self.inner.ui.borrow().clone();
        ui.report_error(self, &error);
    }

    /// Orderly teardown after `close`. Emits nothing if a terminal event
    /// already went out; a plain user-requested disconnect of a connected
    /// session reports only `disconnected`.
    pub(crate) fn set_disconnected(&self) {
        self.inner.state.set(ConnectionState::Disconnected);
        let ui = self.inner.ui.borrow().clone();
        ui.disconnected(self);
    }

    /// Whether signed-on or an error has been reported.
    pub fn terminal_emitted(&self) -> bool {
        self.inner.terminal_emitted.get()
    }

    // Protocol payload ------------------------------------------------------

    pub fn set_proto_data(&self, data: Box<dyn Any>) {
        *self.inner.proto_data.borrow_mut() = Some(data);
    }

    pub fn with_proto_data<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner
            .proto_data
            .borrow()
            .as_ref()
            .and_then(|d| d.downcast_ref::<T>())
            .map(f)
    }

    pub fn take_proto_data(&self) -> Option<Box<dyn Any>> {
        self.inner.proto_data.borrow_mut().take()
    }

    // Chats -----------------------------------------------------------------

    /// Allocate the next chat id for this session.
    pub fn alloc_chat_id(&self) -> i32 {
        let id = self.inner.next_chat_id.get();
        self.inner.next_chat_id.set(id + 1);
        self.inner.chats.borrow_mut().push(id);
        id
    }

    pub fn forget_chat(&self, id: i32) {
        self.inner.chats.borrow_mut().retain(|c| *c != id);
    }

    pub fn chat_ids(&self) -> Vec<i32> {
        self.inner.chats.borrow().clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("name", &self.display_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct Recorder {
        events: StdRefCell<Vec<String>>,
    }

    impl ConnectionUiOps for Recorder {
        fn update_progress(&self, _c: &Connection, text: &str, step: usize, total: usize) {
            self.events
                .borrow_mut()
                .push(format!("progress:{text}:{step}/{total}"));
        }

        fn connected(&self, _c: &Connection) {
            self.events.borrow_mut().push("connected".into());
        }

        fn disconnected(&self, _c: &Connection) {
            self.events.borrow_mut().push("disconnected".into());
        }

        fn report_error(&self, _c: &Connection, e: &ConnectionError) {
            self.events.borrow_mut().push(format!("error:{e}"));
        }
    }

    fn wired() -> (Connection, Rc<Recorder>) {
        let account = Account::new("xmpp", "u@h");
        let conn = Connection::new(&account);
        let rec = Rc::new(Recorder { events: StdRefCell::new(Vec::new()) });
        conn.set_ui_ops(rec.clone());
        // Keep the account alive through the test.
        std::mem::forget(account);
        (conn, rec)
    }

    #[test]
    fn test_exactly_one_terminal_event() {
        let (conn, rec) = wired();
        conn.set_connected();
        conn.error(ConnectionError::NetworkError("late".into()));
        conn.set_connected();
        assert_eq!(rec.events.borrow().as_slice(), ["connected"]);
        assert!(conn.is_connected());
    }

    #[test]
    fn test_error_wins_when_first() {
        let (conn, rec) = wired();
        conn.error(ConnectionError::AuthenticationFailed("denied".into()));
        conn.set_connected();
        assert_eq!(rec.events.borrow().as_slice(), ["error:denied"]);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_progress_routing() {
        let (conn, rec) = wired();
        conn.update_progress("Connecting", 1, 5);
        assert_eq!(rec.events.borrow().as_slice(), ["progress:Connecting:1/5"]);
    }

    #[test]
    fn test_weak_account_backref() {
        let account = Account::new("xmpp", "u@h");
        let conn = Connection::new(&account);
        assert!(conn.account().is_some());
        drop(account);
        assert!(conn.account().is_none());
    }

    #[test]
    fn test_chat_id_allocation() {
        let account = Account::new("irc", "me");
        let conn = Connection::new(&account);
        let a = conn.alloc_chat_id();
        let b = conn.alloc_chat_id();
        assert_ne!(a, b);
        assert_eq!(conn.chat_ids(), vec![a, b]);
        conn.forget_chat(a);
        assert_eq!(conn.chat_ids(), vec![b]);
    }

    #[test]
    fn test_error_fatality() {
        assert!(!ConnectionError::NetworkError("x".into()).is_fatal());
        assert!(ConnectionError::CertExpired.is_fatal());
        assert!(ConnectionError::AuthenticationFailed("x".into()).is_fatal());
    }
}
