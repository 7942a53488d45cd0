//! The core root object: init/shutdown bracket, registries, UI ops, and
//! the account connection lifecycle.
//!
//! Everything the original kept in writable statics (resolver children, the
//! transfer list, signal tables) lives here, owned by the loop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::account::{Account, BuddyList};
use crate::conversation::Conversations;
use crate::debug;
use crate::eventloop::EventLoop;
use crate::net::Connector;
use crate::protocol::{
    Connection, ConnectionError, ConnectionUiOps, ProtocolRegistry,
};
use crate::resolver::Resolver;
use crate::signals::SignalBus;
use crate::xfer::Xfer;

/// Errors from core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("core is already initialized on this thread")]
    AlreadyInitialized,

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("account is already connecting or connected")]
    AlreadyConnected,

    #[error("account is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Prompts the core raises toward the embedder.
pub trait RequestUiOps {
    /// Ask the user to pick a local file. `for_save` distinguishes
    /// save-destination prompts from open prompts. Deliver `None` on
    /// cancel.
    fn request_file(
        &self,
        _title: &str,
        _default_name: Option<&str>,
        _for_save: bool,
        cb: Box<dyn FnOnce(Option<std::path::PathBuf>)>,
    ) {
        cb(None);
    }

    /// Yes/no confirmation. Deliver `false` on cancel.
    fn request_accept(&self, _title: &str, _message: &str, cb: Box<dyn FnOnce(bool)>) {
        cb(false);
    }

    /// Surface an error dialog.
    fn show_error(&self, _primary: &str, _secondary: &str) {}
}

/// Account-level notifications.
pub trait AccountUiOps {
    fn connecting_progress(&self, _account: &Account, _text: &str, _step: usize, _total: usize) {}
    fn connected(&self, _account: &Account) {}
    fn disconnected(&self, _account: &Account) {}
    fn connection_error(&self, _account: &Account, _error: &ConnectionError) {}
}

/// Buddy-list notifications.
pub trait BlistUiOps {
    fn buddy_added(&self, _buddy: &crate::account::Buddy) {}
    fn buddy_removed(&self, _buddy: &crate::account::Buddy) {}
    fn buddy_status_changed(&self, _buddy: &crate::account::Buddy) {}
}

/// Conversation notifications.
pub trait ConversationUiOps {
    fn wrote_message(&self, _conv: &crate::conversation::Conversation, _msg: &crate::conversation::Message) {}
    fn typing_changed(&self, _conv: &crate::conversation::Conversation) {}
    fn chat_joined(&self, _conv: &crate::conversation::Conversation) {}
    fn chat_left(&self, _conv: &crate::conversation::Conversation) {}
}

struct NoopUi;

impl RequestUiOps for NoopUi {}
impl AccountUiOps for NoopUi {}
impl BlistUiOps for NoopUi {}
impl ConversationUiOps for NoopUi {}
impl crate::xfer::XferUiOps for NoopUi {}

pub(crate) struct UiOpsSet {
    pub request: Rc<dyn RequestUiOps>,
    pub account: Rc<dyn AccountUiOps>,
    pub blist: Rc<dyn BlistUiOps>,
    pub conversation: Rc<dyn ConversationUiOps>,
    pub xfer: Rc<dyn crate::xfer::XferUiOps>,
}

impl Default for UiOpsSet {
    fn default() -> Self {
        let noop = Rc::new(NoopUi);
        UiOpsSet {
            request: noop.clone(),
            account: noop.clone(),
            blist: noop.clone(),
            conversation: noop.clone(),
            xfer: noop,
        }
    }
}

pub(crate) struct CoreInner {
    pub(crate) ev: EventLoop,
    pub(crate) resolver: Rc<Resolver>,
    pub(crate) connector: Connector,
    pub(crate) signals: SignalBus,
    pub(crate) protocols: ProtocolRegistry,
    pub(crate) accounts: RefCell<Vec<Account>>,
    pub(crate) blist: RefCell<BuddyList>,
    pub(crate) conversations: RefCell<Conversations>,
    pub(crate) xfers: RefCell<Vec<Xfer>>,
    pub(crate) ui: RefCell<UiOpsSet>,
    /// `(account key, peer) → epoch of last auto-response`.
    pub(crate) last_auto_responses: RefCell<HashMap<(String, String), i64>>,
    pub(crate) auto_response_sweeper: Cell<bool>,
    /// UI restriction on reported media capabilities.
    pub(crate) ui_media_caps: Cell<u32>,
    shut_down: Cell<bool>,
}

thread_local! {
    static LIVE: Cell<bool> = const { Cell::new(false) };
}

/// Handle to the core. Cheap to clone; everything lives on the loop thread.
#[derive(Clone)]
pub struct Core {
    inner: Rc<CoreInner>,
}

impl Core {
    /// Bring the core up. Must be called exactly once (per loop thread);
    /// bracket all other API use between this and [`Core::shutdown`].
    pub fn init() -> Result<Core> {
        Self::init_with(EventLoop::new())
    }

    /// Like [`Core::init`] with a custom event-loop backend.
    pub fn init_with(ev: EventLoop) -> Result<Core> {
        let resolver = Rc::new(Resolver::new(ev.clone()));
        Self::init_with_resolver(ev, resolver)
    }

    /// Like [`Core::init`] with an explicit resolver (backend selection).
    pub fn init_with_resolver(ev: EventLoop, resolver: Rc<Resolver>) -> Result<Core> {
        if LIVE.with(|l| l.replace(true)) {
            return Err(CoreError::AlreadyInitialized);
        }
        debug::init();

        let core = Core {
            inner: Rc::new(CoreInner {
                ev,
                connector: Connector::new(resolver.clone()),
                resolver,
                signals: SignalBus::new(),
                protocols: ProtocolRegistry::new(),
                accounts: RefCell::new(Vec::new()),
                blist: RefCell::new(BuddyList::new()),
                conversations: RefCell::new(Conversations::new()),
                xfers: RefCell::new(Vec::new()),
                ui: RefCell::new(UiOpsSet::default()),
                last_auto_responses: RefCell::new(HashMap::new()),
                auto_response_sweeper: Cell::new(false),
                ui_media_caps: Cell::new(u32::MAX),
                shut_down: Cell::new(false),
            }),
        };
        core.register_core_signals();
        debug::info("core", "initialized");
        Ok(core)
    }

    /// Tear everything down. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.replace(true) {
            return;
        }
        let accounts: Vec<Account> = self.inner.accounts.borrow().clone();
        for account in &accounts {
            let _ = self.disconnect_account(account);
        }
        for xfer in self.inner.xfers.borrow_mut().drain(..) {
            xfer.teardown();
        }
        self.inner.resolver.shutdown();
        self.inner.signals.clear();
        debug::reset();
        LIVE.with(|l| l.set(false));
        debug::info("core", "shut down");
    }

    pub(crate) fn downgrade(&self) -> Weak<CoreInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Rc<CoreInner>) -> Core {
        Core { inner }
    }

    pub(crate) fn inner(&self) -> &CoreInner {
        &self.inner
    }

    // Service accessors ----------------------------------------------------

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.ev
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    pub fn signals(&self) -> &SignalBus {
        &self.inner.signals
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.inner.protocols
    }

    pub fn with_blist<R>(&self, f: impl FnOnce(&mut BuddyList) -> R) -> R {
        f(&mut self.inner.blist.borrow_mut())
    }

    pub fn with_conversations<R>(&self, f: impl FnOnce(&mut Conversations) -> R) -> R {
        f(&mut self.inner.conversations.borrow_mut())
    }

    // UI ops ---------------------------------------------------------------

    pub fn set_request_ui_ops(&self, ops: Rc<dyn RequestUiOps>) {
        self.inner.ui.borrow_mut().request = ops;
    }

    pub fn set_account_ui_ops(&self, ops: Rc<dyn AccountUiOps>) {
        self.inner.ui.borrow_mut().account = ops;
    }

    pub fn set_blist_ui_ops(&self, ops: Rc<dyn BlistUiOps>) {
        self.inner.ui.borrow_mut().blist = ops;
    }

    pub fn set_conversation_ui_ops(&self, ops: Rc<dyn ConversationUiOps>) {
        self.inner.ui.borrow_mut().conversation = ops;
    }

    pub fn set_xfer_ui_ops(&self, ops: Rc<dyn crate::xfer::XferUiOps>) {
        self.inner.ui.borrow_mut().xfer = ops;
    }

    pub(crate) fn request_ui(&self) -> Rc<dyn RequestUiOps> {
        self.inner.ui.borrow().request.clone()
    }

    pub(crate) fn account_ui(&self) -> Rc<dyn AccountUiOps> {
        self.inner.ui.borrow().account.clone()
    }

    pub(crate) fn blist_ui(&self) -> Rc<dyn BlistUiOps> {
        self.inner.ui.borrow().blist.clone()
    }

    pub(crate) fn conversation_ui(&self) -> Rc<dyn ConversationUiOps> {
        self.inner.ui.borrow().conversation.clone()
    }

    pub(crate) fn xfer_ui(&self) -> Rc<dyn crate::xfer::XferUiOps> {
        self.inner.ui.borrow().xfer.clone()
    }

    // Accounts -------------------------------------------------------------

    pub fn add_account(&self, account: Account) -> Account {
        self.inner.accounts.borrow_mut().push(account.clone());
        account
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.inner.accounts.borrow().clone()
    }

    pub fn find_account(&self, protocol_id: &str, username: &str) -> Option<Account> {
        self.inner
            .accounts
            .borrow()
            .iter()
            .find(|a| a.protocol_id() == protocol_id && a.username() == username)
            .cloned()
    }

    /// First connected account of a protocol, for URI dispatch.
    pub fn first_connected_account(&self, protocol_id: &str) -> Option<Account> {
        self.inner
            .accounts
            .borrow()
            .iter()
            .find(|a| a.protocol_id() == protocol_id && a.is_connected())
            .cloned()
    }

    pub fn remove_account(&self, account: &Account) {
        let _ = self.disconnect_account(account);
        self.inner.accounts.borrow_mut().retain(|a| !a.same(account));
        self.with_conversations(|c| c.remove_account(account));
        let orphans = self.with_blist(|b| b.remove_account_buddies(account));
        if let Some(protocol) = self.inner.protocols.find(account.protocol_id()) {
            for buddy in &orphans {
                protocol.buddy_free(buddy);
            }
        }
    }

    // Connection lifecycle -------------------------------------------------

    /// Start a session for the account. The protocol's login drives the
    /// state machine from here on.
    pub fn connect_account(&self, account: &Account) -> Result<Connection> {
        if account.connection().is_some() {
            return Err(CoreError::AlreadyConnected);
        }
        let protocol = self
            .inner
            .protocols
            .find(account.protocol_id())
            .ok_or_else(|| CoreError::UnknownProtocol(account.protocol_id().to_string()))?;

        let connection = Connection::new(account);
        connection.set_ui_ops(Rc::new(CoreConnectionUi {
            core: self.downgrade(),
            account: account.clone(),
        }));
        account.set_connection(Some(connection.clone()));
        debug::info(
            "connection",
            &format!("connecting {} ({})", account.username(), account.protocol_id()),
        );
        protocol.login(self, &connection);
        Ok(connection)
    }

    /// End the session, keeping the account.
    pub fn disconnect_account(&self, account: &Account) -> Result<()> {
        let Some(connection) = account.connection() else {
            return Err(CoreError::NotConnected);
        };
        if let Some(id) = connection.keepalive_timer() {
            self.inner.ev.cancel(id);
            connection.set_keepalive_timer(None);
        }
        if let Some(protocol) = self.inner.protocols.find(account.protocol_id()) {
            protocol.close(&connection);
        }
        connection.set_disconnected();
        account.set_connection(None);
        account.with_presence_mut(|p| {
            p.set_status(crate::account::Status::new(
                crate::account::StatusPrimitive::Offline,
            ));
        });
        Ok(())
    }

    /// Whether an incoming event from `who` passes the account's privacy
    /// policy.
    pub fn privacy_check(&self, account: &Account, who: &str) -> bool {
        let is_buddy = self
            .inner
            .blist
            .borrow()
            .find_buddy(account, who)
            .is_some();
        account.with_privacy(|p| p.check(who, is_buddy))
    }

    /// Privacy state changed: notify the protocol so it can resynchronize
    /// its server-side lists.
    pub fn privacy_changed(&self, account: &Account) {
        if let (Some(connection), Some(protocol)) = (
            account.connection(),
            self.inner.protocols.find(account.protocol_id()),
        ) {
            if let Some(privacy) = protocol.privacy_ops() {
                privacy.set_permit_deny(&connection);
            }
        }
    }

    // Roomlists ------------------------------------------------------------

    /// Start fetching the account's room list; rooms arrive through the
    /// `roomlist-room-add` signal and `roomlist-done` marks the end.
    /// Returns whether the protocol supports roomlists at all.
    pub fn get_roomlist(&self, account: &Account) -> bool {
        let (Some(connection), Some(protocol)) = (
            account.connection(),
            self.inner.protocols.find(account.protocol_id()),
        ) else {
            return false;
        };
        let Some(roomlist) = protocol.roomlist_ops() else {
            return false;
        };
        roomlist.get_list(&connection);
        true
    }

    /// Abandon a running room list fetch.
    pub fn cancel_roomlist(&self, account: &Account) {
        if let (Some(connection), Some(protocol)) = (
            account.connection(),
            self.inner.protocols.find(account.protocol_id()),
        ) {
            if let Some(roomlist) = protocol.roomlist_ops() {
                roomlist.cancel(&connection);
            }
        }
    }

    /// Whether a room list fetch is in flight for the account.
    pub fn roomlist_in_progress(&self, account: &Account) -> bool {
        let (Some(connection), Some(protocol)) = (
            account.connection(),
            self.inner.protocols.find(account.protocol_id()),
        ) else {
            return false;
        };
        protocol
            .roomlist_ops()
            .is_some_and(|r| r.in_progress(&connection))
    }

    // Xfers ----------------------------------------------------------------

    pub(crate) fn register_xfer(&self, xfer: &Xfer) {
        self.inner.xfers.borrow_mut().push(xfer.clone());
    }

    pub(crate) fn unregister_xfer(&self, xfer: &Xfer) {
        self.inner.xfers.borrow_mut().retain(|x| !x.same(xfer));
    }

    pub fn xfers(&self) -> Vec<Xfer> {
        self.inner.xfers.borrow().clone()
    }

    fn register_core_signals(&self) {
        use crate::server::{
            BlockedImEvent, BuddyEvent, ChatInEvent, ImMsgEvent, TypingEvent,
        };
        let s = &self.inner.signals;
        let _ = s.register::<ImMsgEvent>("receiving-im-msg");
        let _ = s.register::<ImMsgEvent>("received-im-msg");
        let _ = s.register::<BlockedImEvent>("blocked-im-msg");
        let _ = s.register::<ImMsgEvent>("sending-im-msg");
        let _ = s.register::<ImMsgEvent>("sent-im-msg");
        let _ = s.register::<TypingEvent>("buddy-typing");
        let _ = s.register::<TypingEvent>("buddy-typing-stopped");
        let _ = s.register::<ChatInEvent>("receiving-chat-msg");
        let _ = s.register::<ChatInEvent>("received-chat-msg");
        let _ = s.register::<BuddyEvent>("buddy-signed-on");
        let _ = s.register::<BuddyEvent>("buddy-signed-off");
        let _ = s.register::<BuddyEvent>("buddy-status-changed");
        let _ = s.register::<Connection>("signed-on");
        let _ = s.register::<Connection>("signed-off");
        let _ = s.register::<(Connection, ConnectionError)>("connection-error");
        let _ = s.register::<crate::protocol::RoomlistRoomEvent>("roomlist-room-add");
        let _ = s.register::<crate::protocol::RoomlistDoneEvent>("roomlist-done");
        crate::xfer::register_signals(s);
    }
}

/// Adapter wiring connection events into signals and account UI ops.
struct CoreConnectionUi {
    core: Weak<CoreInner>,
    account: Account,
}

impl CoreConnectionUi {
    fn core(&self) -> Option<Core> {
        self.core.upgrade().map(Core::from_inner)
    }
}

impl ConnectionUiOps for CoreConnectionUi {
    fn update_progress(&self, _conn: &Connection, text: &str, step: usize, total: usize) {
        if let Some(core) = self.core() {
            core.account_ui()
                .connecting_progress(&self.account, text, step, total);
        }
    }

    fn connected(&self, conn: &Connection) {
        let Some(core) = self.core() else {
            return;
        };
        self.account.with_presence_mut(|p| {
            p.set_status(crate::account::Status::new(
                crate::account::StatusPrimitive::Available,
            ));
            p.set_login_time(Some(crate::conversation::now_epoch()));
        });
        core.start_keepalive(&self.account, conn);
        core.account_ui().connected(&self.account);
        let mut arg = conn.clone();
        let _ = core.signals().emit("signed-on", &mut arg);
    }

    fn disconnected(&self, conn: &Connection) {
        if let Some(core) = self.core() {
            core.account_ui().disconnected(&self.account);
            let mut arg = conn.clone();
            let _ = core.signals().emit("signed-off", &mut arg);
        }
    }

    fn report_error(&self, conn: &Connection, error: &ConnectionError) {
        let Some(core) = self.core() else {
            return;
        };
        if matches!(error, ConnectionError::AuthenticationFailed(_)) {
            self.account.purge_unsaved_password();
        }
        if let Some(id) = conn.keepalive_timer() {
            core.event_loop().cancel(id);
            conn.set_keepalive_timer(None);
        }
        // Run the protocol's teardown so per-session state (and the
        // connection's protocol payload) is released.
        if let Some(protocol) = core.protocols().find(self.account.protocol_id()) {
            protocol.close(conn);
        }
        self.account.set_connection(None);
        core.account_ui().connection_error(&self.account, error);
        let mut arg = (conn.clone(), error.clone());
        let _ = core.signals().emit("connection-error", &mut arg);
    }
}

impl Core {
    fn start_keepalive(&self, account: &Account, conn: &Connection) {
        let Some(protocol) = self.inner.protocols.find(account.protocol_id()) else {
            return;
        };
        let Some(interval) = protocol.server_ops().and_then(|s| s.keepalive_interval()) else {
            return;
        };
        let conn_for_timer = conn.clone();
        let weak = self.downgrade();
        let id = self.inner.ev.schedule_after_seconds(interval, move || {
            let conn = &conn_for_timer;
            if weak.upgrade().is_none() || !conn.is_connected() {
                return false;
            }
            let Some(core) = weak.upgrade().map(Core::from_inner) else {
                return false;
            };
            let Some(account) = conn.account() else {
                return false;
            };
            if conn.idle_seconds() >= interval {
                if let Some(protocol) = core.protocols().find(account.protocol_id()) {
                    if let Some(server) = protocol.server_ops() {
                        server.keepalive(&conn);
                    }
                }
            }
            true
        });
        conn.set_keepalive_timer(Some(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_once_per_thread() {
        let core = Core::init().unwrap();
        assert!(matches!(Core::init(), Err(CoreError::AlreadyInitialized)));
        core.shutdown();
        // After shutdown a fresh init works again.
        let core2 = Core::init().unwrap();
        core2.shutdown();
    }

    #[test]
    fn test_account_crud() {
        let core = Core::init().unwrap();
        let a = core.add_account(Account::new("irc", "me"));
        assert!(core.find_account("irc", "me").is_some());
        assert!(core.find_account("irc", "nobody").is_none());
        core.remove_account(&a);
        assert!(core.find_account("irc", "me").is_none());
        core.shutdown();
    }

    #[test]
    fn test_connect_unknown_protocol() {
        let core = Core::init().unwrap();
        let a = core.add_account(Account::new("nonexistent", "me"));
        assert!(matches!(
            core.connect_account(&a),
            Err(CoreError::UnknownProtocol(_))
        ));
        core.shutdown();
    }
}
