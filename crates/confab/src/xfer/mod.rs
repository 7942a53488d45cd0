//! The file-transfer engine.
//!
//! A generic pump moves bytes between a local file and a transport the
//! protocol supplied (a socket, or any protocol-mediated byte stream).
//! The pump only runs while both bits of the ready mask are set; after an
//! iteration that consumed a buffer both bits clear, and each side re-arms
//! its own bit. Sides that don't need pacing leave auto-ready on and never
//! notice the gate.
//!
//! Local file access can be overridden by plugins through the `open-local`,
//! `query-local`, `read-local` and `write-local` signals (an in-memory blob
//! or cache can stand in for the filesystem).

mod pump;

use std::cell::{Cell, RefCell};
use std::path::{Component, Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;

use crate::account::Account;
use crate::conversation::now_epoch;
use crate::core::{Core, CoreInner};
use crate::debug;
use crate::signals::SignalBus;

/// Initial pump buffer size.
pub const BUF_INITIAL: usize = 4096;
/// Pump buffer ceiling.
pub const BUF_MAX: usize = 65535;

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDirection {
    Send,
    Receive,
}

/// Transfer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XferStatus {
    #[default]
    NotStarted,
    Accepted,
    Started,
    Done,
    CancelLocal,
    CancelRemote,
}

/// The two-bit pump gate.
pub mod ready {
    pub const NONE: u8 = 0;
    pub const UI: u8 = 0x1;
    pub const PROTOCOL: u8 = 0x2;
    pub const BOTH: u8 = UI | PROTOCOL;
}

/// Byte stream the pump talks to. Protocol-mediated transports implement
/// the tokio traits over whatever framing they need.
pub trait XferTransport: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> XferTransport for T {}

/// Protocol hooks on one transfer.
#[derive(Default)]
pub struct XferHooks {
    /// The user accepted (and picked a path where needed): tell the peer.
    pub init: Option<Box<dyn Fn(&Xfer)>>,
    /// The user declined the request.
    pub request_denied: Option<Box<dyn Fn(&Xfer)>>,
    /// Pump finished cleanly.
    pub end: Option<Box<dyn Fn(&Xfer)>>,
    /// We cancelled.
    pub cancel_send: Option<Box<dyn Fn(&Xfer)>>,
    /// The peer cancelled.
    pub cancel_recv: Option<Box<dyn Fn(&Xfer)>>,
}

/// Embedder surface for transfers.
pub trait XferUiOps {
    fn add(&self, _xfer: &Xfer) {}
    fn update_progress(&self, _xfer: &Xfer, _fraction: f64) {}
    fn ended(&self, _xfer: &Xfer) {}
    fn cancelled(&self, _xfer: &Xfer) {}
    fn error(&self, _xfer: &Xfer, _message: &str) {}
}

pub(crate) struct XferInner {
    core: Weak<CoreInner>,
    account: Account,
    peer: String,
    direction: XferDirection,
    status: Cell<XferStatus>,
    /// Name the remote advertised (receive) or we will advertise (send).
    remote_filename: RefCell<Option<String>>,
    local_filename: RefCell<Option<PathBuf>>,
    message: RefCell<Option<String>>,
    size: Cell<u64>,
    bytes_sent: Cell<u64>,
    start_time: Cell<Option<Instant>>,
    end_time: Cell<Option<Instant>>,
    thumbnail: RefCell<Option<(Vec<u8>, String)>>,
    ready: Cell<u8>,
    ui_auto_ready: Cell<bool>,
    protocol_auto_ready: Cell<bool>,
    ready_gate: Notify,
    buf_size: Cell<usize>,
    hooks: RefCell<Rc<XferHooks>>,
    transport: RefCell<Option<Box<dyn XferTransport>>>,
    cancelled: Cell<bool>,
}

/// Handle to one transfer. Clones share state.
#[derive(Clone)]
pub struct Xfer {
    inner: Rc<XferInner>,
}

// Signal payloads ----------------------------------------------------------

/// An incoming transfer was requested; handlers may accept it by setting a
/// local filename, or cancel it, before the UI is prompted.
pub struct FileRecvRequestEvent {
    pub xfer: Xfer,
}

/// Pump asks to open the local file; a handler that takes over sets
/// `handled`.
pub struct OpenLocalEvent {
    pub xfer: Xfer,
    pub handled: bool,
}

/// Pump asks for the local size when no file backs the transfer.
pub struct QueryLocalEvent {
    pub xfer: Xfer,
    pub size: Option<u64>,
}

/// Pump wants up to `want` bytes of local data; a handler supplies `data`.
pub struct ReadLocalEvent {
    pub xfer: Xfer,
    pub want: usize,
    pub data: Option<Vec<u8>>,
}

/// Pump has received bytes; a handler that stores them itself sets
/// `handled`.
pub struct WriteLocalEvent {
    pub xfer: Xfer,
    pub data: Vec<u8>,
    pub handled: bool,
}

/// A partial write left bytes unsent; they are carried into the next pump
/// iteration.
pub struct DataNotSentEvent {
    pub xfer: Xfer,
    pub data: Vec<u8>,
}

/// A send request is about to go out; a handler may attach a thumbnail.
pub struct AddThumbnailEvent {
    pub xfer: Xfer,
    pub supported_formats: String,
}

/// Register the transfer signals on the core bus. Called from core init.
pub(crate) fn register_signals(bus: &SignalBus) {
    let _ = bus.register::<FileRecvRequestEvent>("file-recv-request");
    let _ = bus.register::<OpenLocalEvent>("open-local");
    let _ = bus.register::<QueryLocalEvent>("query-local");
    let _ = bus.register::<ReadLocalEvent>("read-local");
    let _ = bus.register::<WriteLocalEvent>("write-local");
    let _ = bus.register::<DataNotSentEvent>("data-not-sent");
    let _ = bus.register::<AddThumbnailEvent>("add-thumbnail");
}

fn path_is_sane(path: &Path) -> bool {
    !path.components().any(|c| matches!(c, Component::ParentDir))
}

impl Core {
    /// Create a transfer and register it. Protocols call this from their
    /// xfer capability.
    pub fn new_xfer(&self, account: &Account, direction: XferDirection, peer: &str) -> Xfer {
        let xfer = Xfer {
            inner: Rc::new(XferInner {
                core: self.downgrade(),
                account: account.clone(),
                peer: peer.to_string(),
                direction,
                status: Cell::new(XferStatus::NotStarted),
                remote_filename: RefCell::new(None),
                local_filename: RefCell::new(None),
                message: RefCell::new(None),
                size: Cell::new(0),
                bytes_sent: Cell::new(0),
                start_time: Cell::new(None),
                end_time: Cell::new(None),
                thumbnail: RefCell::new(None),
                ready: Cell::new(ready::NONE),
                ui_auto_ready: Cell::new(true),
                protocol_auto_ready: Cell::new(true),
                ready_gate: Notify::new(),
                buf_size: Cell::new(BUF_INITIAL),
                hooks: RefCell::new(Rc::new(XferHooks::default())),
                transport: RefCell::new(None),
                cancelled: Cell::new(false),
            }),
        };
        self.register_xfer(&xfer);
        xfer
    }
}

impl Xfer {
    // Introspection --------------------------------------------------------

    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn direction(&self) -> XferDirection {
        self.inner.direction
    }

    pub fn status(&self) -> XferStatus {
        self.inner.status.get()
    }

    pub fn same(&self, other: &Xfer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn size(&self) -> u64 {
        self.inner.size.get()
    }

    pub fn set_size(&self, size: u64) {
        self.inner.size.set(size);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.get()
    }

    pub fn progress(&self) -> f64 {
        let size = self.size();
        if size == 0 {
            return 0.0;
        }
        self.bytes_sent() as f64 / size as f64
    }

    pub fn remote_filename(&self) -> Option<String> {
        self.inner.remote_filename.borrow().clone()
    }

    pub fn set_remote_filename(&self, name: impl Into<String>) {
        *self.inner.remote_filename.borrow_mut() = Some(name.into());
    }

    pub fn local_filename(&self) -> Option<PathBuf> {
        self.inner.local_filename.borrow().clone()
    }

    pub fn set_local_filename(&self, path: impl Into<PathBuf>) {
        *self.inner.local_filename.borrow_mut() = Some(path.into());
    }

    pub fn message(&self) -> Option<String> {
        self.inner.message.borrow().clone()
    }

    pub fn set_message(&self, message: Option<String>) {
        *self.inner.message.borrow_mut() = message;
    }

    pub fn thumbnail(&self) -> Option<(Vec<u8>, String)> {
        self.inner.thumbnail.borrow().clone()
    }

    pub fn set_thumbnail(&self, data: Vec<u8>, mime: impl Into<String>) {
        *self.inner.thumbnail.borrow_mut() = Some((data, mime.into()));
    }

    pub fn set_hooks(&self, hooks: XferHooks) {
        *self.inner.hooks.borrow_mut() = Rc::new(hooks);
    }

    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let start = self.inner.start_time.get()?;
        Some(match self.inner.end_time.get() {
            Some(end) => end.duration_since(start),
            None => start.elapsed(),
        })
    }

    fn core(&self) -> Option<Core> {
        self.inner.core.upgrade().map(Core::from_inner)
    }

    fn ui(&self) -> Option<Rc<dyn XferUiOps>> {
        self.core().map(|c| c.xfer_ui())
    }

    // Request flow ---------------------------------------------------------

    /// Kick the transfer off: prompt for a file (send) or for acceptance
    /// (receive).
    pub fn request(&self) {
        match self.inner.direction {
            XferDirection::Send => self.request_send(),
            XferDirection::Receive => self.request_receive(),
        }
    }

    fn request_send(&self) {
        let Some(core) = self.core() else {
            return;
        };
        if let Some(path) = self.local_filename() {
            self.send_file_chosen(path);
            return;
        }
        let this = self.clone();
        core.request_ui().request_file(
            "Select the file to send",
            None,
            false,
            Box::new(move |path| match path {
                Some(path) => this.send_file_chosen(path),
                None => this.request_denied(),
            }),
        );
    }

    fn send_file_chosen(&self, path: PathBuf) {
        let this = self.clone();
        tokio::task::spawn_local(async move {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {
                    this.set_local_filename(path.clone());
                    if this.remote_filename().is_none() {
                        if let Some(name) = path.file_name() {
                            this.set_remote_filename(name.to_string_lossy().to_string());
                        }
                    }
                    this.set_size(meta.len());
                    this.inner.status.set(XferStatus::Accepted);

                    if let Some(core) = this.core() {
                        let mut thumb = AddThumbnailEvent {
                            xfer: this.clone(),
                            supported_formats: "image/png,image/jpeg".into(),
                        };
                        let _ = core.signals().emit("add-thumbnail", &mut thumb);
                        core.xfer_ui().add(&this);
                    }
                    this.run_hook(|h| h.init.as_deref());
                }
                Ok(_) => {
                    this.show_error("The selected file is empty or not a regular file.");
                    this.cancel_local();
                }
                Err(e) => {
                    this.show_error(&format!("Unable to read {}: {e}", path.display()));
                    this.cancel_local();
                }
            }
        });
    }

    fn request_receive(&self) {
        let Some(core) = self.core() else {
            return;
        };

        let mut event = FileRecvRequestEvent { xfer: self.clone() };
        let _ = core.signals().emit("file-recv-request", &mut event);

        // A plugin may have resolved the request already.
        match self.status() {
            XferStatus::CancelLocal | XferStatus::CancelRemote => return,
            XferStatus::NotStarted => {}
            _ => {
                core.xfer_ui().add(self);
                self.run_hook(|h| h.init.as_deref());
                return;
            }
        }

        let who = self.inner.peer.clone();
        let filename = self.remote_filename();
        let prompt = match &filename {
            Some(name) => format!("{who} wants to send you {name}"),
            None => format!("{who} wants to send you a file"),
        };
        let this = self.clone();
        core.request_ui().request_accept(
            "Incoming file transfer",
            &prompt,
            Box::new(move |accepted| {
                if !accepted {
                    this.request_denied();
                    return;
                }
                let Some(core) = this.core() else {
                    return;
                };
                let this2 = this.clone();
                core.request_ui().request_file(
                    "Save file as…",
                    this.remote_filename().as_deref(),
                    true,
                    Box::new(move |path| match path {
                        Some(path) => this2.request_accepted(path),
                        None => this2.request_denied(),
                    }),
                );
            }),
        );
    }

    /// The user accepted and picked a destination. Rejects escape-y paths.
    pub fn request_accepted(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !path_is_sane(&path) {
            self.show_error("Invalid destination path.");
            self.cancel_local();
            return;
        }
        self.set_local_filename(path);
        self.inner.status.set(XferStatus::Accepted);
        if let Some(core) = self.core() {
            core.xfer_ui().add(self);
        }
        self.run_hook(|h| h.init.as_deref());
    }

    /// The user declined the request.
    pub fn request_denied(&self) {
        debug::info("xfer", &format!("request for {} denied", self.inner.peer));
        self.run_hook(|h| h.request_denied.as_deref());
        self.inner.status.set(XferStatus::CancelLocal);
        self.teardown();
    }

    // Ready mask -----------------------------------------------------------

    /// The UI paces the pump manually from now on.
    pub fn set_ui_paced(&self) {
        self.inner.ui_auto_ready.set(false);
    }

    /// The protocol paces the pump manually from now on.
    pub fn set_protocol_paced(&self) {
        self.inner.protocol_auto_ready.set(false);
    }

    /// The UI is ready for another buffer.
    pub fn ui_ready(&self) {
        self.set_ready_bit(ready::UI);
    }

    /// The protocol is ready for another buffer.
    pub fn protocol_ready(&self) {
        self.set_ready_bit(ready::PROTOCOL);
    }

    fn set_ready_bit(&self, bit: u8) {
        let mask = self.inner.ready.get() | bit;
        self.inner.ready.set(mask);
        if mask == ready::BOTH {
            self.inner.ready_gate.notify_one();
        } else {
            debug::misc(
                "xfer",
                &format!(
                    "{} ready, waiting for {}",
                    if bit == ready::UI { "UI" } else { "protocol" },
                    if bit == ready::UI { "protocol" } else { "UI" }
                ),
            );
        }
    }

    pub fn ready_mask(&self) -> u8 {
        self.inner.ready.get()
    }

    /// Called by the pump after an iteration that consumed a buffer: both
    /// sides must re-arm. Auto-ready sides re-arm immediately.
    fn clear_ready(&self) {
        self.inner.ready.set(ready::NONE);
        if self.inner.ui_auto_ready.get() {
            self.inner.ready.set(self.inner.ready.get() | ready::UI);
        }
        if self.inner.protocol_auto_ready.get() {
            self.inner.ready.set(self.inner.ready.get() | ready::PROTOCOL);
        }
    }

    async fn await_ready(&self) {
        loop {
            if self.inner.cancelled.get() {
                return;
            }
            if self.inner.ready.get() == ready::BOTH {
                return;
            }
            self.inner.ready_gate.notified().await;
        }
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.inner.buf_size.get()
    }

    fn grow_buffer(&self) {
        let grown = (self.buffer_size() * 3 / 2).min(BUF_MAX);
        self.inner.buf_size.set(grown);
    }

    // Start / pump ---------------------------------------------------------

    /// Begin moving bytes over `transport`. For sends the remote must have
    /// accepted (we are in `Accepted`); receives likewise.
    pub fn start(&self, transport: Box<dyn XferTransport>) {
        if self.status() != XferStatus::Accepted {
            debug::error(
                "xfer",
                &format!("start in state {:?} refused", self.status()),
            );
            return;
        }
        *self.inner.transport.borrow_mut() = Some(transport);
        self.inner.status.set(XferStatus::Started);
        self.inner.start_time.set(Some(Instant::now()));
        self.clear_ready();
        let this = self.clone();
        tokio::task::spawn_local(async move {
            pump::run(this).await;
        });
    }

    /// Resolve `host:port`, connect, then start. The async counterpart of
    /// handing in a ready socket.
    pub fn start_connect(&self, host: String, port: u16) {
        let Some(core) = self.core() else {
            return;
        };
        let this = self.clone();
        let connector = core.connector().clone();
        tokio::task::spawn_local(async move {
            match connector.connect(&host, port).await {
                Ok(stream) => this.start(Box::new(stream)),
                Err(e) => {
                    this.show_error(&format!("Unable to connect: {e}"));
                    this.cancel_local();
                }
            }
        });
    }

    // Endings --------------------------------------------------------------

    pub(crate) fn finish(&self) {
        if self.status() == XferStatus::Done {
            return;
        }
        self.inner.status.set(XferStatus::Done);
        self.inner.end_time.set(Some(Instant::now()));
        self.inner.cancelled.set(true);
        self.inner.ready_gate.notify_one();

        let name = self.display_name();
        debug::info("xfer", &format!("transfer of {name} complete"));
        self.write_conv_message(&match self.inner.direction {
            XferDirection::Send => format!("Successfully sent {name} to {}", self.inner.peer),
            XferDirection::Receive => {
                format!("Successfully received {name} from {}", self.inner.peer)
            }
        });
        self.run_hook(|h| h.end.as_deref());
        if let Some(ui) = self.ui() {
            ui.ended(self);
        }
        if let Some(core) = self.core() {
            core.unregister_xfer(self);
        }
    }

    /// We are cancelling.
    pub fn cancel_local(&self) {
        if matches!(self.status(), XferStatus::Done | XferStatus::CancelLocal) {
            return;
        }
        self.inner.status.set(XferStatus::CancelLocal);
        self.inner.end_time.set(Some(Instant::now()));
        self.inner.cancelled.set(true);
        self.inner.ready_gate.notify_one();

        let name = self.display_name();
        self.write_conv_message(&format!("You cancelled the transfer of {name}"));
        match self.inner.direction {
            XferDirection::Send => self.run_hook(|h| h.cancel_send.as_deref()),
            XferDirection::Receive => self.run_hook(|h| h.cancel_recv.as_deref()),
        }
        if let Some(ui) = self.ui() {
            ui.cancelled(self);
        }
        self.teardown();
    }

    /// The peer cancelled.
    pub fn cancel_remote(&self) {
        if matches!(
            self.status(),
            XferStatus::Done | XferStatus::CancelLocal | XferStatus::CancelRemote
        ) {
            return;
        }
        self.inner.status.set(XferStatus::CancelRemote);
        self.inner.end_time.set(Some(Instant::now()));
        self.inner.cancelled.set(true);
        self.inner.ready_gate.notify_one();

        let name = self.display_name();
        let text = format!("{} cancelled the transfer of {name}", self.inner.peer);
        self.write_conv_message(&text);
        self.show_error(&text);
        match self.inner.direction {
            XferDirection::Send => self.run_hook(|h| h.cancel_send.as_deref()),
            XferDirection::Receive => self.run_hook(|h| h.cancel_recv.as_deref()),
        }
        if let Some(ui) = self.ui() {
            ui.cancelled(self);
        }
        self.teardown();
    }

    /// Drop buffers and deregister. Safe to call repeatedly.
    pub(crate) fn teardown(&self) {
        self.inner.cancelled.set(true);
        self.inner.ready_gate.notify_one();
        self.inner.transport.borrow_mut().take();
        if let Some(core) = self.core() {
            core.unregister_xfer(self);
        }
    }

    // Internals shared with the pump ---------------------------------------

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    pub(crate) fn take_transport(&self) -> Option<Box<dyn XferTransport>> {
        self.inner.transport.borrow_mut().take()
    }

    pub(crate) fn add_bytes_sent(&self, n: u64) {
        self.inner.bytes_sent.set(self.inner.bytes_sent.get() + n);
        if let Some(ui) = self.ui() {
            ui.update_progress(self, self.progress());
        }
    }

    pub(crate) fn maybe_grow_buffer(&self, consumed: usize) {
        if consumed == self.buffer_size() {
            self.grow_buffer();
        }
    }

    pub(crate) fn pump_iteration_done(&self) {
        self.clear_ready();
    }

    pub(crate) fn signals(&self) -> Option<SignalBus> {
        self.core().map(|c| c.signals().clone())
    }

    pub(crate) fn display_name(&self) -> String {
        self.remote_filename()
            .or_else(|| {
                self.local_filename()
                    .map(|p| p.file_name().unwrap_or_default().to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "a file".to_string())
    }

    pub(crate) fn show_error(&self, message: &str) {
        debug::error("xfer", message);
        if let Some(ui) = self.ui() {
            ui.error(self, message);
        }
        if let Some(core) = self.core() {
            core.request_ui().show_error("File transfer failed", message);
        }
    }

    fn write_conv_message(&self, text: &str) {
        if let Some(core) = self.core() {
            let conv =
                core.with_conversations(|c| c.ensure_im(&self.inner.account, &self.inner.peer));
            conv.push_system(text);
            let msg = conv.last_message().unwrap_or(crate::conversation::Message {
                who: String::new(),
                content: text.to_string(),
                flags: crate::conversation::flags::SYSTEM,
                when: now_epoch(),
            });
            core.conversation_ui().wrote_message(&conv, &msg);
        }
    }

    fn run_hook(&self, pick: impl FnOnce(&XferHooks) -> Option<&(dyn Fn(&Xfer))>) {
        // Hooks may call back into the xfer; clone out of the cell first.
        let hooks = Rc::clone(&*self.inner.hooks.borrow());
        if let Some(hook) = pick(&hooks) {
            hook(self);
        }
    }
}

impl std::fmt::Debug for Xfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xfer")
            .field("peer", &self.inner.peer)
            .field("direction", &self.inner.direction)
            .field("status", &self.status())
            .field("bytes", &self.bytes_sent())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_sanity() {
        assert!(path_is_sane(Path::new("/home/user/file.bin")));
        assert!(path_is_sane(Path::new("relative/file.bin")));
        assert!(!path_is_sane(Path::new("../escape.bin")));
        assert!(!path_is_sane(Path::new("/home/../../etc/passwd")));
    }

    #[test]
    fn test_ready_mask_gating() {
        let core = Core::init().unwrap();
        let account = core.add_account(Account::new("x", "me"));
        let xfer = core.new_xfer(&account, XferDirection::Receive, "peer");
        xfer.set_ui_paced();
        xfer.set_protocol_paced();

        assert_eq!(xfer.ready_mask(), ready::NONE);
        xfer.ui_ready();
        assert_eq!(xfer.ready_mask(), ready::UI);
        xfer.protocol_ready();
        assert_eq!(xfer.ready_mask(), ready::BOTH);

        xfer.pump_iteration_done();
        assert_eq!(xfer.ready_mask(), ready::NONE);
        core.shutdown();
    }

    #[test]
    fn test_auto_ready_rearms() {
        let core = Core::init().unwrap();
        let account = core.add_account(Account::new("x", "me"));
        let xfer = core.new_xfer(&account, XferDirection::Send, "peer");
        // Neither side paces: the gate re-arms itself.
        xfer.pump_iteration_done();
        assert_eq!(xfer.ready_mask(), ready::BOTH);
        core.shutdown();
    }

    #[test]
    fn test_registration() {
        let core = Core::init().unwrap();
        let account = core.add_account(Account::new("x", "me"));
        let xfer = core.new_xfer(&account, XferDirection::Send, "peer");
        assert_eq!(core.xfers().len(), 1);
        xfer.teardown();
        assert!(core.xfers().is_empty());
        core.shutdown();
    }

    #[test]
    fn test_request_accepted_rejects_escapes() {
        let core = Core::init().unwrap();
        let account = core.add_account(Account::new("x", "me"));
        let xfer = core.new_xfer(&account, XferDirection::Receive, "peer");
        xfer.set_remote_filename("innocent.txt");
        xfer.request_accepted("../../etc/shadow");
        assert_eq!(xfer.status(), XferStatus::CancelLocal);
        core.shutdown();
    }

    #[test]
    fn test_progress() {
        let core = Core::init().unwrap();
        let account = core.add_account(Account::new("x", "me"));
        let xfer = core.new_xfer(&account, XferDirection::Send, "peer");
        xfer.set_size(1000);
        xfer.add_bytes_sent(250);
        assert!((xfer.progress() - 0.25).abs() < f64::EPSILON);
        assert!(xfer.bytes_sent() <= xfer.size());
        core.shutdown();
    }
}
