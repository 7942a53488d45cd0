//! Multi-protocol instant messaging core library.
//!
//! Confab maintains live sessions to heterogeneous IM networks (XMPP, IRC,
//! Gadu-Gadu, and anything else implementing the protocol traits),
//! translates their wire protocols into one model of accounts, buddies,
//! presences, conversations and file transfers, and surfaces that model to
//! an embedding UI through a narrow set of callback traits.
//!
//! The core is strictly single-threaded and cooperative: run it inside a
//! tokio current-thread runtime with a `LocalSet`. Resolver helpers (child
//! processes, worker threads) are the only things that leave the loop, and
//! they re-enter it before touching shared state.
//!
//! # Example
//!
//! ```ignore
//! use std::rc::Rc;
//! use confab::core::Core;
//! use confab::account::Account;
//! use confab::protocol::xmpp::XmppProtocol;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let local = tokio::task::LocalSet::new();
//!     local.run_until(async {
//!         let core = Core::init().unwrap();
//!         core.protocols().add(Rc::new(XmppProtocol::new()));
//!
//!         let account = core.add_account(Account::new("xmpp", "romeo@example.net"));
//!         account.set_password(Some("secret".into()));
//!         core.connect_account(&account).unwrap();
//!
//!         // ... drive the loop; UI ops deliver events ...
//!         core.shutdown();
//!     }).await;
//! }
//! ```
//!
//! # Extending
//!
//! Plugins hook the signal bus (`receiving-im-msg` and friends) to rewrite
//! or veto traffic; protocols implement [`protocol::Protocol`] plus
//! whatever capability traits they support.

pub mod account;
pub mod conversation;
pub mod core;
pub mod debug;
pub mod eventloop;
pub mod media;
pub mod net;
pub mod plugin;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod signals;
pub mod util;
pub mod xfer;
pub mod xml;

// Re-export the types nearly every embedder touches.
pub use account::{Account, Buddy, BuddyList, Group, Presence, PrivacyPolicy, Status, StatusPrimitive};
pub use conversation::{Conversation, Message, TypingState};
pub use core::{Core, CoreError};
pub use eventloop::{Cond, EventLoop, EventLoopOps, SourceId};
pub use plugin::{ABI_VERSION, Plugin, PluginInfo, PluginRegistry};
pub use protocol::{Connection, ConnectionError, ConnectionState, Protocol};
pub use resolver::{Backend, DnsQuery, Resolver, SrvTarget};
pub use signals::{HandlerId, SignalBus};
pub use xfer::{Xfer, XferDirection, XferStatus};
pub use xml::Element;
