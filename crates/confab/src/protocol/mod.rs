//! The protocol plugin framework.
//!
//! A protocol implements [`Protocol`] plus whichever capability traits it
//! supports. Capabilities are discovered through `Option<&dyn …>` accessors,
//! so adding a capability is adding a trait, never changing an existing
//! one. Unknown capabilities are simply `None` to older callers.

pub mod connection;
pub mod gg;
pub mod irc;
mod registry;
pub mod xmpp;

pub use connection::{Connection, ConnectionError, ConnectionState, ConnectionUiOps, connflags};
pub use registry::ProtocolRegistry;

use std::collections::HashMap;
use std::rc::Rc;

use crate::account::{Account, Buddy, SettingValue, Status, StatusType};
use crate::conversation::TypingState;
use crate::core::Core;
use crate::xfer::Xfer;

/// A typed account option a protocol declares for its configuration UI.
#[derive(Debug, Clone)]
pub struct AccountOption {
    pub key: String,
    pub label: String,
    pub default: SettingValue,
}

impl AccountOption {
    pub fn bool(key: &str, label: &str, default: bool) -> AccountOption {
        AccountOption {
            key: key.into(),
            label: label.into(),
            default: SettingValue::Bool(default),
        }
    }

    pub fn int(key: &str, label: &str, default: i64) -> AccountOption {
        AccountOption {
            key: key.into(),
            label: label.into(),
            default: SettingValue::Int(default),
        }
    }

    pub fn string(key: &str, label: &str, default: &str) -> AccountOption {
        AccountOption {
            key: key.into(),
            label: label.into(),
            default: SettingValue::Str(default.into()),
        }
    }
}

/// How a username splits into parts (`user@server` and the like).
#[derive(Debug, Clone)]
pub struct UserSplit {
    pub label: String,
    pub separator: char,
    pub default: String,
}

/// One field of a chat join form.
#[derive(Debug, Clone)]
pub struct ChatField {
    pub id: String,
    pub label: String,
    pub required: bool,
    pub secret: bool,
}

/// An attention (nudge/buzz) kind a protocol can send.
#[derive(Debug, Clone)]
pub struct AttentionType {
    pub id: String,
    pub name: String,
    /// "%s has buzzed you!"
    pub incoming_description: String,
}

/// A room in a roomlist fetch.
#[derive(Debug, Clone)]
pub struct Room {
    pub name: String,
    pub description: Option<String>,
    pub user_count: Option<u32>,
}

/// Signal payload: one room discovered during a roomlist fetch.
pub struct RoomlistRoomEvent {
    pub account: Account,
    pub room: Room,
}

/// Signal payload: the roomlist fetch finished (or was cancelled).
pub struct RoomlistDoneEvent {
    pub account: Account,
    pub cancelled: bool,
}

/// The base protocol interface.
pub trait Protocol {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    fn list_icon(&self, _account: Option<&Account>) -> &str {
        "im"
    }

    fn account_options(&self) -> Vec<AccountOption> {
        Vec::new()
    }

    fn user_splits(&self) -> Vec<UserSplit> {
        Vec::new()
    }

    /// Statuses this protocol can express for the account.
    fn status_types(&self, account: &Account) -> Vec<StatusType>;

    /// Begin a session. The connection is already in `Connecting` state;
    /// the protocol must eventually emit exactly one of signed-on or
    /// connection-error on it.
    fn login(&self, core: &Core, connection: &Connection);

    /// Tear the session down. Must be idempotent.
    fn close(&self, connection: &Connection);

    /// Drop the protocol-private payload of a removed buddy.
    fn buddy_free(&self, buddy: &Buddy) {
        let _ = buddy.take_proto_data();
    }

    // Capability discovery -------------------------------------------------

    fn server_ops(&self) -> Option<&dyn ServerOps> {
        None
    }

    fn im_ops(&self) -> Option<&dyn ImOps> {
        None
    }

    fn chat_ops(&self) -> Option<&dyn ChatOps> {
        None
    }

    fn privacy_ops(&self) -> Option<&dyn PrivacyOps> {
        None
    }

    fn xfer_ops(&self) -> Option<&dyn XferOps> {
        None
    }

    fn media_ops(&self) -> Option<&dyn MediaOps> {
        None
    }

    fn attention_ops(&self) -> Option<&dyn AttentionOps> {
        None
    }

    fn roomlist_ops(&self) -> Option<&dyn RoomlistOps> {
        None
    }
}

/// Server-side bookkeeping operations.
pub trait ServerOps {
    fn set_status(&self, _account: &Account, _status: &Status) {}
    fn get_info(&self, _gc: &Connection, _who: &str) {}
    fn set_buddy_icon(&self, _gc: &Connection, _icon: Option<&[u8]>) {}
    fn add_buddy(&self, _gc: &Connection, _buddy: &Buddy, _group: &str) {}
    fn remove_buddy(&self, _gc: &Connection, _buddy: &Buddy, _group: &str) {}
    fn alias_buddy(&self, _gc: &Connection, _who: &str, _alias: Option<&str>) {}
    fn group_buddy(&self, _gc: &Connection, _who: &str, _old: &str, _new: &str) {}
    fn rename_group(&self, _gc: &Connection, _old: &str, _new: &str, _buddies: &[Buddy]) {}

    /// Periodic no-op to keep the session alive / detect death.
    fn keepalive(&self, _gc: &Connection) {}

    /// Seconds of quiet before `keepalive` should run. `None` disables.
    fn keepalive_interval(&self) -> Option<u64> {
        Some(30)
    }

    fn register_user(&self, _account: &Account) {}
    fn unregister_user(&self, _account: &Account) {}

    /// Write raw protocol data; returns bytes accepted or a negative errno.
    fn send_raw(&self, _gc: &Connection, _buf: &[u8]) -> i32 {
        -(libc::ENOSYS)
    }
}

/// 1:1 messaging.
pub trait ImOps {
    /// Send a message; returns bytes accepted, 0 for "queued", or a
    /// negative errno.
    fn send(&self, gc: &Connection, who: &str, message: &str, flags: u32) -> i32;

    fn send_typing(&self, _gc: &Connection, _who: &str, _state: TypingState) {}
}

/// Multi-user chats.
pub trait ChatOps {
    /// Fields of the join form.
    fn info(&self) -> Vec<ChatField>;

    /// Default join-form values for a room name.
    fn info_defaults(&self, gc: &Connection, room: &str) -> HashMap<String, String>;

    fn join(&self, gc: &Connection, components: &HashMap<String, String>);
    fn leave(&self, gc: &Connection, id: i32);

    /// Returns bytes accepted or a negative errno.
    fn send(&self, gc: &Connection, id: i32, message: &str, flags: u32) -> i32;

    fn invite(&self, _gc: &Connection, _id: i32, _who: &str, _message: &str) {}
    fn set_topic(&self, _gc: &Connection, _id: i32, _topic: &str) {}

    /// Canonical room name from join components.
    fn get_name(&self, _components: &HashMap<String, String>) -> Option<String> {
        None
    }

    fn get_user_real_name(&self, _gc: &Connection, _id: i32, _who: &str) -> Option<String> {
        None
    }
}

/// Server-side privacy list maintenance.
pub trait PrivacyOps {
    fn add_permit(&self, _gc: &Connection, _who: &str) {}
    fn rem_permit(&self, _gc: &Connection, _who: &str) {}
    fn add_deny(&self, _gc: &Connection, _who: &str) {}
    fn rem_deny(&self, _gc: &Connection, _who: &str) {}

    /// The policy or a list changed wholesale; resynchronize.
    fn set_permit_deny(&self, _gc: &Connection) {}
}

/// File transfers.
pub trait XferOps {
    fn can_receive(&self, _gc: &Connection, _who: &str) -> bool {
        true
    }

    /// Create an outgoing transfer object for `who`.
    fn new_xfer(&self, gc: &Connection, who: &str) -> Option<Xfer>;

    /// Offer a file (UI flow picks the path when `filename` is `None`).
    fn send_file(&self, gc: &Connection, who: &str, filename: Option<&str>);
}

/// Media capability probe; the core implements no media itself.
pub trait MediaOps {
    /// Union of the peer's resource capabilities, see [`crate::media`].
    fn get_caps(&self, account: &Account, who: &str) -> u32;

    /// Kick off a session; returns whether initiation was attempted.
    fn initiate(&self, _account: &Account, _who: &str, _media_type: u32) -> bool {
        false
    }
}

/// Nudge / buzz.
pub trait AttentionOps {
    fn types(&self) -> Vec<AttentionType>;

    /// Returns whether the attention was sent.
    fn send_attention(&self, gc: &Connection, who: &str, type_id: &str) -> bool;
}

/// Room list fetching.
pub trait RoomlistOps {
    /// Start fetching; rooms are delivered through the `roomlist-room-add`
    /// signal, completion through `roomlist-done`.
    fn get_list(&self, gc: &Connection);

    fn cancel(&self, _gc: &Connection) {}

    /// Whether a fetch is currently running.
    fn in_progress(&self, _gc: &Connection) -> bool {
        false
    }
}

/// Shorthand used by the core when routing to capability interfaces.
pub type ProtocolRef = Rc<dyn Protocol>;
