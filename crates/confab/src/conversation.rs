//! Conversations: 1:1 IMs and multi-user chats.
//!
//! An IM conversation is keyed by the remote user; a chat by the integer id
//! the protocol assigned when the join completed. Each conversation keeps a
//! bounded history window; the embedder's UI is the real transcript.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::account::Account;

/// Message flags, combined bitwise.
pub mod flags {
    /// An outgoing message.
    pub const SEND: u32 = 1 << 0;
    /// An incoming message.
    pub const RECV: u32 = 1 << 1;
    /// Generated by the core, not a person.
    pub const SYSTEM: u32 = 1 << 2;
    /// An automatic response.
    pub const AUTO_RESP: u32 = 1 << 3;
    /// Delivery failed.
    pub const ERROR: u32 = 1 << 4;
    /// Keep out of logs.
    pub const NO_LOG: u32 = 1 << 5;
    /// Should raise attention.
    pub const NOTIFY: u32 = 1 << 6;
    /// Contains the user's nick.
    pub const NICK_MENTION: u32 = 1 << 7;
}

/// Chat participant flags.
pub mod cbflags {
    pub const VOICE: u32 = 1 << 0;
    pub const HALFOP: u32 = 1 << 1;
    pub const OP: u32 = 1 << 2;
    pub const FOUNDER: u32 = 1 << 3;
    pub const TYPING: u32 = 1 << 4;
}

/// Bound on the in-core history window.
pub const HISTORY_MAX: usize = 200;

/// Remote typing state for an IM conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypingState {
    #[default]
    NotTyping,
    Typing,
    /// Typed something, then stopped.
    Typed,
}

/// One recorded message.
#[derive(Debug, Clone)]
pub struct Message {
    pub who: String,
    pub content: String,
    pub flags: u32,
    /// Seconds since the epoch.
    pub when: i64,
}

/// A chat participant.
#[derive(Debug, Clone)]
pub struct ChatUser {
    pub name: String,
    pub flags: u32,
}

enum Kind {
    Im {
        typing: Cell<TypingState>,
    },
    Chat {
        id: i32,
        nick: RefCell<String>,
        topic: RefCell<Option<String>>,
        users: RefCell<Vec<ChatUser>>,
        left: Cell<bool>,
    },
}

struct ConvInner {
    account: Account,
    name: String,
    kind: Kind,
    history: RefCell<VecDeque<Message>>,
}

/// Handle to one conversation. Clones share state.
#[derive(Clone)]
pub struct Conversation {
    inner: Rc<ConvInner>,
}

impl Conversation {
    pub fn new_im(account: Account, who: impl Into<String>) -> Conversation {
        Conversation {
            inner: Rc::new(ConvInner {
                account,
                name: who.into(),
                kind: Kind::Im { typing: Cell::new(TypingState::NotTyping) },
                history: RefCell::new(VecDeque::new()),
            }),
        }
    }

    pub fn new_chat(account: Account, name: impl Into<String>, id: i32, nick: impl Into<String>) -> Conversation {
        Conversation {
            inner: Rc::new(ConvInner {
                account,
                name: name.into(),
                kind: Kind::Chat {
                    id,
                    nick: RefCell::new(nick.into()),
                    topic: RefCell::new(None),
                    users: RefCell::new(Vec::new()),
                    left: Cell::new(false),
                },
                history: RefCell::new(VecDeque::new()),
            }),
        }
    }

    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    /// Remote user (IM) or room name (chat).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_im(&self) -> bool {
        matches!(self.inner.kind, Kind::Im { .. })
    }

    pub fn is_chat(&self) -> bool {
        matches!(self.inner.kind, Kind::Chat { .. })
    }

    pub fn same(&self, other: &Conversation) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // IM ------------------------------------------------------------------

    pub fn typing_state(&self) -> TypingState {
        match &self.inner.kind {
            Kind::Im { typing } => typing.get(),
            Kind::Chat { .. } => TypingState::NotTyping,
        }
    }

    pub fn set_typing_state(&self, state: TypingState) {
        if let Kind::Im { typing } = &self.inner.kind {
            typing.set(state);
        }
    }

    // Chat ----------------------------------------------------------------

    /// Protocol-assigned chat id; `None` for IMs.
    pub fn chat_id(&self) -> Option<i32> {
        match &self.inner.kind {
            Kind::Chat { id, .. } => Some(*id),
            Kind::Im { .. } => None,
        }
    }

    /// Our own nick in the room.
    pub fn chat_nick(&self) -> Option<String> {
        match &self.inner.kind {
            Kind::Chat { nick, .. } => Some(nick.borrow().clone()),
            Kind::Im { .. } => None,
        }
    }

    pub fn set_chat_nick(&self, new_nick: &str) {
        if let Kind::Chat { nick, .. } = &self.inner.kind {
            *nick.borrow_mut() = new_nick.to_string();
        }
    }

    pub fn topic(&self) -> Option<String> {
        match &self.inner.kind {
            Kind::Chat { topic, .. } => topic.borrow().clone(),
            Kind::Im { .. } => None,
        }
    }

    pub fn set_topic(&self, new_topic: Option<String>) {
        if let Kind::Chat { topic, .. } = &self.inner.kind {
            *topic.borrow_mut() = new_topic;
        }
    }

    pub fn add_user(&self, name: impl Into<String>, user_flags: u32) {
        if let Kind::Chat { users, .. } = &self.inner.kind {
            let name = name.into();
            let mut users = users.borrow_mut();
            if !users.iter().any(|u| u.name.eq_ignore_ascii_case(&name)) {
                users.push(ChatUser { name, flags: user_flags });
            }
        }
    }

    pub fn remove_user(&self, name: &str) -> bool {
        if let Kind::Chat { users, .. } = &self.inner.kind {
            let mut users = users.borrow_mut();
            let before = users.len();
            users.retain(|u| !u.name.eq_ignore_ascii_case(name));
            return users.len() != before;
        }
        false
    }

    pub fn rename_user(&self, old: &str, new: &str) {
        if let Kind::Chat { users, .. } = &self.inner.kind {
            if let Some(u) = users
                .borrow_mut()
                .iter_mut()
                .find(|u| u.name.eq_ignore_ascii_case(old))
            {
                u.name = new.to_string();
            }
        }
    }

    pub fn users(&self) -> Vec<ChatUser> {
        match &self.inner.kind {
            Kind::Chat { users, .. } => users.borrow().clone(),
            Kind::Im { .. } => Vec::new(),
        }
    }

    pub fn has_user(&self, name: &str) -> bool {
        match &self.inner.kind {
            Kind::Chat { users, .. } => users
                .borrow()
                .iter()
                .any(|u| u.name.eq_ignore_ascii_case(name)),
            Kind::Im { .. } => false,
        }
    }

    /// Mark the chat as left; the conversation object survives for the UI.
    pub fn set_left(&self) {
        if let Kind::Chat { left, users, .. } = &self.inner.kind {
            left.set(true);
            users.borrow_mut().clear();
        }
    }

    pub fn has_left(&self) -> bool {
        match &self.inner.kind {
            Kind::Chat { left, .. } => left.get(),
            Kind::Im { .. } => false,
        }
    }

    // History --------------------------------------------------------------

    /// Append a message, trimming the window.
    pub fn push_message(&self, msg: Message) {
        let mut history = self.inner.history.borrow_mut();
        if history.len() == HISTORY_MAX {
            history.pop_front();
        }
        history.push_back(msg);
    }

    /// Record a system notice.
    pub fn push_system(&self, text: impl Into<String>) {
        self.push_message(Message {
            who: String::new(),
            content: text.into(),
            flags: flags::SYSTEM,
            when: now_epoch(),
        });
    }

    pub fn history(&self) -> Vec<Message> {
        self.inner.history.borrow().iter().cloned().collect()
    }

    pub fn last_message(&self) -> Option<Message> {
        self.inner.history.borrow().back().cloned()
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("name", &self.inner.name)
            .field("chat", &self.is_chat())
            .finish()
    }
}

pub(crate) fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The set of open conversations, owned by the core.
#[derive(Default)]
pub struct Conversations {
    all: Vec<Conversation>,
}

impl Conversations {
    pub fn new() -> Conversations {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.all.iter()
    }

    pub fn find_im(&self, account: &Account, who: &str) -> Option<Conversation> {
        self.all
            .iter()
            .find(|c| {
                c.is_im() && c.account().same(account) && c.name().eq_ignore_ascii_case(who)
            })
            .cloned()
    }

    /// Find or create the IM conversation with `who`.
    pub fn ensure_im(&mut self, account: &Account, who: &str) -> Conversation {
        if let Some(c) = self.find_im(account, who) {
            return c;
        }
        let c = Conversation::new_im(account.clone(), who);
        self.all.push(c.clone());
        c
    }

    pub fn find_chat(&self, account: &Account, id: i32) -> Option<Conversation> {
        self.all
            .iter()
            .find(|c| c.account().same(account) && c.chat_id() == Some(id))
            .cloned()
    }

    pub fn find_chat_by_name(&self, account: &Account, name: &str) -> Option<Conversation> {
        self.all
            .iter()
            .find(|c| {
                c.is_chat() && c.account().same(account) && c.name().eq_ignore_ascii_case(name)
            })
            .cloned()
    }

    pub fn register_chat(
        &mut self,
        account: &Account,
        name: &str,
        id: i32,
        nick: &str,
    ) -> Conversation {
        if let Some(existing) = self.find_chat(account, id) {
            return existing;
        }
        let c = Conversation::new_chat(account.clone(), name, id, nick);
        self.all.push(c.clone());
        c
    }

    pub fn remove(&mut self, conv: &Conversation) {
        self.all.retain(|c| !c.same(conv));
    }

    pub fn remove_account(&mut self, account: &Account) {
        self.all.retain(|c| !c.account().same(account));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("irc", "me")
    }

    #[test]
    fn test_im_typing_state() {
        let c = Conversation::new_im(account(), "alice");
        assert_eq!(c.typing_state(), TypingState::NotTyping);
        c.set_typing_state(TypingState::Typing);
        assert_eq!(c.typing_state(), TypingState::Typing);
        c.set_typing_state(TypingState::Typed);
        assert_eq!(c.typing_state(), TypingState::Typed);
    }

    #[test]
    fn test_chat_users_dedup() {
        let c = Conversation::new_chat(account(), "#room", 1, "me");
        c.add_user("Alice", 0);
        c.add_user("alice", cbflags::OP);
        assert_eq!(c.users().len(), 1);
        assert!(c.has_user("ALICE"));
        assert!(c.remove_user("alice"));
        assert!(!c.remove_user("alice"));
    }

    #[test]
    fn test_history_window() {
        let c = Conversation::new_im(account(), "alice");
        for i in 0..(HISTORY_MAX + 10) {
            c.push_message(Message {
                who: "alice".into(),
                content: format!("m{i}"),
                flags: flags::RECV,
                when: i as i64,
            });
        }
        let h = c.history();
        assert_eq!(h.len(), HISTORY_MAX);
        assert_eq!(h.first().unwrap().content, "m10");
        assert_eq!(h.last().unwrap().content, format!("m{}", HISTORY_MAX + 9));
    }

    #[test]
    fn test_registry_ensure_im() {
        let a = account();
        let mut convs = Conversations::new();
        let c1 = convs.ensure_im(&a, "Alice");
        let c2 = convs.ensure_im(&a, "alice");
        assert!(c1.same(&c2));
        let other = Account::new("irc", "someone");
        let c3 = convs.ensure_im(&other, "alice");
        assert!(!c1.same(&c3));
    }

    #[test]
    fn test_registry_chat_by_id() {
        let a = account();
        let mut convs = Conversations::new();
        let c = convs.register_chat(&a, "#rust", 7, "me");
        assert_eq!(c.chat_id(), Some(7));
        assert!(convs.find_chat(&a, 7).unwrap().same(&c));
        assert!(convs.find_chat_by_name(&a, "#RUST").unwrap().same(&c));
        convs.remove(&c);
        assert!(convs.find_chat(&a, 7).is_none());
    }

    #[test]
    fn test_chat_leave_clears_users() {
        let c = Conversation::new_chat(account(), "#room", 1, "me");
        c.add_user("alice", 0);
        c.set_left();
        assert!(c.has_left());
        assert!(c.users().is_empty());
    }
}
