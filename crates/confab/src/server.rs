//! Protocol-to-model plumbing: the inbound and outbound message pipelines,
//! typing notifications, chat bookkeeping, buddy presence updates, and the
//! auto-response gate.
//!
//! Protocols call the `got_*` entry points; embedders call `send_*`.

use crate::account::{Account, Buddy, Status};
use crate::conversation::{Conversation, Message, TypingState, flags, now_epoch};
use crate::core::Core;
use crate::debug;
use crate::protocol::{Connection, connflags};

/// Suppression window between auto-responses to the same peer.
pub const AUTO_RESPONSE_WINDOW_SECS: i64 = 600;

/// A (possibly rewritten) IM in flight through the signal pipeline.
pub struct ImMsgEvent {
    pub account: Account,
    pub who: String,
    pub message: String,
    pub flags: u32,
}

/// A message dropped by the privacy policy.
pub struct BlockedImEvent {
    pub account: Account,
    pub who: String,
    pub message: String,
}

/// Remote typing-state change.
pub struct TypingEvent {
    pub account: Account,
    pub who: String,
    pub state: TypingState,
}

/// A chat message in flight.
pub struct ChatInEvent {
    pub account: Account,
    pub chat_id: i32,
    pub who: String,
    pub message: String,
    pub flags: u32,
}

/// A buddy whose presence changed.
pub struct BuddyEvent {
    pub buddy: Buddy,
}

impl Core {
    // Inbound IM -----------------------------------------------------------

    /// A protocol received a 1:1 message. Runs the full pipeline: privacy,
    /// rewrite/veto signals, conversation recording, auto-response.
    pub fn got_im(&self, conn: &Connection, who: &str, message: &str, incoming_flags: u32) {
        let Some(account) = conn.account() else {
            return;
        };

        if !self.privacy_check(&account, who) {
            debug::info("server", &format!("privacy dropped message from {who}"));
            let mut blocked = BlockedImEvent {
                account: account.clone(),
                who: who.to_string(),
                message: message.to_string(),
            };
            let _ = self.signals().emit("blocked-im-msg", &mut blocked);
            return;
        }

        let mut event = ImMsgEvent {
            account: account.clone(),
            who: who.to_string(),
            message: message.to_string(),
            flags: incoming_flags | flags::RECV,
        };
        match self.signals().emit("receiving-im-msg", &mut event) {
            Ok(true) => {
                debug::info("server", &format!("message from {who} vetoed"));
                return;
            }
            Ok(false) => {}
            Err(e) => debug::error("server", &format!("receiving-im-msg: {e}")),
        }

        let conv = self.with_conversations(|c| c.ensure_im(&account, &event.who));
        conv.set_typing_state(TypingState::NotTyping);
        let msg = Message {
            who: event.who.clone(),
            content: event.message.clone(),
            flags: event.flags,
            when: now_epoch(),
        };
        conv.push_message(msg.clone());
        self.conversation_ui().wrote_message(&conv, &msg);
        let _ = self.signals().emit("received-im-msg", &mut event);

        if event.flags & flags::AUTO_RESP == 0 {
            self.maybe_auto_respond(&account, conn, &event.who);
        }
    }

    /// Send a 1:1 message. Returns bytes accepted or a negative errno from
    /// the protocol.
    pub fn send_im(&self, account: &Account, who: &str, message: &str) -> i32 {
        let Some(conn) = account.connection() else {
            return -(libc::ENOTCONN);
        };
        let Some(protocol) = self.protocols().find(account.protocol_id()) else {
            return -(libc::ENOSYS);
        };
        let Some(im) = protocol.im_ops() else {
            return -(libc::ENOSYS);
        };

        let mut event = ImMsgEvent {
            account: account.clone(),
            who: who.to_string(),
            message: message.to_string(),
            flags: flags::SEND,
        };
        match self.signals().emit("sending-im-msg", &mut event) {
            Ok(true) => return 0,
            Ok(false) => {}
            Err(e) => debug::error("server", &format!("sending-im-msg: {e}")),
        }

        let sent = im.send(&conn, &event.who, &event.message, event.flags);
        if sent >= 0 {
            let conv = self.with_conversations(|c| c.ensure_im(account, &event.who));
            let msg = Message {
                who: account.username().to_string(),
                content: event.message.clone(),
                flags: event.flags,
                when: now_epoch(),
            };
            conv.push_message(msg.clone());
            self.conversation_ui().wrote_message(&conv, &msg);
            let _ = self.signals().emit("sent-im-msg", &mut event);
        }
        sent
    }

    // Auto-response --------------------------------------------------------

    fn maybe_auto_respond(&self, account: &Account, conn: &Connection, who: &str) {
        if !conn.has_flag(connflags::AUTO_RESPONDER) {
            return;
        }
        let pref = account.get_string("auto-reply", "away");
        if pref == "never" {
            return;
        }
        let (away, idle, reply) = account.with_presence(|p| {
            (
                p.active_status().primitive.is_away_like(),
                p.is_idle(),
                p.active_status().message().map(str::to_string),
            )
        });
        if !away {
            return;
        }
        if pref == "awayidle" && !idle {
            return;
        }
        let Some(reply) = reply.filter(|m| !m.is_empty()) else {
            return;
        };

        let key = (
            format!("{}:{}", account.protocol_id(), account.username()),
            who.to_lowercase(),
        );
        let now = now_epoch();
        {
            let responses = self.inner().last_auto_responses.borrow();
            if let Some(&sent) = responses.get(&key) {
                if now - sent < AUTO_RESPONSE_WINDOW_SECS {
                    return;
                }
            }
        }
        self.inner().last_auto_responses.borrow_mut().insert(key, now);
        self.start_auto_response_sweeper();

        let Some(protocol) = self.protocols().find(account.protocol_id()) else {
            return;
        };
        let Some(im) = protocol.im_ops() else {
            return;
        };
        debug::info("server", &format!("auto-responding to {who}"));
        let send_flags = flags::SEND | flags::AUTO_RESP;
        if im.send(conn, who, &reply, send_flags) >= 0 {
            let conv = self.with_conversations(|c| c.ensure_im(account, who));
            let msg = Message {
                who: account.username().to_string(),
                content: reply,
                flags: send_flags,
                when: now,
            };
            conv.push_message(msg.clone());
            self.conversation_ui().wrote_message(&conv, &msg);
        }
    }

    fn start_auto_response_sweeper(&self) {
        if self.inner().auto_response_sweeper.replace(true) {
            return;
        }
        let weak = self.downgrade();
        self.event_loop()
            .schedule_after_seconds((AUTO_RESPONSE_WINDOW_SECS + 1) as u64, move || {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                let now = now_epoch();
                inner
                    .last_auto_responses
                    .borrow_mut()
                    .retain(|_, sent| now - *sent <= AUTO_RESPONSE_WINDOW_SECS);
                !inner.last_auto_responses.borrow().is_empty() || {
                    inner.auto_response_sweeper.set(false);
                    false
                }
            });
    }

    /// Test/introspection hook: when the last auto-response to `who` went
    /// out, if within the suppression window.
    pub fn last_auto_response(&self, account: &Account, who: &str) -> Option<i64> {
        let key = (
            format!("{}:{}", account.protocol_id(), account.username()),
            who.to_lowercase(),
        );
        self.inner().last_auto_responses.borrow().get(&key).copied()
    }

    // Typing ---------------------------------------------------------------

    /// A protocol received a typing-state change for an IM peer.
    pub fn got_typing(&self, conn: &Connection, who: &str, state: TypingState) {
        let Some(account) = conn.account() else {
            return;
        };
        let conv = self.with_conversations(|c| c.find_im(&account, who));
        if let Some(conv) = &conv {
            conv.set_typing_state(state);
            self.conversation_ui().typing_changed(conv);
        }
        let mut event = TypingEvent {
            account,
            who: who.to_string(),
            state,
        };
        let name = if state == TypingState::NotTyping {
            "buddy-typing-stopped"
        } else {
            "buddy-typing"
        };
        let _ = self.signals().emit(name, &mut event);
    }

    /// The local user is typing; forward to the protocol.
    pub fn send_typing(&self, account: &Account, who: &str, state: TypingState) {
        if let (Some(conn), Some(protocol)) = (
            account.connection(),
            self.protocols().find(account.protocol_id()),
        ) {
            if let Some(im) = protocol.im_ops() {
                im.send_typing(&conn, who, state);
            }
        }
    }

    // Chats ----------------------------------------------------------------

    /// The protocol completed a room join; allocate the chat id and the
    /// conversation.
    pub fn got_joined_chat(&self, conn: &Connection, name: &str, nick: &str) -> Conversation {
        let account = conn.account().expect("joined chat on a dead connection");
        let id = conn.alloc_chat_id();
        let conv = self.with_conversations(|c| c.register_chat(&account, name, id, nick));
        self.conversation_ui().chat_joined(&conv);
        conv
    }

    /// A chat message arrived. Self-echo (our own nick) records as a send.
    pub fn got_chat_in(&self, conn: &Connection, id: i32, who: &str, message: &str) {
        let Some(account) = conn.account() else {
            return;
        };
        let Some(conv) = self.with_conversations(|c| c.find_chat(&account, id)) else {
            debug::warning("server", &format!("chat message for unknown id {id}"));
            return;
        };

        let own_nick = conv.chat_nick().unwrap_or_default();
        let mut msg_flags = if own_nick.eq_ignore_ascii_case(who) {
            flags::SEND
        } else {
            flags::RECV
        };
        if msg_flags & flags::RECV != 0 && crate::util::has_word(message, &own_nick) {
            msg_flags |= flags::NICK_MENTION | flags::NOTIFY;
        }

        let mut event = ChatInEvent {
            account,
            chat_id: id,
            who: who.to_string(),
            message: message.to_string(),
            flags: msg_flags,
        };
        match self.signals().emit("receiving-chat-msg", &mut event) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => debug::error("server", &format!("receiving-chat-msg: {e}")),
        }

        let msg = Message {
            who: event.who.clone(),
            content: event.message.clone(),
            flags: event.flags,
            when: now_epoch(),
        };
        conv.push_message(msg.clone());
        self.conversation_ui().wrote_message(&conv, &msg);
        let _ = self.signals().emit("received-chat-msg", &mut event);
    }

    /// The protocol (or server) took us out of a chat.
    pub fn got_chat_left(&self, conn: &Connection, id: i32) {
        let Some(account) = conn.account() else {
            return;
        };
        conn.forget_chat(id);
        if let Some(conv) = self.with_conversations(|c| c.find_chat(&account, id)) {
            conv.set_left();
            self.conversation_ui().chat_left(&conv);
        }
    }

    /// Send to a chat. Returns bytes accepted or a negative errno.
    pub fn send_chat(&self, account: &Account, id: i32, message: &str) -> i32 {
        let Some(conn) = account.connection() else {
            return -(libc::ENOTCONN);
        };
        let Some(protocol) = self.protocols().find(account.protocol_id()) else {
            return -(libc::ENOSYS);
        };
        let Some(chat) = protocol.chat_ops() else {
            return -(libc::ENOSYS);
        };
        chat.send(&conn, id, message, flags::SEND)
    }

    // Buddy presence -------------------------------------------------------

    /// A protocol learned a buddy's presence. Updates the list and emits
    /// the sign-on/sign-off signals when the edge changes.
    pub fn got_buddy_status(&self, account: &Account, name: &str, status: Status) {
        let Some(buddy) = self.with_blist(|b| b.find_buddy(account, name)) else {
            return;
        };
        let was_online = buddy.is_online();
        buddy.with_presence_mut(|p| p.set_status(status));
        let online = buddy.is_online();

        self.blist_ui().buddy_status_changed(&buddy);
        let mut event = BuddyEvent { buddy: buddy.clone() };
        if online && !was_online {
            let _ = self.signals().emit("buddy-signed-on", &mut event);
        } else if !online && was_online {
            let _ = self.signals().emit("buddy-signed-off", &mut event);
        } else {
            let _ = self.signals().emit("buddy-status-changed", &mut event);
        }
    }

    /// Record a server alias learned from the roster.
    pub fn got_alias(&self, account: &Account, name: &str, alias: Option<&str>) {
        if let Some(buddy) = self.with_blist(|b| b.find_buddy(account, name)) {
            buddy.set_server_alias(alias.map(str::to_string));
            self.blist_ui().buddy_status_changed(&buddy);
        }
    }

    // Buddy list maintenance ----------------------------------------------

    /// Embedder adds a buddy; the protocol mirrors it server-side.
    pub fn add_buddy(&self, account: &Account, name: &str, group: &str) -> Buddy {
        let buddy = self.with_blist(|b| b.add_buddy(account, name, group));
        self.blist_ui().buddy_added(&buddy);
        if let (Some(conn), Some(protocol)) = (
            account.connection(),
            self.protocols().find(account.protocol_id()),
        ) {
            if let Some(server) = protocol.server_ops() {
                server.add_buddy(&conn, &buddy, group);
            }
        }
        buddy
    }

    /// Embedder removes a buddy from one group; the protocol's buddy-free
    /// hook runs when the last group reference goes.
    pub fn remove_buddy(&self, account: &Account, name: &str, group: &str) {
        let buddy = self.with_blist(|b| b.find_buddy(account, name));
        let Some(buddy) = buddy else {
            return;
        };
        if let (Some(conn), Some(protocol)) = (
            account.connection(),
            self.protocols().find(account.protocol_id()),
        ) {
            if let Some(server) = protocol.server_ops() {
                server.remove_buddy(&conn, &buddy, group);
            }
        }
        let last = self.with_blist(|b| b.remove_buddy(account, name, group));
        if let Some(gone) = last {
            if let Some(protocol) = self.protocols().find(account.protocol_id()) {
                protocol.buddy_free(&gone);
            }
            self.blist_ui().buddy_removed(&gone);
        }
    }
}
