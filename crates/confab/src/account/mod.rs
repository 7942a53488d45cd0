//! Accounts: identity, credentials, per-protocol settings, presence and
//! privacy state.

mod blist;
mod presence;
mod privacy;

pub use blist::{Buddy, BuddyList, Group};
pub use presence::{Presence, Status, StatusAttr, StatusPrimitive, StatusType};
pub use privacy::{Privacy, PrivacyPolicy};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::protocol::Connection;

/// One typed per-protocol setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

struct AccountState {
    password: Option<String>,
    remember_password: bool,
    alias: Option<String>,
    enabled: bool,
    settings: HashMap<String, SettingValue>,
    presence: Presence,
    privacy: Privacy,
    /// Present only while connecting or connected. The connection holds a
    /// weak reference back; dropping this is how sessions die.
    connection: Option<Connection>,
}

struct AccountInner {
    protocol_id: String,
    username: String,
    state: RefCell<AccountState>,
}

/// An account identity: `(protocol_id, username)` plus credentials and
/// configuration. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Account {
    inner: Rc<AccountInner>,
}

impl Account {
    pub fn new(protocol_id: impl Into<String>, username: impl Into<String>) -> Account {
        Account {
            inner: Rc::new(AccountInner {
                protocol_id: protocol_id.into(),
                username: username.into(),
                state: RefCell::new(AccountState {
                    password: None,
                    remember_password: false,
                    alias: None,
                    enabled: true,
                    settings: HashMap::new(),
                    presence: Presence::new(),
                    privacy: Privacy::new(),
                    connection: None,
                }),
            }),
        }
    }

    pub fn protocol_id(&self) -> &str {
        &self.inner.protocol_id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// Identity equality: same underlying account object.
    pub fn same(&self, other: &Account) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn password(&self) -> Option<String> {
        self.inner.state.borrow().password.clone()
    }

    pub fn set_password(&self, password: Option<String>) {
        self.inner.state.borrow_mut().password = password;
    }

    pub fn remember_password(&self) -> bool {
        self.inner.state.borrow().remember_password
    }

    pub fn set_remember_password(&self, remember: bool) {
        self.inner.state.borrow_mut().remember_password = remember;
    }

    /// Purge a password that was never meant to be kept. Called after
    /// authentication failures.
    pub fn purge_unsaved_password(&self) {
        let mut state = self.inner.state.borrow_mut();
        if !state.remember_password {
            if let Some(p) = state.password.take() {
                crate::util::str_wipe(p);
            }
        }
    }

    pub fn alias(&self) -> Option<String> {
        self.inner.state.borrow().alias.clone()
    }

    pub fn set_alias(&self, alias: Option<String>) {
        self.inner.state.borrow_mut().alias = alias;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.borrow().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.state.borrow_mut().enabled = enabled;
    }

    // Typed settings -------------------------------------------------------

    pub fn set_setting(&self, key: impl Into<String>, value: SettingValue) {
        self.inner.state.borrow_mut().settings.insert(key.into(), value);
    }

    pub fn set_bool(&self, key: impl Into<String>, value: bool) {
        self.set_setting(key, SettingValue::Bool(value));
    }

    pub fn set_int(&self, key: impl Into<String>, value: i64) {
        self.set_setting(key, SettingValue::Int(value));
    }

    pub fn set_string(&self, key: impl Into<String>, value: impl Into<String>) {
        self.set_setting(key, SettingValue::Str(value.into()));
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.inner.state.borrow().settings.get(key) {
            Some(SettingValue::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.inner.state.borrow().settings.get(key) {
            Some(SettingValue::Int(i)) => *i,
            _ => default,
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.inner.state.borrow().settings.get(key) {
            Some(SettingValue::Str(s)) => s.clone(),
            _ => default.to_string(),
        }
    }

    /// Snapshot of all settings, for embedder persistence.
    pub fn settings(&self) -> HashMap<String, SettingValue> {
        self.inner.state.borrow().settings.clone()
    }

    /// Settings as a JSON object, for embedders that persist accounts.
    pub fn settings_to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.inner.state.borrow().settings)
            .unwrap_or(serde_json::Value::Null)
    }

    /// Restore settings from a JSON object produced by
    /// [`Account::settings_to_json`]. Unknown shapes are ignored.
    pub fn load_settings_json(&self, value: &serde_json::Value) {
        if let Ok(settings) =
            serde_json::from_value::<HashMap<String, SettingValue>>(value.clone())
        {
            self.inner.state.borrow_mut().settings = settings;
        }
    }

    // Presence -------------------------------------------------------------

    pub fn with_presence<R>(&self, f: impl FnOnce(&Presence) -> R) -> R {
        f(&self.inner.state.borrow().presence)
    }

    pub fn with_presence_mut<R>(&self, f: impl FnOnce(&mut Presence) -> R) -> R {
        f(&mut self.inner.state.borrow_mut().presence)
    }

    // Privacy --------------------------------------------------------------

    pub fn with_privacy<R>(&self, f: impl FnOnce(&Privacy) -> R) -> R {
        f(&self.inner.state.borrow().privacy)
    }

    pub fn with_privacy_mut<R>(&self, f: impl FnOnce(&mut Privacy) -> R) -> R {
        f(&mut self.inner.state.borrow_mut().privacy)
    }

    // Connection lifecycle -------------------------------------------------

    pub fn connection(&self) -> Option<Connection> {
        self.inner.state.borrow().connection.clone()
    }

    pub(crate) fn set_connection(&self, connection: Option<Connection>) {
        self.inner.state.borrow_mut().connection = connection;
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_connected())
    }

    pub fn is_connecting(&self) -> bool {
        self.connection().is_some_and(|c| c.is_connecting())
    }
}

/// Weak back-reference to an account, held by child objects like the
/// connection so ownership stays strictly parental.
#[derive(Clone)]
pub struct WeakAccount {
    inner: std::rc::Weak<AccountInner>,
}

impl WeakAccount {
    pub fn upgrade(&self) -> Option<Account> {
        self.inner.upgrade().map(|inner| Account { inner })
    }
}

impl Account {
    pub fn downgrade(&self) -> WeakAccount {
        WeakAccount { inner: Rc::downgrade(&self.inner) }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("protocol", &self.inner.protocol_id)
            .field("username", &self.inner.username)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let a = Account::new("xmpp", "romeo@example.net");
        assert_eq!(a.protocol_id(), "xmpp");
        assert_eq!(a.username(), "romeo@example.net");
        let b = a.clone();
        assert!(a.same(&b));
        assert!(!a.same(&Account::new("xmpp", "romeo@example.net")));
    }

    #[test]
    fn test_settings_typed() {
        let a = Account::new("irc", "nick");
        a.set_bool("ssl", true);
        a.set_int("port", 6697);
        a.set_string("realname", "A. User");
        assert!(a.get_bool("ssl", false));
        assert_eq!(a.get_int("port", 0), 6697);
        assert_eq!(a.get_string("realname", ""), "A. User");
        // Wrong type falls back to the default.
        assert_eq!(a.get_int("ssl", 42), 42);
        assert_eq!(a.get_bool("missing", true), true);
    }

    #[test]
    fn test_settings_json_round_trip() {
        let a = Account::new("irc", "nick");
        a.set_bool("ssl", true);
        a.set_int("port", 6697);
        a.set_string("realname", "A. User");

        let json = a.settings_to_json();
        let b = Account::new("irc", "nick");
        b.load_settings_json(&json);
        assert!(b.get_bool("ssl", false));
        assert_eq!(b.get_int("port", 0), 6697);
        assert_eq!(b.get_string("realname", ""), "A. User");
    }

    #[test]
    fn test_purge_unsaved_password() {
        let a = Account::new("xmpp", "u@h");
        a.set_password(Some("secret".into()));
        a.set_remember_password(false);
        a.purge_unsaved_password();
        assert_eq!(a.password(), None);

        a.set_password(Some("kept".into()));
        a.set_remember_password(true);
        a.purge_unsaved_password();
        assert_eq!(a.password(), Some("kept".into()));
    }

    #[test]
    fn test_no_connection_offline() {
        let a = Account::new("xmpp", "u@h");
        assert!(!a.is_connected());
        assert!(!a.is_connecting());
        assert!(a.connection().is_none());
    }
}
