//! The buddy list: groups, buddies, aliases, protocol-private data.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use super::{Account, Presence};

struct BuddyInner {
    account: Account,
    name: String,
    state: RefCell<BuddyState>,
}

struct BuddyState {
    local_alias: Option<String>,
    server_alias: Option<String>,
    presence: Presence,
    /// Protocol-private payload, created by the owning protocol and dropped
    /// through its buddy-free hook when the buddy is removed.
    proto_data: Option<Box<dyn Any>>,
}

/// A remote identity the local user tracks. Cheap to clone; clones share
/// state. The same buddy object may appear in several groups.
#[derive(Clone)]
pub struct Buddy {
    inner: Rc<BuddyInner>,
}

impl Buddy {
    pub fn new(account: Account, name: impl Into<String>) -> Buddy {
        Buddy {
            inner: Rc::new(BuddyInner {
                account,
                name: name.into(),
                state: RefCell::new(BuddyState {
                    local_alias: None,
                    server_alias: None,
                    presence: Presence::new(),
                    proto_data: None,
                }),
            }),
        }
    }

    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn same(&self, other: &Buddy) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Display alias, three tiers: local alias, then server alias, then the
    /// bare name.
    pub fn alias(&self) -> String {
        let state = self.inner.state.borrow();
        state
            .local_alias
            .clone()
            .or_else(|| state.server_alias.clone())
            .unwrap_or_else(|| self.inner.name.clone())
    }

    pub fn local_alias(&self) -> Option<String> {
        self.inner.state.borrow().local_alias.clone()
    }

    pub fn set_local_alias(&self, alias: Option<String>) {
        self.inner.state.borrow_mut().local_alias = alias;
    }

    pub fn server_alias(&self) -> Option<String> {
        self.inner.state.borrow().server_alias.clone()
    }

    pub fn set_server_alias(&self, alias: Option<String>) {
        self.inner.state.borrow_mut().server_alias = alias;
    }

    pub fn with_presence<R>(&self, f: impl FnOnce(&Presence) -> R) -> R {
        f(&self.inner.state.borrow().presence)
    }

    pub fn with_presence_mut<R>(&self, f: impl FnOnce(&mut Presence) -> R) -> R {
        f(&mut self.inner.state.borrow_mut().presence)
    }

    pub fn is_online(&self) -> bool {
        self.with_presence(|p| p.is_online())
    }

    /// Install protocol-private data. At most one payload lives on a buddy;
    /// setting twice is a protocol bug and the old payload is kept.
    pub fn init_proto_data(&self, data: Box<dyn Any>) -> bool {
        let mut state = self.inner.state.borrow_mut();
        if state.proto_data.is_some() {
            return false;
        }
        state.proto_data = Some(data);
        true
    }

    pub fn has_proto_data(&self) -> bool {
        self.inner.state.borrow().proto_data.is_some()
    }

    pub fn with_proto_data<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut state = self.inner.state.borrow_mut();
        state
            .proto_data
            .as_mut()
            .and_then(|d| d.downcast_mut::<T>())
            .map(f)
    }

    /// Remove and return the protocol payload, for the buddy-free hook.
    pub fn take_proto_data(&self) -> Option<Box<dyn Any>> {
        self.inner.state.borrow_mut().proto_data.take()
    }
}

impl std::fmt::Debug for Buddy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buddy").field("name", &self.inner.name).finish()
    }
}

/// A named group of buddies. Membership is case-insensitively unique.
pub struct Group {
    pub name: String,
    buddies: Vec<Buddy>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Group {
        Group { name: name.into(), buddies: Vec::new() }
    }

    pub fn buddies(&self) -> impl Iterator<Item = &Buddy> {
        self.buddies.iter()
    }

    pub fn len(&self) -> usize {
        self.buddies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buddies.is_empty()
    }

    fn contains_name(&self, account: &Account, name: &str) -> bool {
        self.buddies
            .iter()
            .any(|b| b.account().same(account) && b.name().eq_ignore_ascii_case(name))
    }
}

/// The global buddy list, owned by the core.
#[derive(Default)]
pub struct BuddyList {
    groups: Vec<Group>,
}

impl BuddyList {
    pub fn new() -> BuddyList {
        Self::default()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn ensure_group(&mut self, name: &str) -> &mut Group {
        if let Some(i) = self
            .groups
            .iter()
            .position(|g| g.name.eq_ignore_ascii_case(name))
        {
            return &mut self.groups[i];
        }
        self.groups.push(Group::new(name));
        self.groups.last_mut().expect("just pushed")
    }

    pub fn find_group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name.eq_ignore_ascii_case(name))
    }

    pub fn rename_group(&mut self, old: &str, new: &str) -> bool {
        if self.find_group(new).is_some() {
            return false;
        }
        if let Some(g) = self
            .groups
            .iter_mut()
            .find(|g| g.name.eq_ignore_ascii_case(old))
        {
            g.name = new.to_string();
            return true;
        }
        false
    }

    /// Add a buddy to a group. Re-adding an existing `(account, name)` to
    /// the same group (any case) returns the existing buddy; adding to a
    /// new group links the same buddy object there.
    pub fn add_buddy(&mut self, account: &Account, name: &str, group: &str) -> Buddy {
        if let Some(existing) = self.find_buddy(account, name) {
            let g = self.ensure_group(group);
            if !g.contains_name(account, name) {
                g.buddies.push(existing.clone());
            }
            return existing;
        }
        let buddy = Buddy::new(account.clone(), name);
        self.ensure_group(group).buddies.push(buddy.clone());
        buddy
    }

    /// Find a buddy by account and (case-insensitive) name.
    pub fn find_buddy(&self, account: &Account, name: &str) -> Option<Buddy> {
        for g in &self.groups {
            for b in &g.buddies {
                if b.account().same(account) && b.name().eq_ignore_ascii_case(name) {
                    return Some(b.clone());
                }
            }
        }
        None
    }

    /// Remove a buddy from one group; returns the buddy if that was its
    /// last group (the caller runs the protocol's buddy-free hook then).
    pub fn remove_buddy(&mut self, account: &Account, name: &str, group: &str) -> Option<Buddy> {
        let mut removed = None;
        if let Some(g) = self
            .groups
            .iter_mut()
            .find(|g| g.name.eq_ignore_ascii_case(group))
        {
            if let Some(i) = g
                .buddies
                .iter()
                .position(|b| b.account().same(account) && b.name().eq_ignore_ascii_case(name))
            {
                removed = Some(g.buddies.remove(i));
            }
        }
        let removed = removed?;
        if self.find_buddy(account, name).is_none() {
            Some(removed)
        } else {
            None
        }
    }

    /// Drop every buddy belonging to `account`, returning them for cleanup.
    pub fn remove_account_buddies(&mut self, account: &Account) -> Vec<Buddy> {
        let mut out: Vec<Buddy> = Vec::new();
        for g in &mut self.groups {
            g.buddies.retain(|b| {
                if b.account().same(account) {
                    // The same buddy may sit in several groups.
                    if !out.iter().any(|o| o.same(b)) {
                        out.push(b.clone());
                    }
                    false
                } else {
                    true
                }
            });
        }
        out
    }

    /// Group names a buddy appears in.
    pub fn groups_of(&self, buddy: &Buddy) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|g| g.buddies.iter().any(|b| b.same(buddy)))
            .map(|g| g.name.as_str())
            .collect()
    }

    /// All buddies of one account, deduplicated.
    pub fn account_buddies(&self, account: &Account) -> Vec<Buddy> {
        let mut out: Vec<Buddy> = Vec::new();
        for g in &self.groups {
            for b in &g.buddies {
                if b.account().same(account) && !out.iter().any(|o| o.same(b)) {
                    out.push(b.clone());
                }
            }
        }
        out
    }
}
