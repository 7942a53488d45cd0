//! Protocol registry: id → implementation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{Protocol, ProtocolRef};
use crate::debug;

/// The installed protocols, owned by the core.
#[derive(Default)]
pub struct ProtocolRegistry {
    by_id: RefCell<HashMap<String, ProtocolRef>>,
}

impl ProtocolRegistry {
    pub fn new() -> ProtocolRegistry {
        Self::default()
    }

    /// Register a protocol. A duplicate id replaces the old registration
    /// (plugin reload).
    pub fn add(&self, protocol: Rc<dyn Protocol>) {
        let id = protocol.id().to_string();
        debug::info("protocols", &format!("registered protocol {id}"));
        self.by_id.borrow_mut().insert(id, protocol);
    }

    pub fn find(&self, id: &str) -> Option<ProtocolRef> {
        self.by_id.borrow().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<ProtocolRef> {
        let removed = self.by_id.borrow_mut().remove(id);
        if removed.is_some() {
            debug::info("protocols", &format!("removed protocol {id}"));
        }
        removed
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_id.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_id.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.borrow().is_empty()
    }
}
