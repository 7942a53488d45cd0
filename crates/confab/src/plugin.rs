//! Plugin surface: query/load/unload and ABI versioning.
//!
//! A plugin describes itself, loads (typically registering protocols or
//! connecting signal handlers), and unloads. Loading refuses plugins built
//! against a different [`ABI_VERSION`]; capability growth happens by adding
//! traits, so the version only moves on breaking changes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::core::Core;
use crate::debug;

/// Bumped on breaking changes to the plugin-visible surface.
pub const ABI_VERSION: u32 = 3;

/// Static facts about a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Must equal [`ABI_VERSION`] to load.
    pub abi_version: u32,
}

/// The query/load/unload triple.
pub trait Plugin {
    fn query(&self) -> PluginInfo;

    /// Returns whether the plugin came up; a `false` keeps it unloaded.
    fn load(&self, core: &Core) -> bool;

    fn unload(&self, core: &Core);
}

/// Errors from plugin loading.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin {id} was built for ABI {got}, this core is ABI {want}")]
    AbiMismatch { id: String, got: u32, want: u32 },

    #[error("plugin {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("plugin {0} refused to load")]
    LoadFailed(String),

    #[error("plugin {0} is not loaded")]
    NotLoaded(String),
}

pub type Result<T> = std::result::Result<T, PluginError>;

/// Loaded plugins, owned by the embedder (one per core is typical).
#[derive(Default)]
pub struct PluginRegistry {
    loaded: RefCell<HashMap<String, Rc<dyn Plugin>>>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        Self::default()
    }

    /// Query, verify the ABI, and load.
    pub fn load(&self, core: &Core, plugin: Rc<dyn Plugin>) -> Result<PluginInfo> {
        let info = plugin.query();
        if info.abi_version != ABI_VERSION {
            return Err(PluginError::AbiMismatch {
                id: info.id,
                got: info.abi_version,
                want: ABI_VERSION,
            });
        }
        if self.loaded.borrow().contains_key(&info.id) {
            return Err(PluginError::AlreadyLoaded(info.id));
        }
        if !plugin.load(core) {
            return Err(PluginError::LoadFailed(info.id));
        }
        debug::info("plugins", &format!("loaded {} {}", info.id, info.version));
        self.loaded.borrow_mut().insert(info.id.clone(), plugin);
        Ok(info)
    }

    pub fn unload(&self, core: &Core, id: &str) -> Result<()> {
        let plugin = self
            .loaded
            .borrow_mut()
            .remove(id)
            .ok_or_else(|| PluginError::NotLoaded(id.to_string()))?;
        plugin.unload(core);
        debug::info("plugins", &format!("unloaded {id}"));
        Ok(())
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded.borrow().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loaded.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Unload everything, for shutdown.
    pub fn unload_all(&self, core: &Core) {
        let plugins: Vec<(String, Rc<dyn Plugin>)> = self
            .loaded
            .borrow_mut()
            .drain()
            .collect();
        for (id, plugin) in plugins {
            plugin.unload(core);
            debug::info("plugins", &format!("unloaded {id}"));
        }
    }
}
