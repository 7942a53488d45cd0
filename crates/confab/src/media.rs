//! Media capability glue.
//!
//! The core implements no media pipeline. It only probes what a peer could
//! do (the union over their known resources) and forwards initiation to the
//! protocol. The embedder may mask capabilities it cannot render.

use crate::account::Account;
use crate::core::Core;

/// Media capability bits.
pub mod caps {
    pub const NONE: u32 = 0;
    pub const AUDIO: u32 = 1 << 0;
    pub const VIDEO: u32 = 1 << 1;
    pub const AUDIO_VIDEO: u32 = AUDIO | VIDEO;
    pub const MODIFY_SESSION: u32 = 1 << 2;
    pub const CHANGE_DIRECTION: u32 = 1 << 3;
}

impl Core {
    /// Restrict what [`Core::get_media_caps`] may report; a UI with no
    /// video stack masks video out.
    pub fn set_ui_media_caps(&self, mask: u32) {
        self.inner().ui_media_caps.set(mask);
    }

    /// What media sessions could be established with `who`, as far as the
    /// protocol knows, intersected with the UI mask.
    pub fn get_media_caps(&self, account: &Account, who: &str) -> u32 {
        let Some(protocol) = self.protocols().find(account.protocol_id()) else {
            return caps::NONE;
        };
        let Some(media) = protocol.media_ops() else {
            return caps::NONE;
        };
        media.get_caps(account, who) & self.inner().ui_media_caps.get()
    }

    /// Ask the protocol to start a media session. Returns whether the
    /// attempt was made.
    pub fn initiate_media(&self, account: &Account, who: &str, media_type: u32) -> bool {
        if self.get_media_caps(account, who) & media_type != media_type {
            return false;
        }
        let Some(protocol) = self.protocols().find(account.protocol_id()) else {
            return false;
        };
        let Some(media) = protocol.media_ops() else {
            return false;
        };
        media.initiate(account, who, media_type)
    }
}
