//! Presence and status primitives.
//!
//! A presence aggregates active statuses. Exactly one non-overlay primitive
//! is current at any time; mood, tune and mobile ride alongside as overlays.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The closed set of status primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusPrimitive {
    Offline,
    Available,
    Away,
    ExtendedAway,
    DoNotDisturb,
    Invisible,
    Mood,
    Tune,
    Mobile,
}

impl StatusPrimitive {
    pub fn id(self) -> &'static str {
        match self {
            StatusPrimitive::Offline => "offline",
            StatusPrimitive::Available => "available",
            StatusPrimitive::Away => "away",
            StatusPrimitive::ExtendedAway => "extended-away",
            StatusPrimitive::DoNotDisturb => "do-not-disturb",
            StatusPrimitive::Invisible => "invisible",
            StatusPrimitive::Mood => "mood",
            StatusPrimitive::Tune => "tune",
            StatusPrimitive::Mobile => "mobile",
        }
    }

    /// Overlays coexist with the current primitive instead of replacing it.
    pub fn is_overlay(self) -> bool {
        matches!(
            self,
            StatusPrimitive::Mood | StatusPrimitive::Tune | StatusPrimitive::Mobile
        )
    }

    /// Whether a buddy with this primitive counts as signed on.
    pub fn is_online(self) -> bool {
        self != StatusPrimitive::Offline
    }

    /// Whether auto-responses are appropriate (the user is not around).
    pub fn is_away_like(self) -> bool {
        matches!(
            self,
            StatusPrimitive::Away | StatusPrimitive::ExtendedAway | StatusPrimitive::DoNotDisturb
        )
    }
}

/// A typed status attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusAttr {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// A status kind a protocol supports: primitive plus attribute schema.
#[derive(Debug, Clone)]
pub struct StatusType {
    pub primitive: StatusPrimitive,
    /// Protocol-scoped id, e.g. `"dnd"`.
    pub id: String,
    pub name: String,
    pub user_settable: bool,
    /// Attribute names this status accepts (e.g. `message`).
    pub attrs: Vec<String>,
}

impl StatusType {
    pub fn new(primitive: StatusPrimitive, id: impl Into<String>, name: impl Into<String>) -> Self {
        StatusType {
            primitive,
            id: id.into(),
            name: name.into(),
            user_settable: true,
            attrs: vec!["message".into()],
        }
    }

    pub fn with_user_settable(mut self, user_settable: bool) -> Self {
        self.user_settable = user_settable;
        self
    }
}

/// An active status instance.
#[derive(Debug, Clone)]
pub struct Status {
    pub primitive: StatusPrimitive,
    pub id: String,
    attrs: HashMap<String, StatusAttr>,
}

impl Status {
    pub fn new(primitive: StatusPrimitive) -> Status {
        Status {
            primitive,
            id: primitive.id().to_string(),
            attrs: HashMap::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Status {
        self.attrs
            .insert("message".into(), StatusAttr::Str(message.into()));
        self
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: StatusAttr) {
        self.attrs.insert(name.into(), value);
    }

    pub fn attr(&self, name: &str) -> Option<&StatusAttr> {
        self.attrs.get(name)
    }

    pub fn attr_string(&self, name: &str) -> Option<&str> {
        match self.attrs.get(name) {
            Some(StatusAttr::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.attr_string("message")
    }
}

/// A presence: one current primitive status plus overlays, idle state and
/// login time.
#[derive(Debug, Clone)]
pub struct Presence {
    current: Status,
    overlays: Vec<Status>,
    idle: bool,
    idle_since: Option<i64>,
    login_time: Option<i64>,
}

impl Default for Presence {
    fn default() -> Self {
        Presence {
            current: Status::new(StatusPrimitive::Offline),
            overlays: Vec::new(),
            idle: false,
            idle_since: None,
            login_time: None,
        }
    }
}

impl Presence {
    pub fn new() -> Presence {
        Self::default()
    }

    /// The one current non-overlay status.
    pub fn active_status(&self) -> &Status {
        &self.current
    }

    /// Switch the current status. Overlay primitives instead join the
    /// overlay set, replacing a previous overlay of the same primitive.
    pub fn set_status(&mut self, status: Status) {
        if status.primitive.is_overlay() {
            self.overlays.retain(|s| s.primitive != status.primitive);
            self.overlays.push(status);
        } else {
            self.current = status;
        }
    }

    pub fn remove_overlay(&mut self, primitive: StatusPrimitive) {
        self.overlays.retain(|s| s.primitive != primitive);
    }

    pub fn overlay(&self, primitive: StatusPrimitive) -> Option<&Status> {
        self.overlays.iter().find(|s| s.primitive == primitive)
    }

    pub fn is_online(&self) -> bool {
        self.current.primitive.is_online()
    }

    pub fn is_available(&self) -> bool {
        self.current.primitive == StatusPrimitive::Available
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn set_idle(&mut self, idle: bool, since_epoch: Option<i64>) {
        self.idle = idle;
        self.idle_since = if idle { since_epoch } else { None };
    }

    pub fn idle_since(&self) -> Option<i64> {
        self.idle_since
    }

    pub fn login_time(&self) -> Option<i64> {
        self.login_time
    }

    pub fn set_login_time(&mut self, epoch: Option<i64>) {
        self.login_time = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_current_primitive() {
        let mut p = Presence::new();
        assert_eq!(p.active_status().primitive, StatusPrimitive::Offline);
        p.set_status(Status::new(StatusPrimitive::Available));
        assert_eq!(p.active_status().primitive, StatusPrimitive::Available);
        p.set_status(Status::new(StatusPrimitive::Away).with_message("bbl"));
        assert_eq!(p.active_status().primitive, StatusPrimitive::Away);
        assert_eq!(p.active_status().message(), Some("bbl"));
    }

    #[test]
    fn test_overlays_do_not_replace_current() {
        let mut p = Presence::new();
        p.set_status(Status::new(StatusPrimitive::Available));
        let mut tune = Status::new(StatusPrimitive::Tune);
        tune.set_attr("title", StatusAttr::Str("Ode to Joy".into()));
        p.set_status(tune);
        assert_eq!(p.active_status().primitive, StatusPrimitive::Available);
        assert_eq!(
            p.overlay(StatusPrimitive::Tune).unwrap().attr_string("title"),
            Some("Ode to Joy")
        );

        // Re-setting an overlay replaces the old instance of it.
        let mut tune2 = Status::new(StatusPrimitive::Tune);
        tune2.set_attr("title", StatusAttr::Str("Eine kleine".into()));
        p.set_status(tune2);
        assert_eq!(
            p.overlay(StatusPrimitive::Tune).unwrap().attr_string("title"),
            Some("Eine kleine")
        );
        p.remove_overlay(StatusPrimitive::Tune);
        assert!(p.overlay(StatusPrimitive::Tune).is_none());
    }

    #[test]
    fn test_idle_tracking() {
        let mut p = Presence::new();
        p.set_idle(true, Some(1_000_000));
        assert!(p.is_idle());
        assert_eq!(p.idle_since(), Some(1_000_000));
        p.set_idle(false, None);
        assert!(!p.is_idle());
        assert_eq!(p.idle_since(), None);
    }

    #[test]
    fn test_primitive_classification() {
        assert!(StatusPrimitive::Away.is_away_like());
        assert!(StatusPrimitive::DoNotDisturb.is_away_like());
        assert!(!StatusPrimitive::Available.is_away_like());
        assert!(StatusPrimitive::Mood.is_overlay());
        assert!(!StatusPrimitive::Invisible.is_overlay());
        assert!(!StatusPrimitive::Offline.is_online());
    }
}
