//! Privacy policy: who may reach this account.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The closed set of privacy policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrivacyPolicy {
    #[default]
    AllowAll,
    DenyAll,
    /// Only the permit list gets through.
    AllowUsers,
    /// Everyone but the deny list gets through.
    DenyUsers,
    /// Only people on the buddy list get through.
    AllowBuddylist,
}

fn normalize(who: &str) -> String {
    who.trim().to_lowercase()
}

/// Per-account privacy state: a policy plus permit and deny sets.
///
/// Names are compared case-insensitively. Mutators return whether anything
/// changed, so callers know when to push a server-side list update.
#[derive(Debug, Clone, Default)]
pub struct Privacy {
    policy: PrivacyPolicy,
    permit: BTreeSet<String>,
    deny: BTreeSet<String>,
}

impl Privacy {
    pub fn new() -> Privacy {
        Self::default()
    }

    pub fn policy(&self) -> PrivacyPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: PrivacyPolicy) -> bool {
        if self.policy == policy {
            return false;
        }
        self.policy = policy;
        true
    }

    pub fn permit_add(&mut self, who: &str) -> bool {
        self.permit.insert(normalize(who))
    }

    pub fn permit_remove(&mut self, who: &str) -> bool {
        self.permit.remove(&normalize(who))
    }

    pub fn deny_add(&mut self, who: &str) -> bool {
        self.deny.insert(normalize(who))
    }

    pub fn deny_remove(&mut self, who: &str) -> bool {
        self.deny.remove(&normalize(who))
    }

    pub fn permit_list(&self) -> impl Iterator<Item = &str> {
        self.permit.iter().map(String::as_str)
    }

    pub fn deny_list(&self) -> impl Iterator<Item = &str> {
        self.deny.iter().map(String::as_str)
    }

    /// Whether an incoming event from `who` should be delivered.
    /// `is_buddy` is the buddy-list membership of `who`, supplied by the
    /// caller because the list lives on the core.
    pub fn check(&self, who: &str, is_buddy: bool) -> bool {
        let who = normalize(who);
        match self.policy {
            PrivacyPolicy::AllowAll => true,
            PrivacyPolicy::DenyAll => false,
            PrivacyPolicy::AllowUsers => self.permit.contains(&who),
            PrivacyPolicy::DenyUsers => !self.deny.contains(&who),
            PrivacyPolicy::AllowBuddylist => is_buddy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_all() {
        let p = Privacy::new();
        assert!(p.check("anyone@anywhere", false));
    }

    #[test]
    fn test_deny_users() {
        let mut p = Privacy::new();
        p.set_policy(PrivacyPolicy::DenyUsers);
        assert!(p.deny_add("Spammer@Example.Com"));
        assert!(!p.check("spammer@example.com", false));
        assert!(!p.check("SPAMMER@EXAMPLE.COM", false));
        assert!(p.check("friend@example.com", false));
    }

    #[test]
    fn test_allow_users() {
        let mut p = Privacy::new();
        p.set_policy(PrivacyPolicy::AllowUsers);
        p.permit_add("friend@example.com");
        assert!(p.check("Friend@example.com", false));
        assert!(!p.check("stranger@example.com", false));
    }

    #[test]
    fn test_allow_buddylist() {
        let mut p = Privacy::new();
        p.set_policy(PrivacyPolicy::AllowBuddylist);
        assert!(p.check("buddy", true));
        assert!(!p.check("not-buddy", false));
    }

    #[test]
    fn test_add_remove_round_trip() {
        let mut p = Privacy::new();
        p.set_policy(PrivacyPolicy::DenyUsers);
        let before = p.check("x@y", false);
        assert!(p.deny_add("x@y"));
        assert!(!p.deny_add("x@y"));
        assert!(p.deny_remove("x@y"));
        assert!(!p.deny_remove("x@y"));
        assert_eq!(p.check("x@y", false), before);
    }

    #[test]
    fn test_set_policy_reports_change() {
        let mut p = Privacy::new();
        assert!(!p.set_policy(PrivacyPolicy::AllowAll));
        assert!(p.set_policy(PrivacyPolicy::DenyAll));
    }
}
