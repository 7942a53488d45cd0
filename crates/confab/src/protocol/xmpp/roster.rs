//! Roster synchronization.

use super::stanza::{NS_ROSTER, build_iq};
use crate::account::Account;
use crate::core::Core;
use crate::debug;
use crate::xml::Element;

/// One roster entry as the server sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RosterItem {
    pub jid: String,
    pub name: Option<String>,
    pub subscription: String,
    pub groups: Vec<String>,
}

/// Build the roster fetch, with the cached version when the server supports
/// roster versioning.
pub(super) fn build_roster_get(id: &str, ver: Option<&str>) -> Element {
    let mut iq = build_iq("get", id);
    let query = iq.new_child("query");
    query.set_namespace(NS_ROSTER);
    if let Some(ver) = ver {
        query.set_attrib("ver", ver);
    }
    iq
}

/// Parse `<query xmlns="jabber:iq:roster">` items.
pub(super) fn parse_roster(query: &Element) -> (Option<String>, Vec<RosterItem>) {
    let ver = query.get_attrib("ver").map(str::to_string);
    let items = query
        .children_named("item")
        .filter_map(|item| {
            let jid = item.get_attrib("jid")?.to_string();
            let groups: Vec<String> = item
                .children_named("group")
                .map(|g| g.get_data())
                .filter(|g| !g.is_empty())
                .collect();
            Some(RosterItem {
                jid,
                name: item.get_attrib("name").map(str::to_string),
                subscription: item
                    .get_attrib("subscription")
                    .unwrap_or("none")
                    .to_string(),
                groups,
            })
        })
        .collect();
    (ver, items)
}

/// Fold a roster push or fetch result into the buddy list.
pub(super) fn apply_roster(core: &Core, account: &Account, query: &Element) {
    let (ver, items) = parse_roster(query);
    if let Some(ver) = ver {
        account.set_string("roster-ver", ver);
    }
    for item in items {
        if item.subscription == "remove" {
            let groups = core.with_blist(|b| {
                b.find_buddy(account, &item.jid)
                    .map(|buddy| {
                        b.groups_of(&buddy)
                            .into_iter()
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            });
            for group in groups {
                core.remove_buddy(account, &item.jid, &group);
            }
            continue;
        }

        let groups = if item.groups.is_empty() {
            vec!["Buddies".to_string()]
        } else {
            item.groups.clone()
        };
        for group in &groups {
            core.with_blist(|b| b.add_buddy(account, &item.jid, group));
        }
        core.got_alias(account, &item.jid, item.name.as_deref());
    }
    debug::info("xmpp", "roster synchronized");
}

/// `<item jid="…" name="…"><group>…</group></item>` inside a roster set.
pub(super) fn build_roster_set(id: &str, jid: &str, name: Option<&str>, groups: &[&str]) -> Element {
    let mut iq = build_iq("set", id);
    let query = iq.new_child("query");
    query.set_namespace(NS_ROSTER);
    let item = query.new_child("item");
    item.set_attrib("jid", jid);
    if let Some(name) = name {
        item.set_attrib("name", name);
    }
    for group in groups {
        item.new_child("group").insert_data(*group);
    }
    iq
}
