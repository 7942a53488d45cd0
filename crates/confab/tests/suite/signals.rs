//! Signal bus behavior across the message pipeline.

use std::cell::RefCell;
use std::rc::Rc;

use confab::account::Account;
use confab::conversation::flags;
use confab::server::ImMsgEvent;

use crate::common::{InstantProtocol, run_local, test_core};

#[test]
fn veto_at_high_priority_starves_low_priority() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(InstantProtocol));
        let account = core.add_account(Account::new("instant", "me"));
        let conn = core.connect_account(&account).unwrap();

        let low_ran = Rc::new(RefCell::new(false));
        let low = low_ran.clone();
        core.signals()
            .connect_priority("receiving-im-msg", 0, move |_: &mut ImMsgEvent| {
                *low.borrow_mut() = true;
                false
            })
            .unwrap();
        core.signals()
            .connect_priority("receiving-im-msg", 100, |_: &mut ImMsgEvent| true)
            .unwrap();

        let received = Rc::new(RefCell::new(0u32));
        let r = received.clone();
        core.signals()
            .connect("received-im-msg", move |_: &mut ImMsgEvent| {
                *r.borrow_mut() += 1;
                false
            })
            .unwrap();

        core.got_im(&conn, "alice", "dropped on the floor", 0);

        assert!(!*low_ran.borrow(), "priority-0 handler must never run");
        assert_eq!(*received.borrow(), 0, "received-im-msg must never fire");
        assert!(
            core.with_conversations(|c| c.find_im(&account, "alice")).is_none(),
            "vetoed message must not create a conversation"
        );
        core.shutdown();
    });
}

#[test]
fn handlers_rewrite_in_priority_order() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(InstantProtocol));
        let account = core.add_account(Account::new("instant", "me"));
        let conn = core.connect_account(&account).unwrap();

        core.signals()
            .connect_priority("receiving-im-msg", 50, |e: &mut ImMsgEvent| {
                e.message = format!("[first] {}", e.message);
                false
            })
            .unwrap();
        core.signals()
            .connect_priority("receiving-im-msg", -50, |e: &mut ImMsgEvent| {
                e.message = format!("[second] {}", e.message);
                false
            })
            .unwrap();

        core.got_im(&conn, "alice", "hello", 0);
        let conv = core
            .with_conversations(|c| c.find_im(&account, "alice"))
            .unwrap();
        assert_eq!(conv.last_message().unwrap().content, "[second] [first] hello");
        core.shutdown();
    });
}

#[test]
fn blocked_sender_fires_blocked_signal_only() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(InstantProtocol));
        let account = core.add_account(Account::new("instant", "me"));
        let conn = core.connect_account(&account).unwrap();
        account.with_privacy_mut(|p| {
            p.set_policy(confab::PrivacyPolicy::DenyUsers);
            p.deny_add("mallory");
        });

        let blocked = Rc::new(RefCell::new(Vec::new()));
        let b = blocked.clone();
        core.signals()
            .connect(
                "blocked-im-msg",
                move |e: &mut confab::server::BlockedImEvent| {
                    b.borrow_mut().push(e.who.clone());
                    false
                },
            )
            .unwrap();

        core.got_im(&conn, "mallory", "buy cheap meds", 0);
        core.got_im(&conn, "alice", "hi!", 0);

        assert_eq!(blocked.borrow().as_slice(), ["mallory"]);
        assert!(core.with_conversations(|c| c.find_im(&account, "mallory")).is_none());
        let conv = core
            .with_conversations(|c| c.find_im(&account, "alice"))
            .unwrap();
        assert!(conv.last_message().unwrap().flags & flags::RECV != 0);
        core.shutdown();
    });
}
