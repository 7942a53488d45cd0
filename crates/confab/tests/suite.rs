//! Integration test entry point.
//!
//! The actual tests live in the `suite/` directory; `common/` holds the
//! in-memory protocol and the scripted wire servers the suites talk to.
//!
//! Everything here runs on a current-thread runtime inside a `LocalSet`,
//! the same way an embedder drives the core.

#[path = "common/mod.rs"]
mod common;

#[path = "suite/signals.rs"]
mod signals;

#[path = "suite/xml_tree.rs"]
mod xml_tree;

#[path = "suite/resolver.rs"]
mod resolver;

#[path = "suite/transfer.rs"]
mod transfer;

#[path = "suite/xmpp_stream.rs"]
mod xmpp_stream;

#[path = "suite/irc_session.rs"]
mod irc_session;

#[path = "suite/gg_session.rs"]
mod gg_session;
