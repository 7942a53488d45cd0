//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use confab::account::{Account, StatusPrimitive, StatusType};
use confab::core::{AccountUiOps, Core};
use confab::eventloop::EventLoop;
use confab::protocol::{Connection, ConnectionError, Protocol};
use confab::resolver::{Backend, Resolver};

/// Run a future on a fresh current-thread runtime + LocalSet, the way an
/// embedder hosts the core.
pub fn run_local<F: Future<Output = ()>>(f: F) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(f));
}

/// A core wired with the worker-thread resolver (no forked children under
/// the test harness).
pub fn test_core() -> Core {
    let ev = EventLoop::new();
    let resolver = Rc::new(Resolver::with_backend(ev.clone(), Backend::Thread));
    Core::init_with_resolver(ev, resolver).unwrap()
}

/// Poll until `cond` holds or the deadline passes.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the deadline");
}

/// Records terminal connection events for assertions.
#[derive(Default)]
pub struct ConnRecorder {
    pub errors: RefCell<Vec<ConnectionError>>,
    pub connected: RefCell<Vec<String>>,
}

impl AccountUiOps for ConnRecorder {
    fn connected(&self, account: &Account) {
        self.connected.borrow_mut().push(account.username().to_string());
    }

    fn connection_error(&self, _account: &Account, error: &ConnectionError) {
        self.errors.borrow_mut().push(error.clone());
    }
}

/// A minimal protocol whose login immediately succeeds; used by suites that
/// exercise the model rather than a wire.
pub struct InstantProtocol;

impl Protocol for InstantProtocol {
    fn id(&self) -> &str {
        "instant"
    }

    fn name(&self) -> &str {
        "Instant"
    }

    fn status_types(&self, _account: &Account) -> Vec<StatusType> {
        vec![
            StatusType::new(StatusPrimitive::Available, "available", "Available"),
            StatusType::new(StatusPrimitive::Away, "away", "Away"),
        ]
    }

    fn login(&self, _core: &Core, connection: &Connection) {
        connection.set_connected();
    }

    fn close(&self, _connection: &Connection) {}
}
