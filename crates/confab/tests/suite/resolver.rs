//! Resolver cancellation semantics.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use confab::eventloop::EventLoop;
use confab::resolver::{Backend, Resolver};

use crate::common::run_local;

#[test]
fn cancelled_callback_never_fires_while_second_query_completes() {
    run_local(async {
        let resolver = Resolver::with_backend(EventLoop::new(), Backend::Thread);

        // Issue, cancel, and immediately re-issue for the same host within
        // one loop tick.
        let first_fired = Rc::new(Cell::new(false));
        let f = first_fired.clone();
        let first = resolver.resolve("localhost", 4000, Box::new(move |_| f.set(true)));
        first.cancel();

        let second_result = Rc::new(Cell::new(None::<bool>));
        let s = second_result.clone();
        let _second = resolver.resolve(
            "localhost",
            4000,
            Box::new(move |result| s.set(Some(result.is_ok()))),
        );

        crate::common::wait_for(|| second_result.get().is_some()).await;
        assert_eq!(second_result.get(), Some(true));

        // Give the first callback every chance to misfire.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!first_fired.get(), "cancelled callback must not fire");
    });
}

#[test]
fn cancel_is_idempotent_and_survives_completion() {
    run_local(async {
        let resolver = Resolver::with_backend(EventLoop::new(), Backend::Thread);
        let fired = Rc::new(Cell::new(0u32));
        let f = fired.clone();
        let query = resolver.resolve(
            "localhost",
            4001,
            Box::new(move |_| f.set(f.get() + 1)),
        );
        crate::common::wait_for(|| fired.get() > 0).await;
        // Cancelling after the fact is a no-op, repeatedly.
        query.cancel();
        query.cancel();
        assert_eq!(fired.get(), 1);
    });
}

#[test]
fn results_carry_the_requested_port() {
    run_local(async {
        let resolver = Resolver::with_backend(EventLoop::new(), Backend::Thread);
        let addrs = resolver.resolve_async("localhost", 5299).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 5299));
    });
}
