//! Blocking fallback backend: looks up inline on the loop thread.
//!
//! Only used when no other backend is available. The callback is still
//! delivered from a scheduled timeout so callers observe the same
//! asynchronous shape as the real backends.

use std::cell::RefCell;
use std::net::{SocketAddr, ToSocketAddrs};

use super::{DnsQuery, ResolveError, ResolveFn, Result};
use crate::eventloop::EventLoop;

fn lookup(hostname: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (hostname, port)
        .to_socket_addrs()
        .map_err(ResolveError::Io)?
        .collect();
    if addrs.is_empty() {
        return Err(ResolveError::BadHostname { host: hostname.to_string() });
    }
    Ok(addrs)
}

pub(super) fn resolve(ev: &EventLoop, hostname: &str, port: u16, query: DnsQuery, cb: ResolveFn) {
    let result = lookup(hostname, port);
    let slot = RefCell::new(Some((result, cb)));
    ev.schedule_after(0, move || {
        if let Some((result, cb)) = slot.borrow_mut().take() {
            if !query.is_cancelled() {
                cb(result);
            }
        }
        false
    });
}
