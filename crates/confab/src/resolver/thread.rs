//! Worker-thread backend: one short-lived thread per query.
//!
//! The thread performs the blocking lookup and hands the result back over a
//! oneshot channel; a loop-local task delivers the callback. Cancellation
//! flips the token and lets the thread finish unobserved.

use std::net::{SocketAddr, ToSocketAddrs};

use super::{DnsQuery, ResolveError, ResolveFn, Result};

fn lookup(hostname: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (hostname, port)
        .to_socket_addrs()
        .map_err(|e| classify(hostname, e))?
        .collect();
    if addrs.is_empty() {
        return Err(ResolveError::BadHostname { host: hostname.to_string() });
    }
    Ok(addrs)
}

fn classify(host: &str, err: std::io::Error) -> ResolveError {
    // getaddrinfo failures surface as generic errors; name-not-found has no
    // stable errno, so match on the common kinds and fall back to Io.
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidInput => {
            ResolveError::BadHostname { host: host.to_string() }
        }
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            ResolveError::Temporary { host: host.to_string() }
        }
        _ => {
            let msg = err.to_string();
            if msg.contains("failure in name resolution")
                || msg.contains("Name or service not known")
                || msg.contains("nodename nor servname")
            {
                ResolveError::BadHostname { host: host.to_string() }
            } else {
                ResolveError::Io(err)
            }
        }
    }
}

pub(super) fn resolve(hostname: &str, port: u16, query: DnsQuery, cb: ResolveFn) {
    let host = hostname.to_string();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let spawned = std::thread::Builder::new()
        .name("confab-dns".into())
        .spawn(move || {
            let _ = tx.send(lookup(&host, port));
        });

    match spawned {
        Ok(_) => {
            tokio::task::spawn_local(async move {
                let result = rx
                    .await
                    .unwrap_or_else(|_| Err(ResolveError::ChildEof));
                if !query.is_cancelled() {
                    cb(result);
                }
            });
        }
        Err(e) => {
            // Deliver the failure from a fresh loop turn, preserving the
            // asynchronous contract.
            tokio::task::spawn_local(async move {
                tokio::task::yield_now().await;
                if !query.is_cancelled() {
                    cb(Err(ResolveError::SpawnFailed(e)));
                }
            });
        }
    }
}
