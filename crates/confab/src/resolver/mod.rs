//! Asynchronous name resolution.
//!
//! Resolution never blocks the loop thread (except with the explicit
//! [`Backend::Blocking`] fallback). Three interchangeable strategies:
//!
//! - [`Backend::Child`] (Unix): a pool of reusable child processes performs
//!   blocking `getaddrinfo` calls, isolated from resolver-library bugs.
//!   At most [`child::MAX_DNS_CHILDREN`] children; excess queries queue FIFO.
//! - [`Backend::Thread`]: one short-lived worker thread per query.
//! - [`Backend::Blocking`]: inline lookup, for loops with nothing better.
//!
//! Every query returns a [`DnsQuery`] cancellation token. Cancellation is
//! idempotent and fire-and-forget: once `cancel` returns, the callback is
//! guaranteed not to fire. The resolver never retries; retry policy belongs
//! to the protocol that asked.

#[cfg(unix)]
pub mod child;
mod blocking;
mod srv;
mod thread;

pub use srv::{SrvTarget, resolve_srv_async};

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use crate::debug;
use crate::eventloop::EventLoop;

/// Errors a query can end with.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The name does not exist.
    #[error("name not found: {host}")]
    BadHostname { host: String },

    /// Transient failure; trying again later may work.
    #[error("temporary resolver failure for {host}")]
    Temporary { host: String },

    /// A helper process or thread could not be created.
    #[error("unable to create resolver: {0}")]
    SpawnFailed(#[source] io::Error),

    /// A resolver child died mid-conversation.
    #[error("resolver child exited unexpectedly")]
    ChildEof,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Completion callback: an ordered, non-empty address list or an error.
pub type ResolveFn = Box<dyn FnOnce(Result<Vec<SocketAddr>>)>;

/// Which strategy performs lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Child-process pool (Unix only).
    #[cfg(unix)]
    Child,
    /// One worker thread per query.
    Thread,
    /// Inline on the loop thread.
    Blocking,
}

impl Backend {
    fn preferred() -> Backend {
        #[cfg(unix)]
        {
            Backend::Child
        }
        #[cfg(not(unix))]
        {
            Backend::Thread
        }
    }
}

/// Cancellation token for an in-flight query.
///
/// Dropping the token does *not* cancel; call [`DnsQuery::cancel`].
#[derive(Clone)]
pub struct DnsQuery {
    cancelled: Rc<Cell<bool>>,
}

impl DnsQuery {
    pub(crate) fn new() -> DnsQuery {
        DnsQuery { cancelled: Rc::new(Cell::new(false)) }
    }

    /// Cancel the query. Idempotent. After this returns the callback will
    /// not fire, even if a result was already in flight.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Embedder override for name resolution: return `Some` to answer a query
/// without touching any backend (captive-portal UIs, test fixtures).
pub trait DnsQueryUiOps {
    fn resolve_host(&self, hostname: &str, port: u16) -> Option<Vec<SocketAddr>>;
}

/// The resolver fabric. One per core; owns the child pool.
pub struct Resolver {
    ev: EventLoop,
    backend: Backend,
    ui: RefCell<Option<Rc<dyn DnsQueryUiOps>>>,
    #[cfg(unix)]
    pool: Rc<child::ChildPool>,
}

impl Resolver {
    pub fn new(ev: EventLoop) -> Resolver {
        Self::with_backend(ev, Backend::preferred())
    }

    pub fn with_backend(ev: EventLoop, backend: Backend) -> Resolver {
        Resolver {
            ev,
            backend,
            ui: RefCell::new(None),
            #[cfg(unix)]
            pool: Rc::new(child::ChildPool::new()),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Install an embedder resolution override.
    pub fn set_ui_ops(&self, ops: Rc<dyn DnsQueryUiOps>) {
        *self.ui.borrow_mut() = Some(ops);
    }

    /// Resolve `hostname:port` to an ordered sockaddr list.
    pub fn resolve(&self, hostname: &str, port: u16, cb: ResolveFn) -> DnsQuery {
        let query = DnsQuery::new();
        debug::info("dnsquery", &format!("resolving {hostname}:{port}"));

        // The UI may answer outright; the result is still delivered from a
        // fresh loop turn so callers observe one asynchronous shape.
        let override_answer = self
            .ui
            .borrow()
            .as_ref()
            .and_then(|ops| ops.resolve_host(hostname, port));
        if let Some(addrs) = override_answer {
            let slot = RefCell::new(Some(cb));
            let q = query.clone();
            self.ev.schedule_after(0, move || {
                if let Some(cb) = slot.borrow_mut().take() {
                    if !q.is_cancelled() {
                        cb(Ok(addrs.clone()));
                    }
                }
                false
            });
            return query;
        }

        match self.backend {
            #[cfg(unix)]
            Backend::Child => {
                child::resolve(&self.pool, &self.ev, hostname, port, query.clone(), cb);
            }
            Backend::Thread => {
                thread::resolve(hostname, port, query.clone(), cb);
            }
            Backend::Blocking => {
                blocking::resolve(&self.ev, hostname, port, query.clone(), cb);
            }
        }
        query
    }

    /// Resolve and await, for async callers inside the core.
    pub async fn resolve_async(&self, hostname: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = RefCell::new(Some(tx));
        self.resolve(
            hostname,
            port,
            Box::new(move |result| {
                if let Some(tx) = tx.borrow_mut().take() {
                    let _ = tx.send(result);
                }
            }),
        );
        rx.await.unwrap_or_else(|_| {
            Err(ResolveError::Io(io::Error::other("resolver dropped the query")))
        })
    }

    /// Resolve SRV targets for `_service._proto.domain`, sorted by priority
    /// then weight (both ascending, stable).
    pub fn resolve_srv(
        &self,
        service: &str,
        proto: &str,
        domain: &str,
        cb: Box<dyn FnOnce(Result<Vec<SrvTarget>>)>,
    ) -> DnsQuery {
        let query = DnsQuery::new();
        srv::resolve(service, proto, domain, query.clone(), cb);
        query
    }

    /// Tear down pooled resolver children. Part of core shutdown.
    pub fn shutdown(&self) {
        #[cfg(unix)]
        self.pool.shutdown();
    }
}

/// Create a non-blocking pipe; returns `(read_end, write_end)`.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::FromRawFd;

    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid out-array of two ints.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        // SAFETY: fd was just returned by pipe().
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    // SAFETY: pipe() handed us ownership of both descriptors.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[tokio::test(flavor = "current_thread")]
    async fn test_thread_backend_resolves_localhost() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolver =
                    Resolver::with_backend(EventLoop::new(), Backend::Thread);
                let addrs = resolver.resolve_async("localhost", 5222).await.unwrap();
                assert!(!addrs.is_empty());
                assert!(addrs.iter().all(|a| a.port() == 5222));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_thread_backend_bad_host() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolver =
                    Resolver::with_backend(EventLoop::new(), Backend::Thread);
                let err = resolver
                    .resolve_async("no-such-host.invalid", 1)
                    .await
                    .unwrap_err();
                assert!(matches!(
                    err,
                    ResolveError::BadHostname { .. } | ResolveError::Io(_)
                ));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_before_completion() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolver =
                    Resolver::with_backend(EventLoop::new(), Backend::Thread);
                let fired = Rc::new(Cell::new(false));
                let f = fired.clone();
                let query = resolver.resolve(
                    "localhost",
                    80,
                    Box::new(move |_| f.set(true)),
                );
                query.cancel();
                query.cancel();
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                assert!(!fired.get());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_then_second_query_same_host() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolver =
                    Resolver::with_backend(EventLoop::new(), Backend::Thread);
                let first_fired = Rc::new(Cell::new(false));
                let f = first_fired.clone();
                let first = resolver.resolve(
                    "localhost",
                    80,
                    Box::new(move |_| f.set(true)),
                );
                first.cancel();
                let addrs = resolver.resolve_async("localhost", 80).await.unwrap();
                assert!(!addrs.is_empty());
                assert!(!first_fired.get());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_backend() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolver =
                    Resolver::with_backend(EventLoop::new(), Backend::Blocking);
                let addrs = resolver.resolve_async("localhost", 6667).await.unwrap();
                assert!(!addrs.is_empty());
            })
            .await;
    }
}
