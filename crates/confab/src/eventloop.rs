//! Event loop adapter: timeouts, fd-readiness watches, cancellation.
//!
//! The core is strictly single-threaded and cooperative; every callback runs
//! on the loop thread. This module abstracts the embedder's main loop behind
//! [`EventLoopOps`], with [`TokioLoop`] as the stock backend (tokio
//! current-thread runtime inside a `LocalSet`). Embedders with their own
//! loop install a different backend; everything above this module only sees
//! the contract.
//!
//! Timers fire no earlier than requested, with no upper bound. A timer
//! callback returning `true` re-arms itself for the same interval.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

/// Readiness condition for fd watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cond(u8);

impl Cond {
    pub const READ: Cond = Cond(0x1);
    pub const WRITE: Cond = Cond(0x2);

    pub fn contains(self, other: Cond) -> bool {
        self.0 & other.0 == other.0
    }

    fn interest(self) -> Interest {
        match (self.contains(Cond::READ), self.contains(Cond::WRITE)) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }
}

impl BitOr for Cond {
    type Output = Cond;

    fn bitor(self, rhs: Cond) -> Cond {
        Cond(self.0 | rhs.0)
    }
}

/// Opaque cancellation handle for a timeout or watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

/// Timer callback; return `true` to run again after the same delay.
pub type TimerFn = Box<dyn FnMut() -> bool>;
/// Watch callback, invoked with the fd and the condition that matched.
pub type WatchFn = Box<dyn FnMut(RawFd, Cond)>;

/// The loop contract. All methods must be called from the loop thread.
pub trait EventLoopOps {
    /// Run `f` after `delay`; re-arm while it returns `true`.
    fn schedule_after(&self, delay: Duration, f: TimerFn) -> SourceId;

    /// Invoke `f` whenever `fd` is ready for `cond`. The fd must be
    /// non-blocking; the callback should consume until `WouldBlock`.
    fn watch_fd(&self, fd: RawFd, cond: Cond, f: WatchFn) -> io::Result<SourceId>;

    /// Cancel a pending source. Idempotent; returns `false` when the source
    /// already fired (one-shot) or was never known.
    fn cancel(&self, id: SourceId) -> bool;

    /// Read the pending socket error for `fd`.
    fn fd_get_error(&self, fd: RawFd) -> io::Result<i32> {
        fd_get_error_sockopt(fd)
    }
}

/// `getsockopt(SO_ERROR)`, the platform-correct way to read a socket error.
pub fn fd_get_error_sockopt(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: fd is a caller-supplied descriptor; err/len are valid
    // out-pointers of the size we report.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(err)
}

/// Poll `fd` for readiness right now, without blocking.
fn poll_ready_now(fd: RawFd, cond: Cond) -> bool {
    let mut events: libc::c_short = 0;
    if cond.contains(Cond::READ) {
        events |= libc::POLLIN;
    }
    if cond.contains(Cond::WRITE) {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    // SAFETY: pfd is a valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    rc > 0 && pfd.revents & (events | libc::POLLERR | libc::POLLHUP) != 0
}

fn matched_cond(read: bool, write: bool) -> Cond {
    match (read, write) {
        (true, true) => Cond::READ | Cond::WRITE,
        (false, true) => Cond::WRITE,
        _ => Cond::READ,
    }
}

struct RawWatch(RawFd);

impl AsRawFd for RawWatch {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[derive(Default)]
struct LoopInner {
    next_id: Cell<u64>,
    active: RefCell<HashMap<SourceId, tokio::task::AbortHandle>>,
}

/// Stock backend: tokio current-thread runtime + `LocalSet`.
#[derive(Clone, Default)]
pub struct TokioLoop {
    inner: Rc<LoopInner>,
}

impl TokioLoop {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SourceId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        SourceId(id)
    }

    fn track(&self, id: SourceId, handle: tokio::task::AbortHandle) {
        self.inner.active.borrow_mut().insert(id, handle);
    }
}

impl EventLoopOps for TokioLoop {
    fn schedule_after(&self, delay: Duration, mut f: TimerFn) -> SourceId {
        let id = self.next_id();
        let inner = Rc::clone(&self.inner);
        let handle = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(delay).await;
                if !f() {
                    break;
                }
            }
            inner.active.borrow_mut().remove(&id);
        });
        self.track(id, handle.abort_handle());
        id
    }

    fn watch_fd(&self, fd: RawFd, cond: Cond, mut f: WatchFn) -> io::Result<SourceId> {
        let id = self.next_id();
        let interest = cond.interest();
        let afd = AsyncFd::with_interest(RawWatch(fd), interest)?;
        let inner = Rc::clone(&self.inner);
        let handle = tokio::task::spawn_local(async move {
            loop {
                let ready = match afd.ready(interest).await {
                    Ok(mut guard) => {
                        let ready = guard.ready();
                        guard.clear_ready();
                        ready
                    }
                    Err(_) => break,
                };
                let matched = matched_cond(
                    ready.is_readable() || ready.is_read_closed(),
                    ready.is_writable() || ready.is_write_closed(),
                );
                // Emulate level-triggered dispatch: keep calling while the
                // fd stays ready, yielding between iterations so other
                // tasks are not starved.
                loop {
                    f(fd, matched);
                    tokio::task::yield_now().await;
                    if !poll_ready_now(fd, matched) {
                        break;
                    }
                }
            }
            inner.active.borrow_mut().remove(&id);
        });
        self.track(id, handle.abort_handle());
        Ok(id)
    }

    fn cancel(&self, id: SourceId) -> bool {
        match self.inner.active.borrow_mut().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Shared handle to the installed loop backend.
#[derive(Clone)]
pub struct EventLoop {
    ops: Rc<dyn EventLoopOps>,
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop { ops: Rc::new(TokioLoop::new()) }
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a custom backend.
    pub fn with_ops(ops: Rc<dyn EventLoopOps>) -> Self {
        EventLoop { ops }
    }

    /// Run `f` once after `ms` milliseconds; return `true` from `f` to
    /// re-arm.
    pub fn schedule_after(&self, ms: u64, f: impl FnMut() -> bool + 'static) -> SourceId {
        self.ops.schedule_after(Duration::from_millis(ms), Box::new(f))
    }

    /// Coarse-grained variant for timers where sub-second precision would
    /// waste wakeups.
    pub fn schedule_after_seconds(&self, secs: u64, f: impl FnMut() -> bool + 'static) -> SourceId {
        self.ops.schedule_after(Duration::from_secs(secs), Box::new(f))
    }

    pub fn watch_fd(
        &self,
        fd: RawFd,
        cond: Cond,
        f: impl FnMut(RawFd, Cond) + 'static,
    ) -> io::Result<SourceId> {
        self.ops.watch_fd(fd, cond, Box::new(f))
    }

    pub fn cancel(&self, id: SourceId) -> bool {
        self.ops.cancel(id)
    }

    pub fn fd_get_error(&self, fd: RawFd) -> io::Result<i32> {
        self.ops.fd_get_error(fd)
    }
}
