//! Unix child-process backend.
//!
//! Each child performs blocking `getaddrinfo` calls in its own process,
//! isolating the loop from resolver-library hangs and crashes. Children are
//! reusable: after answering they wait up to [`CHILD_IDLE_TIMEOUT`] for the
//! next request, then exit on their own. The parent keeps at most
//! [`MAX_DNS_CHILDREN`] alive; excess queries wait in a FIFO queue. Any I/O
//! error talking to a child discards that child.
//!
//! Wire format on the pipes (parent and child are the same binary, so
//! native layout is fine):
//!
//! - request: `{ hostname: [u8; 512] (NUL-padded), port: i32 }`
//! - response: `status: i32` (0 or a gai error), then zero or more
//!   `{ len: u32, sockaddr bytes }`, then `len == 0`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::{DnsQuery, ResolveError, ResolveFn, Result};
use crate::debug;
use crate::eventloop::EventLoop;

/// Upper bound on live resolver children.
pub const MAX_DNS_CHILDREN: usize = 4;

/// How long an idle child waits for another request before exiting.
pub const CHILD_IDLE_TIMEOUT_MS: i32 = 40_000;

const HOSTNAME_MAX: usize = 512;

struct ResolverChild {
    pid: libc::pid_t,
    /// Parent writes requests here (non-blocking).
    fd_in: OwnedFd,
    /// Parent reads responses here (non-blocking).
    fd_out: OwnedFd,
}

impl ResolverChild {
    /// Best-effort liveness probe, reaping if the child already exited.
    fn alive(&self) -> bool {
        let mut status = 0;
        // SAFETY: pid belongs to a child we forked; WNOHANG never blocks.
        let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        rc == 0
    }

    fn kill(self) {
        // SAFETY: pid is our child. A second kill of a reaped pid is
        // harmless here because we never recycle the struct.
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
            libc::waitpid(self.pid, std::ptr::null_mut(), 0);
        }
    }
}

struct Pending {
    hostname: String,
    port: u16,
    query: DnsQuery,
    cb: ResolveFn,
}

/// Loop-owned pool state. Lives on the resolver, not in a static.
pub struct ChildPool {
    free: RefCell<Vec<ResolverChild>>,
    count: Cell<usize>,
    queue: RefCell<VecDeque<Pending>>,
}

impl ChildPool {
    pub(super) fn new() -> ChildPool {
        ChildPool {
            free: RefCell::new(Vec::new()),
            count: Cell::new(0),
            queue: RefCell::new(VecDeque::new()),
        }
    }

    /// Live child count, for boundary assertions.
    pub fn child_count(&self) -> usize {
        self.count.get()
    }

    pub(super) fn shutdown(&self) {
        self.queue.borrow_mut().clear();
        for child in self.free.borrow_mut().drain(..) {
            self.count.set(self.count.get().saturating_sub(1));
            child.kill();
        }
    }

    fn take_free(&self) -> Option<ResolverChild> {
        loop {
            let child = self.free.borrow_mut().pop()?;
            if child.alive() {
                return Some(child);
            }
            debug::info("dnsquery", "discarding dead resolver child");
            self.count.set(self.count.get().saturating_sub(1));
        }
    }

    fn discard(&self, child: ResolverChild) {
        self.count.set(self.count.get().saturating_sub(1));
        child.kill();
    }
}

pub(super) fn resolve(
    pool: &Rc<ChildPool>,
    ev: &EventLoop,
    hostname: &str,
    port: u16,
    query: DnsQuery,
    cb: ResolveFn,
) {
    if hostname.len() >= HOSTNAME_MAX {
        let host = hostname.to_string();
        let slot = RefCell::new(Some(cb));
        ev.schedule_after(0, move || {
            if let Some(cb) = slot.borrow_mut().take() {
                if !query.is_cancelled() {
                    cb(Err(ResolveError::BadHostname { host: host.clone() }));
                }
            }
            false
        });
        return;
    }

    let pending = Pending { hostname: hostname.to_string(), port, query, cb };
    dispatch(pool, pending);
}

fn dispatch(pool: &Rc<ChildPool>, pending: Pending) {
    if let Some(child) = pool.take_free() {
        run_on_child(pool, child, pending);
        return;
    }
    if pool.count.get() < MAX_DNS_CHILDREN {
        match spawn_child() {
            Ok(child) => {
                pool.count.set(pool.count.get() + 1);
                run_on_child(pool, child, pending);
            }
            Err(e) => {
                if !pending.query.is_cancelled() {
                    (pending.cb)(Err(ResolveError::SpawnFailed(e)));
                }
            }
        }
        return;
    }
    debug::info("dnsquery", &format!("queueing DNS query for {}", pending.hostname));
    pool.queue.borrow_mut().push_back(pending);
}

fn service_queue(pool: &Rc<ChildPool>) {
    loop {
        let Some(next) = pool.queue.borrow_mut().pop_front() else {
            return;
        };
        if next.query.is_cancelled() {
            continue;
        }
        dispatch(pool, next);
        return;
    }
}

fn run_on_child(pool: &Rc<ChildPool>, child: ResolverChild, pending: Pending) {
    let pool = Rc::clone(pool);
    tokio::task::spawn_local(async move {
        let Pending { hostname, port, query, cb } = pending;

        let outcome = converse(&child, &hostname, port).await;
        match outcome {
            Ok(result) => {
                pool.free.borrow_mut().push(child);
                if !query.is_cancelled() {
                    cb(result);
                }
            }
            Err(e) => {
                debug::error("dnsquery", &format!("resolver child failed: {e}"));
                pool.discard(child);
                if !query.is_cancelled() {
                    cb(Err(e));
                }
            }
        }
        service_queue(&pool);
    });
}

/// Send one request and read the full response. An `Err` from this function
/// means the child itself is broken; a lookup failure is `Ok(Err(..))`.
async fn converse(
    child: &ResolverChild,
    hostname: &str,
    port: u16,
) -> std::result::Result<Result<Vec<SocketAddr>>, ResolveError> {
    let mut request = [0u8; HOSTNAME_MAX + 4];
    request[..hostname.len()].copy_from_slice(hostname.as_bytes());
    request[HOSTNAME_MAX..].copy_from_slice(&(port as i32).to_ne_bytes());

    write_all_async(&child.fd_in, &request).await?;

    let afd = AsyncFd::with_interest(child.fd_out.as_raw_fd(), Interest::READABLE)
        .map_err(ResolveError::Io)?;

    let mut status = [0u8; 4];
    read_exact_async(&afd, &mut status).await?;
    let status = i32::from_ne_bytes(status);
    if status != 0 {
        let host = hostname.to_string();
        return Ok(Err(match status {
            libc::EAI_AGAIN => ResolveError::Temporary { host },
            _ => ResolveError::BadHostname { host },
        }));
    }

    let mut addrs = Vec::new();
    loop {
        let mut len = [0u8; 4];
        read_exact_async(&afd, &mut len).await?;
        let len = u32::from_ne_bytes(len) as usize;
        if len == 0 {
            break;
        }
        if len > 128 {
            return Err(ResolveError::ChildEof);
        }
        let mut sockaddr = vec![0u8; len];
        read_exact_async(&afd, &mut sockaddr).await?;
        if let Some(addr) = sockaddr_to_addr(&sockaddr) {
            addrs.push(addr);
        }
    }

    if addrs.is_empty() {
        return Ok(Err(ResolveError::BadHostname { host: hostname.to_string() }));
    }
    Ok(Ok(addrs))
}

async fn write_all_async(fd: &OwnedFd, mut buf: &[u8]) -> std::result::Result<(), ResolveError> {
    let afd = AsyncFd::with_interest(fd.as_raw_fd(), Interest::WRITABLE)
        .map_err(ResolveError::Io)?;
    while !buf.is_empty() {
        let mut guard = afd.writable().await.map_err(ResolveError::Io)?;
        // SAFETY: the fd is open; buf is valid for buf.len() bytes.
        let n = unsafe {
            libc::write(
                afd.get_ref().as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return Err(ResolveError::ChildEof);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

async fn read_exact_async(
    afd: &AsyncFd<RawFd>,
    buf: &mut [u8],
) -> std::result::Result<(), ResolveError> {
    let mut filled = 0;
    while filled < buf.len() {
        let mut guard = afd.readable().await.map_err(ResolveError::Io)?;
        // SAFETY: the fd is open; the remaining buffer is valid.
        let n = unsafe {
            libc::read(
                *afd.get_ref(),
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return Err(ResolveError::ChildEof);
        }
        if n == 0 {
            return Err(ResolveError::ChildEof);
        }
        filled += n as usize;
    }
    Ok(())
}

/// Decode a raw `sockaddr` (Linux layout) into a `SocketAddr`.
fn sockaddr_to_addr(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() < 2 {
        return None;
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    match family as i32 {
        libc::AF_INET if bytes.len() >= 8 => {
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 if bytes.len() >= 24 => {
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[8..24]);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                0,
                0,
            )))
        }
        _ => None,
    }
}

fn set_nonblocking(fd: RawFd) {
    // SAFETY: fcntl on an owned, open descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn spawn_child() -> io::Result<ResolverChild> {
    let mut req_fds = [0i32; 2];
    let mut resp_fds = [0i32; 2];
    // SAFETY: valid out-arrays.
    unsafe {
        if libc::pipe(req_fds.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::pipe(resp_fds.as_mut_ptr()) != 0 {
            libc::close(req_fds[0]);
            libc::close(req_fds[1]);
            return Err(io::Error::last_os_error());
        }
    }

    // SAFETY: fork with immediate divergence; the child only touches its
    // pipe ends and async-signal-safe-adjacent calls plus getaddrinfo,
    // mirroring the long-standing child-resolver design.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        unsafe {
            libc::close(req_fds[0]);
            libc::close(req_fds[1]);
            libc::close(resp_fds[0]);
            libc::close(resp_fds[1]);
        }
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // Child: read requests from req_fds[0], write responses to
        // resp_fds[1]. Never returns.
        unsafe {
            libc::close(req_fds[1]);
            libc::close(resp_fds[0]);
        }
        child_main(req_fds[0], resp_fds[1]);
    }

    // Parent keeps the opposite ends, non-blocking.
    unsafe {
        libc::close(req_fds[0]);
        libc::close(resp_fds[1]);
    }
    set_nonblocking(req_fds[1]);
    set_nonblocking(resp_fds[0]);
    debug::info("dnsquery", &format!("spawned resolver child {pid}"));
    // SAFETY: the parent owns these two descriptors now.
    Ok(unsafe {
        ResolverChild {
            pid,
            fd_in: OwnedFd::from_raw_fd(req_fds[1]),
            fd_out: OwnedFd::from_raw_fd(resp_fds[0]),
        }
    })
}

fn child_write_all(fd: RawFd, buf: &[u8]) -> bool {
    let mut off = 0;
    while off < buf.len() {
        // SAFETY: fd is the child's response pipe; buffer range is valid.
        let n = unsafe {
            libc::write(fd, buf[off..].as_ptr() as *const libc::c_void, buf.len() - off)
        };
        if n <= 0 {
            return false;
        }
        off += n as usize;
    }
    true
}

fn child_read_exact(fd: RawFd, buf: &mut [u8]) -> bool {
    let mut off = 0;
    while off < buf.len() {
        // SAFETY: fd is the child's request pipe; buffer range is valid.
        let n = unsafe {
            libc::read(fd, buf[off..].as_mut_ptr() as *mut libc::c_void, buf.len() - off)
        };
        if n <= 0 {
            return false;
        }
        off += n as usize;
    }
    true
}

fn child_main(req_fd: RawFd, resp_fd: RawFd) -> ! {
    loop {
        let mut pfd = libc::pollfd { fd: req_fd, events: libc::POLLIN, revents: 0 };
        // SAFETY: pfd is valid for the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, CHILD_IDLE_TIMEOUT_MS) };
        if rc <= 0 {
            // Idle timeout or error: exit and let the parent notice EOF.
            unsafe { libc::_exit(0) }
        }

        let mut request = [0u8; HOSTNAME_MAX + 4];
        if !child_read_exact(req_fd, &mut request) {
            unsafe { libc::_exit(0) }
        }
        let name_len = request[..HOSTNAME_MAX]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HOSTNAME_MAX);
        let mut host = [0u8; HOSTNAME_MAX];
        host[..name_len].copy_from_slice(&request[..name_len]);
        let port = i32::from_ne_bytes([
            request[HOSTNAME_MAX],
            request[HOSTNAME_MAX + 1],
            request[HOSTNAME_MAX + 2],
            request[HOSTNAME_MAX + 3],
        ]);
        let mut service = [0u8; 8];
        let port_str = format!("{port}");
        service[..port_str.len()].copy_from_slice(port_str.as_bytes());

        // SAFETY: hints is zeroed then initialized; host/service are
        // NUL-terminated buffers living on this stack frame.
        let status = unsafe {
            let mut hints: libc::addrinfo = std::mem::zeroed();
            hints.ai_family = libc::AF_UNSPEC;
            hints.ai_socktype = libc::SOCK_STREAM;
            let mut res: *mut libc::addrinfo = std::ptr::null_mut();
            let status = libc::getaddrinfo(
                host.as_ptr() as *const libc::c_char,
                service.as_ptr() as *const libc::c_char,
                &hints,
                &mut res,
            );

            if !child_write_all(resp_fd, &status.to_ne_bytes()) {
                libc::_exit(0);
            }
            if status == 0 {
                let mut cursor = res;
                while !cursor.is_null() {
                    let ai = &*cursor;
                    let len = ai.ai_addrlen;
                    if !child_write_all(resp_fd, &len.to_ne_bytes())
                        || !child_write_all(
                            resp_fd,
                            std::slice::from_raw_parts(ai.ai_addr as *const u8, len as usize),
                        )
                    {
                        libc::_exit(0);
                    }
                    cursor = ai.ai_next;
                }
                if !child_write_all(resp_fd, &0u32.to_ne_bytes()) {
                    libc::_exit(0);
                }
                libc::freeaddrinfo(res);
            }
            status
        };
        let _ = status;
    }
}
