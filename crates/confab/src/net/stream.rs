//! Queued output stream with back-pressure.
//!
//! Writers never block: [`QueuedOutputStream::queue`] appends a chunk and
//! returns. A loop-local task drains the queue in submission order through
//! an internal buffer that starts at [`BUF_INITIAL`] and grows by half,
//! capped at [`BUF_MAX`], whenever a full buffer was accepted by a single
//! write. A fatal write error parks on the stream and surfaces from the
//! next `queue` or `graceful_close`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

/// Initial coalescing buffer size.
pub const BUF_INITIAL: usize = 4096;
/// Buffer growth ceiling.
pub const BUF_MAX: usize = 65535;

struct Inner {
    queue: RefCell<VecDeque<Bytes>>,
    pending: Cell<usize>,
    buf_size: Cell<usize>,
    error: RefCell<Option<io::Error>>,
    closing: Cell<bool>,
    closed: Cell<bool>,
    wake: Notify,
    done: Notify,
}

/// Handle to an async write queue. Clones share the queue.
#[derive(Clone)]
pub struct QueuedOutputStream {
    inner: Rc<Inner>,
}

impl QueuedOutputStream {
    /// Wrap a writer, spawning the loop-local flush task.
    pub fn new<W: AsyncWrite + Unpin + 'static>(writer: W) -> QueuedOutputStream {
        let inner = Rc::new(Inner {
            queue: RefCell::new(VecDeque::new()),
            pending: Cell::new(0),
            buf_size: Cell::new(BUF_INITIAL),
            error: RefCell::new(None),
            closing: Cell::new(false),
            closed: Cell::new(false),
            wake: Notify::new(),
            done: Notify::new(),
        });
        tokio::task::spawn_local(flush_task(Rc::clone(&inner), writer));
        QueuedOutputStream { inner }
    }

    /// Append a chunk. Returns the error from an earlier failed flush, if
    /// any; the chunk is dropped in that case.
    pub fn queue(&self, bytes: impl Into<Bytes>) -> io::Result<()> {
        if let Some(e) = self.inner.error.borrow_mut().take() {
            return Err(e);
        }
        if self.inner.closing.get() || self.inner.closed.get() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closing"));
        }
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Ok(());
        }
        self.inner.pending.set(self.inner.pending.get() + bytes.len());
        self.inner.queue.borrow_mut().push_back(bytes);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Bytes accepted but not yet written.
    pub fn pending(&self) -> usize {
        self.inner.pending.get()
    }

    /// Current coalescing buffer size (grows under load).
    pub fn buffer_size(&self) -> usize {
        self.inner.buf_size.get()
    }

    /// Flush everything still queued, then shut the writer down.
    pub async fn graceful_close(&self) -> io::Result<()> {
        self.inner.closing.set(true);
        self.inner.wake.notify_one();
        while !self.inner.closed.get() {
            self.inner.done.notified().await;
        }
        match self.inner.error.borrow_mut().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abandon queued data and stop the flush task.
    pub fn abort(&self) {
        self.inner.queue.borrow_mut().clear();
        self.inner.pending.set(0);
        self.inner.closing.set(true);
        self.inner.wake.notify_one();
    }
}

/// Pull up to `limit` bytes off the queue into one contiguous buffer.
fn fill_chunk(inner: &Inner, limit: usize) -> Bytes {
    let mut queue = inner.queue.borrow_mut();

    // Single large chunk: split without copying.
    let single_large =
        queue.len() == 1 && queue.front().is_some_and(|front| front.len() >= limit);
    if single_large {
        let front = queue.front_mut().expect("non-empty");
        let out = front.split_to(limit);
        let drained = front.is_empty();
        if drained {
            queue.pop_front();
        }
        return out;
    }

    let mut buf = BytesMut::with_capacity(limit);
    while buf.len() < limit {
        let Some(mut front) = queue.pop_front() else {
            break;
        };
        let space = limit - buf.len();
        if front.len() > space {
            buf.extend_from_slice(&front.split_to(space));
            queue.push_front(front);
            break;
        }
        buf.extend_from_slice(&front);
    }
    buf.freeze()
}

async fn flush_task<W: AsyncWrite + Unpin>(inner: Rc<Inner>, mut writer: W) {
    loop {
        let empty = inner.queue.borrow().is_empty();
        if empty {
            if inner.closing.get() {
                break;
            }
            inner.wake.notified().await;
            continue;
        }

        let buf_size = inner.buf_size.get();
        let mut chunk = fill_chunk(&inner, buf_size);
        let chunk_len = chunk.len();

        while !chunk.is_empty() {
            match writer.write(&chunk).await {
                Ok(0) => {
                    record_error(
                        &inner,
                        io::Error::new(io::ErrorKind::WriteZero, "connection closed"),
                    );
                    finish(&inner);
                    return;
                }
                Ok(n) => {
                    inner.pending.set(inner.pending.get().saturating_sub(n));
                    // A full buffer in one syscall means the peer can take
                    // more per wakeup: grow, up to the cap.
                    if n == chunk_len && chunk_len == buf_size {
                        let grown = (buf_size + buf_size / 2).min(BUF_MAX);
                        inner.buf_size.set(grown);
                    }
                    let _ = chunk.split_to(n);
                }
                Err(e) => {
                    record_error(&inner, e);
                    finish(&inner);
                    return;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    finish(&inner);
}

fn record_error(inner: &Inner, e: io::Error) {
    inner.queue.borrow_mut().clear();
    inner.pending.set(0);
    *inner.error.borrow_mut() = Some(e);
}

fn finish(inner: &Inner) {
    inner.closed.set(true);
    // Waiters that arrive later observe `closed` before awaiting.
    inner.done.notify_waiters();
}
