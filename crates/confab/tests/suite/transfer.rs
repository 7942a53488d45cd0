//! File-transfer engine end-to-end: the pump, back-pressure, endings.

use std::cell::RefCell;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use confab::account::Account;
use confab::xfer::{Xfer, XferDirection, XferStatus, XferUiOps};

use crate::common::{run_local, test_core, wait_for};

/// Wire that accepts at most `max` bytes per write, to force many pump
/// iterations.
struct Throttled<T> {
    inner: T,
    max: usize,
}

impl<T: AsyncRead + Unpin> AsyncRead for Throttled<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Throttled<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let max = self.max;
        let capped = &buf[..buf.len().min(max)];
        Pin::new(&mut self.get_mut().inner).poll_write(cx, capped)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Default)]
struct XferRecorder {
    progress_bytes: RefCell<Vec<u64>>,
    ended: RefCell<u32>,
    cancelled: RefCell<u32>,
}

impl XferUiOps for XferRecorder {
    fn update_progress(&self, xfer: &Xfer, _fraction: f64) {
        self.progress_bytes.borrow_mut().push(xfer.bytes_sent());
    }

    fn ended(&self, _xfer: &Xfer) {
        *self.ended.borrow_mut() += 1;
    }

    fn cancelled(&self, _xfer: &Xfer) {
        *self.cancelled.borrow_mut() += 1;
    }
}

fn temp_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("confab-{tag}-{}", confab::util::uuid_random()))
}

#[test]
fn send_small_file_in_hundred_byte_steps() {
    run_local(async {
        let core = test_core();
        let recorder = Rc::new(XferRecorder::default());
        core.set_xfer_ui_ops(recorder.clone());
        let account = core.add_account(Account::new("instant", "me"));

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let path = temp_path("send");
        std::fs::write(&path, &payload).unwrap();

        let (near, far) = tokio::io::duplex(1 << 16);
        let receiver = tokio::task::spawn_local(async move {
            let mut got = Vec::new();
            let mut far = far;
            far.read_to_end(&mut got).await.unwrap();
            got
        });

        let xfer = core.new_xfer(&account, XferDirection::Send, "peer");
        xfer.set_local_filename(&path);
        xfer.request();
        wait_for(|| xfer.status() == XferStatus::Accepted).await;
        assert_eq!(xfer.size(), 1000);

        xfer.start(Box::new(Throttled { inner: near, max: 100 }));
        wait_for(|| xfer.status() == XferStatus::Done).await;

        // Ten 100-byte steps, monotone, ending exactly at the size.
        let progress = recorder.progress_bytes.borrow();
        let steps: Vec<u64> = progress.clone();
        assert_eq!(*steps.last().unwrap(), 1000);
        let mut prev = 0;
        for b in &steps {
            assert!(*b >= prev, "bytes_sent must be monotone");
            assert!(*b - prev <= 100, "step exceeded the transport cap");
            prev = *b;
        }
        assert_eq!(steps.iter().filter(|b| **b % 100 == 0).count(), steps.len());
        assert_eq!(steps.len(), 10);
        assert_eq!(*recorder.ended.borrow(), 1, "exactly one end emission");
        assert_eq!(*recorder.cancelled.borrow(), 0);

        // The recipient got identical bytes.
        assert_eq!(receiver.await.unwrap(), payload);

        std::fs::remove_file(&path).ok();
        core.shutdown();
    });
}

#[test]
fn receive_writes_file_and_truncates_overrun() {
    run_local(async {
        let core = test_core();
        let recorder = Rc::new(XferRecorder::default());
        core.set_xfer_ui_ops(recorder.clone());
        let account = core.add_account(Account::new("instant", "me"));

        let payload: Vec<u8> = (0..500u32).map(|i| (i % 13) as u8).collect();
        let dest = temp_path("recv");

        let (near, far) = tokio::io::duplex(1 << 16);
        let xfer = core.new_xfer(&account, XferDirection::Receive, "peer");
        xfer.set_remote_filename("payload.bin");
        xfer.set_size(500);
        xfer.request_accepted(&dest);
        assert_eq!(xfer.status(), XferStatus::Accepted);
        xfer.start(Box::new(near));

        let mut far = far;
        // Send the payload plus bytes past the advertised size. The pump
        // may finish (and drop its end) before the overrun lands, so these
        // writes are best-effort.
        let _ = far.write_all(&payload).await;
        let _ = far.write_all(b"overrun bytes the peer should not trust").await;
        let _ = far.shutdown().await;

        wait_for(|| xfer.status() == XferStatus::Done).await;
        assert_eq!(xfer.bytes_sent(), 500);
        assert!(xfer.bytes_sent() <= xfer.size());

        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written, payload, "overrun must be truncated");
        assert_eq!(*recorder.ended.borrow(), 1);

        std::fs::remove_file(&dest).ok();
        core.shutdown();
    });
}

#[test]
fn remote_close_before_size_is_a_remote_cancel() {
    run_local(async {
        let core = test_core();
        let recorder = Rc::new(XferRecorder::default());
        core.set_xfer_ui_ops(recorder.clone());
        let account = core.add_account(Account::new("instant", "me"));

        let dest = temp_path("cancelled");
        let (near, far) = tokio::io::duplex(1 << 16);
        let xfer = core.new_xfer(&account, XferDirection::Receive, "peer");
        xfer.set_remote_filename("never-finishes.bin");
        xfer.set_size(10_000);
        xfer.request_accepted(&dest);
        xfer.start(Box::new(near));

        let mut far = far;
        far.write_all(b"a few bytes").await.unwrap();
        drop(far);

        wait_for(|| xfer.status() == XferStatus::CancelRemote).await;
        assert_eq!(*recorder.cancelled.borrow(), 1);
        assert_eq!(*recorder.ended.borrow(), 0);

        // The cancellation left a system message in the peer conversation.
        let conv = core
            .with_conversations(|c| c.find_im(&account, "peer"))
            .unwrap();
        let last = conv.last_message().unwrap();
        assert!(last.flags & confab::conversation::flags::SYSTEM != 0);
        assert!(last.content.contains("cancelled"));

        std::fs::remove_file(&dest).ok();
        core.shutdown();
    });
}

#[test]
fn plugin_auto_accepts_recv_request() {
    run_local(async {
        let core = test_core();
        let account = core.add_account(Account::new("instant", "me"));

        let dest = temp_path("auto");
        let dest2 = dest.clone();
        core.signals()
            .connect(
                "file-recv-request",
                move |e: &mut confab::xfer::FileRecvRequestEvent| {
                    e.xfer.request_accepted(&dest2);
                    false
                },
            )
            .unwrap();

        let xfer = core.new_xfer(&account, XferDirection::Receive, "peer");
        xfer.set_remote_filename("auto.bin");
        xfer.set_size(3);
        xfer.request();
        assert_eq!(xfer.status(), XferStatus::Accepted);
        assert_eq!(xfer.local_filename(), Some(dest.clone()));

        let (near, far) = tokio::io::duplex(64);
        xfer.start(Box::new(near));
        let mut far = far;
        far.write_all(b"abc").await.unwrap();
        far.shutdown().await.unwrap();
        wait_for(|| xfer.status() == XferStatus::Done).await;
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");

        std::fs::remove_file(&dest).ok();
        core.shutdown();
    });
}

#[test]
fn manual_ready_mask_pauses_the_pump() {
    run_local(async {
        let core = test_core();
        let account = core.add_account(Account::new("instant", "me"));

        let payload = vec![7u8; 200];
        let path = temp_path("paced");
        std::fs::write(&path, &payload).unwrap();

        let (near, far) = tokio::io::duplex(1 << 16);
        let xfer = core.new_xfer(&account, XferDirection::Send, "peer");
        xfer.set_local_filename(&path);
        xfer.request();
        wait_for(|| xfer.status() == XferStatus::Accepted).await;

        // The UI paces the pump by hand and has not armed its bit yet.
        xfer.set_ui_paced();
        xfer.start(Box::new(Throttled { inner: near, max: 100 }));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(xfer.bytes_sent(), 0, "pump must wait for ui_ready");

        // Each ui_ready releases iterations until the next gate clear.
        xfer.ui_ready();
        wait_for(|| xfer.status() == XferStatus::Done || xfer.bytes_sent() > 0).await;
        while xfer.status() != XferStatus::Done {
            xfer.ui_ready();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(xfer.bytes_sent(), 200);

        let receiver = tokio::task::spawn_local(async move {
            let mut got = Vec::new();
            let mut far = far;
            far.read_to_end(&mut got).await.unwrap();
            got
        });
        assert_eq!(receiver.await.unwrap(), payload);

        std::fs::remove_file(&path).ok();
        core.shutdown();
    });
}
