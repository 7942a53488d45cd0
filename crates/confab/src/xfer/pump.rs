//! The transfer pump: one buffer per iteration, gated by the ready mask.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    DataNotSentEvent, OpenLocalEvent, QueryLocalEvent, ReadLocalEvent, WriteLocalEvent, Xfer,
    XferDirection, XferTransport, ready,
};
use crate::debug;

pub(super) async fn run(xfer: Xfer) {
    let Some(mut transport) = xfer.take_transport() else {
        return;
    };
    match xfer.direction() {
        XferDirection::Send => run_send(&xfer, &mut transport).await,
        XferDirection::Receive => run_receive(&xfer, &mut transport).await,
    }
}

/// Emit `open-local`; returns whether a plugin took over local access.
fn local_overridden(xfer: &Xfer) -> bool {
    let Some(signals) = xfer.signals() else {
        return false;
    };
    let mut event = OpenLocalEvent { xfer: xfer.clone(), handled: false };
    let _ = signals.emit("open-local", &mut event);
    if event.handled && xfer.size() == 0 {
        // A plugin-backed source still has to tell us how much is coming.
        let mut query = QueryLocalEvent { xfer: xfer.clone(), size: None };
        let _ = signals.emit("query-local", &mut query);
        if let Some(size) = query.size {
            xfer.set_size(size);
        }
    }
    event.handled
}

fn read_from_plugin(xfer: &Xfer, want: usize) -> Option<Vec<u8>> {
    let signals = xfer.signals()?;
    let mut event = ReadLocalEvent { xfer: xfer.clone(), want, data: None };
    let _ = signals.emit("read-local", &mut event);
    event.data
}

/// Returns whether a plugin consumed the bytes.
fn write_to_plugin(xfer: &Xfer, data: &[u8]) -> bool {
    let Some(signals) = xfer.signals() else {
        return false;
    };
    let mut event = WriteLocalEvent {
        xfer: xfer.clone(),
        data: data.to_vec(),
        handled: false,
    };
    let _ = signals.emit("write-local", &mut event);
    event.handled
}

fn report_unsent(xfer: &Xfer, data: &[u8]) {
    if let Some(signals) = xfer.signals() {
        let mut event = DataNotSentEvent { xfer: xfer.clone(), data: data.to_vec() };
        let _ = signals.emit("data-not-sent", &mut event);
    }
}

async fn run_send(xfer: &Xfer, transport: &mut Box<dyn XferTransport>) {
    let plugin_backed = local_overridden(xfer);
    let mut file = if plugin_backed {
        None
    } else {
        let Some(path) = xfer.local_filename() else {
            xfer.show_error("No local file to send.");
            xfer.cancel_local();
            return;
        };
        match tokio::fs::File::open(&path).await {
            Ok(f) => Some(f),
            Err(e) => {
                xfer.show_error(&format!("Unable to open {}: {e}", path.display()));
                xfer.cancel_local();
                return;
            }
        }
    };

    // Bytes read from the source but not yet accepted by the wire.
    let mut carry: Vec<u8> = Vec::new();

    loop {
        xfer.await_ready().await;
        if xfer.is_cancelled() {
            return;
        }

        if carry.is_empty() {
            let total_read = xfer.bytes_sent();
            let remaining = xfer.size().saturating_sub(total_read) as usize;
            if remaining == 0 {
                xfer.finish();
                return;
            }
            let want = remaining.min(xfer.buffer_size());

            let chunk = if plugin_backed {
                match read_from_plugin(xfer, want) {
                    Some(data) => data,
                    None => {
                        // The source claimed readiness but had nothing yet;
                        // it will call ui_ready when data exists.
                        xfer.set_ui_paced();
                        xfer.inner.ready.set(xfer.inner.ready.get() & !ready::UI);
                        continue;
                    }
                }
            } else {
                let mut buf = vec![0u8; want];
                match file.as_mut().expect("file-backed send").read(&mut buf).await {
                    Ok(0) => {
                        xfer.show_error("The file shrank while it was being sent.");
                        xfer.cancel_local();
                        return;
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        buf
                    }
                    Err(e) => {
                        xfer.show_error(&format!("Read failed: {e}"));
                        xfer.cancel_local();
                        return;
                    }
                }
            };
            if chunk.len() == xfer.buffer_size() {
                xfer.maybe_grow_buffer(chunk.len());
            }
            carry = chunk;
        }

        match transport.write(&carry).await {
            Ok(0) => {
                xfer.cancel_remote();
                return;
            }
            Ok(n) => {
                xfer.add_bytes_sent(n as u64);
                if n < carry.len() {
                    let rest = carry.split_off(n);
                    carry = rest;
                    report_unsent(xfer, &carry);
                } else {
                    carry.clear();
                }
            }
            Err(e) => {
                debug::error("xfer", &format!("wire write failed: {e}"));
                xfer.cancel_remote();
                return;
            }
        }

        if carry.is_empty() && xfer.bytes_sent() >= xfer.size() {
            let _ = transport.flush().await;
            xfer.finish();
            return;
        }
        xfer.pump_iteration_done();
    }
}

async fn run_receive(xfer: &Xfer, transport: &mut Box<dyn XferTransport>) {
    let plugin_backed = local_overridden(xfer);
    let mut file = if plugin_backed {
        None
    } else {
        let Some(path) = xfer.local_filename() else {
            xfer.show_error("No destination file chosen.");
            xfer.cancel_local();
            return;
        };
        match tokio::fs::File::create(&path).await {
            Ok(f) => Some(f),
            Err(e) => {
                xfer.show_error(&format!("Unable to write {}: {e}", path.display()));
                xfer.cancel_local();
                return;
            }
        }
    };

    loop {
        xfer.await_ready().await;
        if xfer.is_cancelled() {
            return;
        }

        let mut buf = vec![0u8; xfer.buffer_size()];
        let n = match transport.read(&mut buf).await {
            Ok(0) => {
                let size = xfer.size();
                if size > 0 && xfer.bytes_sent() >= size {
                    xfer.finish();
                } else if size == 0 {
                    // Unknown size: EOF is the only end marker.
                    xfer.finish();
                } else {
                    xfer.cancel_remote();
                }
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug::error("xfer", &format!("wire read failed: {e}"));
                xfer.cancel_remote();
                return;
            }
        };
        buf.truncate(n);

        // Size overrun is truncated with a warning; the wire is not trusted
        // over the negotiated size.
        let size = xfer.size();
        if size > 0 {
            let room = size.saturating_sub(xfer.bytes_sent()) as usize;
            if buf.len() > room {
                debug::warning(
                    "xfer",
                    &format!("peer sent {} bytes past the advertised size", buf.len() - room),
                );
                buf.truncate(room);
            }
        }

        if !buf.is_empty() {
            if !write_to_plugin(xfer, &buf) {
                if let Some(file) = file.as_mut() {
                    if let Err(e) = file.write_all(&buf).await {
                        xfer.show_error(&format!("Write failed: {e}"));
                        xfer.cancel_local();
                        return;
                    }
                }
            }
            xfer.add_bytes_sent(buf.len() as u64);
            xfer.maybe_grow_buffer(n);
        }

        if size > 0 && xfer.bytes_sent() >= size {
            if let Some(file) = file.as_mut() {
                let _ = file.flush().await;
            }
            xfer.finish();
            return;
        }
        xfer.pump_iteration_done();
    }
}
