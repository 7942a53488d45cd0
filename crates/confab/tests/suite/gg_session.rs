//! Gadu-Gadu binary session against a scripted server.

use std::cell::Cell;
use std::rc::Rc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use confab::account::Account;
use confab::conversation::TypingState;
use confab::protocol::gg::{GgProtocol, PacketEvent};

use crate::common::{ConnRecorder, run_local, test_core, wait_for};

const GG_WELCOME: u32 = 0x0001;
const GG_STATUS: u32 = 0x0002;
const GG_LOGIN_OK: u32 = 0x0003;
const GG_RECV_MSG: u32 = 0x000a;
const GG_LOGIN: u32 = 0x0031;
const GG_NOTIFY: u32 = 0x0010;
const GG_TYPING_NOTIFY: u32 = 0x0059;

const GG_STATUS_AVAIL: u32 = 0x0002;

fn packet(kind: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Read one framed packet from the scripted server's side.
async fn read_packet(stream: &mut TcpStream, buf: &mut Vec<u8>) -> (u32, Vec<u8>) {
    let mut chunk = [0u8; 2048];
    loop {
        if buf.len() >= 8 {
            let kind = u32::from_le_bytes(buf[0..4].try_into().unwrap());
            let len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
            if buf.len() >= 8 + len {
                let body = buf[8..8 + len].to_vec();
                buf.drain(..8 + len);
                return (kind, body);
            }
        }
        let n = stream.read(&mut chunk).await.expect("script read");
        assert!(n > 0, "client hung up mid-packet");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn event_fsm_login_presence_and_messaging() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(GgProtocol::new()));
        let recorder = Rc::new(ConnRecorder::default());
        core.set_account_ui_ops(recorder.clone());

        let account = core.add_account(Account::new("gg", "123456"));
        account.set_password(Some("tajne".into()));
        core.with_blist(|b| {
            b.add_buddy(&account, "7777", "Friends");
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        account.set_string("server", "127.0.0.1");
        account.set_int("port", port as i64);

        tokio::task::spawn_local(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();

            stream
                .write_all(&packet(GG_WELCOME, &0xabadcafeu32.to_le_bytes()))
                .await
                .unwrap();

            let (kind, body) = read_packet(&mut stream, &mut buf).await;
            assert_eq!(kind, GG_LOGIN);
            let uin = u32::from_le_bytes(body[0..4].try_into().unwrap());
            assert_eq!(uin, 123456);

            stream.write_all(&packet(GG_LOGIN_OK, &[])).await.unwrap();

            // The client uploads its notify list right after login.
            let (kind, body) = read_packet(&mut stream, &mut buf).await;
            assert_eq!(kind, GG_NOTIFY);
            assert_eq!(body.len(), 4);
            assert_eq!(u32::from_le_bytes(body[0..4].try_into().unwrap()), 7777);

            // Buddy 7777 comes online, then messages us.
            let mut status = Vec::new();
            status.extend_from_slice(&7777u32.to_le_bytes());
            status.extend_from_slice(&GG_STATUS_AVAIL.to_le_bytes());
            stream.write_all(&packet(GG_STATUS, &status)).await.unwrap();

            let mut msg = Vec::new();
            msg.extend_from_slice(&7777u32.to_le_bytes());
            msg.extend_from_slice(&1u32.to_le_bytes());
            msg.extend_from_slice("siema".as_bytes());
            msg.push(0);
            stream.write_all(&packet(GG_RECV_MSG, &msg)).await.unwrap();

            // Expect the reply message on the wire.
            loop {
                let (kind, body) = read_packet(&mut stream, &mut buf).await;
                if kind == 0x000b {
                    let uin = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    assert_eq!(uin, 7777);
                    break;
                }
            }

            let mut sink = [0u8; 1024];
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        core.connect_account(&account).unwrap();
        wait_for(|| !recorder.connected.borrow().is_empty()).await;

        // Presence propagated to the buddy list.
        wait_for(|| {
            core.with_blist(|b| b.find_buddy(&account, "7777"))
                .map(|b| b.is_online())
                .unwrap_or(false)
        })
        .await;

        // The inbound message landed in a conversation.
        wait_for(|| {
            core.with_conversations(|c| c.find_im(&account, "7777")).is_some()
        })
        .await;
        let conv = core
            .with_conversations(|c| c.find_im(&account, "7777"))
            .unwrap();
        assert_eq!(conv.last_message().unwrap().content, "siema");

        assert!(core.send_im(&account, "7777", "no siema") > 0);
        wait_for(|| conv.history().len() == 2).await;

        assert!(recorder.errors.borrow().is_empty());
        core.shutdown();
    });
}

#[test]
fn typing_notifications_are_rate_limited() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(GgProtocol::new()));
        let recorder = Rc::new(ConnRecorder::default());
        core.set_account_ui_ops(recorder.clone());

        let account = core.add_account(Account::new("gg", "123456"));
        account.set_password(Some("tajne".into()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        account.set_string("server", "127.0.0.1");
        account.set_int("port", port as i64);

        tokio::task::spawn_local(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream
                .write_all(&packet(GG_WELCOME, &1u32.to_le_bytes()))
                .await
                .unwrap();
            let _ = read_packet(&mut stream, &mut buf).await;
            stream.write_all(&packet(GG_LOGIN_OK, &[])).await.unwrap();
            let mut sink = [0u8; 1024];
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        core.connect_account(&account).unwrap();
        wait_for(|| !recorder.connected.borrow().is_empty()).await;

        // Count typing packets as they cross the signal bus. The signal
        // exists once the protocol has logged in.
        let typing_sent = Rc::new(Cell::new(0u32));
        let t = typing_sent.clone();
        let typing_lengths = Rc::new(std::cell::RefCell::new(Vec::<u16>::new()));
        let lengths = typing_lengths.clone();
        core.signals()
            .connect("gg-sending-packet", move |e: &mut PacketEvent| {
                let kind = u32::from_le_bytes(e.data[0..4].try_into().unwrap());
                if kind == GG_TYPING_NOTIFY {
                    t.set(t.get() + 1);
                    let length = u16::from_le_bytes(e.data[8..10].try_into().unwrap());
                    lengths.borrow_mut().push(length);
                }
                false
            })
            .unwrap();

        // A burst of typing events within the suppression window collapses
        // into one notification.
        core.send_typing(&account, "7777", TypingState::Typing);
        core.send_typing(&account, "7777", TypingState::Typing);
        core.send_typing(&account, "7777", TypingState::Typing);
        assert_eq!(typing_sent.get(), 1);
        assert!(typing_lengths.borrow()[0] > 0, "typing carries a nonzero length");

        // Stopping is a state change and goes out immediately, length 0.
        core.send_typing(&account, "7777", TypingState::NotTyping);
        assert_eq!(typing_sent.get(), 2);
        assert_eq!(typing_lengths.borrow()[1], 0);

        core.shutdown();
    });
}
