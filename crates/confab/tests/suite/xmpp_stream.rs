//! XMPP stream establishment against a scripted server.

use std::rc::Rc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use confab::account::Account;
use confab::protocol::ConnectionError;
use confab::protocol::xmpp::XmppProtocol;

use crate::common::{ConnRecorder, run_local, test_core, wait_for};

const STREAM_HEADER: &str = "<stream:stream xmlns=\"jabber:client\" \
    xmlns:stream=\"http://etherx.jabber.org/streams\" id=\"s1\" \
    from=\"example.net\" version=\"1.0\">";

async fn read_until(stream: &mut TcpStream, needle: &str, ctx: &mut String) {
    let mut chunk = [0u8; 2048];
    while !ctx.contains(needle) {
        let n = stream.read(&mut chunk).await.expect("script read");
        assert!(n > 0, "client hung up while the script waited for {needle}");
        ctx.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
    ctx.clear();
}

fn extract_attr(haystack: &str, name: &str) -> Option<String> {
    let start = haystack.find(&format!("{name}=\""))? + name.len() + 2;
    let end = haystack[start..].find('"')? + start;
    Some(haystack[start..end].to_string())
}

fn xmpp_account(core: &confab::Core, port: u16) -> Account {
    let account = core.add_account(Account::new("xmpp", "romeo@example.net"));
    account.set_string("connect_server", "127.0.0.1");
    account.set_int("port", port as i64);
    account
}

#[test]
fn required_tls_against_plaintext_server_is_an_encryption_error() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(XmppProtocol::new()));
        let recorder = Rc::new(ConnRecorder::default());
        core.set_account_ui_ops(recorder.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::task::spawn_local(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut ctx = String::new();
            read_until(&mut stream, ">", &mut ctx).await;
            // Features advertise no <starttls/> at all.
            let reply = format!("{STREAM_HEADER}<stream:features/>");
            stream.write_all(reply.as_bytes()).await.unwrap();
            // Hold the socket open; the client must bail on its own.
            let mut sink = [0u8; 256];
            let _ = stream.read(&mut sink).await;
        });

        let account = xmpp_account(&core, port);
        account.set_string("encryption", "require_tls");
        account.set_password(Some("secret".into()));
        core.connect_account(&account).unwrap();

        wait_for(|| !recorder.errors.borrow().is_empty()).await;
        let errors = recorder.errors.borrow();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            ConnectionError::EncryptionError(message) => {
                assert_eq!(
                    message,
                    "You require encryption, but it is not available on this server."
                );
            }
            other => panic!("expected encryption-error, got {other:?}"),
        }
        assert!(account.connection().is_none(), "connection must be gone");
        core.shutdown();
    });
}

#[test]
fn sasl_failure_purges_unsaved_password_without_retry() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(XmppProtocol::new()));
        let recorder = Rc::new(ConnRecorder::default());
        core.set_account_ui_ops(recorder.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::task::spawn_local(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut ctx = String::new();
            read_until(&mut stream, ">", &mut ctx).await;
            let features = format!(
                "{STREAM_HEADER}<stream:features>\
                 <mechanisms xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\">\
                 <mechanism>PLAIN</mechanism></mechanisms></stream:features>"
            );
            stream.write_all(features.as_bytes()).await.unwrap();
            read_until(&mut stream, "</auth>", &mut ctx).await;
            stream
                .write_all(
                    b"<failure xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\">\
                      <not-authorized/></failure>",
                )
                .await
                .unwrap();
            let mut sink = [0u8; 256];
            let _ = stream.read(&mut sink).await;
        });

        let account = xmpp_account(&core, port);
        account.set_string("encryption", "none");
        account.set_bool("auth_plain_in_clear", true);
        account.set_password(Some("wrong-password".into()));
        account.set_remember_password(false);

        core.connect_account(&account).unwrap();
        wait_for(|| !recorder.errors.borrow().is_empty()).await;

        {
            let errors = recorder.errors.borrow();
            assert_eq!(errors.len(), 1, "no retry after an auth failure");
            assert!(matches!(errors[0], ConnectionError::AuthenticationFailed(_)));
        }
        assert_eq!(account.password(), None, "unsaved password must be purged");
        assert!(recorder.connected.borrow().is_empty());
        core.shutdown();
    });
}

#[test]
fn full_plaintext_session_login_roster_buzz_and_roomlist() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(XmppProtocol::new()));
        let recorder = Rc::new(ConnRecorder::default());
        core.set_account_ui_ops(recorder.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::task::spawn_local(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut ctx = String::new();

            read_until(&mut stream, ">", &mut ctx).await;
            let features = format!(
                "{STREAM_HEADER}<stream:features>\
                 <mechanisms xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\">\
                 <mechanism>PLAIN</mechanism></mechanisms></stream:features>"
            );
            stream.write_all(features.as_bytes()).await.unwrap();

            read_until(&mut stream, "</auth>", &mut ctx).await;
            stream
                .write_all(b"<success xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"/>")
                .await
                .unwrap();

            // Stream restart after authentication.
            read_until(&mut stream, ">", &mut ctx).await;
            let features = format!(
                "{STREAM_HEADER}<stream:features>\
                 <bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/>\
                 <session xmlns=\"urn:ietf:params:xml:ns:xmpp-session\"/>\
                 </stream:features>"
            );
            stream.write_all(features.as_bytes()).await.unwrap();

            // Resource binding.
            let mut raw = [0u8; 4096];
            let mut buf = String::new();
            while !buf.contains("</iq>") {
                let n = stream.read(&mut raw).await.unwrap();
                assert!(n > 0);
                buf.push_str(&String::from_utf8_lossy(&raw[..n]));
            }
            let bind_id = extract_attr(&buf, "id").unwrap();
            let reply = format!(
                "<iq type=\"result\" id=\"{bind_id}\">\
                 <bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\">\
                 <jid>romeo@example.net/orchard</jid></bind></iq>"
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
            buf.clear();

            // Session request.
            while !buf.contains("</iq>") {
                let n = stream.read(&mut raw).await.unwrap();
                assert!(n > 0);
                buf.push_str(&String::from_utf8_lossy(&raw[..n]));
            }
            let session_id = extract_attr(&buf, "id").unwrap();
            stream
                .write_all(format!("<iq type=\"result\" id=\"{session_id}\"/>").as_bytes())
                .await
                .unwrap();
            buf.clear();

            // Roster fetch (arrives with the initial presence).
            while !buf.contains("jabber:iq:roster") {
                let n = stream.read(&mut raw).await.unwrap();
                assert!(n > 0);
                buf.push_str(&String::from_utf8_lossy(&raw[..n]));
            }
            let roster_id = extract_attr(&buf, "id").unwrap();
            let roster = format!(
                "<iq type=\"result\" id=\"{roster_id}\">\
                 <query xmlns=\"jabber:iq:roster\" ver=\"v1\">\
                 <item jid=\"juliet@example.net\" name=\"Juliet\" subscription=\"both\">\
                 <group>Verona</group></item></query></iq>"
            );
            stream.write_all(roster.as_bytes()).await.unwrap();

            // Deliver one message so the whole inbound path is exercised,
            // then a buzz.
            stream
                .write_all(
                    b"<message from=\"juliet@example.net/balcony\" type=\"chat\">\
                      <body>O Romeo</body></message>\
                      <message from=\"juliet@example.net/balcony\" type=\"headline\">\
                      <attention xmlns=\"urn:xmpp:attention\"/></message>",
                )
                .await
                .unwrap();
            buf.clear();

            // Room list fetch against the conference service.
            while !buf.contains("disco#items") {
                let n = stream.read(&mut raw).await.unwrap();
                assert!(n > 0);
                buf.push_str(&String::from_utf8_lossy(&raw[..n]));
            }
            assert!(buf.contains("to=\"conference.example.net\""));
            let disco_id = extract_attr(&buf, "id").unwrap();
            let disco = format!(
                "<iq type=\"result\" id=\"{disco_id}\" from=\"conference.example.net\">\
                 <query xmlns=\"http://jabber.org/protocol/disco#items\">\
                 <item jid=\"rust@conference.example.net\" name=\"Rust room\"/>\
                 <item jid=\"play@conference.example.net\"/></query></iq>"
            );
            stream.write_all(disco.as_bytes()).await.unwrap();

            let mut sink = [0u8; 1024];
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let account = xmpp_account(&core, port);
        account.set_string("encryption", "none");
        account.set_bool("auth_plain_in_clear", true);
        account.set_password(Some("secret".into()));
        account.set_remember_password(true);

        core.connect_account(&account).unwrap();
        wait_for(|| !recorder.connected.borrow().is_empty()).await;
        assert!(account.is_connected());

        // Roster landed in the buddy list with the server alias.
        wait_for(|| {
            core.with_blist(|b| b.find_buddy(&account, "juliet@example.net").is_some())
        })
        .await;
        let buddy = core
            .with_blist(|b| b.find_buddy(&account, "juliet@example.net"))
            .unwrap();
        assert_eq!(buddy.alias(), "Juliet");
        assert_eq!(account.get_string("roster-ver", ""), "v1");

        // The inbound message reached the conversation model, and the buzz
        // right behind it became a system message.
        wait_for(|| {
            core.with_conversations(|c| c.find_im(&account, "juliet@example.net"))
                .map(|conv| conv.history().len() >= 2)
                .unwrap_or(false)
        })
        .await;
        let conv = core
            .with_conversations(|c| c.find_im(&account, "juliet@example.net"))
            .unwrap();
        let history = conv.history();
        assert_eq!(history[0].content, "O Romeo");
        assert!(history[0].flags & confab::conversation::flags::RECV != 0);
        let buzz = history.last().unwrap();
        assert!(buzz.flags & confab::conversation::flags::SYSTEM != 0);
        assert_eq!(buzz.content, "juliet@example.net has buzzed you!");

        // Room list fetch: rooms stream through the signal bus, the done
        // signal drops the progress flag.
        let rooms = Rc::new(std::cell::RefCell::new(Vec::<(String, Option<String>)>::new()));
        let done = Rc::new(std::cell::Cell::new(false));
        let r = rooms.clone();
        core.signals()
            .connect(
                "roomlist-room-add",
                move |e: &mut confab::protocol::RoomlistRoomEvent| {
                    r.borrow_mut()
                        .push((e.room.name.clone(), e.room.description.clone()));
                    false
                },
            )
            .unwrap();
        let d = done.clone();
        core.signals()
            .connect(
                "roomlist-done",
                move |e: &mut confab::protocol::RoomlistDoneEvent| {
                    assert!(!e.cancelled);
                    d.set(true);
                    false
                },
            )
            .unwrap();

        assert!(core.get_roomlist(&account));
        assert!(core.roomlist_in_progress(&account));
        wait_for(|| done.get()).await;
        assert!(!core.roomlist_in_progress(&account));
        assert_eq!(
            rooms.borrow().clone(),
            vec![
                (
                    "rust@conference.example.net".to_string(),
                    Some("Rust room".to_string())
                ),
                ("play@conference.example.net".to_string(), None),
            ]
        );

        assert_eq!(recorder.errors.borrow().len(), 0);
        core.shutdown();
    });
}
