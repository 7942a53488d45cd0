//! IRC session against a scripted server.

use std::collections::HashMap;
use std::rc::Rc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use confab::account::Account;
use confab::conversation::flags;
use confab::protocol::irc::IrcProtocol;

use crate::common::{ConnRecorder, run_local, test_core, wait_for};

async fn read_until(stream: &mut TcpStream, needle: &str, ctx: &mut String) -> String {
    let mut chunk = [0u8; 2048];
    while !ctx.contains(needle) {
        let n = stream.read(&mut chunk).await.expect("script read");
        assert!(n > 0, "client hung up while waiting for {needle}");
        ctx.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
    std::mem::take(ctx)
}

#[test]
fn registration_ison_and_private_messages() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(IrcProtocol::new()));
        let recorder = Rc::new(ConnRecorder::default());
        core.set_account_ui_ops(recorder.clone());

        let account = core.add_account(Account::new("irc", "tester@127.0.0.1"));
        core.with_blist(|b| {
            b.add_buddy(&account, "alice", "Friends");
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        account.set_int("port", port as i64);

        tokio::task::spawn_local(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut ctx = String::new();

            let registration = read_until(&mut stream, "NICK tester\r\n", &mut ctx).await;
            assert!(registration.contains("USER tester"));
            assert!(registration.contains("NICK tester"));
            stream
                .write_all(b":server 001 tester :Welcome to the test net\r\n")
                .await
                .unwrap();

            // Presence poll for the one buddy.
            let ison = read_until(&mut stream, "ISON :alice\r\n", &mut ctx).await;
            assert!(ison.contains("ISON :alice"));
            stream
                .write_all(b":server 303 tester :alice\r\n")
                .await
                .unwrap();

            // Inbound private message.
            stream
                .write_all(b":alice!a@h PRIVMSG tester :hello tester\r\n")
                .await
                .unwrap();

            // Expect the reply on the wire.
            let reply = read_until(&mut stream, "hi back\r\n", &mut ctx).await;
            assert!(reply.contains("PRIVMSG alice :hi back"));

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

        // The bootstrap ISON marked alice online without a sign-on event.
        wait_for(|| {
            core.with_blist(|b| b.find_buddy(&account, "alice"))
                .map(|b| b.is_online())
                .unwrap_or(false)
        })
        .await;

        wait_for(|| {
            core.with_conversations(|c| c.find_im(&account, "alice")).is_some()
        })
        .await;
        let conv = core
            .with_conversations(|c| c.find_im(&account, "alice"))
            .unwrap();
        assert_eq!(conv.last_message().unwrap().content, "hello tester");

        assert!(core.send_im(&account, "alice", "hi back") > 0);
        wait_for(|| conv.history().len() == 2).await;
        assert!(conv.last_message().unwrap().flags & flags::SEND != 0);

        core.shutdown();
    });
}

#[test]
fn channel_join_names_and_self_echo() {
    run_local(async {
        let core = test_core();
        core.protocols().add(Rc::new(IrcProtocol::new()));
        let recorder = Rc::new(ConnRecorder::default());
        core.set_account_ui_ops(recorder.clone());

        let account = core.add_account(Account::new("irc", "tester@127.0.0.1"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        account.set_int("port", port as i64);

        tokio::task::spawn_local(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut ctx = String::new();

            read_until(&mut stream, "NICK tester\r\n", &mut ctx).await;
            stream
                .write_all(b":server 001 tester :Welcome\r\n")
                .await
                .unwrap();

            let join = read_until(&mut stream, "JOIN #rust\r\n", &mut ctx).await;
            assert!(join.contains("JOIN #rust"));
            stream
                .write_all(
                    b":tester!t@h JOIN #rust\r\n\
                      :server 353 tester = #rust :tester @oper +voiced\r\n\
                      :server 332 tester #rust :Welcome to #rust\r\n",
                )
                .await
                .unwrap();

            let sent = read_until(&mut stream, "hello channel\r\n", &mut ctx).await;
            assert!(sent.contains("PRIVMSG #rust :hello channel"));

            stream
                .write_all(b":oper!o@h PRIVMSG #rust :hi tester, welcome\r\n")
                .await
                .unwrap();

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

        let conn = account.connection().unwrap();
        let protocol = core.protocols().find("irc").unwrap();
        let chat = protocol.chat_ops().unwrap();
        let mut components = HashMap::new();
        components.insert("channel".to_string(), "#rust".to_string());
        chat.join(&conn, &components);

        wait_for(|| {
            core.with_conversations(|c| c.find_chat_by_name(&account, "#rust")).is_some()
        })
        .await;
        let conv = core
            .with_conversations(|c| c.find_chat_by_name(&account, "#rust"))
            .unwrap();

        wait_for(|| conv.users().len() == 3).await;
        assert!(conv.has_user("oper"));
        wait_for(|| conv.topic().is_some()).await;
        assert_eq!(conv.topic().as_deref(), Some("Welcome to #rust"));

        let id = conv.chat_id().unwrap();
        assert!(core.send_chat(&account, id, "hello channel") > 0);
        wait_for(|| !conv.history().is_empty()).await;
        let echo = conv.history()[0].clone();
        assert!(echo.flags & flags::SEND != 0, "own messages echo as sends");

        // A message mentioning our nick is flagged.
        wait_for(|| conv.history().len() >= 2).await;
        let inbound = conv.last_message().unwrap();
        assert!(inbound.flags & flags::RECV != 0);
        assert!(inbound.flags & flags::NICK_MENTION != 0);

        core.shutdown();
    });
}
