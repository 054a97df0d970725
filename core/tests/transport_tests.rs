/// Transport integration tests
/// Real TCP connections against the in-memory backend and hand-rolled servers

extern crate chatlink_core;

use chatlink_core::chat_types::{ConversationId, MessageContent, MessageKind, UserId};
use chatlink_core::credential::MemoryCredentialStore;
use chatlink_core::local_backend::LocalBackend;
use chatlink_core::multiplexer::StreamMultiplexer;
use chatlink_core::session::SessionState;
use chatlink_core::transport::protocol::{read_command, write_command, INBOUND_DESTINATION};
use chatlink_core::transport::{Command, ConnectionState, TransportChannel};
use chatlink_core::{ChatContext, ChatError, Config, Services};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

async fn start_backend(backend: Arc<LocalBackend>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(backend.serve(listener));
    addr
}

fn config(transport_addr: &str) -> Config {
    Config {
        transport_addr: transport_addr.to_string(),
        ..Config::default()
    }
}

fn context(backend: Arc<LocalBackend>, transport_addr: &str) -> ChatContext {
    let services = Services::from_backend(backend, Arc::new(MemoryCredentialStore::new()));
    ChatContext::new(config(transport_addr), services)
}

async fn wait_for_state(transport: &TransportChannel, expected: ConnectionState) {
    for _ in 0..200 {
        if transport.state().await == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("transport never reached {:?}", expected);
}

/// Session logged in through the backend, with a transport aimed at `addr`
async fn logged_in_transport(
    backend: Arc<LocalBackend>,
    addr: &str,
) -> (Arc<TransportChannel>, Arc<StreamMultiplexer>) {
    let session = Arc::new(SessionState::new(backend, Arc::new(MemoryCredentialStore::new())));
    session.initialize().await;
    assert!(session.authenticate("admin", "admin").await);
    let multiplexer = Arc::new(StreamMultiplexer::new());
    let transport = Arc::new(TransportChannel::new(&config(addr), session, multiplexer.clone()));
    (transport, multiplexer)
}

/// Logged in against a backend that is not serving the transport
async fn detached_transport(addr: &str) -> (Arc<TransportChannel>, Arc<StreamMultiplexer>) {
    logged_in_transport(Arc::new(LocalBackend::with_demo_data()), addr).await
}

#[tokio::test]
async fn test_send_echoes_back_through_all_stream() {
    let backend = Arc::new(LocalBackend::with_demo_data());
    let addr = start_backend(backend.clone()).await;
    let ctx = context(backend.clone(), &addr);
    ctx.start().await;

    let mut all = ctx.multiplexer().all_stream();
    assert!(ctx.session().authenticate("admin", "admin").await);
    wait_for_state(ctx.transport(), ConnectionState::Connected).await;

    ctx.send(ConversationId(1), MessageContent::Text("hi".into()))
        .await
        .unwrap();

    let (conversation_id, message) = timeout(Duration::from_secs(2), all.recv())
        .await
        .expect("no echo")
        .unwrap();
    assert_eq!(conversation_id, ConversationId(1));
    assert_eq!(message.author_id, UserId(1));
    assert_eq!(message.content, MessageContent::Text("hi".into()));
    assert_eq!(message.kind(), MessageKind::Text);
    assert!(message.timestamp.is_some());
    assert_eq!(backend.message_count(ConversationId(1)), 2);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_connect_without_credential_fails() {
    let backend = Arc::new(LocalBackend::with_demo_data());
    let session = Arc::new(SessionState::new(backend, Arc::new(MemoryCredentialStore::new())));
    session.initialize().await;
    let transport = TransportChannel::new(
        &config("127.0.0.1:1"),
        session,
        Arc::new(StreamMultiplexer::new()),
    );

    assert!(matches!(transport.connect().await, Err(ChatError::NoCredential)));
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let backend = Arc::new(LocalBackend::with_demo_data());
    let addr = start_backend(backend.clone()).await;
    let (transport, _) = logged_in_transport(backend, &addr).await;
    transport.disconnect().await;

    transport.connect().await.unwrap();
    assert!(transport.is_connected().await);
    transport.disconnect().await;
    transport.disconnect().await;
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_send_while_disconnected() {
    let (transport, _) = detached_transport("127.0.0.1:1").await;
    let result = transport
        .send(ConversationId(1), UserId(1), MessageContent::Text("x".into()))
        .await;
    assert!(matches!(result, Err(ChatError::NotConnected)));
}

#[tokio::test]
async fn test_handshake_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_command(&mut stream, 1024 * 1024).await;
        write_command(
            &mut stream,
            &Command::Error {
                message: "token revoked".into(),
            },
        )
        .await
        .unwrap();
    });

    let (transport, _) = detached_transport(&addr).await;
    match transport.connect().await {
        Err(ChatError::Handshake(message)) => assert_eq!(message, "token revoked"),
        other => panic!("expected handshake error, got {:?}", other.err()),
    }
    assert!(!transport.is_connected().await);
}

#[tokio::test]
async fn test_connect_sends_raw_token_and_subscribes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let connect = read_command(&mut stream, 1024 * 1024).await.unwrap();
        write_command(&mut stream, &Command::Connected { user_name: "Ada".into() })
            .await
            .unwrap();
        let subscribe = read_command(&mut stream, 1024 * 1024).await.unwrap();
        (connect, subscribe)
    });

    let (transport, _) = detached_transport(&addr).await;
    transport.connect().await.unwrap();
    assert_eq!(transport.user_name().await.as_deref(), Some("Ada"));

    let (connect, subscribe) = server.await.unwrap();
    match connect {
        Command::Connect { authorization } => {
            assert!(!authorization.starts_with("Bearer"));
            assert_eq!(authorization.split('.').count(), 3);
        }
        other => panic!("expected connect, got {}", other),
    }
    assert!(matches!(
        subscribe,
        Command::Subscribe { destination, .. } if destination == INBOUND_DESTINATION
    ));
}

#[tokio::test]
async fn test_bad_inbound_frames_do_not_stop_delivery() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_command(&mut stream, 1024 * 1024).await;
        write_command(&mut stream, &Command::Connected { user_name: "Ada".into() })
            .await
            .unwrap();
        let _ = read_command(&mut stream, 1024 * 1024).await;

        // Undecodable command
        use tokio::io::AsyncWriteExt;
        let garbage = b"not json";
        stream.write_all(&(garbage.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(garbage).await.unwrap();

        for body in [
            r#"{"chatId":1,"authorId":2,"content":"{broken","type":"IMAGE"}"#,
            r#"{"chatId":1,"authorId":2,"timestamp":5,"content":"fine","type":"TEXT"}"#,
        ] {
            write_command(
                &mut stream,
                &Command::Message {
                    subscription: "sub-0".into(),
                    destination: INBOUND_DESTINATION.into(),
                    body: body.into(),
                },
            )
            .await
            .unwrap();
        }
        // Keep the connection open until the client goes away
        let _ = read_command(&mut stream, 1024 * 1024).await;
    });

    let (transport, multiplexer) = detached_transport(&addr).await;
    let mut all = multiplexer.all_stream();
    transport.connect().await.unwrap();

    let (_, message) = timeout(Duration::from_secs(2), all.recv())
        .await
        .expect("valid message not delivered")
        .unwrap();
    assert_eq!(message.content, MessageContent::Text("fine".into()));
    assert_eq!(multiplexer.dropped_count(), 1);
    assert!(transport.is_connected().await);
}

#[tokio::test]
async fn test_server_close_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_command(&mut stream, 1024 * 1024).await;
        write_command(&mut stream, &Command::Connected { user_name: "Ada".into() })
            .await
            .unwrap();
        let _ = read_command(&mut stream, 1024 * 1024).await;
        write_command(&mut stream, &Command::Disconnect).await.unwrap();
    });

    let (transport, _) = detached_transport(&addr).await;
    transport.connect().await.unwrap();
    wait_for_state(&transport, ConnectionState::Closed).await;

    transport.disconnect().await;
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_cancels_stalled_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_command(&mut stream, 1024 * 1024).await;
        // Never answer, keep the socket open
        sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let (transport, _) = detached_transport(&addr).await;
    let pending = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.connect().await })
    };
    sleep(Duration::from_millis(200)).await;

    let state = timeout(Duration::from_secs(2), transport.state())
        .await
        .expect("state blocked behind the handshake");
    assert_eq!(state, ConnectionState::Disconnected);
    let sent = timeout(
        Duration::from_secs(2),
        transport.send(ConversationId(1), UserId(1), MessageContent::Text("x".into())),
    )
    .await
    .expect("send blocked behind the handshake");
    assert!(matches!(sent, Err(ChatError::NotConnected)));

    timeout(Duration::from_secs(2), transport.disconnect())
        .await
        .expect("disconnect blocked behind the handshake");

    let result = timeout(Duration::from_secs(2), pending)
        .await
        .expect("connect was not cancelled")
        .unwrap();
    assert!(matches!(result, Err(ChatError::Connection(_))));
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
}
