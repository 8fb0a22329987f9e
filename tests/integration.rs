//! Integration tests for framelink.
//!
//! These tests run clients and servers against each other over real
//! transports (TCP, Unix sockets and in-memory streams).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use framelink::protocol::{build_frame, FrameCodec};
use framelink::transport::{memory, Dialer, TcpAcceptor, TcpDialer};
use framelink::{
    Client, ClientPolicy, Connection, FramelinkError, HandlerRegistry, Property, Server,
    ServerConfig, ServerPolicy, SessionDriver, SessionState,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const ECHO: u32 = 1;
const ECHO_REPLY: u32 = 2;

fn echo_server(listener: impl framelink::transport::Listener) -> Server {
    Server::builder()
        .listener(listener)
        .handle(ECHO, |req| async move {
            req.reply(ECHO_REPLY, req.bytes()).await
        })
        .build()
        .unwrap()
}

/// Client builder with a handler forwarding every echo reply to a channel.
fn collecting_client(dialer: Arc<dyn Dialer>) -> (framelink::ClientBuilder, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(64);
    let builder = Client::builder().dialer(dialer).handle(ECHO_REPLY, move |req| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(req.bytes()).await;
            Ok(())
        }
    });
    (builder, rx)
}

/// Test a full request/reply exchange over TCP.
#[tokio::test]
async fn test_tcp_echo() {
    init_tracing();
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    let server = echo_server(acceptor);
    let _done = server.start(2);

    let (builder, mut replies) = collecting_client(Arc::new(TcpDialer::new(addr.to_string())));
    let client = builder.start().unwrap();

    for i in 0..10u8 {
        client.send(ECHO, vec![i; 32]).await.unwrap();
    }
    for i in 0..10u8 {
        assert_eq!(replies.recv().await.unwrap(), Bytes::from(vec![i; 32]));
    }

    client.stop().await;
    server.stop().await;
}

/// Test the same exchange over a Unix domain socket.
#[cfg(unix)]
#[tokio::test]
async fn test_unix_echo() {
    use framelink::transport::{UnixAcceptor, UnixDialer};

    let path = UnixAcceptor::temp_path();
    let server = echo_server(UnixAcceptor::bind(&path).unwrap());
    let _done = server.start(1);

    let (builder, mut replies) = collecting_client(Arc::new(UnixDialer::new(&path)));
    let client = builder.start().unwrap();

    client.send(ECHO, &b"unix"[..]).await.unwrap();
    assert_eq!(&replies.recv().await.unwrap()[..], b"unix");

    client.stop().await;
    server.stop().await;
}

/// Test concurrent senders through one client: every frame arrives whole.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_client_sends_arrive_intact() {
    let (connector, listener) = memory::channel(512);
    let server = echo_server(listener);
    let _done = server.start(2);

    let (builder, mut replies) = collecting_client(Arc::new(connector));
    let client = builder.start().unwrap();

    let mut senders = Vec::new();
    for i in 0..32u8 {
        let client = client.clone();
        senders.push(tokio::spawn(async move {
            client.send(ECHO, vec![i; 700]).await
        }));
    }
    for sender in senders {
        sender.await.unwrap().unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..32 {
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.len(), 700);
        assert!(reply.iter().all(|b| *b == reply[0]));
        seen.push(reply[0]);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..32).collect::<Vec<u8>>());

    client.stop().await;
    server.stop().await;
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Login {
    user: String,
    level: u64,
}

/// Test typed handlers, MsgPack helpers and the per-connection property store.
#[tokio::test]
async fn test_typed_handler_and_properties() {
    const LOGIN: u32 = 10;
    const WHOAMI: u32 = 11;
    const IDENTITY: u32 = 12;

    let (connector, listener) = memory::channel(4096);
    let server = Server::builder()
        .listener(listener)
        .handle_typed(LOGIN, |login: Login, req| async move {
            let props = req.connection().properties();
            props.store("user", login.user);
            props.store("level", login.level);
            Ok(())
        })
        .handle(WHOAMI, |req| async move {
            let props = req.connection().properties();
            let user = props.load("user").and_then(|p| p.as_str().map(String::from));
            let peer = req
                .connection()
                .attachment()
                .and_then(|p| p.as_str())
                .map(String::from);
            req.reply_msgpack(IDENTITY, &(user, props.load("level"), peer))
                .await
        })
        .build()
        .unwrap();
    let _done = server.start(1);

    let (tx, mut rx) = mpsc::channel(1);
    let client = Client::builder()
        .dialer(Arc::new(connector))
        .handle_typed(
            IDENTITY,
            move |identity: (Option<String>, Option<Property>, Option<String>), _req| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(identity).await;
                    Ok(())
                }
            },
        )
        .start()
        .unwrap();

    client
        .send_msgpack(
            LOGIN,
            &Login {
                user: "ana".to_string(),
                level: 3,
            },
        )
        .await
        .unwrap();
    client.send(WHOAMI, Bytes::new()).await.unwrap();

    let (user, level, peer) = rx.recv().await.unwrap();
    assert_eq!(user.as_deref(), Some("ana"));
    assert_eq!(level, Some(Property::Uint(3)));
    assert!(peer.unwrap().starts_with("memory:"));

    client.stop().await;
    server.stop().await;
}

/// Test-local shared handle; a foreign `Arc<T>` can't implement the
/// crate's policy traits directly (orphan rule).
struct Shared<T>(Arc<T>);

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared(self.0.clone())
    }
}

impl<T> std::ops::Deref for Shared<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

struct Redial {
    dialer: Arc<dyn Dialer>,
    dial_errors: AtomicUsize,
    session_errors: Mutex<Vec<FramelinkError>>,
}

#[async_trait]
impl ClientPolicy for Shared<Redial> {
    async fn on_dial_error(&self, _error: &FramelinkError) -> Option<Arc<dyn Dialer>> {
        self.dial_errors.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Some(self.dialer.clone())
    }

    async fn on_session_error(
        &self,
        _connection: &Connection,
        error: &FramelinkError,
    ) -> Option<Arc<dyn Dialer>> {
        self.session_errors.lock().await.push(error.clone());
        Some(self.dialer.clone())
    }
}

/// Test that the client keeps dialing until the server shows up, then serves.
#[tokio::test]
async fn test_client_reconnects_until_server_is_up() {
    // reserve a port, then release it so the first dials are refused
    let addr = {
        let scout = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        scout.local_addr().unwrap()
    };
    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(addr.to_string()));
    let policy = Shared(Arc::new(Redial {
        dialer: dialer.clone(),
        dial_errors: AtomicUsize::new(0),
        session_errors: Mutex::new(Vec::new()),
    }));

    let (builder, mut replies) = collecting_client(dialer);
    let client = builder.policy(policy.clone()).start().unwrap();

    while policy.dial_errors.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let server = echo_server(TcpAcceptor::bind(addr).await.unwrap());
    let _done = server.start(1);

    client.send(ECHO, &b"finally"[..]).await.unwrap();
    assert_eq!(&replies.recv().await.unwrap()[..], b"finally");
    assert!(client.dial_attempts() >= 3);
    assert_eq!(client.sessions(), 1);

    client.stop().await;
    server.stop().await;
}

struct Recorder {
    errors: Mutex<Vec<FramelinkError>>,
}

#[async_trait]
impl ServerPolicy for Shared<Recorder> {
    async fn on_session_error(&self, _connection: &Connection, error: &FramelinkError) {
        self.errors.lock().await.push(error.clone());
    }
}

/// Test that explicit teardown and transport faults are reported differently.
#[tokio::test]
async fn test_server_reports_closed_by_request_vs_fault() {
    let (connector, listener) = memory::channel(1024);
    let recorder = Shared(Arc::new(Recorder {
        errors: Mutex::new(Vec::new()),
    }));
    let server = Server::builder()
        .listener(listener)
        .handle(ECHO, |req| async move {
            // a handler closing its own connection is an explicit stop
            req.connection().close();
            Ok(())
        })
        .policy(recorder.clone())
        .build()
        .unwrap();
    let _done = server.start(1);

    // peer vanishes: transport fault
    let vanishing = connector.connect().await.unwrap();
    drop(vanishing);

    // handler closes: explicit stop
    let mut polite = connector.connect().await.unwrap();
    polite.write_all(&build_frame(ECHO, b"bye")).await.unwrap();

    while recorder.errors.lock().await.len() < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let errors = recorder.errors.lock().await.clone();
    assert_eq!(
        errors.iter().filter(|e| e.is_transport()).count(),
        1,
        "{errors:?}"
    );
    assert_eq!(
        errors
            .iter()
            .filter(|e| matches!(e, FramelinkError::ClosedByRequest))
            .count(),
        1,
        "{errors:?}"
    );

    server.stop().await;
}

/// Test the admission ceiling against real clients over TCP.
#[tokio::test]
async fn test_admission_ceiling_over_tcp() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    let server = Server::builder()
        .listener(acceptor)
        .config(ServerConfig {
            max_connections: 2,
            ..ServerConfig::default()
        })
        .build()
        .unwrap();
    let _done = server.start(4);

    let mut clients = Vec::new();
    for _ in 0..4 {
        let client = Client::builder()
            .dialer(Arc::new(TcpDialer::new(addr.to_string())))
            .start()
            .unwrap();
        clients.push(client);
    }

    // refused clients see their session end and, with the default policy, stop
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while clients.iter().filter(|c| !c.is_running()).count() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "refused clients never stopped");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(server.active_connections(), 2);
    assert_eq!(server.served(), 2);
    assert_eq!(server.rejected(), 2);
    assert_eq!(clients.iter().filter(|c| c.is_running()).count(), 2);

    for client in &clients {
        client.stop().await;
    }
    server.stop().await;
}

/// Test a bare session driver against a hand-rolled peer.
#[tokio::test]
async fn test_session_driver_with_raw_peer() {
    let mut registry = HandlerRegistry::new();
    registry.register(ECHO, |req| async move { req.reply(ECHO_REPLY, req.bytes()).await });

    let (transport, mut peer) = tokio::io::duplex(1024);
    let driver = SessionDriver::builder(Arc::new(registry)).spawn(transport);

    peer.write_all(&build_frame(99, b"nobody home")).await.unwrap();
    peer.write_all(&build_frame(ECHO, b"")).await.unwrap();

    let reply = FrameCodec::default().decode(&mut peer).await.unwrap();
    assert_eq!(reply.id(), ECHO_REPLY);
    assert_eq!(reply.payload_len(), 0);
    assert_eq!(driver.state(), SessionState::Running);

    driver.stop().await;
    assert_eq!(driver.state(), SessionState::Stopped);
    assert!(matches!(driver.error(), Some(FramelinkError::ClosedByRequest)));
}

/// Test that a send cancelled right after handoff still resolves exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_handoff_resolves_once() {
    let (transport, mut peer) = tokio::io::duplex(16);
    let driver = SessionDriver::builder(Arc::new(HandlerRegistry::new())).spawn(transport);
    let conn = driver.connection().clone();

    let cancel = CancellationToken::new();
    let sender = tokio::spawn({
        let cancel = cancel.clone();
        async move { conn.send_with_cancel(4, vec![7u8; 256], &cancel).await }
    });
    // the write is parked on the small duplex buffer by now
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let frame = FrameCodec::default().decode(&mut peer).await.unwrap();
    assert_eq!(frame.payload_len(), 256);
    assert!(sender.await.unwrap().is_ok());

    driver.stop().await;
}

/// Test that an oversized client send fails before anything is written.
#[tokio::test]
async fn test_oversized_send_never_reaches_peer() {
    let (connector, listener) = memory::channel(1024);
    let seen = Arc::new(AtomicUsize::new(0));
    let server = Server::builder()
        .listener(listener)
        .handle(ECHO, {
            let seen = seen.clone();
            move |_req| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
        .build()
        .unwrap();
    let _done = server.start(1);

    let client = Client::builder()
        .dialer(Arc::new(connector))
        .max_frame_size(16)
        .start()
        .unwrap();

    let err = client.send(ECHO, vec![0u8; 17]).await.unwrap_err();
    assert!(err.never_sent());
    client.send(ECHO, vec![0u8; 16]).await.unwrap();

    while seen.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    client.stop().await;
    server.stop().await;
}

/// Test configuration loading from JSON.
#[test]
fn test_config_from_json() {
    let config: ServerConfig = serde_json::from_str(
        r#"{ "max_frame_size": 65536, "max_connections": 8, "acceptors": 2 }"#,
    )
    .unwrap();

    assert_eq!(config.max_frame_size, 65536);
    assert_eq!(config.session().max_frame_size, 65536);
    assert!(config.validate().is_ok());

    let round_trip: ServerConfig =
        serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
    assert_eq!(round_trip, config);
}
