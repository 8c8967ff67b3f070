//! Integration tests for the in-place TLS upgrade (startTls)
//!
//! Tests run against an in-process loopback TLS server built from a
//! self-signed certificate; no external services or fixtures are required.

use sockwire::{ConnectOptions, SecureTransport, Socket, SocketEvent, TlsOptions, TlsSocket};
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// Opt-in tracing for debugging: `RUST_LOG=sockwire=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Self-signed server credentials plus a CA file the client trusts.
struct TlsFixture {
    acceptor: TlsAcceptor,
    ca_file: tempfile::NamedTempFile,
}

fn tls_fixture() -> TlsFixture {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("self-signed cert");
    let cert_der = certified.cert.der().clone();
    let key = rustls_pki_types::PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key)
        .expect("server config");

    let mut ca_file = tempfile::NamedTempFile::new().expect("temp CA file");
    ca_file
        .write_all(certified.cert.pem().as_bytes())
        .expect("write CA pem");

    TlsFixture {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        ca_file,
    }
}

fn client_tls(fixture: &TlsFixture) -> sockwire::TlsConfig {
    sockwire::TlsConfig::builder()
        .ca_cert_path(fixture.ca_file.path().to_str().expect("utf-8 path"))
        .build()
        .expect("client tls config")
}

async fn bind_loopback() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<SocketEvent>,
    pred: impl Fn(&SocketEvent) -> bool,
) -> SocketEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event bus closed before the expected event")
                }
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn starttls_options(addr: SocketAddr, fixture: &TlsFixture) -> ConnectOptions {
    ConnectOptions::new("127.0.0.1", addr.port())
        .secure_transport(SecureTransport::StartTls)
        .tls(client_tls(fixture))
        .server_name("localhost")
}

#[tokio::test]
async fn test_starttls_upgrade_preserves_identity() {
    init_tracing();
    let fixture = tls_fixture();
    let acceptor = fixture.acceptor.clone();
    let (listener, addr) = bind_loopback().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        // Plaintext banner first, then the handshake
        stream.write_all(b"banner").await.expect("banner");
        let mut tls = acceptor.accept(stream).await.expect("tls accept");
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.expect("read");
        tls.write_all(&buf).await.expect("echo");
        tls.flush().await.expect("flush");
        buf
    });

    let socket = Socket::new();
    socket
        .connect(starttls_options(addr, &fixture))
        .expect("connect");
    socket.ready().await.expect("ready");

    // Plaintext phase
    assert_eq!(&socket.recv().await.expect("banner")[..], b"banner");
    assert_eq!(socket.secure_transport(), Some(SecureTransport::StartTls));
    let port_before = socket.remote_port();

    let tls = TlsSocket::wrap(socket, TlsOptions::default()).expect("wrap");
    let mut events = tls.events();
    tls.start().await.expect("upgrade");

    wait_for_event(&mut events, |e| matches!(e, SocketEvent::Secure)).await;
    wait_for_event(&mut events, |e| matches!(e, SocketEvent::SecureConnect)).await;

    assert!(tls.encrypted());
    assert!(tls.authorized());
    assert!(tls.secure_established());
    assert!(!tls.secure_pending());

    // Same socket identity: counters and peer survive the promotion
    assert_eq!(tls.socket().remote_port(), port_before);
    assert!(tls.bytes_read() >= 6);

    tls.write(&b"ping"[..]).await.expect("write");
    assert_eq!(&tls.recv().await.expect("echo")[..], b"ping");
    assert_eq!(server.await.expect("server"), *b"ping");

    tls.destroy();
}

#[tokio::test]
async fn test_tls_connect_helper_upgrades_immediately() {
    let fixture = tls_fixture();
    let acceptor = fixture.acceptor.clone();
    let (listener, addr) = bind_loopback().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut tls = acceptor.accept(stream).await.expect("tls accept");
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).await.expect("read");
        tls.write_all(&buf).await.expect("echo");
        tls.flush().await.expect("flush");
    });

    let tls = sockwire::tls::connect(starttls_options(addr, &fixture), TlsOptions::default())
        .await
        .expect("tls connect");

    assert!(tls.encrypted());
    tls.write(&b"hello"[..]).await.expect("write");
    assert_eq!(&tls.recv().await.expect("echo")[..], b"hello");
    tls.destroy();
}

#[tokio::test]
async fn test_handshake_timeout_fails_upgrade() {
    let fixture = tls_fixture();
    let (listener, addr) = bind_loopback().await;

    tokio::spawn(async move {
        // Accept and go silent: the handshake can never complete
        let _stream = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let socket = Socket::new();
    socket
        .connect(starttls_options(addr, &fixture))
        .expect("connect");
    socket.ready().await.expect("ready");
    let mut events = socket.events();

    let tls = TlsSocket::wrap(
        socket,
        TlsOptions {
            handshake_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    )
    .expect("wrap");

    let err = tls.start().await.expect_err("must time out");
    assert!(matches!(err, sockwire::Error::HandshakeTimeout { .. }));
    assert!(tls.destroyed());

    // One error, then the terminal close
    let error = wait_for_event(&mut events, |e| matches!(e, SocketEvent::Error(_))).await;
    if let SocketEvent::Error(message) = error {
        assert!(message.contains("handshake"), "unexpected error: {message}");
    }
    let close = wait_for_event(&mut events, |e| matches!(e, SocketEvent::Close { .. })).await;
    assert_eq!(close, SocketEvent::Close { had_error: true });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut late_errors = 0;
    loop {
        match events.try_recv() {
            Ok(SocketEvent::Error(_)) => late_errors += 1,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(late_errors, 0, "the handshake error must be emitted once");
}

#[tokio::test]
async fn test_secure_ready_surfaces_typed_handshake_error() {
    let fixture = tls_fixture();
    let (listener, addr) = bind_loopback().await;

    tokio::spawn(async move {
        // Accept and go silent: the handshake can never complete
        let _stream = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    // The background upgrade funnels its failure into secure_ready; the
    // caller must see the original error variant, not a flattened string.
    let err = sockwire::tls::connect(
        starttls_options(addr, &fixture),
        TlsOptions {
            handshake_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    )
    .await
    .expect_err("must time out");
    assert!(matches!(err, sockwire::Error::HandshakeTimeout { .. }));
}

#[tokio::test]
async fn test_peer_close_during_handshake_fails_upgrade() {
    let fixture = tls_fixture();
    let (listener, addr) = bind_loopback().await;

    tokio::spawn(async move {
        // Accept and hang up before speaking TLS
        let (stream, _) = listener.accept().await.expect("accept");
        drop(stream);
    });

    let socket = Socket::new();
    socket
        .connect(starttls_options(addr, &fixture))
        .expect("connect");
    socket.ready().await.expect("ready");

    let tls = TlsSocket::wrap(socket, TlsOptions::default()).expect("wrap");
    let err = tls.start().await.expect_err("handshake must fail");
    assert!(matches!(
        err,
        sockwire::Error::ConnectionReset { .. } | sockwire::Error::Tls(_)
    ));
    assert!(tls.destroyed());
    assert!(!tls.secure_established());
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let fixture = tls_fixture();
    let acceptor = fixture.acceptor.clone();
    let (listener, addr) = bind_loopback().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let _tls = acceptor.accept(stream).await.expect("tls accept");
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let socket = Socket::new();
    socket
        .connect(starttls_options(addr, &fixture))
        .expect("connect");
    socket.ready().await.expect("ready");

    let tls = TlsSocket::wrap(socket, TlsOptions::default()).expect("wrap");
    tls.start().await.expect("upgrade");
    assert!(matches!(
        tls.start().await,
        Err(sockwire::Error::InvalidState { .. })
    ));
    tls.destroy();
}

#[tokio::test]
async fn test_idle_timer_survives_upgrade() {
    let fixture = tls_fixture();
    let acceptor = fixture.acceptor.clone();
    let (listener, addr) = bind_loopback().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let _tls = acceptor.accept(stream).await.expect("tls accept");
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let socket = Socket::new();
    socket
        .connect(starttls_options(addr, &fixture))
        .expect("connect");
    socket.ready().await.expect("ready");
    socket.set_timeout(Some(Duration::from_millis(100)));

    let tls = TlsSocket::wrap(socket, TlsOptions::default()).expect("wrap");
    tls.start().await.expect("upgrade");

    // The timer armed before the upgrade keeps running on the same socket
    let mut events = tls.events();
    wait_for_event(&mut events, |e| matches!(e, SocketEvent::Timeout)).await;
    assert!(!tls.destroyed());
    tls.destroy();
}
