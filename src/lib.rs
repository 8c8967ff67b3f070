//! Full-duplex TCP/TLS sockets over a pluggable non-blocking transport
//!
//! This crate provides:
//! * [`Socket`] — a full-duplex byte stream with non-blocking connect,
//!   ordered pre-connect write queueing, pause/resume backpressure and an
//!   idle timer
//! * [`TlsSocket`] — in-place promotion of an established plaintext socket
//!   to TLS (`starttls`), preserving identity, counters and timers
//! * [`TransportProvider`](transport::TransportProvider) — the seam for
//!   swapping the native transport (TCP by default)
//! * Lifecycle events on a broadcast bus ([`SocketEvent`])
//!
//! # Quick start
//!
//! ```no_run
//! use sockwire::{connect, ConnectOptions};
//!
//! # async fn run() -> sockwire::Result<()> {
//! let socket = connect(ConnectOptions::new("example.com", 80)).await?;
//! socket.write(&b"GET / HTTP/1.0\r\n\r\n"[..]).await?;
//! while let Some(chunk) = socket.recv().await {
//!     println!("read {} bytes", chunk.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Deferred TLS
//!
//! A socket opened with [`SecureTransport::StartTls`] stays plaintext until
//! [`TlsSocket::start`] upgrades it:
//!
//! ```no_run
//! use sockwire::{ConnectOptions, SecureTransport, Socket, TlsOptions, TlsSocket};
//!
//! # async fn run() -> sockwire::Result<()> {
//! let tls = sockwire::TlsConfig::builder().use_webpki_roots(true).build()?;
//! let socket = Socket::new();
//! socket.connect(
//!     ConnectOptions::new("db.example.com", 5432)
//!         .secure_transport(SecureTransport::StartTls)
//!         .tls(tls),
//! )?;
//! socket.ready().await?;
//! // ... plaintext negotiation ...
//! let tls = TlsSocket::wrap(socket, TlsOptions::default())?;
//! tls.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod abort;
pub mod error;
pub mod events;
pub mod ip;
pub mod lookup;
pub mod metrics;
pub mod socket;
pub mod stream;
pub mod transport;

pub use abort::{AbortController, AbortSignal};
pub use error::{Error, Result};
pub use events::SocketEvent;
pub use ip::{is_ip, is_ipv4, is_ipv6};
pub use socket::{
    ConnectOptions, DataCallback, ReadyState, RecvBufferFn, Socket, SocketState, TlsOptions,
    TlsSocket,
};
pub use stream::ByteStream;
pub use transport::{SecureTransport, TlsConfig, TransportProvider};

/// Open a socket and wait for the connect to resolve.
///
/// Convenience over [`Socket::new`] + [`Socket::connect`] + [`Socket::ready`]
/// for callers that do not need to write before the transport is up.
pub async fn connect(options: ConnectOptions) -> Result<Socket> {
    let socket = Socket::new();
    socket.connect(options)?;
    socket.ready().await?;
    Ok(socket)
}

/// TLS entry points.
pub mod tls {
    use super::{ConnectOptions, Result, TlsOptions, TlsSocket};

    /// Open a socket in `startTls` mode and upgrade it as soon as the
    /// transport connects. Resolves once the handshake completes.
    pub async fn connect(options: ConnectOptions, tls_options: TlsOptions) -> Result<TlsSocket> {
        let socket = TlsSocket::connect(options, tls_options)?;
        socket.secure_ready().await?;
        Ok(socket)
    }
}
