//! Native transport capability layer
//!
//! This module is the consumed surface the socket core is built on:
//! * [`TransportProvider`] — opens a non-blocking, stream-oriented duplex
//!   with a declared secure-transport mode
//! * [`RawConnection`] — the opened duplex plus its addresses
//! * [`tls::promote`] — the in-place startTls promotion
//!
//! The bundled [`TokioTcpProvider`] backs the capability with tokio TCP and
//! tokio-rustls. Tests inject their own providers.

mod tcp;
pub mod tls;

pub use tcp::TokioTcpProvider;
pub use tls::{parse_server_name, TlsConfig, TlsConfigBuilder};

use crate::Result;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Secure-transport mode declared when opening a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecureTransport {
    /// Plaintext for the connection's lifetime
    #[default]
    Off,
    /// TLS negotiated during open
    On,
    /// Plaintext at first, eligible for in-place promotion later
    StartTls,
}

impl std::fmt::Display for SecureTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
            Self::StartTls => write!(f, "starttls"),
        }
    }
}

/// Destination of an open call. The host is either a resolved literal or a
/// hostname the provider resolves itself (address family 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Options for [`TransportProvider::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Keep the writable side open after the readable side ends
    pub allow_half_open: bool,
    /// Secure-transport mode for this connection
    pub secure_transport: SecureTransport,
    /// TLS client configuration; required for `On`, used at promotion time
    /// for `StartTls`
    pub tls: Option<TlsConfig>,
    /// SNI override; defaults to the connect host
    pub server_name: Option<String>,
}

/// A non-blocking byte-stream duplex the socket core can own.
pub trait RawDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawDuplex for T {}

/// An opened native connection.
pub struct RawConnection {
    /// The duplex byte stream
    pub io: Box<dyn RawDuplex>,
    /// Mode the connection was opened with
    pub secure_transport: SecureTransport,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("secure_transport", &self.secure_transport)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Capability to open native connections.
pub trait TransportProvider: Send + Sync {
    fn open(
        &self,
        address: &RemoteAddress,
        options: &OpenOptions,
    ) -> BoxFuture<'static, Result<RawConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_transport_display() {
        assert_eq!(SecureTransport::Off.to_string(), "off");
        assert_eq!(SecureTransport::On.to_string(), "on");
        assert_eq!(SecureTransport::StartTls.to_string(), "starttls");
    }

    #[test]
    fn test_remote_address_display() {
        let addr = RemoteAddress {
            host: "example.com".into(),
            port: 443,
        };
        assert_eq!(addr.to_string(), "example.com:443");
    }

    #[test]
    fn test_open_options_defaults() {
        let opts = OpenOptions::default();
        assert!(!opts.allow_half_open);
        assert_eq!(opts.secure_transport, SecureTransport::Off);
        assert!(opts.tls.is_none());
        assert!(opts.server_name.is_none());
    }
}
