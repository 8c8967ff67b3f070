//! Tokio-backed TCP transport provider

use super::{OpenOptions, RawConnection, RemoteAddress, SecureTransport, TransportProvider};
use crate::{Error, Result};
use futures::future::BoxFuture;
use tokio::net::TcpStream;

/// Opens TCP connections on the tokio runtime, negotiating TLS during open
/// when the secure mode is [`SecureTransport::On`].
///
/// When handed a hostname rather than a literal IP, resolution falls through
/// to the runtime's `ToSocketAddrs` machinery.
#[derive(Debug, Default, Clone)]
pub struct TokioTcpProvider;

impl TransportProvider for TokioTcpProvider {
    fn open(
        &self,
        address: &RemoteAddress,
        options: &OpenOptions,
    ) -> BoxFuture<'static, Result<RawConnection>> {
        let address = address.clone();
        let options = options.clone();
        Box::pin(async move {
            let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
            let local_addr = stream.local_addr().ok();
            let peer_addr = stream.peer_addr().ok();

            let io: Box<dyn super::RawDuplex> = match options.secure_transport {
                SecureTransport::Off | SecureTransport::StartTls => Box::new(stream),
                SecureTransport::On => {
                    let tls = options.tls.as_ref().ok_or_else(|| {
                        Error::Config(
                            "secure transport 'on' requires a TlsConfig but none was provided"
                                .into(),
                        )
                    })?;
                    let server_name = options.server_name.as_deref().unwrap_or(&address.host);
                    super::tls::promote(Box::new(stream), tls, server_name).await?
                }
            };

            tracing::debug!(
                peer = %address,
                secure = %options.secure_transport,
                "native transport opened"
            );

            Ok(RawConnection {
                io,
                secure_transport: options.secure_transport,
                local_addr,
                peer_addr,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let provider = TokioTcpProvider;
        let address = RemoteAddress {
            host: "127.0.0.1".into(),
            // Reserved port nothing listens on
            port: 1,
        };
        let result = provider.open(&address, &OpenOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_plain_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider = TokioTcpProvider;
        let address = RemoteAddress {
            host: "127.0.0.1".into(),
            port,
        };
        let conn = provider
            .open(&address, &OpenOptions::default())
            .await
            .unwrap();
        assert_eq!(conn.secure_transport, SecureTransport::Off);
        assert_eq!(conn.peer_addr.unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_secure_on_without_tls_config() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider = TokioTcpProvider;
        let address = RemoteAddress {
            host: "127.0.0.1".into(),
            port,
        };
        let options = OpenOptions {
            secure_transport: SecureTransport::On,
            ..Default::default()
        };
        let result = provider.open(&address, &options).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
