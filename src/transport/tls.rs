//! TLS client configuration and the startTls promotion
//!
//! TLS is delegated entirely to rustls/tokio-rustls. This module owns the
//! client configuration (root stores, SNI names) and [`promote`], which
//! consumes a plaintext duplex and returns the encrypted one in its place.

use super::RawDuplex;
use crate::{Error, Result};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::Item;
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;

/// TLS client configuration for secure and startTls connections.
///
/// Built from system root certificates by default; a custom CA file or the
/// bundled webpki roots can be selected through the builder.
#[derive(Clone)]
pub struct TlsConfig {
    ca_cert_path: Option<String>,
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// The compiled rustls `ClientConfig`.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_path", &self.ca_cert_path)
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

/// Builder for [`TlsConfig`].
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    ca_cert_path: Option<String>,
    use_webpki_roots: bool,
}

impl TlsConfigBuilder {
    /// Use a custom CA certificate file (PEM) instead of system roots.
    pub fn ca_cert_path(mut self, path: impl Into<String>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Use the bundled webpki root set instead of system roots. Ignored when
    /// a CA file is configured.
    pub fn use_webpki_roots(mut self, use_webpki: bool) -> Self {
        self.use_webpki_roots = use_webpki;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Fails when the CA file cannot be read or parsed, or no system roots
    /// could be loaded.
    pub fn build(self) -> Result<TlsConfig> {
        let root_store = if let Some(ca_path) = &self.ca_cert_path {
            load_custom_ca(ca_path)?
        } else if self.use_webpki_roots {
            let mut store = RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        } else {
            let result = rustls_native_certs::load_native_certs();

            let mut store = RootCertStore::empty();
            for cert in result.certs {
                let _ = store.add_parsable_certificates(std::iter::once(cert));
            }

            if !result.errors.is_empty() && store.is_empty() {
                return Err(Error::Config(
                    "failed to load any system root certificates".into(),
                ));
            }

            store
        };

        let client_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );

        Ok(TlsConfig {
            ca_cert_path: self.ca_cert_path,
            client_config,
        })
    }
}

/// Load a custom CA certificate from a PEM file.
fn load_custom_ca(ca_path: &str) -> Result<RootCertStore> {
    let ca_cert_data = fs::read(ca_path)
        .map_err(|e| Error::Config(format!("failed to read CA file '{}': {}", ca_path, e)))?;

    let mut reader = std::io::Cursor::new(&ca_cert_data);
    let mut root_store = RootCertStore::empty();
    let mut found_certs = 0;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let _ = root_store.add_parsable_certificates(std::iter::once(cert));
                found_certs += 1;
            }
            Ok(Some(_)) => {
                // Skip non-certificate items (private keys, etc.)
            }
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "failed to parse CA certificate from '{}'",
                    ca_path
                )));
            }
        }
    }

    if found_certs == 0 {
        return Err(Error::Config(format!(
            "no valid certificates found in '{}'",
            ca_path
        )));
    }

    Ok(root_store)
}

/// Promote an established plaintext duplex to TLS in place.
///
/// Consumes the plaintext stream and returns the encrypted one; the logical
/// connection is never closed. This is the native side of startTls.
pub async fn promote(
    io: Box<dyn RawDuplex>,
    tls: &TlsConfig,
    server_name: &str,
) -> Result<Box<dyn RawDuplex>> {
    let name = parse_server_name(server_name)?;
    let name = rustls_pki_types::ServerName::try_from(name)
        .map_err(|_| Error::Config(format!("invalid hostname for TLS: {}", server_name)))?;

    let connector = tokio_rustls::TlsConnector::from(tls.client_config());
    let stream = connector.connect(name, io).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::from(e)
        } else {
            Error::Tls(format!("handshake failed: {}", e))
        }
    })?;

    tracing::debug!(server_name, "transport promoted to TLS");
    Ok(Box::new(stream))
}

/// Parse and validate a hostname for TLS SNI.
pub fn parse_server_name(hostname: &str) -> Result<String> {
    let hostname = hostname.trim_end_matches('.');

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(Error::Config(format!(
            "invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    if !hostname
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '.' || c == ':')
    {
        return Err(Error::Config(format!(
            "invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    Ok(hostname.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_name_valid() {
        assert!(parse_server_name("localhost").is_ok());
        assert!(parse_server_name("example.com").is_ok());
        assert!(parse_server_name("db.internal.example.com").is_ok());
    }

    #[test]
    fn test_parse_server_name_trailing_dot() {
        assert_eq!(parse_server_name("example.com.").unwrap(), "example.com");
    }

    #[test]
    fn test_parse_server_name_empty() {
        assert!(parse_server_name("").is_err());
        assert!(parse_server_name(".").is_err());
    }

    #[test]
    fn test_parse_server_name_invalid_chars() {
        assert!(parse_server_name("exa mple.com").is_err());
        assert!(parse_server_name("host/path").is_err());
    }

    #[test]
    fn test_tls_config_webpki_roots() {
        let tls = TlsConfig::builder()
            .use_webpki_roots(true)
            .build()
            .expect("webpki roots always available");
        let debug = format!("{:?}", tls);
        assert!(debug.contains("TlsConfig"));
    }

    #[test]
    fn test_tls_config_missing_ca_file() {
        let result = TlsConfig::builder()
            .ca_cert_path("/nonexistent/ca.pem")
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
