//! Error types for sockwire

/// Errors produced by sockets, the TLS upgrade path, and the transport layer.
///
/// Validation errors (`InvalidArgument`, `NotImplemented`, `AlreadyConnecting`,
/// `SocketDestroyed`) are returned synchronously before any native call.
/// Connection errors are delivered through events and pending write/connect
/// acknowledgements, never across the caller's stack. The enum is `Clone` so
/// the error that tore a socket down can be handed to every waiter that
/// observes the failure afterwards; the I/O payload sits behind an `Arc` to
/// keep that cheap.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Invalid argument supplied to connect/write
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error (TLS setup, certificates, server names)
    #[error("configuration error: {0}")]
    Config(String),

    /// A second connect was issued while one is in flight
    #[error("socket is already connecting")]
    AlreadyConnecting,

    /// Operation on a destroyed socket
    #[error("socket has been destroyed")]
    SocketDestroyed,

    /// The socket closed while the operation was pending
    #[error("socket closed")]
    SocketClosed,

    /// Write issued after the writable side ended (EPIPE-class)
    #[error("write after end (EPIPE)")]
    Epipe,

    /// Host lookup failed
    #[error("lookup failed for {host}: {message}")]
    Lookup { host: String, message: String },

    /// Connection reset before the TLS handshake completed
    #[error("connection reset by peer ({host}:{port})")]
    ConnectionReset { host: String, port: u16 },

    /// The TLS handshake did not complete within the configured window
    #[error("TLS handshake timed out ({host}:{port})")]
    HandshakeTimeout { host: String, port: u16 },

    /// TLS handshake or protocol failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Accepted option that this implementation deliberately does not support
    #[error("option not implemented: {0}")]
    NotImplemented(&'static str),

    /// Invalid lifecycle transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Native write made no progress past the retry cap
    #[error("write retry limit exceeded")]
    WriteRetryExceeded,

    /// Connection aborted via an abort signal
    #[error("connection aborted")]
    Aborted,

    /// I/O error from the native transport
    #[error("I/O error: {0}")]
    Io(#[source] std::sync::Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(std::sync::Arc::new(e))
    }
}

impl Error {
    /// Whether this error represents an abrupt teardown the close event
    /// should report as `had_error`.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::NotImplemented(_) | Error::InvalidArgument(_))
    }
}

/// Result type for sockwire operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::HandshakeTimeout {
            host: "example.com".into(),
            port: 443,
        };
        assert_eq!(err.to_string(), "TLS handshake timed out (example.com:443)");

        let err = Error::ConnectionReset {
            host: "10.0.0.1".into(),
            port: 8443,
        };
        assert!(err.to_string().contains("10.0.0.1:8443"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
