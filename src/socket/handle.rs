//! The live native connection handle
//!
//! A socket owns at most one `Handle` at a time. The duplex is split so the
//! read loop and the write path run independently; either half is taken out
//! of its slot while in use and put back afterwards. The TLS upgrade reunites
//! both halves, promotes the stream, and re-binds fresh halves into the same
//! handle, so socket identity and byte counters survive the swap.

use crate::transport::{RawConnection, RawDuplex, SecureTransport};
use std::net::SocketAddr;
use tokio::io::{ReadHalf, WriteHalf};

pub(crate) struct Handle {
    /// Read half; `None` while the read loop (or an upgrade) holds it
    pub reader: Option<ReadHalf<Box<dyn RawDuplex>>>,
    /// Write half; `None` while a flush (or an upgrade) holds it
    pub writer: Option<WriteHalf<Box<dyn RawDuplex>>>,
    /// Secure mode the handle currently operates in
    pub secure_transport: SecureTransport,
    /// Whether the read loop should keep scheduling reads
    pub reading: bool,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

impl Handle {
    pub fn install(conn: RawConnection) -> Self {
        let (reader, writer) = tokio::io::split(conn.io);
        Self {
            reader: Some(reader),
            writer: Some(writer),
            secure_transport: conn.secure_transport,
            reading: true,
            local_addr: conn.local_addr,
            peer_addr: conn.peer_addr,
        }
    }

    /// Both halves at rest, eligible for reuniting (upgrade path).
    pub fn halves_available(&self) -> bool {
        self.reader.is_some() && self.writer.is_some()
    }

    /// Take both halves and reunite them into the owned duplex. Counters and
    /// addresses stay behind on the handle.
    pub fn take_io(&mut self) -> Option<Box<dyn RawDuplex>> {
        let reader = self.reader.take()?;
        match self.writer.take() {
            Some(writer) => Some(reader.unsplit(writer)),
            None => {
                self.reader = Some(reader);
                None
            }
        }
    }

    /// Re-bind a (possibly promoted) duplex into this handle.
    pub fn rebind(&mut self, io: Box<dyn RawDuplex>, secure_transport: SecureTransport) {
        let (reader, writer) = tokio::io::split(io);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.secure_transport = secure_transport;
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("secure_transport", &self.secure_transport)
            .field("reading", &self.reading)
            .field("reader_bound", &self.reader.is_some())
            .field("writer_bound", &self.writer.is_some())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawConnection;

    fn memory_handle() -> (Handle, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(256);
        let conn = RawConnection {
            io: Box::new(near),
            secure_transport: SecureTransport::StartTls,
            local_addr: None,
            peer_addr: None,
        };
        (Handle::install(conn), far)
    }

    #[tokio::test]
    async fn test_install_binds_both_halves() {
        let (handle, _far) = memory_handle();
        assert!(handle.halves_available());
        assert!(handle.reading);
        assert_eq!(handle.secure_transport, SecureTransport::StartTls);
    }

    #[tokio::test]
    async fn test_take_io_requires_both_halves() {
        let (mut handle, _far) = memory_handle();
        let reader = handle.reader.take();
        assert!(handle.take_io().is_none());
        handle.reader = reader;

        let writer = handle.writer.take();
        // take_io must put the reader back when the writer is missing
        assert!(handle.take_io().is_none());
        assert!(handle.reader.is_some());
        handle.writer = writer;

        assert!(handle.take_io().is_some());
        assert!(!handle.halves_available());
    }

    #[tokio::test]
    async fn test_rebind_after_take() {
        let (mut handle, _far) = memory_handle();
        let io = handle.take_io().unwrap();
        handle.rebind(io, SecureTransport::On);
        assert!(handle.halves_available());
        assert_eq!(handle.secure_transport, SecureTransport::On);
    }
}
