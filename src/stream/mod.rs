//! Readable-side stream adapter
//!
//! The socket's read loop pushes received chunks into a bounded channel; the
//! channel's capacity is the high-water mark, and a full channel is what
//! pauses the producer. [`ByteStream`] wraps the consuming half as a
//! `futures::Stream`.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Stream of received byte chunks. Ends (`None`) when the peer ends the
/// readable side or the socket is destroyed.
pub struct ByteStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ByteStream {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Receive the next chunk.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for ByteStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_delivers_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = ByteStream::new(rx);

        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        drop(tx);

        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"two"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_after_close() {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let mut stream = ByteStream::new(rx);
        drop(tx);
        assert!(stream.recv().await.is_none());
    }
}
