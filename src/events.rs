//! Socket lifecycle events
//!
//! Sockets publish lifecycle notifications on a broadcast bus. Emission never
//! blocks and is lossy when nobody is subscribed; the socket core guarantees
//! the terminal `Close` is emitted exactly once.

use tokio::sync::broadcast;

/// Lifecycle events emitted by [`Socket`](crate::Socket) and
/// [`TlsSocket`](crate::TlsSocket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Native transport opened, handle installed
    Connect,
    /// Socket is fully readable/writable
    Ready,
    /// The native open call failed (always followed by `Close`)
    ConnectionAttemptFailed,
    /// Peer ended the readable side
    End,
    /// Idle timeout elapsed (advisory; the socket is not torn down)
    Timeout,
    /// All queued writes flushed to the native writer
    Drain,
    /// TLS handshake completed
    Secure,
    /// TLS connection verified and released to the application
    SecureConnect,
    /// Non-fatal or fatal error, stringified
    Error(String),
    /// Terminal event; fires exactly once per socket
    Close { had_error: bool },
}

/// Broadcast bus carrying [`SocketEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SocketEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. Silently drops it when there are no subscribers.
    pub fn emit(&self, event: SocketEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(SocketEvent::Connect);
        bus.emit(SocketEvent::Close { had_error: false });

        assert_eq!(rx.recv().await.unwrap(), SocketEvent::Connect);
        assert_eq!(
            rx.recv().await.unwrap(),
            SocketEvent::Close { had_error: false }
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(8);
        // Must not panic or error
        bus.emit(SocketEvent::Ready);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(8);
        bus.emit(SocketEvent::Connect);
        let mut rx = bus.subscribe();
        bus.emit(SocketEvent::Ready);
        assert_eq!(rx.recv().await.unwrap(), SocketEvent::Ready);
    }
}
