//! TLS socket: handshake state machine and in-place transport upgrade
//!
//! A `TlsSocket` wraps a plaintext [`Socket`] opened in `StartTls` mode. The
//! upgrade reclaims the socket's reader/writer halves (no plaintext byte can
//! be delivered downstream once that completes), promotes the reunited
//! duplex through tokio-rustls, and re-binds the encrypted halves into the
//! same handle — identity, byte counters and the idle timer all survive.

use super::sock::{ConnectOptions, Socket};
use super::state::ReadyState;
use crate::events::SocketEvent;
use crate::transport::{SecureTransport, TlsConfig};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;

/// Options for the TLS layer.
///
/// The unsupported knobs are accepted structurally so callers can pass them,
/// but any non-`None` value is rejected with `NotImplemented` — deliberate
/// policy rather than silent degradation.
#[derive(Debug, Default, Clone)]
pub struct TlsOptions {
    /// Client TLS configuration; falls back to the wrapped socket's
    pub tls: Option<TlsConfig>,
    /// SNI override; defaults to the connect host
    pub server_name: Option<String>,
    /// Handshake deadline; `None` waits indefinitely
    pub handshake_timeout: Option<Duration>,
    /// Unsupported: ALPN protocol negotiation
    pub alpn_protocols: Option<Vec<String>>,
    /// Unsupported: session resumption
    pub session: Option<Bytes>,
    /// Unsupported: pre-shared keys
    pub psk: Option<Bytes>,
}

impl TlsOptions {
    fn validate(&self) -> Result<()> {
        if self.alpn_protocols.is_some() {
            return Err(Error::NotImplemented("alpn_protocols"));
        }
        if self.session.is_some() {
            return Err(Error::NotImplemented("session resumption"));
        }
        if self.psk.is_some() {
            return Err(Error::NotImplemented("psk"));
        }
        Ok(())
    }
}

struct TlsState {
    started: bool,
    secure_pending: bool,
    secure_established: bool,
    authorized: bool,
    /// Errors before this flips are recorded instead of emitted
    control_released: bool,
    /// Whether the recorded failure already went out as an error event
    error_emitted: bool,
    deferred_error: Option<Error>,
    pending_session: Option<Bytes>,
    options: TlsOptions,
}

struct TlsInner {
    state: StdMutex<TlsState>,
    /// Flips once the handshake resolved either way
    secure_tx: watch::Sender<bool>,
}

/// A socket whose transport has been (or is being) promoted to TLS.
#[derive(Clone)]
pub struct TlsSocket {
    socket: Socket,
    inner: Arc<TlsInner>,
}

impl TlsSocket {
    /// Wrap an existing socket. The socket must have been opened with
    /// [`SecureTransport::StartTls`]; call [`start`](TlsSocket::start) to
    /// perform the upgrade.
    pub fn wrap(socket: Socket, options: TlsOptions) -> Result<Self> {
        options.validate()?;
        if socket.destroyed() {
            return Err(Error::SocketDestroyed);
        }
        let this = Self::assemble(socket, options);
        // Construction is complete; later errors surface on the event bus.
        this.release_control();
        Ok(this)
    }

    /// Build the wrapper with control withheld: a failure funneled through
    /// [`tls_error`](Self::tls_error) before [`release_control`] runs is
    /// recorded for `secure_ready` instead of being emitted as an event.
    ///
    /// [`release_control`]: Self::release_control
    fn assemble(socket: Socket, options: TlsOptions) -> Self {
        let (secure_tx, _) = watch::channel(false);
        Self {
            socket,
            inner: Arc::new(TlsInner {
                state: StdMutex::new(TlsState {
                    started: false,
                    secure_pending: false,
                    secure_established: false,
                    authorized: false,
                    control_released: false,
                    error_emitted: false,
                    deferred_error: None,
                    pending_session: None,
                    options,
                }),
                secure_tx,
            }),
        }
    }

    /// Hand the wrapper over to the caller. From here upgrade failures go
    /// out on the event bus; a failure recorded while control was withheld
    /// is surfaced now, exactly once.
    fn release_control(&self) {
        let pending = {
            let mut state = self.state();
            state.control_released = true;
            if state.error_emitted {
                None
            } else {
                let pending = state.deferred_error.clone();
                if pending.is_some() {
                    state.error_emitted = true;
                }
                pending
            }
        };
        if let Some(error) = pending {
            self.socket
                .event_bus()
                .emit(SocketEvent::Error(error.to_string()));
        }
    }

    /// Construct a socket, connect it in `StartTls` mode, and run the
    /// upgrade on a background task. Await
    /// [`secure_ready`](TlsSocket::secure_ready) for the outcome.
    pub fn connect(mut options: ConnectOptions, tls_options: TlsOptions) -> Result<Self> {
        tls_options.validate()?;
        options.secure_transport = SecureTransport::StartTls;
        if options.tls.is_none() {
            options.tls = tls_options.tls.clone();
        }
        if options.server_name.is_none() {
            options.server_name = tls_options.server_name.clone();
        }

        let socket = Socket::new();
        socket.connect(options)?;
        let this = Self::assemble(socket, tls_options);

        // Control is released only after the upgrade task is launched; an
        // upgrade failure that lands before the release is recorded for
        // secure_ready rather than emitted into a bus nobody watches yet.
        let upgrading = this.clone();
        tokio::spawn(async move {
            let _ = upgrading.start().await;
        });
        this.release_control();
        Ok(this)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TlsState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Perform the in-place upgrade. Defers until the wrapped transport has
    /// connected; a no-op `Ok` if the handle was already promoted.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.started {
                return Err(Error::InvalidState {
                    expected: "upgrade not yet started".into(),
                    actual: "started".into(),
                });
            }
            state.started = true;
            state.secure_pending = true;
        }

        let result = self.run_upgrade().await;
        match result {
            Ok(()) => {
                let _ = self.inner.secure_tx.send(true);
                Ok(())
            }
            Err(e) => Err(self.tls_error(e)),
        }
    }

    async fn run_upgrade(&self) -> Result<()> {
        // Defer until the wrapped transport has connected
        self.socket.ready().await?;

        match self.socket.secure_transport() {
            Some(SecureTransport::StartTls) => {}
            // Already upgraded: nothing to do
            Some(SecureTransport::On) => {
                self.finish_init();
                self.on_connect_secure();
                return Ok(());
            }
            Some(SecureTransport::Off) => {
                return Err(Error::InvalidState {
                    expected: "starttls-eligible transport".into(),
                    actual: "plaintext transport".into(),
                });
            }
            None => return Err(Error::SocketClosed),
        }

        let (host, port) = self.socket.peer();
        let (handshake_timeout, tls, server_name) = {
            let state = self.state();
            let (socket_tls, socket_name) = self.socket.tls_context();
            let tls = state.options.tls.clone().or(socket_tls);
            let name = state
                .options
                .server_name
                .clone()
                .or(socket_name)
                .unwrap_or_else(|| host.clone());
            (state.options.handshake_timeout, tls, name)
        };
        let tls = tls.ok_or_else(|| {
            Error::Config("startTls requires a TlsConfig but none was provided".into())
        })?;

        // Release the plaintext reader/writer before requesting promotion;
        // from here no pre-upgrade byte can reach the application.
        let io = self.socket.reclaim_io().await?;
        let started = std::time::Instant::now();

        let promotion = crate::transport::tls::promote(io, &tls, &server_name);
        let promoted = match handshake_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, promotion).await {
                Ok(result) => result,
                Err(_) => Err(Error::HandshakeTimeout {
                    host: host.clone(),
                    port,
                }),
            },
            None => promotion.await,
        };

        let new_io = promoted.map_err(|e| match e {
            // EOF mid-handshake is a reset before secureConnect
            Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Error::ConnectionReset {
                    host: host.clone(),
                    port,
                }
            }
            other => other,
        })?;

        self.socket.rebind_io(new_io, SecureTransport::On)?;
        crate::metrics::counters::tls_handshake("ok");
        crate::metrics::histograms::handshake_duration(started.elapsed().as_millis() as u64);
        tracing::debug!(host = %host, port, "transport upgraded to TLS");

        self.finish_init();
        self.on_connect_secure();
        Ok(())
    }

    /// Runs once: flips `secure_established`, clears the handshake timer
    /// (the timeout future resolved with the promotion), emits `Secure`.
    fn finish_init(&self) {
        {
            let mut state = self.state();
            if state.secure_established {
                return;
            }
            state.secure_established = true;
            state.secure_pending = false;
        }
        self.socket.event_bus().emit(SocketEvent::Secure);
    }

    fn on_connect_secure(&self) {
        let session = {
            let mut state = self.state();
            state.authorized = true;
            state.pending_session.take()
        };
        if session.is_some() {
            // Session data buffered while verification was pending; resumption
            // is unsupported, so there is nothing to replay it into.
            tracing::debug!("discarding buffered session data");
        }
        self.socket.event_bus().emit(SocketEvent::SecureConnect);
        let _ = self.inner.secure_tx.send(true);
    }

    /// The TLS error funnel: before control release errors are recorded, not
    /// emitted, avoiding double emission during setup races. The socket is
    /// torn down either way.
    fn tls_error(&self, error: Error) -> Error {
        crate::metrics::counters::tls_handshake("error");
        let emit = {
            let mut state = self.state();
            state.secure_pending = false;
            state.deferred_error = Some(error.clone());
            if state.control_released {
                state.error_emitted = true;
                true
            } else {
                false
            }
        };
        tracing::debug!(error = %error, emitted = emit, "TLS upgrade failed");
        self.socket.destroy_internal(Some(error.clone()), emit);
        let _ = self.inner.secure_tx.send(true);
        error
    }

    /// Resolves once the handshake finished. `Ok` when secure, otherwise the
    /// error that failed the upgrade.
    pub async fn secure_ready(&self) -> Result<()> {
        let mut rx = self.inner.secure_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        let state = self.state();
        if state.secure_established {
            Ok(())
        } else {
            Err(state.deferred_error.clone().unwrap_or(Error::SocketClosed))
        }
    }

    pub fn encrypted(&self) -> bool {
        matches!(
            self.socket.secure_transport(),
            Some(SecureTransport::On)
        )
    }

    pub fn authorized(&self) -> bool {
        self.state().authorized
    }

    pub fn secure_pending(&self) -> bool {
        self.state().secure_pending
    }

    pub fn secure_established(&self) -> bool {
        self.state().secure_established
    }

    /// Unsupported by policy.
    pub fn renegotiate(&self) -> Result<()> {
        Err(Error::NotImplemented("renegotiation"))
    }

    /// Unsupported by policy.
    pub fn set_session(&self, _session: Bytes) -> Result<()> {
        Err(Error::NotImplemented("session resumption"))
    }

    /// Unsupported by policy.
    pub fn peer_certificate(&self) -> Result<Vec<u8>> {
        Err(Error::NotImplemented("peer certificate retrieval"))
    }

    // ---- delegation to the wrapped socket --------------------------------

    /// The wrapped plaintext socket (the same object whose handle was
    /// promoted).
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.socket.write(chunk).await
    }

    pub async fn recv(&self) -> Option<Bytes> {
        self.socket.recv().await
    }

    pub async fn end(&self) -> Result<()> {
        self.socket.end().await
    }

    pub fn destroy(&self) {
        self.socket.destroy();
    }

    pub fn pause(&self) {
        self.socket.pause();
    }

    pub fn resume(&self) {
        self.socket.resume();
    }

    /// Timers chain to the wrapped socket: the wrapper and its transport
    /// share one logical timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.socket.set_timeout(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.socket.timeout()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.socket.ready_state()
    }

    pub fn destroyed(&self) -> bool {
        self.socket.destroyed()
    }

    pub fn bytes_read(&self) -> u64 {
        self.socket.bytes_read()
    }

    pub fn bytes_written(&self) -> u64 {
        self.socket.bytes_written()
    }

    /// Subscribe to lifecycle events of the wrapped socket.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<SocketEvent> {
        self.socket.events()
    }
}

impl std::fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("TlsSocket")
            .field("secure_pending", &state.secure_pending)
            .field("secure_established", &state.secure_established)
            .field("authorized", &state.authorized)
            .finish_non_exhaustive()
    }
}
