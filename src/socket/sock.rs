//! Core socket type
//!
//! A `Socket` is a full-duplex byte stream over one native connection
//! [`Handle`]. It owns the read loop, the serialized write queue, the idle
//! timer, and the connect/destroy state machine. `connect()` is non-blocking:
//! the native open runs on a background task, writes issued meanwhile are
//! queued and replayed in order, and `ready()` awaits the outcome.

use super::handle::Handle;
use super::state::{ReadyState, SocketState};
use crate::abort::{AbortBinding, AbortSignal};
use crate::events::{EventBus, SocketEvent};
use crate::lookup::Lookup;
use crate::stream::ByteStream;
use crate::transport::{
    OpenOptions, RemoteAddress, SecureTransport, TlsConfig, TokioTcpProvider, TransportProvider,
};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::Instrument;

/// Consecutive zero-progress native writes tolerated before the write fails.
const MAX_WRITE_STALLS: u32 = 5;

/// Default receive-channel capacity (chunks), the read-side high-water mark.
const DEFAULT_HIGH_WATER_MARK: usize = 32;

/// Default receive buffer size handed to the native read call.
const DEFAULT_RECV_BUFFER: usize = 16 * 1024;

/// Generator for reusable receive buffers. Returning `None` (or a
/// zero-capacity buffer) stops the read loop; reading into an empty buffer
/// is illegal on the native reader.
pub type RecvBufferFn = Box<dyn FnMut() -> Option<BytesMut> + Send>;

/// Raw per-chunk delivery callback. Returning `false` pauses the read loop.
pub type DataCallback = Box<dyn FnMut(&Bytes) -> bool + Send>;

/// Options accepted by [`Socket::connect`].
///
/// Exactly one of `port`/`path` must be set; `path` (and `fd`) are accepted
/// for surface compatibility but rejected with `NotImplemented`.
pub struct ConnectOptions {
    pub host: String,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub fd: Option<i32>,
    pub allow_half_open: bool,
    /// Accepted, not applied
    pub no_delay: bool,
    /// Accepted, not applied
    pub keep_alive: bool,
    pub secure_transport: SecureTransport,
    pub tls: Option<TlsConfig>,
    /// SNI override; defaults to `host`
    pub server_name: Option<String>,
    /// Receive-channel capacity in chunks
    pub high_water_mark: usize,
    pub lookup: Option<Arc<dyn Lookup>>,
    pub provider: Option<Arc<dyn TransportProvider>>,
    pub signal: Option<AbortSignal>,
    pub recv_buffer: Option<RecvBufferFn>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            path: None,
            fd: None,
            allow_half_open: false,
            no_delay: false,
            keep_alive: false,
            secure_transport: SecureTransport::Off,
            tls: None,
            server_name: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            lookup: None,
            provider: None,
            signal: None,
            recv_buffer: None,
        }
    }

    pub fn allow_half_open(mut self, allow: bool) -> Self {
        self.allow_half_open = allow;
        self
    }

    pub fn secure_transport(mut self, mode: SecureTransport) -> Self {
        self.secure_transport = mode;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn high_water_mark(mut self, chunks: usize) -> Self {
        self.high_water_mark = chunks.max(1);
        self
    }

    pub fn lookup(mut self, lookup: Arc<dyn Lookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn TransportProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn recv_buffer(mut self, generator: RecvBufferFn) -> Self {
        self.recv_buffer = Some(generator);
        self
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("allow_half_open", &self.allow_half_open)
            .field("secure_transport", &self.secure_transport)
            .field("high_water_mark", &self.high_water_mark)
            .finish_non_exhaustive()
    }
}

/// Mutable socket state behind the core lock. Never held across an await.
struct Core {
    state: SocketState,
    handle: Option<Handle>,
    /// Queued writes with their acknowledgements, flushed in order
    pending: VecDeque<(Bytes, oneshot::Sender<Result<()>>)>,
    pending_bytes: usize,
    write_inflight: bool,
    read_loop_active: bool,
    /// User-requested pause; also honored before connect completes
    paused: bool,
    /// Upgrade path asked the read loop to surrender the reader
    read_stop_requested: bool,
    writable_ended: bool,
    readable_ended: bool,
    destroyed: bool,
    had_error: bool,
    error: Option<Error>,
    timeout: Option<Duration>,
    timer_epoch: u64,
    bytes_read: u64,
    bytes_written: u64,
    allow_half_open: bool,
    no_delay: bool,
    keep_alive: bool,
    host: String,
    port: u16,
    secure_transport: SecureTransport,
    tls: Option<TlsConfig>,
    server_name: Option<String>,
    reset_pending: bool,
    data_tx: Option<mpsc::Sender<Bytes>>,
    on_data: Option<DataCallback>,
    recv_buffer: Option<RecvBufferFn>,
    abort_binding: Option<AbortBinding>,
}

impl Core {
    fn new() -> Self {
        Self {
            state: SocketState::Idle,
            handle: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            write_inflight: false,
            read_loop_active: false,
            paused: false,
            read_stop_requested: false,
            writable_ended: false,
            readable_ended: false,
            destroyed: false,
            had_error: false,
            error: None,
            timeout: None,
            timer_epoch: 0,
            bytes_read: 0,
            bytes_written: 0,
            allow_half_open: false,
            no_delay: false,
            keep_alive: false,
            host: String::new(),
            port: 0,
            secure_transport: SecureTransport::Off,
            tls: None,
            server_name: None,
            reset_pending: false,
            data_tx: None,
            on_data: None,
            recv_buffer: None,
            abort_binding: None,
        }
    }

    fn reading_allowed(&self) -> bool {
        !self.destroyed && !self.paused && !self.read_stop_requested && !self.readable_ended
    }
}

pub(crate) struct Shared {
    core: StdMutex<Core>,
    pub(crate) events: EventBus,
    /// connect() outcome flag; true once the open resolved either way
    ready_tx: watch::Sender<bool>,
    /// Bumped to make the read loop re-check its flags
    control_tx: watch::Sender<u64>,
    /// Bumped on read/write byte progress; re-arms the idle timer
    activity_tx: watch::Sender<u64>,
    /// Bumped on structural transitions (loop exit, writer returned)
    progress_tx: watch::Sender<u64>,
    data_rx: AsyncMutex<Option<mpsc::Receiver<Bytes>>>,
}

fn bump(tx: &watch::Sender<u64>) {
    tx.send_modify(|v| *v = v.wrapping_add(1));
}

/// A Node-style duplex socket. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<Shared>,
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    /// Create an idle socket. Call [`connect`](Socket::connect) to open it.
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (control_tx, _) = watch::channel(0);
        let (activity_tx, _) = watch::channel(0);
        let (progress_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                core: StdMutex::new(Core::new()),
                events: EventBus::default(),
                ready_tx,
                control_tx,
                activity_tx,
                progress_tx,
                data_rx: AsyncMutex::new(None),
            }),
        }
    }

    fn core(&self) -> std::sync::MutexGuard<'_, Core> {
        // Lock poisoning only happens after a panic in this module
        self.shared
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Begin connecting. Non-blocking: validation happens synchronously, the
    /// native open on a background task. Use [`ready`](Socket::ready) to
    /// await the outcome; events report it either way.
    pub fn connect(&self, mut options: ConnectOptions) -> Result<()> {
        let port = {
            let mut core = self.core();
            if core.destroyed {
                return Err(Error::SocketDestroyed);
            }
            if core.state != SocketState::Idle {
                return Err(Error::AlreadyConnecting);
            }
            if options.fd.is_some() {
                return Err(Error::NotImplemented("fd"));
            }
            match (&options.path, options.port) {
                (Some(_), Some(_)) => {
                    return Err(Error::InvalidArgument(
                        "exactly one of port or path must be set".into(),
                    ));
                }
                (Some(_), None) => return Err(Error::NotImplemented("path")),
                (None, None) => {
                    return Err(Error::InvalidArgument(
                        "exactly one of port or path must be set".into(),
                    ));
                }
                (None, Some(port)) => port,
            }
        };

        let (data_tx, data_rx) = mpsc::channel(options.high_water_mark.max(1));

        {
            let mut core = self.core();
            core.state.transition(SocketState::Connecting)?;
            core.host = options.host.clone();
            core.port = port;
            core.allow_half_open = options.allow_half_open;
            core.no_delay = options.no_delay;
            core.keep_alive = options.keep_alive;
            core.secure_transport = options.secure_transport;
            core.tls = options.tls.clone();
            core.server_name = options.server_name.clone();
            core.data_tx = Some(data_tx);
            core.recv_buffer = options.recv_buffer.take();

            if let Some(signal) = options.signal.take() {
                let this = self.clone();
                let mut signal = signal;
                let task = tokio::spawn(async move {
                    signal.aborted().await;
                    this.destroy_with(Some(Error::Aborted));
                });
                core.abort_binding = Some(AbortBinding::new(task));
            }
        }

        // The receiver slot is free before the first connect
        if let Ok(mut slot) = self.shared.data_rx.try_lock() {
            *slot = Some(data_rx);
        }

        let this = self.clone();
        let host = options.host.clone();
        let lookup = options.lookup.clone();
        let provider = options
            .provider
            .clone()
            .unwrap_or_else(|| Arc::new(TokioTcpProvider) as Arc<dyn TransportProvider>);
        let open_options = OpenOptions {
            allow_half_open: options.allow_half_open,
            secure_transport: options.secure_transport,
            tls: options.tls.clone(),
            server_name: options.server_name.clone(),
        };

        tokio::spawn(
            async move {
                this.run_connect(host, port, lookup, provider, open_options)
                    .await;
            }
            .instrument(tracing::debug_span!("connect", host = %options.host, port)),
        );

        Ok(())
    }

    async fn run_connect(
        &self,
        host: String,
        port: u16,
        lookup: Option<Arc<dyn Lookup>>,
        provider: Arc<dyn TransportProvider>,
        open_options: OpenOptions,
    ) {
        let started = std::time::Instant::now();

        // Literal IPs connect directly; a lookup capability resolves
        // hostnames; without one the literal hostname goes straight to the
        // native open (address family 0).
        let resolved = if crate::ip::is_ip(&host) != 0 {
            Ok(host.clone())
        } else if let Some(lookup) = lookup {
            lookup.lookup(&host).await.map(|ip| ip.to_string())
        } else {
            Ok(host.clone())
        };

        let opened = match resolved {
            Ok(target) => {
                let address = RemoteAddress {
                    host: target,
                    port,
                };
                provider.open(&address, &open_options).await
            }
            Err(e) => Err(e),
        };

        match opened {
            Ok(conn) => {
                let secure = conn.secure_transport;
                let start_reading = {
                    let mut core = self.core();
                    if core.destroyed {
                        // Destroyed while the open was in flight; discard.
                        return;
                    }
                    let mut handle = Handle::install(conn);
                    handle.reading = !core.paused;
                    core.handle = Some(handle);
                    if core.state.transition(SocketState::Open).is_err() {
                        return;
                    }
                    !core.paused
                };

                crate::metrics::counters::connection_opened(&secure.to_string());
                crate::metrics::histograms::connect_duration(started.elapsed().as_millis() as u64);
                tracing::debug!(secure = %secure, "socket connected");

                self.shared.events.emit(SocketEvent::Connect);
                self.shared.events.emit(SocketEvent::Ready);
                let _ = self.shared.ready_tx.send(true);
                bump(&self.shared.progress_tx);

                if start_reading {
                    self.spawn_read_loop();
                }
                // Replay writes queued while connecting, in order
                let this = self.clone();
                tokio::spawn(async move { this.flush_pending().await });

                let reset = self.core().reset_pending;
                if reset {
                    let (host, port) = {
                        let core = self.core();
                        (core.host.clone(), core.port)
                    };
                    self.destroy_with(Some(Error::ConnectionReset { host, port }));
                }
            }
            Err(e) => {
                crate::metrics::counters::connection_failed();
                tracing::debug!(error = %e, "connection attempt failed");
                self.shared.events.emit(SocketEvent::ConnectionAttemptFailed);
                self.destroy_with(Some(e));
            }
        }
    }

    /// Resolves once the pending connect finished. `Ok` when the socket is
    /// open, otherwise the error that tore the connection down.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.shared.ready_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        let core = self.core();
        if core.destroyed {
            Err(core.error.clone().unwrap_or(Error::SocketClosed))
        } else {
            Ok(())
        }
    }

    // ---- read path -------------------------------------------------------

    pub(crate) fn spawn_read_loop(&self) {
        let reader = {
            let mut core = self.core();
            if core.read_loop_active || !core.reading_allowed() {
                return;
            }
            match core.handle.as_mut().and_then(|h| h.reader.take()) {
                Some(reader) => {
                    core.read_loop_active = true;
                    reader
                }
                None => return,
            }
        };
        let this = self.clone();
        tokio::spawn(async move { this.read_loop(reader).await });
    }

    async fn read_loop(&self, mut reader: tokio::io::ReadHalf<Box<dyn crate::transport::RawDuplex>>) {
        use tokio::io::AsyncReadExt;

        enum Exit {
            Stopped,
            Eof,
            Failed(Error),
        }

        let mut control_rx = self.shared.control_tx.subscribe();

        let exit = loop {
            // Mark the control version before checking flags so a flag set
            // after the check wakes the select immediately.
            control_rx.borrow_and_update();

            let mut buf = {
                let mut core = self.core();
                if !core.reading_allowed() {
                    break Exit::Stopped;
                }
                let buf = match core.recv_buffer.as_mut() {
                    Some(generator) => generator(),
                    None => Some(BytesMut::with_capacity(DEFAULT_RECV_BUFFER)),
                };
                match buf {
                    Some(b) if b.capacity() > 0 => b,
                    // A null/empty buffer from the generator stops the loop;
                    // reading into an empty buffer is illegal.
                    _ => break Exit::Stopped,
                }
            };

            let read = tokio::select! {
                biased;
                _ = control_rx.changed() => None,
                r = reader.read_buf(&mut buf) => Some(r),
            };

            let n = match read {
                // Control poked: re-check flags at the top of the loop. The
                // dispatched native read is abandoned at a cancellation-safe
                // point; no bytes were consumed.
                None => continue,
                Some(Ok(n)) => n,
                Some(Err(e)) => break Exit::Failed(Error::from(e)),
            };

            if self.core().destroyed {
                // Destroyed while awaiting; discard the result.
                break Exit::Stopped;
            }

            if n == 0 {
                break Exit::Eof;
            }

            let chunk = buf.split_to(n).freeze();
            {
                let mut core = self.core();
                core.bytes_read += n as u64;
            }
            crate::metrics::counters::bytes_read(n as u64);
            bump(&self.shared.activity_tx);

            self.deliver(chunk, &mut control_rx).await;
        };

        // Return the reader unless the socket already tore the handle down.
        {
            let mut core = self.core();
            if let Some(handle) = core.handle.as_mut() {
                handle.reader = Some(reader);
            }
            core.read_loop_active = false;
        }
        bump(&self.shared.progress_tx);

        match exit {
            Exit::Stopped => {}
            Exit::Eof => self.handle_eof(),
            Exit::Failed(e) => {
                // Native read errors are transport teardown
                tracing::debug!(error = %e, "read loop terminated by transport error");
                self.destroy_with(Some(e));
            }
        }
    }

    /// Deliver one chunk downstream: through the raw callback when
    /// installed, else through the bounded channel (whose full state is the
    /// backpressure pause).
    async fn deliver(&self, chunk: Bytes, control_rx: &mut watch::Receiver<u64>) {
        let callback = self.core().on_data.take();

        if let Some(mut cb) = callback {
            let keep_going = cb(&chunk);
            let mut core = self.core();
            if core.on_data.is_none() {
                core.on_data = Some(cb);
            }
            if !keep_going {
                core.paused = true;
                if let Some(h) = core.handle.as_mut() {
                    h.reading = false;
                }
            }
            return;
        }

        let tx = match self.core().data_tx.clone() {
            Some(tx) => tx,
            None => return,
        };

        loop {
            control_rx.borrow_and_update();
            if self.core().destroyed {
                // Destroyed while the channel was full; discard.
                return;
            }
            tokio::select! {
                biased;
                changed = control_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Re-check flags, then retry the send
                }
                sent = tx.send(chunk.clone()) => {
                    // A dropped receiver means the consumer went away;
                    // discard quietly, destroy() handles teardown.
                    let _ = sent;
                    return;
                }
            }
        }
    }

    fn handle_eof(&self) {
        let tear_down = {
            let mut core = self.core();
            if core.destroyed {
                return;
            }
            core.readable_ended = true;
            // Closing the channel is the end-of-stream push
            core.data_tx = None;
            if let Some(h) = core.handle.as_mut() {
                h.reading = false;
            }
            !core.allow_half_open
        };

        tracing::debug!("peer ended the readable side");
        self.shared.events.emit(SocketEvent::End);

        // Without half-open the writable side ends with the readable one
        if tear_down {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.end().await;
                this.destroy();
            });
        }
    }

    /// Pause reading. Cannot cancel an already-dispatched native read; only
    /// prevents scheduling the next one.
    pub fn pause(&self) {
        let mut core = self.core();
        core.paused = true;
        if let Some(h) = core.handle.as_mut() {
            h.reading = false;
        }
        drop(core);
        bump(&self.shared.control_tx);
    }

    /// Resume reading after a pause.
    pub fn resume(&self) {
        {
            let mut core = self.core();
            core.paused = false;
            if let Some(h) = core.handle.as_mut() {
                h.reading = true;
            }
        }
        bump(&self.shared.control_tx);
        // Single-instance guard inside makes this a no-op while the previous
        // loop is still draining.
        self.spawn_read_loop();
    }

    /// Install a raw per-chunk callback, bypassing the channel. Returning
    /// `false` from the callback pauses the read loop.
    pub fn set_data_callback(&self, callback: DataCallback) {
        self.core().on_data = Some(callback);
    }

    /// Receive the next chunk. Resolves to `None` at end-of-stream or after
    /// destruction.
    pub async fn recv(&self) -> Option<Bytes> {
        let _ = self.ready().await;
        let mut slot = self.shared.data_rx.lock().await;
        slot.as_mut()?.recv().await
    }

    /// Take the readable side as a `futures::Stream`. Returns `None` if it
    /// was already taken or the socket never connected.
    pub fn take_stream(&self) -> Option<ByteStream> {
        self.shared
            .data_rx
            .try_lock()
            .ok()?
            .take()
            .map(ByteStream::new)
    }

    // ---- write path ------------------------------------------------------

    /// Queue a chunk for writing and await its acknowledgement. Writes
    /// issued while connecting are replayed, in order, once the socket
    /// opens.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<()> {
        let chunk: Bytes = chunk.into();
        let rx = {
            let mut core = self.core();
            if core.destroyed {
                return Err(Error::SocketDestroyed);
            }
            if core.writable_ended {
                drop(core);
                // EPIPE-class failure: surfaced asynchronously and fatal
                self.destroy_with(Some(Error::Epipe));
                return Err(Error::Epipe);
            }
            if core.state == SocketState::Idle {
                return Err(Error::InvalidState {
                    expected: "connecting or open".into(),
                    actual: core.state.to_string(),
                });
            }
            let (tx, rx) = oneshot::channel();
            core.pending_bytes += chunk.len();
            core.pending.push_back((chunk, tx));
            rx
        };

        self.flush_pending().await;
        rx.await.unwrap_or(Err(Error::SocketClosed))
    }

    /// Drain the pending-write queue. All queued chunks are concatenated
    /// into one buffer per flush to minimize native round trips; only one
    /// flusher runs at a time.
    async fn flush_pending(&self) {
        loop {
            let (mut writer, buf, acks) = {
                let mut core = self.core();
                // Closing still flushes: end() queues behind any in-flight
                // write and the tail must reach the wire before shutdown.
                if core.write_inflight
                    || core.destroyed
                    || !matches!(core.state, SocketState::Open | SocketState::Closing)
                    || core.pending.is_empty()
                {
                    return;
                }
                let writer = match core.handle.as_mut().and_then(|h| h.writer.take()) {
                    Some(w) => w,
                    None => return,
                };
                core.write_inflight = true;

                let mut buf = BytesMut::with_capacity(core.pending_bytes);
                let mut acks = Vec::with_capacity(core.pending.len());
                while let Some((chunk, ack)) = core.pending.pop_front() {
                    buf.extend_from_slice(&chunk);
                    acks.push(ack);
                }
                core.pending_bytes = 0;
                (writer, buf.freeze(), acks)
            };

            let result = match write_all_retry(&mut writer, &buf).await {
                Ok(()) => writer.flush().await.map_err(Error::from),
                Err(e) => Err(e),
            };

            let failure = {
                let mut core = self.core();
                core.write_inflight = false;
                if let Some(handle) = core.handle.as_mut() {
                    handle.writer = Some(writer);
                }
                // else: destroy cleared the handle; dropping the writer
                // closes the native side.

                match result {
                    Ok(()) => {
                        core.bytes_written += buf.len() as u64;
                        crate::metrics::counters::bytes_written(buf.len() as u64);
                        for ack in acks {
                            let _ = ack.send(Ok(()));
                        }
                        None
                    }
                    Err(e) if core.destroyed => {
                        // Consumer destroyed the socket mid-write; not an
                        // error worth surfacing.
                        let _ = e;
                        for ack in acks {
                            let _ = ack.send(Ok(()));
                        }
                        None
                    }
                    Err(e) => {
                        let mut acks = acks.into_iter();
                        if let Some(first) = acks.next() {
                            let _ = first.send(Err(e.clone()));
                        }
                        for ack in acks {
                            let _ = ack.send(Err(Error::SocketClosed));
                        }
                        Some(e)
                    }
                }
            };

            bump(&self.shared.activity_tx);
            bump(&self.shared.progress_tx);

            if let Some(error) = failure {
                // Write failure tears the connection down
                self.destroy_with(Some(error));
                return;
            }

            if self.core().pending.is_empty() {
                self.shared.events.emit(SocketEvent::Drain);
                return;
            }
            // Chunks queued during the native write: keep flushing
        }
    }

    /// End the writable side: flush queued writes, then shut the native
    /// writer down. Deferred until any in-flight connect completes. With
    /// `allow_half_open` the socket stays readable afterwards.
    pub async fn end(&self) -> Result<()> {
        // _final defers until the connect resolves
        if self.ready().await.is_err() {
            return Ok(());
        }

        {
            let mut core = self.core();
            if core.destroyed || core.writable_ended {
                return Ok(());
            }
            core.writable_ended = true;
            let _ = core.state.transition(SocketState::Closing);
        }

        // Wait for the queue to drain and the writer to come to rest
        let mut progress_rx = self.shared.progress_tx.subscribe();
        loop {
            self.flush_pending().await;
            progress_rx.borrow_and_update();
            let writer = {
                let mut core = self.core();
                if core.destroyed {
                    return Ok(());
                }
                if core.pending.is_empty() && !core.write_inflight {
                    core.handle.as_mut().and_then(|h| h.writer.take())
                } else {
                    None
                }
            };
            match writer {
                Some(mut w) => {
                    let shutdown = w.shutdown().await;
                    let mut core = self.core();
                    if let Some(handle) = core.handle.as_mut() {
                        handle.writer = Some(w);
                    }
                    drop(core);
                    bump(&self.shared.progress_tx);
                    shutdown?;
                    tracing::debug!("writable side ended");
                    return Ok(());
                }
                None => {
                    if progress_rx.changed().await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    // ---- timers ----------------------------------------------------------

    /// Arm (or disarm with `None`) the idle timer. Firing emits an advisory
    /// `Timeout` event; the socket is not torn down. Firing is suppressed
    /// while a write is in flight and making progress.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let epoch = {
            let mut core = self.core();
            core.timeout = timeout;
            core.timer_epoch += 1;
            core.timer_epoch
        };
        if let Some(duration) = timeout {
            let this = self.clone();
            tokio::spawn(async move { this.timer_task(epoch, duration).await });
        }
    }

    async fn timer_task(&self, epoch: u64, duration: Duration) {
        let mut activity_rx = self.shared.activity_tx.subscribe();
        loop {
            let armed_activity = *activity_rx.borrow_and_update();
            let armed_pending = {
                let core = self.core();
                if core.timer_epoch != epoch || core.destroyed {
                    return;
                }
                core.pending_bytes
            };

            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    let fire = {
                        let core = self.core();
                        if core.timer_epoch != epoch || core.destroyed {
                            return;
                        }
                        // A write in flight whose queue moved since arming
                        // is slow but progressing, not idle.
                        let write_progressing =
                            core.write_inflight && core.pending_bytes != armed_pending;
                        !write_progressing && *activity_rx.borrow() == armed_activity
                    };
                    if fire {
                        crate::metrics::counters::idle_timeout();
                        tracing::debug!(?duration, "idle timeout elapsed");
                        self.shared.events.emit(SocketEvent::Timeout);
                    }
                    // Advisory: re-arm either way
                }
                changed = activity_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Activity: re-arm
                }
            }
        }
    }

    // ---- teardown --------------------------------------------------------

    /// Destroy the socket. Idempotent; the terminal `Close` event fires
    /// exactly once.
    pub fn destroy(&self) {
        self.destroy_with(None);
    }

    pub(crate) fn destroy_with(&self, error: Option<Error>) {
        self.destroy_internal(error, true);
    }

    /// Teardown with control over error-event emission. Suppression is used
    /// during TLS setup, where failures are surfaced through the upgrade's
    /// own funnel instead of the generic error event.
    pub(crate) fn destroy_internal(&self, error: Option<Error>, emit_error: bool) {
        let (writer, had_error) = {
            let mut core = self.core();
            if core.destroyed {
                return;
            }
            core.destroyed = true;
            if error.is_some() {
                core.had_error = true;
                core.error = error.clone();
            }
            let _ = core.state.transition(SocketState::Closed);

            for (_, ack) in core.pending.drain(..) {
                let _ = ack.send(Err(Error::SocketClosed));
            }
            core.pending_bytes = 0;
            core.data_tx = None;
            if let Some(binding) = core.abort_binding.as_mut() {
                binding.remove();
            }

            let writer = core.handle.as_mut().and_then(|h| {
                h.reading = false;
                h.writer.take()
            });
            core.handle = None;
            core.timer_epoch += 1;
            (writer, core.had_error)
        };

        if let Some(e) = &error {
            tracing::debug!(error = %e, "socket destroyed with error");
            if emit_error {
                self.shared.events.emit(SocketEvent::Error(e.to_string()));
            }
        } else {
            tracing::debug!("socket destroyed");
        }

        // Wake the read loop, ready() waiters and timers
        bump(&self.shared.control_tx);
        bump(&self.shared.activity_tx);
        bump(&self.shared.progress_tx);
        let _ = self.shared.ready_tx.send(true);

        let events = self.shared.events.clone();
        tokio::spawn(async move {
            if let Some(mut w) = writer {
                // Native close is asynchronous and idempotent
                let _ = w.shutdown().await;
            }
            crate::metrics::counters::connection_closed(had_error);
            events.emit(SocketEvent::Close { had_error });
        });
    }

    /// Destroy tagged as an abrupt reset. Deferred until a pending connect
    /// resolves.
    pub fn reset_and_destroy(&self) {
        let deferred = {
            let mut core = self.core();
            if core.state == SocketState::Connecting {
                core.reset_pending = true;
                true
            } else {
                false
            }
        };
        if !deferred {
            let (host, port) = {
                let core = self.core();
                (core.host.clone(), core.port)
            };
            self.destroy_with(Some(Error::ConnectionReset { host, port }));
        }
    }

    // ---- accessors and no-op socket options ------------------------------

    /// Accepted, not applied: kept for callers that set it unconditionally.
    pub fn set_no_delay(&self, enable: bool) {
        self.core().no_delay = enable;
    }

    /// Accepted, not applied: kept for callers that set it unconditionally.
    pub fn set_keep_alive(&self, enable: bool) {
        self.core().keep_alive = enable;
    }

    pub fn bytes_read(&self) -> u64 {
        self.core().bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.core().bytes_written
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.core().handle.as_ref().and_then(|h| h.peer_addr)
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_address().map(|a| a.port())
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.core().handle.as_ref().and_then(|h| h.local_addr)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_address().map(|a| a.port())
    }

    /// True until the connect completes (or on an idle socket).
    pub fn pending(&self) -> bool {
        matches!(
            self.core().state,
            SocketState::Idle | SocketState::Connecting
        )
    }

    pub fn destroyed(&self) -> bool {
        self.core().destroyed
    }

    pub fn ready_state(&self) -> ReadyState {
        let core = self.core();
        if core.destroyed {
            return ReadyState::Closed;
        }
        match core.state {
            SocketState::Idle => ReadyState::Closed,
            SocketState::Connecting => ReadyState::Opening,
            SocketState::Open | SocketState::Closing => {
                match (core.readable_ended, core.writable_ended) {
                    (false, false) => ReadyState::Open,
                    (false, true) => ReadyState::ReadOnly,
                    (true, false) => ReadyState::WriteOnly,
                    (true, true) => ReadyState::Closed,
                }
            }
            SocketState::Closed => ReadyState::Closed,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<SocketEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn event_bus(&self) -> &EventBus {
        &self.shared.events
    }

    pub(crate) fn peer(&self) -> (String, u16) {
        let core = self.core();
        (core.host.clone(), core.port)
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.core().timeout
    }

    pub(crate) fn tls_context(&self) -> (Option<TlsConfig>, Option<String>) {
        let core = self.core();
        (core.tls.clone(), core.server_name.clone())
    }

    /// Current secure mode of the live handle, if any.
    pub fn secure_transport(&self) -> Option<SecureTransport> {
        self.core().handle.as_ref().map(|h| h.secure_transport)
    }

    // ---- upgrade support (TlsSocket) -------------------------------------

    /// Stop the read loop and wait until both halves are at rest, then hand
    /// the reunited duplex out for promotion. The socket reads nothing while
    /// the duplex is out.
    pub(crate) async fn reclaim_io(&self) -> Result<Box<dyn crate::transport::RawDuplex>> {
        {
            let mut core = self.core();
            if core.destroyed {
                return Err(Error::SocketDestroyed);
            }
            if core.handle.is_none() {
                return Err(Error::SocketClosed);
            }
            core.read_stop_requested = true;
            if let Some(h) = core.handle.as_mut() {
                h.reading = false;
            }
        }
        bump(&self.shared.control_tx);

        let mut progress_rx = self.shared.progress_tx.subscribe();
        loop {
            progress_rx.borrow_and_update();
            {
                let mut core = self.core();
                if core.destroyed {
                    core.read_stop_requested = false;
                    return Err(Error::SocketDestroyed);
                }
                let at_rest = !core.read_loop_active && !core.write_inflight;
                if at_rest {
                    if let Some(handle) = core.handle.as_mut() {
                        if handle.halves_available() {
                            if let Some(io) = handle.take_io() {
                                return Ok(io);
                            }
                        }
                    } else {
                        core.read_stop_requested = false;
                        return Err(Error::SocketClosed);
                    }
                }
            }
            if progress_rx.changed().await.is_err() {
                return Err(Error::SocketClosed);
            }
        }
    }

    /// Re-bind a promoted duplex into the live handle, preserving counters,
    /// and restart the read loop exactly as a fresh connect would.
    pub(crate) fn rebind_io(
        &self,
        io: Box<dyn crate::transport::RawDuplex>,
        secure: SecureTransport,
    ) -> Result<()> {
        let resume = {
            let mut core = self.core();
            if core.destroyed {
                return Err(Error::SocketDestroyed);
            }
            let paused = core.paused;
            match core.handle.as_mut() {
                Some(handle) => {
                    handle.rebind(io, secure);
                    handle.reading = !paused;
                }
                None => return Err(Error::SocketClosed),
            }
            core.read_stop_requested = false;
            !paused
        };
        bump(&self.shared.progress_tx);
        if resume {
            self.spawn_read_loop();
        }
        let this = self.clone();
        tokio::spawn(async move { this.flush_pending().await });
        Ok(())
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core();
        f.debug_struct("Socket")
            .field("state", &core.state)
            .field("destroyed", &core.destroyed)
            .field("bytes_read", &core.bytes_read)
            .field("bytes_written", &core.bytes_written)
            .field("pending_writes", &core.pending.len())
            .finish_non_exhaustive()
    }
}

/// One native write per flush; consecutive zero-progress attempts are capped
/// before surfacing a generic system error.
async fn write_all_retry<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
) -> Result<()> {
    let mut offset = 0;
    let mut stalls = 0u32;
    while offset < buf.len() {
        let n = writer.write(&buf[offset..]).await?;
        if n == 0 {
            stalls += 1;
            if stalls >= MAX_WRITE_STALLS {
                return Err(Error::WriteRetryExceeded);
            }
        } else {
            offset += n;
            stalls = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_defaults() {
        let opts = ConnectOptions::new("localhost", 8080);
        assert_eq!(opts.host, "localhost");
        assert_eq!(opts.port, Some(8080));
        assert!(!opts.allow_half_open);
        assert_eq!(opts.secure_transport, SecureTransport::Off);
        assert_eq!(opts.high_water_mark, DEFAULT_HIGH_WATER_MARK);
    }

    #[test]
    fn test_connect_requires_port_or_path() {
        let socket = Socket::new();
        let mut opts = ConnectOptions::new("localhost", 0);
        opts.port = None;
        assert!(matches!(
            socket.connect(opts),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_connect_rejects_path() {
        let socket = Socket::new();
        let mut opts = ConnectOptions::new("localhost", 0);
        opts.port = None;
        opts.path = Some("/tmp/sock".into());
        assert!(matches!(
            socket.connect(opts),
            Err(Error::NotImplemented("path"))
        ));
    }

    #[test]
    fn test_connect_rejects_port_and_path() {
        let socket = Socket::new();
        let mut opts = ConnectOptions::new("localhost", 80);
        opts.path = Some("/tmp/sock".into());
        assert!(matches!(
            socket.connect(opts),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_connect_rejects_fd() {
        let socket = Socket::new();
        let mut opts = ConnectOptions::new("localhost", 80);
        opts.fd = Some(3);
        assert!(matches!(
            socket.connect(opts),
            Err(Error::NotImplemented("fd"))
        ));
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let socket = Socket::new();
        socket.connect(ConnectOptions::new("127.0.0.1", 1)).unwrap();
        let second = socket.connect(ConnectOptions::new("127.0.0.1", 1));
        assert!(matches!(
            second,
            Err(Error::AlreadyConnecting) | Err(Error::SocketDestroyed)
        ));
    }

    #[tokio::test]
    async fn test_connect_after_destroy_rejected() {
        let socket = Socket::new();
        socket.destroy();
        // destroy() spawns its close task; the flag itself is synchronous
        assert!(socket.destroyed());
        assert!(matches!(
            socket.connect(ConnectOptions::new("127.0.0.1", 1)),
            Err(Error::SocketDestroyed)
        ));
    }

    #[tokio::test]
    async fn test_write_on_idle_socket_rejected() {
        let socket = Socket::new();
        let result = socket.write(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_ready_state_idle() {
        let socket = Socket::new();
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert!(socket.pending());
    }

    #[tokio::test]
    async fn test_write_all_retry_partial_progress() {
        // A writer that accepts one byte per call still completes
        struct OneByte(Vec<u8>);
        impl tokio::io::AsyncWrite for OneByte {
            fn poll_write(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                self.0.push(buf[0]);
                std::task::Poll::Ready(Ok(1))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut writer = OneByte(Vec::new());
        write_all_retry(&mut writer, b"abc").await.unwrap();
        assert_eq!(writer.0, b"abc");
    }

    #[tokio::test]
    async fn test_write_all_retry_stall_cap() {
        // A writer that never makes progress trips the retry cap
        struct Stalled;
        impl tokio::io::AsyncWrite for Stalled {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                std::task::Poll::Ready(Ok(0))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut writer = Stalled;
        let result = write_all_retry(&mut writer, b"abc").await;
        assert!(matches!(result, Err(Error::WriteRetryExceeded)));
    }
}
