//! Socket lifecycle: plaintext sockets, TLS promotion, state machines

mod handle;
mod sock;
mod state;
mod tls;

pub use sock::{ConnectOptions, DataCallback, RecvBufferFn, Socket};
pub use state::{ReadyState, SocketState};
pub use tls::{TlsOptions, TlsSocket};
