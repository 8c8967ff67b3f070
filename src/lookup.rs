//! Injected host lookup capability
//!
//! Resolution policy lives with the caller: literal IPs bypass lookup
//! entirely, and when no capability is supplied the literal hostname is
//! handed straight to the native open call.

use crate::Result;
use futures::future::BoxFuture;
use std::net::IpAddr;

/// Asynchronous hostname resolution capability.
///
/// Implementations return a single address; picking among multiple records
/// is the implementation's policy, not the socket's.
pub trait Lookup: Send + Sync {
    fn lookup(&self, host: &str) -> BoxFuture<'static, Result<IpAddr>>;
}

/// A `Lookup` backed by a plain closure, convenient for tests and adapters.
pub struct LookupFn<F>(pub F);

impl<F> Lookup for LookupFn<F>
where
    F: Fn(&str) -> BoxFuture<'static, Result<IpAddr>> + Send + Sync,
{
    fn lookup(&self, host: &str) -> BoxFuture<'static, Result<IpAddr>> {
        (self.0)(host)
    }
}
