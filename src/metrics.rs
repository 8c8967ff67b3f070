//! Metrics collection helpers
//!
//! Thin wrappers over the `metrics` facade so call sites stay one-liners and
//! metric names live in one place. A recorder is the embedding application's
//! concern; without one these are no-ops.

/// Counter metrics
pub mod counters {
    /// A native transport was opened.
    pub fn connection_opened(secure: &str) {
        metrics::counter!("sockwire_connections_opened_total", "secure" => secure.to_string())
            .increment(1);
    }

    /// A native open call failed.
    pub fn connection_failed() {
        metrics::counter!("sockwire_connection_attempts_failed_total").increment(1);
    }

    /// A socket was destroyed.
    pub fn connection_closed(had_error: bool) {
        let outcome = if had_error { "error" } else { "ok" };
        metrics::counter!("sockwire_connections_closed_total", "outcome" => outcome).increment(1);
    }

    /// Bytes delivered downstream by the read loop.
    pub fn bytes_read(n: u64) {
        metrics::counter!("sockwire_bytes_read_total").increment(n);
    }

    /// Bytes accepted by the native writer.
    pub fn bytes_written(n: u64) {
        metrics::counter!("sockwire_bytes_written_total").increment(n);
    }

    /// A TLS promotion completed.
    pub fn tls_handshake(outcome: &'static str) {
        metrics::counter!("sockwire_tls_handshakes_total", "outcome" => outcome).increment(1);
    }

    /// An idle timeout fired.
    pub fn idle_timeout() {
        metrics::counter!("sockwire_idle_timeouts_total").increment(1);
    }
}

/// Histogram metrics
pub mod histograms {
    /// Time from connect() to handle installation, in milliseconds.
    pub fn connect_duration(ms: u64) {
        metrics::histogram!("sockwire_connect_duration_ms").record(ms as f64);
    }

    /// TLS promotion duration, in milliseconds.
    pub fn handshake_duration(ms: u64) {
        metrics::histogram!("sockwire_tls_handshake_duration_ms").record(ms as f64);
    }
}
