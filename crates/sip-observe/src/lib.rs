// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observability hooks for the transport and framing layer.
//!
//! Transports report through a process-wide [`TransportMetrics`] sink that
//! defaults to a no-op; binaries install [`TracingTransportMetrics`] (or their
//! own exporter) once at startup.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_observe::{set_transport_metrics, transport_metrics, TracingTransportMetrics};
//!
//! set_transport_metrics(Arc::new(TracingTransportMetrics));
//! transport_metrics().on_frame("tcp", "request");
//! ```

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::Level;

/// Metrics sink used by transports and framers to emit observability events.
///
/// `transport`, `kind` and `stage` are low-cardinality identifiers such as
/// "udp", "request" or "framing"; never pass peer data through them.
pub trait TransportMetrics: Send + Sync + 'static {
    /// Raw bytes handed to a framer or datagram decoder.
    fn on_bytes_received(&self, transport: &str, len: usize);
    /// A complete SIP message left the framer ("request" or "response").
    fn on_frame(&self, transport: &str, kind: &str);
    /// A CRLFCRLF keep-alive ping was recognised.
    fn on_keepalive(&self, transport: &str);
    /// A STUN frame was split off the SIP stream.
    fn on_stun(&self, transport: &str);
    /// A framed message failed the sanity check and was discarded.
    fn on_dropped(&self, transport: &str, reason: &str);
    fn on_packet_sent(&self, transport: &str);
    fn on_error(&self, transport: &str, stage: &str);
    fn on_accept(&self, transport: &str);
    fn on_connect(&self, transport: &str);
    fn on_close(&self, transport: &str);
}

#[derive(Debug, Default)]
struct NoopTransportMetrics;

impl TransportMetrics for NoopTransportMetrics {
    fn on_bytes_received(&self, _transport: &str, _len: usize) {}
    fn on_frame(&self, _transport: &str, _kind: &str) {}
    fn on_keepalive(&self, _transport: &str) {}
    fn on_stun(&self, _transport: &str) {}
    fn on_dropped(&self, _transport: &str, _reason: &str) {}
    fn on_packet_sent(&self, _transport: &str) {}
    fn on_error(&self, _transport: &str, _stage: &str) {}
    fn on_accept(&self, _transport: &str) {}
    fn on_connect(&self, _transport: &str) {}
    fn on_close(&self, _transport: &str) {}
}

static TRANSPORT_METRICS: OnceCell<Arc<dyn TransportMetrics>> = OnceCell::new();
static NOOP_TRANSPORT_METRICS: NoopTransportMetrics = NoopTransportMetrics;

/// Installs the global transport metrics implementation.
///
/// Returns `true` if the sink was installed, `false` if one was already set.
pub fn set_transport_metrics(metrics: Arc<dyn TransportMetrics>) -> bool {
    TRANSPORT_METRICS.set(metrics).is_ok()
}

/// Returns the currently configured transport metrics sink.
pub fn transport_metrics() -> &'static dyn TransportMetrics {
    TRANSPORT_METRICS
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP_TRANSPORT_METRICS)
}

/// Creates a tracing span for a transport operation.
pub fn span_with_transport(name: &'static str, transport: &str) -> tracing::Span {
    tracing::span!(Level::INFO, "transport", op = name, transport = transport)
}

/// Creates a tracing span scoped to one connection.
pub fn span_with_peer(name: &'static str, transport: &str, peer: &str) -> tracing::Span {
    tracing::span!(
        Level::INFO,
        "connection",
        op = name,
        transport = transport,
        peer = peer
    )
}

/// Metrics implementation that logs via `tracing`.
#[derive(Debug, Default)]
pub struct TracingTransportMetrics;

impl TransportMetrics for TracingTransportMetrics {
    fn on_bytes_received(&self, transport: &str, len: usize) {
        tracing::trace!(transport, len, "bytes received");
    }

    fn on_frame(&self, transport: &str, kind: &str) {
        tracing::debug!(transport, kind, "message framed");
    }

    fn on_keepalive(&self, transport: &str) {
        tracing::trace!(transport, "keep-alive");
    }

    fn on_stun(&self, transport: &str) {
        tracing::debug!(transport, "stun frame");
    }

    fn on_dropped(&self, transport: &str, reason: &str) {
        tracing::debug!(transport, reason, "message dropped");
    }

    fn on_packet_sent(&self, transport: &str) {
        tracing::debug!(transport, "packet sent");
    }

    fn on_error(&self, transport: &str, stage: &str) {
        tracing::warn!(transport, stage, "transport error");
    }

    fn on_accept(&self, transport: &str) {
        tracing::debug!(transport, "accept");
    }

    fn on_connect(&self, transport: &str) {
        tracing::debug!(transport, "connect");
    }

    fn on_close(&self, transport: &str) {
        tracing::debug!(transport, "close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_is_used_until_installed() {
        // Calling through the default sink must not panic.
        let sink = transport_metrics();
        sink.on_frame("udp", "request");
        sink.on_error("tcp", "framing");
    }

    #[test]
    fn spans_carry_transport_fields() {
        let span = span_with_peer("session", "tcp", "127.0.0.1:5060");
        let _entered = span.enter();
        let other = span_with_transport("udp_packet", "udp");
        drop(other);
    }
}
