// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport layer: listeners, per-connection framing and outbound sends.
//!
//! Every receive path ends in the same place: an [`InboundMessage`] on an
//! unbounded queue consumed by the transaction layer. Datagrams are decoded
//! whole by [`decode_datagram`]; stream connections run a [`StreamFramer`]
//! each. Outbound traffic flows the other way through [`TransportSelector`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use sip_core::SipMessage;
use sip_observe::{span_with_peer, span_with_transport, transport_metrics};
use smol_str::SmolStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub mod connections;
pub mod framer;
pub mod selector;

pub use connections::{ConnectionHandle, ConnectionRegistry};
pub use framer::{decode_datagram, FramerLimits, FramingError, ParsePhase, StreamFramer};
pub use selector::{Resolver, SendFailure, SystemResolver, TransportSelector};

const MAX_DATAGRAM: usize = 65_535;
const WRITER_QUEUE: usize = 32;

/// Indicates which transport carried an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Returns the lowercase transport string for metrics and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        }
    }

    /// Returns the Via header transport parameter value.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::Udp.via_transport(), "UDP");
    /// assert_eq!(TransportKind::Tls.via_transport(), "TLS");
    /// ```
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Parses a transport string (case-insensitive) into a TransportKind.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::parse("tcp"), Some(TransportKind::Tcp));
    /// assert_eq!(TransportKind::parse("sctp"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            _ => None,
        }
    }

    /// Reliable transports deliver in order without loss; the transaction
    /// layer skips retransmission and linger timers on them.
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }
}

/// Identifies one stream connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Where a message came from, or where it should go.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    /// Stream connection the message arrived on, if any.
    pub connection: Option<ConnectionId>,
}

impl Endpoint {
    pub fn new(transport: TransportKind, peer: SocketAddr) -> Self {
        Self {
            transport,
            peer,
            connection: None,
        }
    }

    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }
}

/// Destination of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// A known peer, optionally pinned to an existing connection.
    Endpoint(Endpoint),
    /// A host still to be resolved.
    Host {
        host: SmolStr,
        port: u16,
        transport: TransportKind,
    },
}

impl Target {
    pub fn transport(&self) -> TransportKind {
        match self {
            Target::Endpoint(endpoint) => endpoint.transport,
            Target::Host { transport, .. } => *transport,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.transport().is_reliable()
    }
}

impl From<Endpoint> for Target {
    fn from(endpoint: Endpoint) -> Self {
        Target::Endpoint(endpoint)
    }
}

/// A framed unit handed to the transaction layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub endpoint: Endpoint,
    pub message: sip_core::WireMessage,
}

/// Bytes to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Message(SipMessage),
    /// Pre-encoded bytes such as a keep-alive pong or a STUN response.
    Raw(Bytes),
}

impl OutboundPayload {
    pub fn encode(&self) -> Bytes {
        match self {
            OutboundPayload::Message(message) => sip_parse::serialize_message(message),
            OutboundPayload::Raw(bytes) => bytes.clone(),
        }
    }
}

/// A send request consumed by [`TransportSelector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub target: Target,
    pub payload: OutboundPayload,
}

impl OutboundMessage {
    pub fn message(target: impl Into<Target>, message: SipMessage) -> Self {
        Self {
            target: target.into(),
            payload: OutboundPayload::Message(message),
        }
    }

    pub fn raw(target: impl Into<Target>, bytes: Bytes) -> Self {
        Self {
            target: target.into(),
            payload: OutboundPayload::Raw(bytes),
        }
    }
}

/// Shared state every stream session needs.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub inbound: mpsc::UnboundedSender<InboundMessage>,
    pub registry: Arc<ConnectionRegistry>,
    pub limits: FramerLimits,
    pub shutdown: CancellationToken,
}

/// Runs a UDP receive loop, decoding each datagram onto the inbound queue.
///
/// Undecodable datagrams are logged and dropped; the socket stays open.
pub async fn run_udp(
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    limits: FramerLimits,
    shutdown: CancellationToken,
) -> Result<()> {
    let bind = socket.local_addr()?;
    info!(%bind, "listening (udp)");
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, peer) = match received {
            Ok(pair) => pair,
            Err(e) => {
                error!(%e, "udp recv_from error");
                transport_metrics().on_error(TransportKind::Udp.as_str(), "recv");
                continue;
            }
        };
        let span = span_with_transport("udp_packet", TransportKind::Udp.as_str());
        let _entered = span.enter();
        if n == buf.len() {
            transport_metrics().on_error(TransportKind::Udp.as_str(), "truncate");
            error!(%peer, max = n, "udp datagram likely truncated (buffer full); consider TCP");
        }
        transport_metrics().on_bytes_received(TransportKind::Udp.as_str(), n);
        let datagram = Bytes::copy_from_slice(&buf[..n]);
        let message = match decode_datagram(&datagram, &limits) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                debug!(%peer, error = %e, "dropping undecodable datagram");
                transport_metrics().on_dropped(TransportKind::Udp.as_str(), "framing");
                continue;
            }
        };
        let inbound_message = InboundMessage {
            endpoint: Endpoint::new(TransportKind::Udp, peer),
            message,
        };
        if inbound.send(inbound_message).is_err() {
            error!("receiver dropped; shutting down udp loop");
            transport_metrics().on_error(TransportKind::Udp.as_str(), "dispatch");
            break;
        }
    }
    Ok(())
}

/// Sends a UDP datagram using an existing bound socket.
pub async fn send_udp(socket: &UdpSocket, to: &SocketAddr, data: &[u8]) -> Result<()> {
    socket.send_to(data, to).await?;
    transport_metrics().on_packet_sent(TransportKind::Udp.as_str());
    Ok(())
}

/// Accepts TCP connections, running a framing session for each.
pub async fn run_tcp(listener: TcpListener, ctx: StreamContext) -> Result<()> {
    let bind = listener.local_addr()?;
    info!(%bind, "listening (tcp)");

    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!(%e, "tcp accept error");
                transport_metrics().on_error(TransportKind::Tcp.as_str(), "accept");
                continue;
            }
        };
        transport_metrics().on_accept(TransportKind::Tcp.as_str());
        spawn_stream_session(stream, peer, TransportKind::Tcp, &ctx);
    }
    Ok(())
}

/// Opens an outbound TCP connection and registers it like an accepted one,
/// so responses arriving on it are framed onto the inbound queue.
pub async fn connect_tcp(peer: SocketAddr, ctx: &StreamContext) -> Result<ConnectionHandle> {
    let stream = TcpStream::connect(peer).await?;
    transport_metrics().on_connect(TransportKind::Tcp.as_str());
    Ok(spawn_stream_session(stream, peer, TransportKind::Tcp, ctx))
}

/// Sends buffered bytes via a per-connection writer channel.
pub async fn send_stream(handle: &ConnectionHandle, data: Bytes) -> Result<()> {
    handle
        .writer
        .send(data)
        .await
        .map_err(|_| anyhow!("connection writer dropped"))?;
    Ok(())
}

/// Registers a connected stream and spawns its reader and writer tasks.
///
/// The reader feeds a [`StreamFramer`]; a framing error, EOF, eviction from
/// the registry or shutdown closes the connection.
pub fn spawn_stream_session<S>(
    stream: S,
    peer: SocketAddr,
    transport: TransportKind,
    ctx: &StreamContext,
) -> ConnectionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(WRITER_QUEUE);
    let close = ctx.shutdown.child_token();
    let handle = ctx
        .registry
        .register(transport, peer, writer_tx, close.clone());
    let endpoint = Endpoint::new(transport, peer).with_connection(handle.id);
    let span = span_with_peer("stream_session", transport.as_str(), &peer.to_string());
    tokio::spawn(
        run_stream_session(stream, endpoint, writer_rx, close, ctx.clone()).instrument(span),
    );
    handle
}

async fn run_stream_session<S>(
    stream: S,
    endpoint: Endpoint,
    mut writer_rx: mpsc::Receiver<Bytes>,
    close: CancellationToken,
    ctx: StreamContext,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let transport = endpoint.transport;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let writer_close = close.clone();
    let writer_handle = tokio::spawn(async move {
        while let Some(buf) = writer_rx.recv().await {
            if let Err(e) = writer.write_all(&buf).await {
                warn!(%e, "stream write error");
                transport_metrics().on_error(transport.as_str(), "write");
                writer_close.cancel();
                break;
            }
            transport_metrics().on_packet_sent(transport.as_str());
        }
        let _ = writer.shutdown().await;
    });

    let mut framer = StreamFramer::new(endpoint.clone(), ctx.limits, ctx.inbound.clone());
    loop {
        let read = tokio::select! {
            _ = close.cancelled() => break,
            read = reader.read_buf(framer.write_target()) => read,
        };
        match read {
            Ok(0) => {
                debug!("connection closed by peer");
                break;
            }
            Ok(n) => {
                if let Err(e) = framer.commit_written(n) {
                    warn!(error = %e, "framing error, closing connection");
                    transport_metrics().on_error(transport.as_str(), "framing");
                    break;
                }
            }
            Err(e) => {
                warn!(%e, "stream read error");
                transport_metrics().on_error(transport.as_str(), "read");
                break;
            }
        }
    }

    if let Some(id) = endpoint.connection {
        ctx.registry.unregister(id);
    }
    close.cancel();
    writer_handle.abort();
    transport_metrics().on_close(transport.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parse_case_insensitive() {
        assert_eq!(TransportKind::parse("udp"), Some(TransportKind::Udp));
        assert_eq!(TransportKind::parse("  TCP  "), Some(TransportKind::Tcp));
        assert_eq!(TransportKind::parse("Tls"), Some(TransportKind::Tls));
        assert_eq!(TransportKind::parse("ws"), None);
        assert_eq!(TransportKind::parse(""), None);
    }

    #[test]
    fn transport_kind_round_trip() {
        for transport in [TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls] {
            let parsed = TransportKind::parse(transport.via_transport()).unwrap();
            assert_eq!(parsed, transport);
        }
    }

    #[test]
    fn only_streams_are_reliable() {
        assert!(!TransportKind::Udp.is_reliable());
        assert!(TransportKind::Tcp.is_reliable());
        assert!(TransportKind::Tls.is_reliable());
    }

    #[test]
    fn target_reports_transport() {
        let endpoint = Endpoint::new(TransportKind::Tcp, "10.0.0.1:5060".parse().unwrap());
        assert!(Target::from(endpoint).is_reliable());
        let host = Target::Host {
            host: "example.com".into(),
            port: 5060,
            transport: TransportKind::Udp,
        };
        assert_eq!(host.transport(), TransportKind::Udp);
        assert!(!host.is_reliable());
    }

    #[test]
    fn raw_payload_encodes_verbatim() {
        let payload = OutboundPayload::Raw(Bytes::from_static(b"\r\n"));
        assert_eq!(payload.encode().as_ref(), b"\r\n");
    }
}
