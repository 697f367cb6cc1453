// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use sip_core::{NonSipFrame, SipMessage, WireMessage};
use sip_testkit::{as_bytes, build_options, chunked};
use sip_transport::{
    run_tcp, run_udp, ConnectionRegistry, Endpoint, FramerLimits, InboundMessage,
    OutboundMessage, Resolver, StreamContext, Target, TransportKind, TransportSelector,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

fn stream_context() -> (StreamContext, UnboundedReceiver<InboundMessage>) {
    let (inbound, rx) = unbounded_channel();
    let ctx = StreamContext {
        inbound,
        registry: Arc::new(ConnectionRegistry::new()),
        limits: FramerLimits::default(),
        shutdown: CancellationToken::new(),
    };
    (ctx, rx)
}

async fn start_tcp() -> (SocketAddr, StreamContext, UnboundedReceiver<InboundMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ctx, rx) = stream_context();
    tokio::spawn(run_tcp(listener, ctx.clone()));
    (addr, ctx, rx)
}

struct FixedResolver(Vec<SocketAddr>);

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve(&self, _host: &str, _port: u16, _t: TransportKind) -> Result<Vec<SocketAddr>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn tcp_session_frames_message_split_across_writes() {
    let (addr, _ctx, mut rx) = start_tcp().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let bytes = as_bytes(&build_options("sip:bob@example.com", "z9hG4bKtcp1"));

    for chunk in chunked(&bytes, 17) {
        client.write_all(&chunk).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let inbound = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.endpoint.transport, TransportKind::Tcp);
    assert!(inbound.endpoint.connection.is_some());
    assert!(matches!(inbound.message, WireMessage::Sip(SipMessage::Request(_))));
}

#[tokio::test]
async fn tcp_keepalive_surfaces_as_non_sip_frame() {
    let (addr, _ctx, mut rx) = start_tcp().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"\r\n\r\n").await.unwrap();

    let inbound = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.message, WireMessage::NonSip(NonSipFrame::KeepAlive));
}

#[tokio::test]
async fn tcp_framing_error_closes_connection() {
    let (addr, ctx, mut rx) = start_tcp().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"OPTIONS sip:a@b SIP/2.0\r\nnot a header line\r\n\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)), "server should close the socket");
    assert!(rx.try_recv().is_err());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn udp_listener_decodes_datagrams() {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let (tx, mut rx) = unbounded_channel();
    let shutdown = CancellationToken::new();
    tokio::spawn(run_udp(socket, tx, FramerLimits::default(), shutdown.clone()));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"garbage that is not sip", addr).await.unwrap();
    client
        .send_to(&as_bytes(&build_options("sip:bob@example.com", "z9hG4bKudp1")), addr)
        .await
        .unwrap();

    let inbound = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.endpoint.transport, TransportKind::Udp);
    assert_eq!(inbound.endpoint.peer, client.local_addr().unwrap());
    assert!(matches!(inbound.message, WireMessage::Sip(_)));
    shutdown.cancel();
}

#[tokio::test]
async fn selector_replies_over_inbound_connection() {
    let (addr, ctx, mut rx) = start_tcp().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&as_bytes(&build_options("sip:bob@example.com", "z9hG4bKsel1")))
        .await
        .unwrap();
    let inbound = timeout(WAIT, rx.recv()).await.unwrap().unwrap();

    let selector = TransportSelector::new(None, ctx.clone(), Arc::new(FixedResolver(vec![])));
    selector
        .send(&OutboundMessage::raw(inbound.endpoint, Bytes::from_static(b"\r\n")))
        .await
        .unwrap();

    let mut buf = [0u8; 2];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"\r\n");
}

#[tokio::test]
async fn selector_resolves_host_and_sends_udp() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let (ctx, _rx) = stream_context();
    let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let selector = TransportSelector::new(
        Some(udp),
        ctx,
        Arc::new(FixedResolver(vec![server_addr])),
    );

    let request = build_options("sip:bob@example.com", "z9hG4bKsel2");
    let target = Target::Host {
        host: "proxy.example.com".into(),
        port: 5060,
        transport: TransportKind::Udp,
    };
    selector
        .send(&OutboundMessage::message(target, request.into()))
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(WAIT, server.recv_from(&mut buf)).await.unwrap().unwrap();
    assert!(buf[..n].starts_with(b"OPTIONS sip:bob@example.com SIP/2.0\r\n"));
}

#[tokio::test]
async fn selector_reports_failures() {
    let (ctx, _rx) = stream_context();
    let selector = TransportSelector::new(None, ctx, Arc::new(FixedResolver(vec![])));
    let (out_tx, out_rx) = unbounded_channel();
    let (fail_tx, mut fail_rx) = unbounded_channel();
    tokio::spawn(selector.run(out_rx, fail_tx));

    let endpoint = Endpoint::new(TransportKind::Tls, "127.0.0.1:5061".parse().unwrap());
    let message = OutboundMessage::raw(endpoint, Bytes::from_static(b"x"));
    out_tx.send(message.clone()).unwrap();

    let failure = timeout(WAIT, fail_rx.recv()).await.unwrap().unwrap();
    assert_eq!(failure.message, message);
    assert!(failure.reason.contains("tls"));
}

#[tokio::test]
async fn selector_reports_refused_stream_connect() {
    let (ctx, _rx) = stream_context();
    let selector = TransportSelector::new(None, ctx, Arc::new(FixedResolver(vec![])))
        .with_connect_timeout(Duration::from_millis(500));
    let (out_tx, out_rx) = unbounded_channel();
    let (fail_tx, mut fail_rx) = unbounded_channel();
    tokio::spawn(selector.run(out_rx, fail_tx));

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = closed.local_addr().unwrap();
    drop(closed);

    let message = OutboundMessage::message(
        Endpoint::new(TransportKind::Tcp, peer),
        SipMessage::Request(build_options("sip:bob@example.com", "z9hG4bKrefused")),
    );
    out_tx.send(message.clone()).unwrap();

    let failure = timeout(WAIT, fail_rx.recv()).await.unwrap().unwrap();
    assert_eq!(failure.message, message);
}

struct SlowResolver(Duration);

#[async_trait]
impl Resolver for SlowResolver {
    async fn resolve(&self, host: &str, _port: u16, _t: TransportKind) -> Result<Vec<SocketAddr>> {
        tokio::time::sleep(self.0).await;
        anyhow::bail!("{host} did not resolve")
    }
}

#[tokio::test]
async fn slow_resolve_does_not_hold_up_other_targets() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (ctx, _rx) = stream_context();
    let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let selector = TransportSelector::new(
        Some(udp),
        ctx,
        Arc::new(SlowResolver(Duration::from_secs(3))),
    );
    let (out_tx, out_rx) = unbounded_channel();
    let (fail_tx, mut fail_rx) = unbounded_channel();
    tokio::spawn(selector.run(out_rx, fail_tx));

    let stuck = OutboundMessage::raw(
        Target::Host {
            host: "unreachable.example.com".into(),
            port: 5060,
            transport: TransportKind::Tcp,
        },
        Bytes::from_static(b"stuck"),
    );
    out_tx.send(stuck.clone()).unwrap();
    let started = tokio::time::Instant::now();
    out_tx
        .send(OutboundMessage::raw(
            Endpoint::new(TransportKind::Udp, server.local_addr().unwrap()),
            Bytes::from_static(b"fast"),
        ))
        .unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = timeout(WAIT, server.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"fast");
    assert!(started.elapsed() < Duration::from_millis(500));

    let failure = timeout(Duration::from_secs(5), fail_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.message, stuck);
}

#[tokio::test]
async fn messages_for_one_connection_keep_queue_order() {
    let (addr, ctx, mut rx) = start_tcp().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&as_bytes(&build_options("sip:bob@example.com", "z9hG4bKord1")))
        .await
        .unwrap();
    let inbound = timeout(WAIT, rx.recv()).await.unwrap().unwrap();

    let selector = TransportSelector::new(None, ctx, Arc::new(FixedResolver(vec![])));
    let (out_tx, out_rx) = unbounded_channel();
    let (fail_tx, _fail_rx) = unbounded_channel();
    tokio::spawn(selector.run(out_rx, fail_tx));
    for part in [&b"one,"[..], b"two,", b"three"] {
        out_tx
            .send(OutboundMessage::raw(
                inbound.endpoint.clone(),
                Bytes::copy_from_slice(part),
            ))
            .unwrap();
    }

    let mut buf = [0u8; 13];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"one,two,three");
}
