// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outbound transport selection.
//!
//! The transaction layer never touches sockets: it queues
//! [`OutboundMessage`]s and the selector picks the socket or connection,
//! resolving host targets first. Sends that fail are reported back as
//! [`SendFailure`] so the owning transaction can be torn down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    connect_tcp, send_stream, send_udp, Endpoint, OutboundMessage, StreamContext, Target,
    TransportKind,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

fn is_inline(target: &Target) -> bool {
    matches!(target, Target::Endpoint(endpoint) if endpoint.transport == TransportKind::Udp)
}

/// Resolves a host target into candidate socket addresses, in preference order.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        host: &str,
        port: u16,
        transport: TransportKind,
    ) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system's address lookup (A/AAAA only).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(
        &self,
        host: &str,
        port: u16,
        _transport: TransportKind,
    ) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            bail!("{host} did not resolve to any address");
        }
        Ok(addrs)
    }
}

/// A message the selector could not put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub message: OutboundMessage,
    pub reason: SmolStr,
}

/// Routes outbound messages to the UDP socket or a stream connection.
#[derive(Clone)]
pub struct TransportSelector {
    udp: Option<Arc<UdpSocket>>,
    streams: StreamContext,
    resolver: Arc<dyn Resolver>,
    connect_timeout: Duration,
}

impl TransportSelector {
    pub fn new(
        udp: Option<Arc<UdpSocket>>,
        streams: StreamContext,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            udp,
            streams,
            resolver,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Drains the outbound queue until it closes or shutdown is signalled.
    ///
    /// UDP endpoints are written inline. Every other target gets its own
    /// worker task, so a slow resolve, connect or stream writer only holds
    /// up messages for that target, which stay in queue order.
    pub async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
        failures: mpsc::UnboundedSender<SendFailure>,
    ) -> Result<()> {
        let mut workers: HashMap<Target, mpsc::UnboundedSender<OutboundMessage>> = HashMap::new();
        loop {
            let next = tokio::select! {
                _ = self.streams.shutdown.cancelled() => break,
                next = outbound.recv() => next,
            };
            let Some(message) = next else {
                break;
            };
            if is_inline(&message.target) {
                self.deliver(message, &failures).await;
                continue;
            }

            let message = match workers.get(&message.target) {
                Some(worker) => match worker.send(message) {
                    Ok(()) => continue,
                    // Worker went idle and closed; start a fresh one.
                    Err(mpsc::error::SendError(message)) => message,
                },
                None => message,
            };
            workers.retain(|_, worker| !worker.is_closed());
            let (worker_tx, worker_rx) = mpsc::unbounded_channel();
            let target = message.target.clone();
            if worker_tx.send(message).is_ok() {
                debug!(?target, "outbound worker started");
                tokio::spawn(self.clone().drain_target(worker_rx, failures.clone()));
                workers.insert(target, worker_tx);
            }
        }
        Ok(())
    }

    /// Sends queued messages for one target until idle, closed or shutdown.
    async fn drain_target(
        self,
        mut queue: mpsc::UnboundedReceiver<OutboundMessage>,
        failures: mpsc::UnboundedSender<SendFailure>,
    ) {
        loop {
            let next = tokio::select! {
                _ = self.streams.shutdown.cancelled() => return,
                next = tokio::time::timeout(WORKER_IDLE_TIMEOUT, queue.recv()) => next,
            };
            match next {
                Ok(Some(message)) => self.deliver(message, &failures).await,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        queue.close();
        while let Ok(message) = queue.try_recv() {
            self.deliver(message, &failures).await;
        }
    }

    async fn deliver(&self, message: OutboundMessage, failures: &mpsc::UnboundedSender<SendFailure>) {
        if let Err(e) = self.send(&message).await {
            warn!(error = %e, "outbound send failed");
            let failure = SendFailure {
                message,
                reason: SmolStr::new(e.to_string()),
            };
            if failures.send(failure).is_err() {
                debug!("failure receiver dropped");
            }
        }
    }

    /// Encodes and sends one message, trying each resolved address in turn.
    pub async fn send(&self, outbound: &OutboundMessage) -> Result<()> {
        let payload = outbound.payload.encode();
        match &outbound.target {
            Target::Endpoint(endpoint) => self.send_to(endpoint, payload).await,
            Target::Host {
                host,
                port,
                transport,
            } => {
                let candidates = self.resolver.resolve(host, *port, *transport).await?;
                let mut last_error = anyhow!("no addresses for {host}:{port}");
                for peer in candidates {
                    match self
                        .send_to(&Endpoint::new(*transport, peer), payload.clone())
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            debug!(%peer, error = %e, "candidate failed");
                            last_error = e;
                        }
                    }
                }
                Err(last_error)
            }
        }
    }

    async fn send_to(&self, endpoint: &Endpoint, payload: Bytes) -> Result<()> {
        if endpoint.transport == TransportKind::Udp {
            let socket = self
                .udp
                .as_ref()
                .ok_or_else(|| anyhow!("no udp socket bound"))?;
            return send_udp(socket, &endpoint.peer, &payload).await;
        }

        let registry = &self.streams.registry;
        let existing = endpoint
            .connection
            .and_then(|id| registry.get(id))
            .or_else(|| registry.find_by_peer(endpoint.transport, endpoint.peer));
        let handle = match existing {
            Some(handle) => handle,
            None if endpoint.transport == TransportKind::Tcp => {
                tokio::time::timeout(
                    self.connect_timeout,
                    connect_tcp(endpoint.peer, &self.streams),
                )
                .await
                .map_err(|_| anyhow!("connect to {} timed out", endpoint.peer))??
            }
            None => bail!(
                "no {} connection to {}",
                endpoint.transport.as_str(),
                endpoint.peer
            ),
        };
        send_stream(&handle, payload).await
    }
}
