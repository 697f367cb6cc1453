// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wires the listeners, the transport selector, the transaction engine and
//! the responder into one set of tasks sharing a shutdown token.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sip_transaction::{TokioTimerService, TransactionEngine};
use sip_transport::{
    run_tcp, run_udp, ConnectionRegistry, StreamContext, SystemResolver, TransportSelector,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::DaemonConfig;
use crate::responder::{self, Responder};

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Bound sockets ready to serve.
pub struct Daemon {
    config: DaemonConfig,
    udp: Arc<UdpSocket>,
    tcp: Option<TcpListener>,
}

impl Daemon {
    pub async fn bind(config: DaemonConfig) -> Result<Self> {
        let udp = UdpSocket::bind(&config.udp_bind)
            .await
            .with_context(|| format!("binding udp {}", config.udp_bind))?;
        let tcp = match &config.tcp_bind {
            Some(bind) => Some(
                TcpListener::bind(bind)
                    .await
                    .with_context(|| format!("binding tcp {}", bind))?,
            ),
            None => None,
        };
        Ok(Self {
            config,
            udp: Arc::new(udp),
            tcp,
        })
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    pub fn tcp_addr(&self) -> Result<Option<SocketAddr>> {
        self.tcp
            .as_ref()
            .map(|listener| listener.local_addr())
            .transpose()
            .map_err(Into::into)
    }

    /// Serves until `shutdown` is cancelled, then waits for every task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Daemon { config, udp, tcp } = self;
        let limits = config.framer_limits();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (tu_tx, tu_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(ConnectionRegistry::with_limits(
            config.max_connections,
            config.idle_timeout(),
        ));
        let streams = StreamContext {
            inbound: inbound_tx.clone(),
            registry: Arc::clone(&registry),
            limits,
            shutdown: shutdown.clone(),
        };

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn({
            let socket = Arc::clone(&udp);
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = run_udp(socket, inbound_tx, limits, shutdown).await {
                    error!(%e, "udp listener exited");
                }
            }
        }));

        if let Some(listener) = tcp {
            let ctx = streams.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_tcp(listener, ctx).await {
                    error!(%e, "tcp listener exited");
                }
            }));
        }

        let selector = TransportSelector::new(Some(udp), streams, Arc::new(SystemResolver));
        tasks.push(tokio::spawn(async move {
            if let Err(e) = selector.run(outbound_rx, failure_tx).await {
                error!(%e, "transport selector exited");
            }
        }));

        let engine = TransactionEngine::new(
            TokioTimerService::new(timer_tx),
            outbound_tx,
            tu_tx,
            config.engine_config(),
        );
        tasks.push(tokio::spawn(engine.run(
            inbound_rx,
            command_rx,
            timer_rx,
            failure_rx,
            shutdown.clone(),
        )));

        tasks.push(tokio::spawn(responder::run(
            Responder::new(config.user_agent.as_str()),
            tu_rx,
            command_tx,
            shutdown.clone(),
        )));

        tasks.push(tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let mut ticker = time::interval(IDLE_SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let closed = registry.cleanup_idle();
                            if closed > 0 {
                                debug!(closed, "idle connections closed");
                            }
                        }
                    }
                }
            }
        }));

        info!(udp = %config.udp_bind, tcp = ?config.tcp_bind, "siphond started");
        shutdown.cancelled().await;
        for task in tasks {
            if let Err(e) = task.await {
                error!(%e, "task panicked");
            }
        }
        info!("siphond stopped");
        Ok(())
    }
}
