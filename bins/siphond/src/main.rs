// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

mod config;
mod daemon;
mod responder;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sip_observe::{set_transport_metrics, TracingTransportMetrics};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::daemon::Daemon;

/// SIP daemon: frames UDP/TCP traffic, runs the RFC 3261 transaction layer
/// and answers OPTIONS.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bind address (UDP)
    #[arg(long)]
    udp_bind: Option<String>,
    /// Bind address (TCP)
    #[arg(long)]
    tcp_bind: Option<String>,
    /// Disable the TCP listener
    #[arg(long)]
    no_tcp: bool,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(bind) = self.udp_bind {
            config.udp_bind = bind;
        }
        if let Some(bind) = self.tcp_bind {
            config.tcp_bind = Some(bind);
        }
        if self.no_tcp {
            config.tcp_bind = None;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    set_transport_metrics(Arc::new(TracingTransportMetrics));

    let config = args.into_config()?;
    let daemon = Daemon::bind(config).await?;
    info!(udp = %daemon.udp_addr()?, tcp = ?daemon.tcp_addr()?, "sockets bound");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received, shutting down"),
                Err(err) => warn!(%err, "cannot listen for ctrl-c"),
            }
            shutdown.cancel();
        }
    });

    daemon.run(shutdown).await
}
