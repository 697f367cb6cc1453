// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ConnectionId, TransportKind};

/// Maximum number of open stream connections (prevents file descriptor exhaustion).
const MAX_CONNECTIONS: usize = 1000;

/// Idle timeout for stream connections (close after 5 minutes of inactivity).
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Writer half of a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub writer: Sender<Bytes>,
}

#[derive(Debug)]
struct ConnectionEntry {
    handle: ConnectionHandle,
    close: CancellationToken,
    last_used: Instant,
}

impl ConnectionEntry {
    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.last_used.elapsed() > timeout
    }
}

/// Live stream connections, addressable by id or by peer.
///
/// Accepted and outbound connections both register here so responses can be
/// written back over the connection their request arrived on.
#[derive(Debug)]
pub struct ConnectionRegistry {
    by_id: DashMap<ConnectionId, ConnectionEntry>,
    by_peer: DashMap<(TransportKind, SocketAddr), ConnectionId>,
    next_id: AtomicU64,
    max_size: usize,
    idle_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limits(MAX_CONNECTIONS, IDLE_TIMEOUT)
    }

    /// Creates a registry with custom limits.
    pub fn with_limits(max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            by_id: DashMap::new(),
            by_peer: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_size,
            idle_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Registers a connection and returns its handle.
    ///
    /// `close` is cancelled when the registry evicts the connection; the
    /// session owning the socket is expected to stop on it.
    pub fn register(
        &self,
        transport: TransportKind,
        peer: SocketAddr,
        writer: Sender<Bytes>,
        close: CancellationToken,
    ) -> ConnectionHandle {
        if self.by_id.len() >= self.max_size {
            self.cleanup_idle();
            if self.by_id.len() >= self.max_size {
                self.evict_lru();
            }
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = ConnectionHandle {
            id,
            transport,
            peer,
            writer,
        };
        self.by_id.insert(
            id,
            ConnectionEntry {
                handle: handle.clone(),
                close,
                last_used: Instant::now(),
            },
        );
        self.by_peer.insert((transport, peer), id);
        debug!(%peer, connection = id.0, "connection registered");
        handle
    }

    /// Forgets a connection. Called by the session when its socket closes.
    pub fn unregister(&self, id: ConnectionId) {
        if let Some((_, entry)) = self.by_id.remove(&id) {
            let key = (entry.handle.transport, entry.handle.peer);
            self.by_peer.remove_if(&key, |_, current| *current == id);
            debug!(peer = %entry.handle.peer, connection = id.0, "connection unregistered");
        }
    }

    /// Looks up a connection by id and marks it used.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let mut entry = self.by_id.get_mut(&id)?;
        entry.touch();
        Some(entry.handle.clone())
    }

    /// Looks up the most recent connection to `peer` over `transport`.
    pub fn find_by_peer(&self, transport: TransportKind, peer: SocketAddr) -> Option<ConnectionHandle> {
        let id = *self.by_peer.get(&(transport, peer))?;
        self.get(id)
    }

    /// Closes connections idle for longer than the idle timeout.
    pub fn cleanup_idle(&self) -> usize {
        let idle: Vec<ConnectionId> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().is_idle(self.idle_timeout))
            .map(|entry| *entry.key())
            .collect();
        for id in &idle {
            self.close(*id);
        }
        idle.len()
    }

    /// Closes roughly 10% of capacity, oldest first.
    fn evict_lru(&self) {
        let evict_count = (self.max_size / 10).max(1);
        let mut entries: Vec<_> = self
            .by_id
            .iter()
            .map(|entry| (*entry.key(), entry.value().last_used))
            .collect();
        entries.sort_by_key(|(_, last_used)| *last_used);
        for (id, _) in entries.into_iter().take(evict_count) {
            debug!(connection = id.0, "evicting LRU connection");
            self.close(id);
        }
    }

    fn close(&self, id: ConnectionId) {
        if let Some((_, entry)) = self.by_id.remove(&id) {
            entry.close.cancel();
            let key = (entry.handle.transport, entry.handle.peer);
            self.by_peer.remove_if(&key, |_, current| *current == id);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
