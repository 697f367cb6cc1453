//! Transaction metrics.
//!
//! Counters are kept per machine kind (client/server, INVITE/non-INVITE)
//! plus global tallies of timer firings and retransmissions per transport.
//! [`TransactionMetrics`] is `Clone`; every clone shares one
//! `parking_lot::RwLock`.
//!
//! ```rust
//! use sip_transaction::metrics::{TransactionKind, TransactionMetrics, TransactionOutcome};
//! use sip_transport::TransportKind;
//! use std::time::Duration;
//!
//! let metrics = TransactionMetrics::new();
//! metrics.on_started(TransactionKind::ServerInvite);
//! metrics.on_finished(
//!     TransactionKind::ServerInvite,
//!     TransactionOutcome::Completed,
//!     Duration::from_millis(250),
//! );
//! metrics.on_retransmission(TransportKind::Udp);
//!
//! assert_eq!(metrics.total_transactions(), 1);
//! assert_eq!(metrics.in_flight(TransactionKind::ServerInvite), 0);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sip_transport::TransportKind;

use crate::{TransactionId, TransactionTimer};

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOutcome {
    /// Final response exchanged and absorption window over
    Completed,
    /// Timer B, F or H expired
    Timeout,
    /// The transport could not deliver a message
    TransportError,
}

/// Which of the four machines a transaction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionKind {
    pub fn of(id: &TransactionId) -> Self {
        match (id.is_server, id.method.is_invite()) {
            (false, true) => TransactionKind::ClientInvite,
            (false, false) => TransactionKind::ClientNonInvite,
            (true, true) => TransactionKind::ServerInvite,
            (true, false) => TransactionKind::ServerNonInvite,
        }
    }

    pub fn is_server(self) -> bool {
        matches!(
            self,
            TransactionKind::ServerInvite | TransactionKind::ServerNonInvite
        )
    }
}

/// Counters for one machine kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindStats {
    pub started: u64,
    pub finished: u64,
    /// Refused because the table limit was reached
    pub rejected: u64,
    pub outcomes: HashMap<TransactionOutcome, u64>,
    pub total_lifetime: Duration,
    pub longest_lifetime: Duration,
}

impl KindStats {
    pub fn mean_lifetime(&self) -> Option<Duration> {
        u32::try_from(self.finished)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.total_lifetime / n)
    }

    pub fn in_flight(&self) -> u64 {
        self.started.saturating_sub(self.finished)
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub kinds: HashMap<TransactionKind, KindStats>,
    pub timer_fires: HashMap<TransactionTimer, u64>,
    pub retransmissions: HashMap<TransportKind, u64>,
}

impl MetricsSnapshot {
    pub fn kind(&self, kind: TransactionKind) -> KindStats {
        self.kinds.get(&kind).cloned().unwrap_or_default()
    }
}

/// Shared transaction counters.
#[derive(Debug, Clone, Default)]
pub struct TransactionMetrics {
    data: Arc<RwLock<MetricsSnapshot>>,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started(&self, kind: TransactionKind) {
        self.data.write().kinds.entry(kind).or_default().started += 1;
    }

    pub fn on_finished(&self, kind: TransactionKind, outcome: TransactionOutcome, lifetime: Duration) {
        let mut data = self.data.write();
        let stats = data.kinds.entry(kind).or_default();
        stats.finished += 1;
        *stats.outcomes.entry(outcome).or_insert(0) += 1;
        stats.total_lifetime += lifetime;
        stats.longest_lifetime = stats.longest_lifetime.max(lifetime);
    }

    pub fn on_rejected(&self, kind: TransactionKind) {
        self.data.write().kinds.entry(kind).or_default().rejected += 1;
    }

    pub fn on_timer(&self, timer: TransactionTimer) {
        *self.data.write().timer_fires.entry(timer).or_insert(0) += 1;
    }

    /// Counts a resend, timer-driven or prompted by a retransmitted request.
    pub fn on_retransmission(&self, transport: TransportKind) {
        *self.data.write().retransmissions.entry(transport).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.data.read().clone()
    }

    pub fn reset(&self) {
        *self.data.write() = MetricsSnapshot::default();
    }

    pub fn timer_fire_count(&self, timer: TransactionTimer) -> u64 {
        self.data.read().timer_fires.get(&timer).copied().unwrap_or(0)
    }

    pub fn retransmission_count(&self, transport: TransportKind) -> u64 {
        self.data
            .read()
            .retransmissions
            .get(&transport)
            .copied()
            .unwrap_or(0)
    }

    /// Transactions that have terminated, of any kind.
    pub fn total_transactions(&self) -> u64 {
        self.data.read().kinds.values().map(|s| s.finished).sum()
    }

    pub fn in_flight(&self, kind: TransactionKind) -> u64 {
        self.data
            .read()
            .kinds
            .get(&kind)
            .map(KindStats::in_flight)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::Method;
    use smol_str::SmolStr;

    fn id(method: Method, is_server: bool) -> TransactionId {
        TransactionId {
            key: SmolStr::new("z9hG4bKkind"),
            method,
            is_server,
        }
    }

    #[test]
    fn kind_follows_method_and_side() {
        assert_eq!(
            TransactionKind::of(&id(Method::Invite, false)),
            TransactionKind::ClientInvite
        );
        assert_eq!(
            TransactionKind::of(&id(Method::Cancel, true)),
            TransactionKind::ServerNonInvite
        );
        assert!(TransactionKind::of(&id(Method::Invite, true)).is_server());
        assert!(!TransactionKind::of(&id(Method::Options, false)).is_server());
    }

    #[test]
    fn counts_timers_and_retransmissions() {
        let metrics = TransactionMetrics::new();
        metrics.on_timer(TransactionTimer::E);
        metrics.on_timer(TransactionTimer::E);
        metrics.on_timer(TransactionTimer::F);
        metrics.on_retransmission(TransportKind::Udp);

        assert_eq!(metrics.timer_fire_count(TransactionTimer::E), 2);
        assert_eq!(metrics.timer_fire_count(TransactionTimer::F), 1);
        assert_eq!(metrics.timer_fire_count(TransactionTimer::K), 0);
        assert_eq!(metrics.retransmission_count(TransportKind::Udp), 1);
        assert_eq!(metrics.retransmission_count(TransportKind::Tcp), 0);
    }

    #[test]
    fn lifetimes_and_outcomes_per_kind() {
        let metrics = TransactionMetrics::new();
        let kind = TransactionKind::ClientNonInvite;
        for _ in 0..3 {
            metrics.on_started(kind);
        }
        metrics.on_finished(kind, TransactionOutcome::Completed, Duration::from_millis(100));
        metrics.on_finished(kind, TransactionOutcome::Timeout, Duration::from_millis(300));

        let stats = metrics.snapshot().kind(kind);
        assert_eq!(stats.in_flight(), 1);
        assert_eq!(stats.mean_lifetime(), Some(Duration::from_millis(200)));
        assert_eq!(stats.longest_lifetime, Duration::from_millis(300));
        assert_eq!(stats.outcomes.get(&TransactionOutcome::Timeout), Some(&1));
        assert_eq!(metrics.total_transactions(), 2);
        assert_eq!(metrics.snapshot().kind(TransactionKind::ServerInvite), KindStats::default());
    }

    #[test]
    fn clones_share_counters_until_reset() {
        let metrics = TransactionMetrics::new();
        let other = metrics.clone();
        other.on_rejected(TransactionKind::ServerNonInvite);
        assert_eq!(
            metrics.snapshot().kind(TransactionKind::ServerNonInvite).rejected,
            1
        );

        metrics.reset();
        assert_eq!(other.snapshot(), MetricsSnapshot::default());
        assert_eq!(KindStats::default().mean_lifetime(), None);
    }
}
