//! Timer values per RFC 3261 §17 (Table 4) and RFC 6026.
//!
//! The state machines only arm retransmission and wait timers on unreliable
//! transports; a reliable transport skips them entirely rather than arming a
//! zero-length timer.

use crate::TransactionTimer;
use std::time::Duration;

/// Fixed Timer D value for unreliable transports (RFC 3261 §17.1.1.2).
pub const TIMER_D: Duration = Duration::from_secs(32);

/// RFC 3261 base timer values.
///
/// T1 MUST NOT be set lower than 500ms on the public Internet; tests shrink
/// it freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// RTT estimate - default 500ms
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE - default 4s
    pub t2: Duration,
    /// Maximum wait time for network to clear - default 5s
    pub t4: Duration,
    /// Delay before an unanswered INVITE gets an automatic 100 Trying - default 200ms
    pub trying: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            trying: Duration::from_millis(200),
        }
    }
}

impl TimerDefaults {
    /// Initial duration of `timer` when it is armed.
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        match timer {
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => self.t1,
            TransactionTimer::B
            | TransactionTimer::F
            | TransactionTimer::H
            | TransactionTimer::J
            | TransactionTimer::L
            | TransactionTimer::M => self.t1.saturating_mul(64),
            TransactionTimer::D => TIMER_D,
            TransactionTimer::I | TransactionTimer::K => self.t4,
            TransactionTimer::Trying => self.trying,
        }
    }

    /// Next retransmission interval: doubled, and capped at T2 when `capped`.
    pub fn backoff(&self, current: Duration, capped: bool) -> Duration {
        let doubled = current.saturating_mul(2);
        if capped {
            doubled.min(self.t2)
        } else {
            doubled
        }
    }
}
