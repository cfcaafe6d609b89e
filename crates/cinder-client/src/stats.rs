//! Client-side counters.
//!
//! Every event is counted twice: in the atomics behind [`StatsSnapshot`],
//! which callers read directly, and through the `metrics` facade so that
//! an application with a recorder installed gets them exported too.
//! Without a recorder the facade calls are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};

use crate::policy::RetransmitReason;

/// Monotonic counters updated on the request path.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    submitted: AtomicU64,
    moved: AtomicU64,
    asked: AtomicU64,
    transient_retries: AtomicU64,
    connection_retries: AtomicU64,
    timeouts: AtomicU64,
    connection_failures: AtomicU64,
    connections_opened: AtomicU64,
}

impl Stats {
    #[inline]
    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        counter!("cinder_requests_total").increment(1);
    }

    pub fn record_retransmit(&self, reason: RetransmitReason) {
        let (local, label) = match reason {
            RetransmitReason::Moved => (&self.moved, "moved"),
            RetransmitReason::Ask => (&self.asked, "ask"),
            RetransmitReason::Transient => (&self.transient_retries, "transient"),
            RetransmitReason::ConnectionLost => (&self.connection_retries, "connection_lost"),
        };
        local.fetch_add(1, Ordering::Relaxed);
        let labels = [("reason", label)];
        counter!("cinder_retransmissions_total", &labels).increment(1);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("cinder_request_timeouts_total").increment(1);
    }

    /// Counts a failed connection and removes it from the active gauge.
    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        counter!("cinder_connection_failures_total").increment(1);
        gauge!("cinder_connections_active").decrement(1.0);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        counter!("cinder_connections_total").increment(1);
        gauge!("cinder_connections_active").increment(1.0);
    }

    /// Removes connections closed on shutdown from the active gauge.
    pub fn record_connections_closed(&self, count: usize) {
        gauge!("cinder_connections_active").decrement(count as f64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            moved: self.moved.load(Ordering::Relaxed),
            asked: self.asked.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            connection_retries: self.connection_retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Logical requests submitted.
    pub submitted: u64,
    /// Retransmissions after a MOVED redirect.
    pub moved: u64,
    /// Retransmissions after an ASK redirect.
    pub asked: u64,
    /// Retransmissions after TRYAGAIN, CLUSTERDOWN and similar replies.
    pub transient_retries: u64,
    /// Retransmissions after a lost connection.
    pub connection_retries: u64,
    /// Attempts that hit the request timeout.
    pub timeouts: u64,
    /// Connections that failed (closed by the peer, I/O error, desync).
    pub connection_failures: u64,
    /// Transports opened, including reconnects.
    pub connections_opened: u64,
}

impl StatsSnapshot {
    /// Total retransmissions for any reason.
    pub fn retransmissions(&self) -> u64 {
        self.moved + self.asked + self.transient_retries + self.connection_retries
    }
}
