//! Connector counters — a cheap pulse for logs and health endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::connector::Connector;

#[derive(Default)]
pub(crate) struct Counters {
    pub inbound_served: AtomicU64,
    pub inbound_failed: AtomicU64,
    pub outbound_requests: AtomicU64,
    pub outbound_publishes: AtomicU64,
    pub fragments_sent: AtomicU64,
    pub ticker_runs: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view of a connector's counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub inbound_served: u64,
    pub inbound_failed: u64,
    pub outbound_requests: u64,
    pub outbound_publishes: u64,
    pub fragments_sent: u64,
    pub ticker_runs: u64,
}

impl Connector {
    pub fn stats(&self) -> StatsSnapshot {
        let c = &self.inner.counters;
        StatsSnapshot {
            inbound_served: c.inbound_served.load(Ordering::Relaxed),
            inbound_failed: c.inbound_failed.load(Ordering::Relaxed),
            outbound_requests: c.outbound_requests.load(Ordering::Relaxed),
            outbound_publishes: c.outbound_publishes.load(Ordering::Relaxed),
            fragments_sent: c.fragments_sent.load(Ordering::Relaxed),
            ticker_runs: c.ticker_runs.load(Ordering::Relaxed),
        }
    }
}
