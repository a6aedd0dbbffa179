//! Per-call counters.
//!
//! Every counter update is mirrored to the global metrics, so a call's
//! numbers are available both locally (as a [`FlowStats`] snapshot) and in
//! the exported instruments.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::observability::metrics;

/// Lock-free tallies for one call.
#[derive(Debug, Default)]
pub struct FlowCounters {
    role: &'static str,
    credits_requested: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    late_deliveries: AtomicU64,
    deferred_enqueues: AtomicU64,
}

impl FlowCounters {
    /// Create counters labelled with the call's role.
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    pub fn credit_requested(&self, count: u32) {
        self.credits_requested
            .fetch_add(u64::from(count), Ordering::Relaxed);
        metrics::record_credit_request(self.role, count);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_received(self.role);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_sent(self.role);
    }

    /// A value arrived after its queue closed and was dropped.
    pub fn late_delivery(&self) {
        self.late_deliveries.fetch_add(1, Ordering::Relaxed);
        metrics::record_late_delivery(self.role);
    }

    /// A value had to wait for queue capacity.
    pub fn deferred_enqueue(&self) {
        self.deferred_enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn snapshot(&self) -> FlowStats {
        FlowStats {
            credits_requested: self.credits_requested.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            late_deliveries: self.late_deliveries.load(Ordering::Relaxed),
            deferred_enqueues: self.deferred_enqueues.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a call's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    /// Credits granted to the peer.
    pub credits_requested: u64,
    /// Messages delivered by the transport.
    pub messages_received: u64,
    /// Messages written to the transport.
    pub messages_sent: u64,
    /// Messages dropped because their queue had already closed.
    pub late_deliveries: u64,
    /// Messages that waited for queue capacity before being enqueued.
    pub deferred_enqueues: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let counters = FlowCounters::new("client");
        counters.credit_requested(1);
        counters.credit_requested(2);
        counters.message_received();
        counters.message_sent();
        counters.late_delivery();
        counters.deferred_enqueue();

        let stats = counters.snapshot();
        assert_eq!(stats.credits_requested, 3);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.late_deliveries, 1);
        assert_eq!(stats.deferred_enqueues, 1);
        assert_eq!(counters.role(), "client");
    }
}
