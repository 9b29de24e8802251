//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the dispatcher and workers.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    unknown_senders: AtomicU64,
    rejected: AtomicU64,
    sightings: AtomicU64,
    gossip: AtomicU64,
    enqueued: AtomicU64,
    acknowledged: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    flushes: AtomicU64,
}

/// A point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Datagrams read from listening sockets.
    pub received: u64,
    /// Datagrams dropped because the sender is not configured.
    pub unknown_senders: u64,
    /// Datagrams from known senders that failed framing, authentication or decoding.
    pub rejected: u64,
    /// Userinfo sightings recorded.
    pub sightings: u64,
    /// Gossip records recorded.
    pub gossip: u64,
    /// Outbox entries created.
    pub enqueued: u64,
    /// Outbox entries removed by acknowledgment.
    pub acknowledged: u64,
    /// Datagrams sent to peers.
    pub sent: u64,
    /// Datagrams that could not be sent.
    pub send_failures: u64,
    /// Outbox flushes performed.
    pub flushes: u64,
    /// Worker tasks that failed or panicked. Only filled in by
    /// [`Relay::stats`](crate::Relay::stats).
    pub task_failures: u64,
}

impl RelayStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unknown_sender(&self) {
        self.unknown_senders.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sighting(&self) {
        self.sightings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_gossip(&self) {
        self.gossip.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            unknown_senders: self.unknown_senders.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            sightings: self.sightings.load(Ordering::Relaxed),
            gossip: self.gossip.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            task_failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = RelayStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_rejected();
        stats.record_flush();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.flushes, 1);
        assert_eq!(snapshot.sent, 0);
    }
}
